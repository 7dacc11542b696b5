//! Retry policy for polling steps.
//!
//! Models the orchestration engine's retry primitive (attempt limit, interval,
//! backoff rate) as an injected value so the workflow can be driven in-process
//! and tested without a real orchestration backend.
//!
//! # Example
//!
//! ```ignore
//! use eks_idp::retry::{retry_with_policy, RetryPolicy};
//!
//! let cluster = retry_with_policy(
//!     &RetryPolicy::readiness(),
//!     "is_cluster_ready",
//!     |e: &Error| e.is_retryable(),
//!     || async { check_ready(&*clusters, "c1").await },
//! ).await?;
//! ```

use std::time::Duration;

use tracing::{error, warn};

/// Default attempt limit for the cluster readiness step
pub const DEFAULT_READY_MAX_ATTEMPTS: u32 = 50;

/// Default fixed interval between readiness attempts
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_secs(30);

/// Attempt limit of the EKS `ClusterActive` waiter
pub const WAITER_MAX_ATTEMPTS: u32 = 40;

/// Retry policy for a single workflow step.
///
/// `backoff_rate` of 1.0 yields a fixed interval; larger values grow the
/// interval geometrically, capped at `max_interval`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (must be > 0)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub interval: Duration,
    /// Multiplier applied to the interval after each failed attempt
    pub backoff_rate: f64,
    /// Upper bound on the delay between attempts
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::readiness()
    }
}

impl RetryPolicy {
    /// Fixed-interval policy: `max_attempts` attempts, `interval` apart
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff_rate: 1.0,
            max_interval: interval,
        }
    }

    /// Readiness step policy: 50 attempts, 30 seconds apart (~25 minutes)
    pub fn readiness() -> Self {
        Self::fixed(DEFAULT_READY_MAX_ATTEMPTS, DEFAULT_READY_INTERVAL)
    }

    /// Policy matching the EKS `ClusterActive` waiter: 40 attempts, 30 seconds apart
    pub fn waiter() -> Self {
        Self::fixed(WAITER_MAX_ATTEMPTS, DEFAULT_READY_INTERVAL)
    }

    /// Delay to wait after the given failed attempt (1-based)
    ///
    /// Returns `None` once the attempt limit is reached.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = (self.interval.as_secs_f64() * self.backoff_rate.powi(exponent))
            .min(self.max_interval.as_secs_f64());
        // Delays too large for a Duration saturate at the cap.
        Some(Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval))
    }

    /// Worst-case total time spent sleeping before giving up
    pub fn max_wait(&self) -> Duration {
        (1..self.max_attempts)
            .filter_map(|attempt| self.delay_after(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Why a retried operation ultimately failed
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
    /// An attempt failed with an error the caller classified as terminal
    Aborted(E),
}

/// Execute an async operation under a retry policy.
///
/// `should_retry` classifies each error; a non-retryable error stops the loop
/// immediately. Retryable errors are retried until `policy.max_attempts` is
/// reached.
///
/// # Arguments
/// * `policy` - Attempt limit and delay schedule
/// * `operation_name` - Name for logging purposes
/// * `should_retry` - Returns true if the error is worth another attempt
/// * `operation` - The async operation to retry
pub async fn retry_with_policy<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(RetryError::Aborted(e));
            }
            Err(e) => {
                let Some(delay) = policy.delay_after(attempt) else {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
