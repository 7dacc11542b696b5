//! Runtime configuration
//!
//! Every setting has a command-line flag and an environment variable, so the
//! binary runs unchanged as a Lambda-style function (environment only) or
//! from a shell.

use std::path::PathBuf;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use clap::Args;
use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::provider::STS_AUDIENCE;
use crate::retry::{RetryPolicy, DEFAULT_READY_MAX_ATTEMPTS};
use crate::thumbprint::parse_trust_bundle;
use crate::{Error, Result};

/// Default HTTP and TLS handshake timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Settings shared by every subcommand
#[derive(Args, Debug, Clone, PartialEq)]
pub struct Config {
    /// AWS region override (default provider chain when unset)
    #[arg(long, env = "AWS_REGION", global = true)]
    pub region: Option<String>,

    /// ARN of the state machine that runs the provisioning workflow
    #[arg(long, env = "STATE_MACHINE_ARN", global = true)]
    pub state_machine_arn: Option<String>,

    /// Maximum readiness checks before the workflow gives up
    #[arg(
        long,
        env = "EKS_IDP_READY_MAX_ATTEMPTS",
        default_value_t = DEFAULT_READY_MAX_ATTEMPTS,
        global = true
    )]
    pub ready_max_attempts: u32,

    /// Seconds between readiness checks
    #[arg(
        long,
        env = "EKS_IDP_READY_INTERVAL_SECS",
        default_value_t = 30,
        global = true
    )]
    pub ready_interval_secs: u64,

    /// Multiplier applied to the readiness interval after each attempt
    #[arg(
        long,
        env = "EKS_IDP_READY_BACKOFF_RATE",
        default_value_t = 1.0,
        global = true
    )]
    pub ready_backoff_rate: f64,

    /// Timeout for the OIDC discovery request in seconds
    #[arg(
        long,
        env = "EKS_IDP_HTTP_TIMEOUT_SECS",
        default_value_t = DEFAULT_TIMEOUT_SECS,
        global = true
    )]
    pub http_timeout_secs: u64,

    /// Timeout for the TLS handshake (connect, read, write) in seconds
    #[arg(
        long,
        env = "EKS_IDP_TLS_TIMEOUT_SECS",
        default_value_t = DEFAULT_TIMEOUT_SECS,
        global = true
    )]
    pub tls_timeout_secs: u64,

    /// Audience registered on created providers
    #[arg(
        long,
        env = "EKS_IDP_CLIENT_ID",
        default_value = STS_AUDIENCE,
        global = true
    )]
    pub client_id: String,

    /// PEM bundle of roots consulted before the system root store
    #[arg(long, env = "EKS_IDP_TRUST_BUNDLE", global = true)]
    pub trust_bundle: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: None,
            state_machine_arn: None,
            ready_max_attempts: DEFAULT_READY_MAX_ATTEMPTS,
            ready_interval_secs: 30,
            ready_backoff_rate: 1.0,
            http_timeout_secs: DEFAULT_TIMEOUT_SECS,
            tls_timeout_secs: DEFAULT_TIMEOUT_SECS,
            client_id: STS_AUDIENCE.to_string(),
            trust_bundle: None,
        }
    }
}

impl Config {
    /// Reject settings no workflow can run with
    pub fn validate(&self) -> Result<()> {
        if self.ready_max_attempts == 0 {
            return Err(Error::config("ready_max_attempts must be at least 1"));
        }
        if !self.ready_backoff_rate.is_finite() || self.ready_backoff_rate < 0.0 {
            return Err(Error::config(format!(
                "ready_backoff_rate must be a non-negative number, got {}",
                self.ready_backoff_rate
            )));
        }
        if self.http_timeout_secs == 0 {
            return Err(Error::config("http_timeout_secs must be at least 1"));
        }
        if self.tls_timeout_secs == 0 {
            return Err(Error::config("tls_timeout_secs must be at least 1"));
        }
        if self.client_id.is_empty() {
            return Err(Error::config("client_id must not be empty"));
        }
        Ok(())
    }

    /// Retry policy of the readiness step
    ///
    /// The delay cap is the interval grown over every configured attempt, so a
    /// backoff rate above 1.0 is never clipped.
    pub fn readiness_policy(&self) -> RetryPolicy {
        let interval = Duration::from_secs(self.ready_interval_secs);
        let growth = self
            .ready_backoff_rate
            .max(1.0)
            .powi(self.ready_max_attempts.saturating_sub(1) as i32);
        RetryPolicy {
            max_attempts: self.ready_max_attempts,
            interval,
            backoff_rate: self.ready_backoff_rate,
            max_interval: Duration::try_from_secs_f64(interval.as_secs_f64() * growth)
                .unwrap_or(Duration::MAX),
        }
    }

    /// Timeout of the discovery request
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Timeout of the TLS handshake
    pub fn tls_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_timeout_secs)
    }

    /// Workflow identifier the dispatcher starts
    pub fn require_state_machine_arn(&self) -> Result<&str> {
        self.state_machine_arn
            .as_deref()
            .filter(|arn| !arn.is_empty())
            .ok_or_else(|| Error::config("STATE_MACHINE_ARN is required to start workflows"))
    }

    /// Load the configured trust bundle, or an empty one
    pub async fn load_trust_bundle(&self) -> Result<Vec<CertificateDer<'static>>> {
        let Some(path) = &self.trust_bundle else {
            return Ok(Vec::new());
        };

        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!(
                "failed to read trust bundle {}: {}",
                path.display(),
                e
            ))
        })?;
        let certs = parse_trust_bundle(&text)?;
        debug!(path = %path.display(), certificates = certs.len(), "Loaded trust bundle");
        Ok(certs)
    }

    /// Load AWS SDK configuration from the default chain
    pub async fn sdk_config(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(Region::new(region.clone()));
        }
        loader.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("eks-idp").chain(args.iter().copied());
        TestCli::parse_from(argv).config
    }

    #[test]
    fn defaults_match_readiness_policy() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.readiness_policy(), RetryPolicy::readiness());
        assert_eq!(config.client_id, "sts.amazonaws.com");
        assert_eq!(config.tls_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--ready-max-attempts",
            "5",
            "--ready-interval-secs",
            "2",
            "--state-machine-arn",
            "arn:aws:states:us-west-2:123456789012:stateMachine:idp",
        ]);
        let policy = config.readiness_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(
            config.require_state_machine_arn().unwrap(),
            "arn:aws:states:us-west-2:123456789012:stateMachine:idp"
        );
    }

    #[test]
    fn backoff_rate_grows_interval() {
        let config = Config {
            ready_max_attempts: 4,
            ready_interval_secs: 1,
            ready_backoff_rate: 2.0,
            ..Config::default()
        };
        let policy = config.readiness_policy();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_after(4), None);
    }

    #[test]
    fn huge_backoff_rate_yields_a_usable_policy() {
        let config = Config {
            ready_backoff_rate: 1e300,
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        let policy = config.readiness_policy();
        assert_eq!(policy.max_interval, Duration::MAX);
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_after(2), Some(Duration::MAX));
        assert_eq!(policy.max_wait(), Duration::MAX);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let cases = [
            Config {
                ready_max_attempts: 0,
                ..Config::default()
            },
            Config {
                ready_backoff_rate: -1.0,
                ..Config::default()
            },
            Config {
                http_timeout_secs: 0,
                ..Config::default()
            },
            Config {
                tls_timeout_secs: 0,
                ..Config::default()
            },
            Config {
                client_id: String::new(),
                ..Config::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn missing_state_machine_is_a_config_error() {
        assert!(matches!(
            Config::default().require_state_machine_arn(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn unset_trust_bundle_is_empty() {
        assert!(Config::default().load_trust_bundle().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_trust_bundle_is_a_config_error() {
        let config = Config {
            trust_bundle: Some(PathBuf::from("/nonexistent/eks-idp/bundle.pem")),
            ..Config::default()
        };
        assert!(matches!(
            config.load_trust_bundle().await,
            Err(Error::Config(_))
        ));
    }
}
