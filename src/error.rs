//! Error types for eks-idp
//!
//! Errors fall into four handling categories: retryable (cluster not ready,
//! transient remote failures), terminal on the create path, terminal on the
//! delete path, and the soft "provider not found" case which is not an error
//! at all (see [`crate::provider::DeregisterOutcome`]).

use thiserror::Error;

/// Main error type for eks-idp operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The OIDC discovery document could not be fetched or parsed
    #[error("discovery error for {issuer}: {message}")]
    Discovery {
        /// Issuer whose discovery document was requested
        issuer: String,
        /// Description of what failed
        message: String,
    },

    /// The TLS handshake with the JWKS host failed
    #[error("connection error to {host}: {message}")]
    Connection {
        /// Host the handshake connected to
        host: String,
        /// Description of what failed
        message: String,
    },

    /// The peer certificate chain could not be walked
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Cluster exists but is not yet active
    #[error("cluster {cluster} is not ready (status {status})")]
    NotReady {
        /// Cluster name
        cluster: String,
        /// Status observed on the last describe call
        status: String,
    },

    /// Cluster reached a state it can never become active from
    #[error("cluster {cluster} entered terminal status {status}")]
    ClusterFailed {
        /// Cluster name
        cluster: String,
        /// Terminal status observed
        status: String,
    },

    /// Readiness polling ran out of attempts
    #[error("cluster {cluster} did not become active after {attempts} attempts")]
    ReadinessTimeout {
        /// Cluster name
        cluster: String,
        /// Number of describe attempts made
        attempts: u32,
    },

    /// Remote service call failed (EKS, IAM, Step Functions)
    #[error("{service} {operation} failed: {message}")]
    Remote {
        /// Service name (eks, iam, sfn)
        service: &'static str,
        /// API operation that failed
        operation: &'static str,
        /// Underlying SDK error rendered with its context
        message: String,
    },

    /// IAM already holds a provider for this URL
    #[error("OIDC provider already exists for {url}")]
    ProviderExists {
        /// Provider URL that was rejected as a duplicate
        url: String,
    },

    /// Cluster description is missing required data or carries malformed data
    #[error("invalid cluster description: {0}")]
    InvalidCluster(String),

    /// Audit event is malformed or cannot be routed
    #[error("event error: {0}")]
    Event(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a discovery error for the given issuer
    pub fn discovery(issuer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Discovery {
            issuer: issuer.into(),
            message: msg.into(),
        }
    }

    /// Create a connection error for the given host
    pub fn connection(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a remote service error
    pub fn remote(service: &'static str, operation: &'static str, msg: impl Into<String>) -> Self {
        Self::Remote {
            service,
            operation,
            message: msg.into(),
        }
    }

    /// Create an invalid-cluster error with the given message
    pub fn invalid_cluster(msg: impl Into<String>) -> Self {
        Self::InvalidCluster(msg.into())
    }

    /// Create an event error with the given message
    pub fn event(msg: impl Into<String>) -> Self {
        Self::Event(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the readiness retry loop should try again after this error
    ///
    /// Only the "not ready yet" condition and transient remote failures are
    /// retryable. Everything else is terminal for the workflow instance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::Remote { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Categorization in the Provisioning Workflow
    // ==========================================================================

    /// Story: A cluster that is still creating is retried, not failed
    #[test]
    fn story_not_ready_is_retryable() {
        let err = Error::NotReady {
            cluster: "c1".to_string(),
            status: "CREATING".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("c1"));
        assert!(err.to_string().contains("CREATING"));
    }

    /// Story: Throttled or flaky EKS calls during polling are retried
    #[test]
    fn story_remote_errors_are_retryable() {
        let err = Error::remote("eks", "DescribeCluster", "ThrottlingException: rate exceeded");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "eks DescribeCluster failed: ThrottlingException: rate exceeded"
        );
    }

    /// Story: Failures after the cluster is active are terminal
    ///
    /// Discovery, TLS and certificate failures must surface to the operator
    /// rather than being silently retried.
    #[test]
    fn story_create_path_failures_are_terminal() {
        let terminal = [
            Error::discovery("https://oidc.example.com/id/1", "Request returned 404"),
            Error::connection("oidc.example.com", "handshake failed"),
            Error::certificate("peer presented no certificates"),
            Error::invalid_cluster("cluster c1 has no OIDC issuer"),
            Error::ReadinessTimeout {
                cluster: "c1".to_string(),
                attempts: 50,
            },
            Error::ClusterFailed {
                cluster: "c1".to_string(),
                status: "FAILED".to_string(),
            },
        ];
        for err in &terminal {
            assert!(!err.is_retryable(), "{err} should be terminal");
        }
    }

    #[test]
    fn story_error_messages_carry_context() {
        let err = Error::discovery("https://oidc.example.com/id/1", "missing jwks_uri");
        assert!(err.to_string().contains("https://oidc.example.com/id/1"));
        assert!(err.to_string().contains("missing jwks_uri"));

        let err = Error::ReadinessTimeout {
            cluster: "prod-us-west".to_string(),
            attempts: 50,
        };
        assert!(err.to_string().contains("prod-us-west"));
        assert!(err.to_string().contains("50 attempts"));
    }

    #[test]
    fn story_json_errors_convert() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
