//! EKS cluster description and readiness checks
//!
//! A [`ClusterDescriptor`] is an immutable snapshot of a describe-cluster
//! response. The readiness check succeeds only for clusters in the `ACTIVE`
//! state; every other state is reported as a retryable [`Error::NotReady`].

mod eks;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_with_policy, RetryError, RetryPolicy};
use crate::{Error, Result};

pub use eks::EksClusterApi;

/// Lifecycle status of an EKS cluster
///
/// Serialized in the upstream wire form (`"ACTIVE"`, `"CREATING"`, ...) and
/// parsed case-insensitively. Unknown values are preserved in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClusterStatus {
    /// Control plane is being provisioned
    Creating,
    /// Cluster is ready for use
    Active,
    /// Cluster is being torn down
    Deleting,
    /// Provisioning failed
    Failed,
    /// Cluster configuration or version update in progress
    Updating,
    /// Cluster request accepted but not started
    Pending,
    /// Any status this crate does not know about
    Other(String),
}

impl ClusterStatus {
    /// Upstream string form of the status
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Deleting => "DELETING",
            Self::Failed => "FAILED",
            Self::Updating => "UPDATING",
            Self::Pending => "PENDING",
            Self::Other(s) => s,
        }
    }

    /// Whether the cluster can never become active from this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleting | Self::Failed)
    }
}

impl From<&str> for ClusterStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "CREATING" => Self::Creating,
            "ACTIVE" => Self::Active,
            "DELETING" => Self::Deleting,
            "FAILED" => Self::Failed,
            "UPDATING" => Self::Updating,
            "PENDING" => Self::Pending,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl From<String> for ClusterStatus {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ClusterStatus> for String {
    fn from(status: ClusterStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OIDC block of a cluster identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcIdentity {
    /// Issuer URL used as the `iss` claim of service-account tokens
    pub issuer: String,
}

/// Identity block of a cluster description
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    /// OIDC issuer information, absent until the control plane is up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcIdentity>,
}

/// Snapshot of a describe-cluster response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// Cluster name
    pub name: String,
    /// Status at query time
    pub status: ClusterStatus,
    /// Identity block carrying the OIDC issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ClusterIdentity>,
}

impl ClusterDescriptor {
    /// Create a descriptor with an OIDC issuer
    pub fn new(name: impl Into<String>, status: ClusterStatus, issuer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            identity: Some(ClusterIdentity {
                oidc: Some(OidcIdentity {
                    issuer: issuer.into(),
                }),
            }),
        }
    }

    /// Whether the cluster is active
    pub fn is_active(&self) -> bool {
        self.status == ClusterStatus::Active
    }

    /// The cluster's OIDC issuer URL
    ///
    /// Fails if the identity block is missing or the issuer is not a
    /// well-formed `https` URL.
    pub fn issuer(&self) -> Result<&str> {
        let issuer = self
            .identity
            .as_ref()
            .and_then(|identity| identity.oidc.as_ref())
            .map(|oidc| oidc.issuer.as_str())
            .ok_or_else(|| {
                Error::invalid_cluster(format!("cluster {} has no OIDC issuer", self.name))
            })?;

        let url = reqwest::Url::parse(issuer).map_err(|e| {
            Error::invalid_cluster(format!(
                "cluster {} has malformed issuer {}: {}",
                self.name, issuer, e
            ))
        })?;
        if url.scheme() != "https" || url.host_str().is_none() {
            return Err(Error::invalid_cluster(format!(
                "cluster {} issuer {} is not an https URL",
                self.name, issuer
            )));
        }

        Ok(issuer)
    }
}

/// Trait abstracting the describe-cluster call
///
/// Allows mocking EKS in tests while using the AWS SDK in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Describe the cluster with the given name
    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescriptor>;
}

/// Check whether a cluster is active
///
/// Returns the full descriptor when the cluster is active. Any other status
/// is reported as [`Error::NotReady`]; the caller's retry policy decides how
/// often to ask again. Remote errors propagate unchanged.
pub async fn check_ready<C: ClusterApi + ?Sized>(
    clusters: &C,
    name: &str,
) -> Result<ClusterDescriptor> {
    let cluster = clusters.describe_cluster(name).await?;

    info!(cluster = %cluster.name, status = %cluster.status, "EKS cluster status");

    if cluster.is_active() {
        return Ok(cluster);
    }
    Err(Error::NotReady {
        cluster: cluster.name,
        status: cluster.status.to_string(),
    })
}

/// Poll until the cluster is active, with waiter semantics
///
/// Unlike the workflow's readiness step, a cluster that is deleting or failed
/// stops the wait immediately with [`Error::ClusterFailed`].
pub async fn wait_for_active<C: ClusterApi + ?Sized>(
    clusters: &C,
    name: &str,
    policy: &RetryPolicy,
) -> Result<ClusterDescriptor> {
    let outcome = retry_with_policy(policy, "wait_for_active", Error::is_retryable, || async move {
        match clusters.describe_cluster(name).await? {
            cluster if cluster.is_active() => Ok(cluster),
            cluster if cluster.status.is_terminal() => Err(Error::ClusterFailed {
                cluster: cluster.name,
                status: cluster.status.to_string(),
            }),
            cluster => Err(Error::NotReady {
                cluster: cluster.name,
                status: cluster.status.to_string(),
            }),
        }
    })
    .await;

    outcome.map_err(|e| match e {
        RetryError::Exhausted { attempts, .. } => Error::ReadinessTimeout {
            cluster: name.to_string(),
            attempts,
        },
        RetryError::Aborted(e) => e,
    })
}
