//! AWS SDK implementation of [`ClusterApi`]

use async_trait::async_trait;
use aws_sdk_eks::error::DisplayErrorContext;
use tracing::debug;

use super::{ClusterApi, ClusterDescriptor, ClusterIdentity, ClusterStatus, OidcIdentity};
use crate::{Error, Result};

/// Describe-cluster backed by the EKS API
#[derive(Clone, Debug)]
pub struct EksClusterApi {
    client: aws_sdk_eks::Client,
}

impl EksClusterApi {
    /// Create a new EksClusterApi from shared SDK configuration
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_eks::Client::new(sdk_config),
        }
    }

    /// Wrap an existing EKS client
    pub fn from_client(client: aws_sdk_eks::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for EksClusterApi {
    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescriptor> {
        debug!(cluster = %name, "Describing EKS cluster");

        let output = self
            .client
            .describe_cluster()
            .name(name)
            .send()
            .await
            .map_err(|e| {
                Error::remote("eks", "DescribeCluster", DisplayErrorContext(&e).to_string())
            })?;

        let cluster = output.cluster().ok_or_else(|| {
            Error::invalid_cluster(format!("DescribeCluster returned no cluster for {}", name))
        })?;

        let status = cluster
            .status()
            .map(|s| ClusterStatus::from(s.as_str()))
            .unwrap_or_else(|| ClusterStatus::Other("UNKNOWN".to_string()));

        let identity = cluster.identity().map(|identity| ClusterIdentity {
            oidc: identity
                .oidc()
                .and_then(|oidc| oidc.issuer())
                .map(|issuer| OidcIdentity {
                    issuer: issuer.to_string(),
                }),
        });

        Ok(ClusterDescriptor {
            name: cluster.name().unwrap_or(name).to_string(),
            status,
            identity,
        })
    }
}
