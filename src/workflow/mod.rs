//! Cluster readiness + OIDC provider registration workflow
//!
//! Two steps, chained:
//!
//! - **Step A** ([`ProvisioningWorkflow::is_cluster_ready`]) describes the
//!   cluster and fails with a retryable error until it is active. It runs
//!   under the injected readiness [`RetryPolicy`].
//! - **Step B** ([`ProvisioningWorkflow::create_oidc_provider`]) receives step
//!   A's output, resolves the issuer's root thumbprint and registers the
//!   provider. It is never retried; failures are terminal.
//!
//! Steps exchange a [`WorkflowPayload`], the same `{ "cluster": ... }` JSON
//! shape an external orchestration engine passes between task states.

mod engine;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::{check_ready, ClusterApi, ClusterDescriptor};
use crate::provider::{ProviderHandle, Registrar};
use crate::retry::{retry_with_policy, RetryError, RetryPolicy};
use crate::thumbprint::{Thumbprint, ThumbprintResolver};
use crate::{Error, Result};

pub use engine::{
    ExecutionFailure, ExecutionHandle, LocalEngine, StepFunctionsEngine, WorkflowEngine,
};

#[cfg(test)]
pub use engine::MockWorkflowEngine;

/// Input/output of a workflow step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPayload {
    /// Cluster snapshot carried between steps
    pub cluster: ClusterDescriptor,
}

impl From<ClusterDescriptor> for WorkflowPayload {
    fn from(cluster: ClusterDescriptor) -> Self {
        Self { cluster }
    }
}

/// Output of the registration step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Cluster the provider was registered for
    pub cluster: String,
    /// Issuer URL registered
    pub issuer: String,
    /// Root certificate thumbprint pinned on the provider
    pub thumbprint: Thumbprint,
    /// The IAM provider
    pub provider: ProviderHandle,
}

/// Poll-then-register workflow for a newly created cluster
#[derive(Clone)]
pub struct ProvisioningWorkflow {
    clusters: Arc<dyn ClusterApi>,
    resolver: Arc<dyn ThumbprintResolver>,
    registrar: Registrar,
    readiness: RetryPolicy,
}

impl ProvisioningWorkflow {
    /// Create a workflow with the default readiness policy (50 × 30s)
    pub fn new(
        clusters: Arc<dyn ClusterApi>,
        resolver: Arc<dyn ThumbprintResolver>,
        registrar: Registrar,
    ) -> Self {
        Self {
            clusters,
            resolver,
            registrar,
            readiness: RetryPolicy::readiness(),
        }
    }

    /// Replace the readiness retry policy
    pub fn with_readiness_policy(mut self, policy: RetryPolicy) -> Self {
        self.readiness = policy;
        self
    }

    /// The readiness retry policy in effect
    pub fn readiness_policy(&self) -> &RetryPolicy {
        &self.readiness
    }

    /// Step A: a single readiness check
    ///
    /// Returns the refreshed payload when the cluster is active, otherwise a
    /// retryable [`Error::NotReady`].
    pub async fn is_cluster_ready(&self, input: &WorkflowPayload) -> Result<WorkflowPayload> {
        let cluster = check_ready(&*self.clusters, &input.cluster.name).await?;
        Ok(cluster.into())
    }

    /// Step A under the readiness policy
    ///
    /// Exhausting the policy is terminal: [`Error::ReadinessTimeout`].
    pub async fn wait_until_ready(&self, input: &WorkflowPayload) -> Result<WorkflowPayload> {
        let name = input.cluster.name.as_str();
        info!(cluster = %name, "Waiting for cluster to become active");

        retry_with_policy(&self.readiness, "is_cluster_ready", Error::is_retryable, || {
            self.is_cluster_ready(input)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, .. } => Error::ReadinessTimeout {
                cluster: name.to_string(),
                attempts,
            },
            RetryError::Aborted(e) => e,
        })
    }

    /// Step B: resolve the issuer thumbprint and register the provider
    ///
    /// Refuses clusters that are not active so a provider is never created
    /// for an unconfirmed issuer.
    pub async fn create_oidc_provider(&self, input: &WorkflowPayload) -> Result<Registration> {
        let cluster = &input.cluster;
        if !cluster.is_active() {
            return Err(Error::invalid_cluster(format!(
                "cluster {} is {}, not ACTIVE",
                cluster.name, cluster.status
            )));
        }
        let issuer = cluster.issuer()?;

        info!(cluster = %cluster.name, issuer = %issuer, "Getting CA thumbprint");
        let thumbprint = self.resolver.resolve_root_thumbprint(issuer).await?;

        let provider = self.registrar.register(issuer, &thumbprint).await?;

        Ok(Registration {
            cluster: cluster.name.clone(),
            issuer: issuer.to_string(),
            thumbprint,
            provider,
        })
    }

    /// Run both steps: wait for the cluster, then register its issuer
    pub async fn run(&self, input: WorkflowPayload) -> Result<Registration> {
        let ready = self.wait_until_ready(&input).await?;
        self.create_oidc_provider(&ready).await
    }
}
