//! Cluster lifecycle event handlers
//!
//! - [`Dispatcher`]: on cluster creation, describe the cluster and start a
//!   provisioning workflow execution. Fire-and-forget.
//! - [`DeletionHandler`]: on cluster deletion, remove the provider matching the
//!   cluster's issuer. No retries.
//! - [`InlineProvisioner`]: single-invocation alternative to the dispatcher
//!   that waits for the cluster in-process and then registers.
//! - [`EventRouter`]: routes a raw audit event to the dispatcher or the
//!   deletion handler by event name.
//! - [`LocalRunner`]: processes a batch of events without a state machine,
//!   running create workflows on local tasks.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cluster::{wait_for_active, ClusterApi};
use crate::events::{AuditEvent, LifecycleKind};
use crate::provider::{DeregisterOutcome, Registrar};
use crate::retry::RetryPolicy;
use crate::workflow::{
    ExecutionFailure, ExecutionHandle, LocalEngine, ProvisioningWorkflow, Registration,
    WorkflowEngine, WorkflowPayload,
};
use crate::Result;

/// Starts a provisioning workflow for each created cluster
#[derive(Clone)]
pub struct Dispatcher {
    clusters: Arc<dyn ClusterApi>,
    engine: Arc<dyn WorkflowEngine>,
    workflow_id: String,
}

impl Dispatcher {
    /// Create a dispatcher starting executions of `workflow_id`
    pub fn new(
        clusters: Arc<dyn ClusterApi>,
        engine: Arc<dyn WorkflowEngine>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            clusters,
            engine,
            workflow_id: workflow_id.into(),
        }
    }

    /// Workflow the dispatcher starts
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Describe the created cluster and start one execution for it
    pub async fn on_cluster_created(&self, event: &AuditEvent) -> Result<ExecutionHandle> {
        let name = event.cluster_name();
        let cluster = self.clusters.describe_cluster(name).await?;
        debug!(cluster = %name, status = %cluster.status, "Described created cluster");

        let input = WorkflowPayload::from(cluster);
        self.engine.start_execution(&self.workflow_id, &input).await
    }
}

/// Removes the OIDC provider of a deleted cluster
#[derive(Clone)]
pub struct DeletionHandler {
    clusters: Arc<dyn ClusterApi>,
    registrar: Registrar,
}

impl DeletionHandler {
    /// Create a new DeletionHandler
    pub fn new(clusters: Arc<dyn ClusterApi>, registrar: Registrar) -> Self {
        Self {
            clusters,
            registrar,
        }
    }

    /// Describe the deleted cluster and deregister its issuer
    pub async fn on_cluster_deleted(&self, event: &AuditEvent) -> Result<DeregisterOutcome> {
        let name = event.cluster_name();
        let cluster = self.clusters.describe_cluster(name).await?;
        let issuer = cluster.issuer()?;
        info!(cluster = %name, issuer = %issuer, "Resolved issuer of deleted cluster");

        self.registrar.deregister(issuer).await
    }
}

/// Waits for a created cluster in-process, then registers its issuer
#[derive(Clone)]
pub struct InlineProvisioner {
    clusters: Arc<dyn ClusterApi>,
    workflow: Arc<ProvisioningWorkflow>,
    waiter: RetryPolicy,
}

impl InlineProvisioner {
    /// Create a provisioner with the default waiter policy (40 × 30s)
    pub fn new(clusters: Arc<dyn ClusterApi>, workflow: Arc<ProvisioningWorkflow>) -> Self {
        Self {
            clusters,
            workflow,
            waiter: RetryPolicy::waiter(),
        }
    }

    /// Replace the waiter policy
    pub fn with_waiter_policy(mut self, policy: RetryPolicy) -> Self {
        self.waiter = policy;
        self
    }

    /// Wait for the cluster to become active and register its provider
    pub async fn on_cluster_created(&self, event: &AuditEvent) -> Result<Registration> {
        let name = event.cluster_name();
        info!(cluster = %name, "Waiting for cluster to become active");

        let cluster = wait_for_active(&*self.clusters, name, &self.waiter).await?;
        self.workflow.create_oidc_provider(&cluster.into()).await
    }
}

/// Result of routing one audit event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum EventOutcome {
    /// A provisioning execution was started
    ExecutionStarted(ExecutionHandle),
    /// Provider deregistration ran
    ProviderDeregistered(DeregisterOutcome),
}

/// Routes audit events to the creation or deletion handler
#[derive(Clone)]
pub struct EventRouter {
    dispatcher: Dispatcher,
    deletion: DeletionHandler,
}

impl EventRouter {
    /// Create a new EventRouter
    pub fn new(dispatcher: Dispatcher, deletion: DeletionHandler) -> Self {
        Self {
            dispatcher,
            deletion,
        }
    }

    /// Parse and route a raw event
    pub async fn handle_event(&self, raw: serde_json::Value) -> Result<EventOutcome> {
        info!(event = %raw, "Received audit event");
        let event = AuditEvent::from_value(raw)?;

        match event.kind()? {
            LifecycleKind::Created => self
                .dispatcher
                .on_cluster_created(&event)
                .await
                .map(EventOutcome::ExecutionStarted),
            LifecycleKind::Deleted => self
                .deletion
                .on_cluster_deleted(&event)
                .await
                .map(EventOutcome::ProviderDeregistered),
        }
    }
}

/// Summary of a local run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LocalRunReport {
    /// Registrations of the executions that succeeded
    pub registrations: Vec<Registration>,
    /// Outcomes of deletion events, in input order
    pub deregistrations: Vec<DeregisterOutcome>,
    /// Executions that ended in an error
    pub failures: Vec<ExecutionFailure>,
}

impl LocalRunReport {
    /// True when no execution failed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Processes events in-process, running create workflows concurrently
#[derive(Clone)]
pub struct LocalRunner {
    clusters: Arc<dyn ClusterApi>,
    workflow: Arc<ProvisioningWorkflow>,
    deletion: DeletionHandler,
}

impl LocalRunner {
    /// Create a new LocalRunner
    pub fn new(
        clusters: Arc<dyn ClusterApi>,
        workflow: Arc<ProvisioningWorkflow>,
        deletion: DeletionHandler,
    ) -> Self {
        Self {
            clusters,
            workflow,
            deletion,
        }
    }

    /// Run one event or a JSON array of events
    ///
    /// Failed executions are collected in the report; only malformed events
    /// and deletion errors fail the run itself.
    pub async fn run(&self, input: serde_json::Value) -> Result<LocalRunReport> {
        let raw_events = match input {
            serde_json::Value::Array(items) => items,
            single => vec![single],
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LocalEngine::new(self.workflow.clone()).with_failure_channel(tx);

        let mut executions = Vec::new();
        let mut deregistrations = Vec::new();
        for raw in raw_events {
            let event = AuditEvent::from_value(raw)?;
            match event.kind()? {
                LifecycleKind::Created => {
                    let cluster = self.clusters.describe_cluster(event.cluster_name()).await?;
                    let (handle, task) = engine.spawn(cluster.into());
                    info!(execution = %handle.execution_id, "Local execution started");
                    executions.push(task);
                }
                LifecycleKind::Deleted => {
                    deregistrations.push(self.deletion.on_cluster_deleted(&event).await?);
                }
            }
        }
        // Closes the failure channel once every task has finished.
        drop(engine);

        let registrations = futures::future::join_all(executions)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(Ok(registration)) => Some(registration),
                Ok(Err(_)) => None,
                Err(e) => {
                    error!(error = %e, "Local execution task panicked");
                    None
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some(failure) = rx.recv().await {
            failures.push(failure);
        }

        Ok(LocalRunReport {
            registrations,
            deregistrations,
            failures,
        })
    }
}
