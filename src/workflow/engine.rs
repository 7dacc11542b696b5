//! Workflow execution engines
//!
//! The dispatcher only needs to start an execution and move on. In production
//! that is an AWS Step Functions `StartExecution` call; the state machine
//! drives the readiness retry and invokes each step. The [`LocalEngine`]
//! runs the same workflow on a tokio task for single-binary deployments and
//! tests, publishing terminal failures on a channel.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_sfn::error::DisplayErrorContext;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

#[cfg(test)]
use mockall::automock;

use super::{ProvisioningWorkflow, Registration, WorkflowPayload};
use crate::{Error, Result};

/// Handle of a started execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHandle {
    /// Execution ARN, or a local execution id
    pub execution_id: String,
}

/// Terminal failure of a workflow execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    /// Execution that failed
    pub execution_id: String,
    /// Cluster the execution was provisioning
    pub cluster: String,
    /// Rendered error
    pub error: String,
}

/// Trait for starting workflow executions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Start one execution of `workflow_id` with the given input
    ///
    /// Returns as soon as the execution is accepted; does not wait for it.
    async fn start_execution(
        &self,
        workflow_id: &str,
        input: &WorkflowPayload,
    ) -> Result<ExecutionHandle>;
}

/// Engine backed by AWS Step Functions
#[derive(Clone, Debug)]
pub struct StepFunctionsEngine {
    client: aws_sdk_sfn::Client,
}

impl StepFunctionsEngine {
    /// Create a new StepFunctionsEngine from shared SDK configuration
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_sfn::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl WorkflowEngine for StepFunctionsEngine {
    async fn start_execution(
        &self,
        workflow_id: &str,
        input: &WorkflowPayload,
    ) -> Result<ExecutionHandle> {
        let input_json = serde_json::to_string(input)?;

        let output = self
            .client
            .start_execution()
            .state_machine_arn(workflow_id)
            .input(input_json)
            .send()
            .await
            .map_err(|e| {
                Error::remote("sfn", "StartExecution", DisplayErrorContext(&e).to_string())
            })?;

        let execution_id = output.execution_arn().to_string();
        info!(execution = %execution_id, "Step function started");
        Ok(ExecutionHandle { execution_id })
    }
}

/// In-process engine running the workflow on a tokio task
#[derive(Clone)]
pub struct LocalEngine {
    workflow: Arc<ProvisioningWorkflow>,
    failures: Option<mpsc::UnboundedSender<ExecutionFailure>>,
}

impl LocalEngine {
    /// Create a new LocalEngine for the given workflow
    pub fn new(workflow: Arc<ProvisioningWorkflow>) -> Self {
        Self {
            workflow,
            failures: None,
        }
    }

    /// Publish terminal failures on the given channel
    pub fn with_failure_channel(mut self, tx: mpsc::UnboundedSender<ExecutionFailure>) -> Self {
        self.failures = Some(tx);
        self
    }

    /// Start an execution and return its handle plus the task running it
    pub fn spawn(&self, input: WorkflowPayload) -> (ExecutionHandle, JoinHandle<Result<Registration>>) {
        let cluster = input.cluster.name.clone();
        let execution_id = format!("local:{}:{}", cluster, uuid::Uuid::new_v4());

        let workflow = self.workflow.clone();
        let failures = self.failures.clone();
        let span = info_span!("execution", execution = %execution_id, cluster = %cluster);
        let id = execution_id.clone();

        let task = tokio::spawn(
            async move {
                let result = workflow.run(input).await;
                match &result {
                    Ok(registration) => info!(
                        issuer = %registration.issuer,
                        created = registration.provider.created,
                        "Workflow succeeded"
                    ),
                    Err(e) => {
                        error!(error = %e, "Workflow failed");
                        if let Some(tx) = failures {
                            // A dropped receiver only loses the notification.
                            let _ = tx.send(ExecutionFailure {
                                execution_id: id,
                                cluster,
                                error: e.to_string(),
                            });
                        }
                    }
                }
                result
            }
            .instrument(span),
        );

        (ExecutionHandle { execution_id }, task)
    }
}

#[async_trait]
impl WorkflowEngine for LocalEngine {
    async fn start_execution(
        &self,
        workflow_id: &str,
        input: &WorkflowPayload,
    ) -> Result<ExecutionHandle> {
        let (handle, _task) = self.spawn(input.clone());
        info!(workflow = %workflow_id, execution = %handle.execution_id, "Local execution started");
        Ok(handle)
    }
}
