//! eks-idp - register EKS cluster OIDC issuers as IAM identity providers

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use eks_idp::cluster::{ClusterApi, EksClusterApi};
use eks_idp::config::Config;
use eks_idp::events::AuditEvent;
use eks_idp::handler::{DeletionHandler, Dispatcher, EventRouter, InlineProvisioner, LocalRunner};
use eks_idp::provider::{AwsIamApi, Registrar};
use eks_idp::telemetry::{init_telemetry, LogFormat};
use eks_idp::thumbprint::TlsThumbprintResolver;
use eks_idp::workflow::{ProvisioningWorkflow, StepFunctionsEngine, WorkflowPayload};

/// eks-idp - IAM OIDC identity providers for EKS clusters
#[derive(Parser, Debug)]
#[command(name = "eks-idp", version, about, long_about = None)]
struct Cli {
    /// Log line format (json or text)
    #[arg(long, env = "EKS_IDP_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route a cluster audit event to the create or delete handler
    ///
    /// CreateCluster starts a state machine execution; DeleteCluster removes
    /// the cluster's OIDC provider.
    HandleEvent(InputArgs),

    /// Describe the created cluster and start a state machine execution
    StartWorkflow(InputArgs),

    /// Workflow step: succeed with the cluster description once it is ACTIVE
    ///
    /// Exits non-zero while the cluster is not ready; the state machine's
    /// retry policy decides when to ask again.
    IsClusterReady(InputArgs),

    /// Workflow step: register the active cluster's issuer with IAM
    CreateOidcProvider(InputArgs),

    /// Wait for the created cluster in-process, then register its issuer
    OnCreateCluster(InputArgs),

    /// Remove the OIDC provider of a deleted cluster
    OnDeleteCluster(InputArgs),

    /// Run one event or an array of events without a state machine
    ///
    /// Create events run the full workflow on local tasks, concurrently.
    RunLocal(InputArgs),
}

impl Commands {
    fn input(&self) -> &InputArgs {
        match self {
            Self::HandleEvent(args)
            | Self::StartWorkflow(args)
            | Self::IsClusterReady(args)
            | Self::CreateOidcProvider(args)
            | Self::OnCreateCluster(args)
            | Self::OnDeleteCluster(args)
            | Self::RunLocal(args) => args,
        }
    }
}

/// Input arguments shared by every subcommand
#[derive(Args, Debug)]
struct InputArgs {
    /// JSON input file (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,
}

/// AWS clients and workflow wiring built from configuration
struct Services {
    sdk_config: aws_config::SdkConfig,
    clusters: Arc<dyn ClusterApi>,
    registrar: Registrar,
    workflow: Arc<ProvisioningWorkflow>,
}

impl Services {
    async fn build(config: &Config) -> anyhow::Result<Self> {
        let sdk_config = config.sdk_config().await;
        let clusters: Arc<dyn ClusterApi> = Arc::new(EksClusterApi::new(&sdk_config));
        let registrar =
            Registrar::with_client_id(Arc::new(AwsIamApi::new(&sdk_config)), &config.client_id);

        let trust_bundle = config.load_trust_bundle().await?;
        let resolver = TlsThumbprintResolver::new(config.http_timeout(), config.tls_timeout())?
            .with_trust_bundle(trust_bundle);

        let workflow = ProvisioningWorkflow::new(clusters.clone(), Arc::new(resolver), registrar.clone())
            .with_readiness_policy(config.readiness_policy());

        Ok(Self {
            sdk_config,
            clusters,
            registrar,
            workflow: Arc::new(workflow),
        })
    }

    fn dispatcher(&self, config: &Config) -> anyhow::Result<Dispatcher> {
        let state_machine = config.require_state_machine_arn()?;
        Ok(Dispatcher::new(
            self.clusters.clone(),
            Arc::new(StepFunctionsEngine::new(&self.sdk_config)),
            state_machine,
        ))
    }

    fn deletion(&self) -> DeletionHandler {
        DeletionHandler::new(self.clusters.clone(), self.registrar.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The TLS handshake and the AWS clients share the aws-lc-rs provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(cli.log_format).context("failed to initialize logging")?;
    cli.config.validate()?;

    let input = read_input(cli.command.input()).await?;
    let services = Services::build(&cli.config).await?;

    let output = run(cli.command, &cli.config, &services, input).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn read_input(args: &InputArgs) -> anyhow::Result<Value> {
    let text = match &args.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read input file {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("failed to read input from stdin")?;
            text
        }
    };
    serde_json::from_str(&text).context("input is not valid JSON")
}

async fn run(
    command: Commands,
    config: &Config,
    services: &Services,
    input: Value,
) -> anyhow::Result<Value> {
    let output = match command {
        Commands::HandleEvent(_) => {
            let router = EventRouter::new(services.dispatcher(config)?, services.deletion());
            serde_json::to_value(router.handle_event(input).await?)?
        }
        Commands::StartWorkflow(_) => {
            let event = AuditEvent::from_value(input)?;
            info!(event = ?event, "Received cluster creation event");
            serde_json::to_value(services.dispatcher(config)?.on_cluster_created(&event).await?)?
        }
        Commands::IsClusterReady(_) => {
            let payload: WorkflowPayload =
                serde_json::from_value(input).context("input is not a workflow payload")?;
            serde_json::to_value(services.workflow.is_cluster_ready(&payload).await?)?
        }
        Commands::CreateOidcProvider(_) => {
            let payload: WorkflowPayload =
                serde_json::from_value(input).context("input is not a workflow payload")?;
            serde_json::to_value(services.workflow.create_oidc_provider(&payload).await?)?
        }
        Commands::OnCreateCluster(_) => {
            let event = AuditEvent::from_value(input)?;
            info!(event = ?event, "Received cluster creation event");
            let provisioner =
                InlineProvisioner::new(services.clusters.clone(), services.workflow.clone());
            serde_json::to_value(provisioner.on_cluster_created(&event).await?)?
        }
        Commands::OnDeleteCluster(_) => {
            let event = AuditEvent::from_value(input)?;
            info!(event = ?event, "Received cluster deletion event");
            serde_json::to_value(services.deletion().on_cluster_deleted(&event).await?)?
        }
        Commands::RunLocal(_) => {
            let runner = LocalRunner::new(
                services.clusters.clone(),
                services.workflow.clone(),
                services.deletion(),
            );
            let report = runner.run(input).await?;
            if !report.is_success() {
                // stdout only ever carries a successful result.
                let rendered = serde_json::to_string(&report)?;
                error!(report = %rendered, "Local run finished with failed executions");
                anyhow::bail!("{} workflow execution(s) failed", report.failures.len());
            }
            serde_json::to_value(report)?
        }
    };
    Ok(output)
}
