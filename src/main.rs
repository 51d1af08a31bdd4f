//! vSphere provisioner - reconciles Cluster API Machines into vSphere VMs

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use vsphere_provisioner::bootstrap::SecretBootstrapData;
use vsphere_provisioner::config::ProvisionerConfig;
use vsphere_provisioner::controller::{error_policy, reconcile, Context};
use vsphere_provisioner::crd::{Cluster, Machine};
use vsphere_provisioner::events::KubeEventPublisher;
use vsphere_provisioner::provisioner::Provisioner;
use vsphere_provisioner::session::SessionManager;
use vsphere_provisioner::status::{KubeMachineStore, MachineStore};
use vsphere_provisioner::telemetry::{init_logging, LogFormat};
use vsphere_provisioner::vsphere::rest::RestConnector;
use vsphere_provisioner::DEFAULT_FIELD_MANAGER;

/// vSphere provisioner - turns Machines into cloned vSphere VMs
#[derive(Parser, Debug)]
#[command(name = "vsphere-provisioner", version, about, long_about = None)]
struct Cli {
    /// Print the Machine and Cluster CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Machine controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Timeout for each vCenter request, in seconds
    #[arg(long, env = "VSPHERE_API_TIMEOUT_SECS", default_value = "300")]
    api_timeout_secs: u64,

    /// Delay between polls of an in-flight vCenter task, in seconds
    #[arg(long, env = "TASK_POLL_SECS", default_value = "5")]
    task_poll_secs: u64,

    /// Delay before retrying when bootstrap data or the guest IP is not ready, in seconds
    #[arg(long, env = "NOT_READY_REQUEUE_SECS", default_value = "20")]
    not_ready_requeue_secs: u64,

    /// Resync interval for provisioned machines, in seconds
    #[arg(long, env = "RESYNC_SECS", default_value = "600")]
    resync_secs: u64,

    /// Only watch Machines in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Field manager name for Kubernetes patches
    #[arg(long, env = "FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self::parse_from(["controller"])
    }
}

impl ControllerArgs {
    fn provisioner_config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            task_poll_interval: Duration::from_secs(self.task_poll_secs),
            not_ready_requeue: Duration::from_secs(self.not_ready_requeue_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            field_manager: self.field_manager.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both kube and reqwest use rustls; pin the process-wide provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [Machine::crd(), Cluster::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_logging(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("vSphere provisioner starting...");
    let config = args.provisioner_config();

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let store: Arc<dyn MachineStore> =
        Arc::new(KubeMachineStore::new(client.clone(), &config.field_manager));
    let provisioner = Provisioner::new(
        SessionManager::new(Arc::new(RestConnector::new(config.api_timeout))),
        store.clone(),
        Arc::new(SecretBootstrapData::new(
            store.clone(),
            config.not_ready_requeue,
        )),
        Arc::new(KubeEventPublisher::new(client.clone(), &config.field_manager)),
        config,
    );
    let ctx = Arc::new(Context::new(provisioner, store));

    let machines: Api<Machine> = match &args.watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    tracing::info!(
        namespace = args.watch_namespace.as_deref().unwrap_or("<all>"),
        "Starting Machine controller"
    );
    Controller::new(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Machine reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Machine reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("vSphere provisioner shutting down");
    Ok(())
}
