use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::api::Api;
use system_registry_orchestrator::constants::{MODULE_NAME, NAMESPACE, NODE_AGENT_PORT};
use system_registry_orchestrator::controller::{
    self, GlobalValuesSync, NodeAgentClient, NodeAgentConfig, SecretCache,
};
use system_registry_orchestrator::crd::{ModuleConfig, UserOperation};
use system_registry_orchestrator::user_operations::{dex::DEX_NAMESPACE, UserOperationRunner};
use system_registry_orchestrator::values::MemoryValues;
use system_registry_orchestrator::Error;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the registry module state in the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace of the registry components
    #[arg(long, env = "POD_NAMESPACE", default_value = NAMESPACE)]
    namespace: String,

    /// Resync interval in seconds when nothing changes
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    reconcile_interval_secs: u64,

    /// PEM bundle verifying the node agents' serving certificates
    #[arg(long, env = "NODE_AGENT_CA_FILE")]
    node_agent_ca_file: Option<PathBuf>,

    /// File with the bearer token sent to the node agents
    #[arg(long, env = "NODE_AGENT_TOKEN_FILE")]
    node_agent_token_file: Option<PathBuf>,

    /// Skip verification of the node agents' certificates
    #[arg(long, env = "NODE_AGENT_INSECURE")]
    node_agent_insecure: bool,

    #[arg(long, env = "NODE_AGENT_PORT", default_value_t = NODE_AGENT_PORT)]
    node_agent_port: u16,

    /// Namespace of the Dex storage objects
    #[arg(long, env = "DEX_NAMESPACE", default_value = DEX_NAMESPACE)]
    dex_namespace: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Reconcile without holding the leader lease
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    #[arg(long, env = "POD_NAMESPACE", default_value = NAMESPACE)]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("registry-orchestrator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_orchestrator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    let module_configs: Api<ModuleConfig> = Api::all(client.clone());
    match module_configs.get_opt(MODULE_NAME).await? {
        Some(mc) => {
            let mode = &mc.spec.settings.mode;
            println!("Module enabled: {}", mc.spec.is_enabled());
            println!("Requested mode: {}", if mode.is_empty() { "Unmanaged" } else { mode });
        }
        None => println!("ModuleConfig {MODULE_NAME} not found"),
    }

    let config_maps: Api<k8s_openapi::api::core::v1::ConfigMap> =
        Api::namespaced(client.clone(), &args.namespace);
    if let Some(cm) = config_maps
        .get_opt(system_registry_orchestrator::constants::STATE_CONFIGMAP)
        .await?
    {
        for (key, value) in cm.data.unwrap_or_default() {
            println!("{key}: {}", value.trim_end());
        }
    }

    let operations: Api<UserOperation> = Api::all(client);
    println!("UserOperations: {}", operations.list(&Default::default()).await?.items.len());
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_orchestrator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!("Starting registry-orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let is_leader = Arc::new(AtomicBool::new(args.disable_leader_election));
    if args.disable_leader_election {
        info!("Leader election disabled, reconciling unconditionally");
    } else {
        let identity = controller::holder_identity();
        info!(identity = %identity, "Leader election enabled");
        tokio::spawn(controller::run_leader_election(
            client.clone(),
            args.namespace.clone(),
            identity,
            Arc::clone(&is_leader),
        ));
    }

    let node_agent = NodeAgentClient::new(&NodeAgentConfig {
        port: args.node_agent_port,
        ca_file: args.node_agent_ca_file,
        token_file: args.node_agent_token_file,
        insecure: args.node_agent_insecure,
        ..Default::default()
    })?;

    let values = MemoryValues::new();
    let global_sync = GlobalValuesSync::new(client.clone(), &args.namespace, values.clone());
    tokio::spawn(async move {
        if let Err(e) = global_sync.run().await {
            error!("Global registry values sync stopped: {e}");
        }
    });

    let (secrets, secrets_writer) = SecretCache::new(client.clone(), &args.namespace);
    let state = Arc::new(controller::ControllerState {
        client: client.clone(),
        namespace: args.namespace.clone(),
        values,
        secrets,
        node_agent: Arc::new(node_agent),
        is_leader: Arc::clone(&is_leader),
        interval: Duration::from_secs(args.reconcile_interval_secs),
        lock: tokio::sync::Mutex::new(()),
    });

    let runner = UserOperationRunner::new(client, &args.dex_namespace, is_leader);
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("UserOperation runner stopped: {e}");
        }
    });

    controller::run_controller(state, secrets_writer).await
}
