//! Controller loop for the system-registry ModuleConfig
//!
//! Every change to the module config or to an object the orchestrator
//! observes triggers a reconcile of the single `system-registry` object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{store::Writer, ObjectRef};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::apply::{emit_event, Applier};
use super::cache::SecretCache;
use super::driver;
use super::inputs::InputsCollector;
use super::status;
use crate::constants::{DECKHOUSE_DEPLOYMENT, MODULE_NAME};
use crate::crd::ModuleConfig;
use crate::error::{Error, Result};
use crate::orchestrator::{EventType, ModuleParams, StaticPodClient};
use crate::values::{self, MemoryValues, CONFIG_PATH};

pub const EVENT_RECONCILE_FAILED: &str = "ReconcileFailed";

/// Requeue delay while a transition is still converging
const PROGRESS_REQUEUE: Duration = Duration::from_secs(5);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub namespace: String,
    pub values: MemoryValues,
    pub secrets: SecretCache,
    pub node_agent: Arc<dyn StaticPodClient>,
    pub is_leader: Arc<AtomicBool>,
    /// Periodic resync when nothing changes
    pub interval: Duration,
    /// Serializes reconciles
    pub lock: Mutex<()>,
}

fn module_ref() -> Option<ObjectRef<ModuleConfig>> {
    Some(ObjectRef::new(MODULE_NAME))
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>, secrets_writer: Writer<Secret>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.namespace.clone();
    let module_configs: Api<ModuleConfig> = Api::all(client.clone());

    info!(namespace = %namespace, "Starting system-registry controller");

    if let Err(e) = module_configs.list(&Default::default()).await {
        error!("ModuleConfig CRD is not available: {e}");
        return Err(Error::ConfigError("ModuleConfig CRD not installed".to_string()));
    }

    let secrets = watcher(state.secrets.api().clone(), watcher::Config::default())
        .default_backoff()
        .reflect(secrets_writer)
        .touched_objects();

    Controller::new(
        module_configs,
        watcher::Config::default().fields(&format!("metadata.name={MODULE_NAME}")),
    )
    .with_config(controller::Config::default().debounce(Duration::from_secs(1)))
    .watches_stream(secrets, |_: Secret| module_ref())
    .watches(Api::<Node>::all(client.clone()), watcher::Config::default(), |_| module_ref())
    .watches(
        Api::<Pod>::namespaced(client.clone(), &namespace),
        watcher::Config::default(),
        |_| module_ref(),
    )
    .watches(
        Api::<Deployment>::namespaced(client.clone(), &namespace),
        watcher::Config::default().fields(&format!("metadata.name={DECKHOUSE_DEPLOYMENT}")),
        |_| module_ref(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, state)
    .for_each(|res| async move {
        match res {
            Ok((obj, _)) => debug!(object = %obj.name, "Reconciled"),
            Err(e) => warn!("Reconcile error: {e}"),
        }
    })
    .await;

    Ok(())
}

#[instrument(skip(module_config, ctx), fields(name = %module_config.name_any()))]
async fn reconcile(module_config: Arc<ModuleConfig>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping");
        return Ok(Action::requeue(ctx.interval));
    }
    let _guard = ctx.lock.lock().await;

    let config = ModuleParams {
        enabled: module_config.spec.is_enabled(),
        generation: module_config.metadata.generation.unwrap_or_default(),
        settings: module_config.spec.settings.clone(),
    };
    values::set_typed(&ctx.values, CONFIG_PATH, &config)?;

    match run_tick(&module_config, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            if let Err(event_err) = emit_event(
                &ctx.client,
                &module_config,
                EventType::Warning,
                EVENT_RECONCILE_FAILED,
                &e.to_string(),
            )
            .await
            {
                warn!("Failed to emit event: {event_err}");
            }
            Err(e)
        }
    }
}

async fn run_tick(module_config: &ModuleConfig, ctx: &ControllerState) -> Result<Action> {
    let Some((params, state)) = driver::load(&ctx.values)? else {
        info!("Module disabled");
        return Ok(Action::requeue(ctx.interval));
    };

    let inputs = InputsCollector {
        client: &ctx.client,
        namespace: &ctx.namespace,
        secrets: &ctx.secrets,
        values: &ctx.values,
    }
    .collect()
    .await?;

    let tick = driver::process(&ctx.values, &params, &state, &inputs, ctx.node_agent.as_ref()).await?;

    Applier {
        client: &ctx.client,
        namespace: &ctx.namespace,
        module_config,
    }
    .apply_all(tick.patches.into_operations())
    .await?;
    status::publish(&ctx.client, &ctx.namespace, &ctx.values, &tick.state).await?;

    info!(
        mode = %tick.state.mode,
        target = %tick.state.target_mode,
        ready = tick.outcome.ready,
        "Orchestration tick done"
    );

    Ok(if tick.outcome.ready {
        Action::requeue(ctx.interval)
    } else {
        Action::requeue(PROGRESS_REQUEUE.min(ctx.interval))
    })
}

fn error_policy(module_config: Arc<ModuleConfig>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {error}", module_config.name_any());

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
