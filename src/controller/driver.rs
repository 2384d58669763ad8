//! One orchestration tick over the values store
//!
//! The module config and the orchestrator state are read from the
//! [`ValuesStore`], processed, and the state written back only when
//! processing succeeded. A failed tick leaves the stored state untouched.

use tracing::{info, warn};

use crate::error::Result;
use crate::orchestrator::{Inputs, ModuleParams, Params, PatchCollector, ProcessOutcome, State, StaticPodClient};
use crate::values::{self, ValuesStore, CONFIG_PATH, READY_PATH, STATE_PATH};

/// What the caller needs to finish a tick
#[derive(Debug)]
pub struct Tick {
    pub state: State,
    pub outcome: ProcessOutcome,
    pub patches: PatchCollector,
}

/// Params and state for an enabled module, `None` after clearing a disabled one
pub fn load(values: &dyn ValuesStore) -> Result<Option<(Params, State)>> {
    let config: ModuleParams = values::get_typed(values, CONFIG_PATH)?;
    if !config.enabled {
        if values.get(STATE_PATH).is_some() {
            info!("Module disabled, dropping orchestrator state");
        }
        values.remove(STATE_PATH);
        values.remove(READY_PATH);
        return Ok(None);
    }

    let params = Params::from_settings(&config.settings, config.generation)?;
    let state = values::get_optional(values, STATE_PATH)?.unwrap_or_default();
    Ok(Some((params, state)))
}

pub async fn process(
    values: &dyn ValuesStore,
    params: &Params,
    state: &State,
    inputs: &Inputs,
    client: &dyn StaticPodClient,
) -> Result<Tick> {
    let mut next = state.clone();
    let mut patches = PatchCollector::new();

    let outcome = next.process(params, inputs, client, &mut patches).await?;
    if let Some(reason) = &outcome.fatal {
        warn!(reason = %reason, "Orchestrator cannot progress");
    }

    values::set_typed(values, STATE_PATH, &next)?;
    Ok(Tick {
        state: next,
        outcome,
        patches,
    })
}
