//! Publishes the orchestrator state for operators and dependent modules

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use serde_json::Value;

use crate::constants::{self, STATE_CONFIGMAP};
use crate::error::Result;
use crate::orchestrator::patch::MANAGER_NAME;
use crate::orchestrator::State;
use crate::values::{ValuesStore, READY_PATH};

/// ConfigMap summarising `state`
pub fn state_config_map(state: &State, namespace: &str) -> Result<ConfigMap> {
    let data = BTreeMap::from([
        ("mode".to_string(), state.mode.to_string()),
        ("targetMode".to_string(), state.target_mode.to_string()),
        ("ready".to_string(), state.is_ready().to_string()),
        ("conditions".to_string(), serde_yaml::to_string(&state.conditions)?),
    ]);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(STATE_CONFIGMAP.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (constants::LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
                (constants::LABEL_MODULE.to_string(), constants::MODULE_NAME.to_string()),
            ])),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

pub async fn publish(
    client: &Client,
    namespace: &str,
    values: &dyn ValuesStore,
    state: &State,
) -> Result<()> {
    values.set(READY_PATH, Value::Bool(state.is_ready()));

    let config_map = state_config_map(state, namespace)?;
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    api.patch(
        STATE_CONFIGMAP,
        &PatchParams::apply(MANAGER_NAME).force(),
        &Patch::Apply(&config_map),
    )
    .await?;
    Ok(())
}
