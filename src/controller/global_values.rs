//! Keeps `global.modulesImages.registry` in step with the registry secret
//!
//! Runs next to the reconcile loop, not inside it, so a tick that patches
//! the secret still sees the previous global values and waits for them.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::constants::DECKHOUSE_REGISTRY_SECRET;
use crate::deckhouse_registry::{DeckhouseRegistryConfig, GlobalRegistryValues};
use crate::error::{Error, Result};
use crate::values::{self, MemoryValues, ValuesStore, GLOBAL_REGISTRY_PATH};

pub struct GlobalValuesSync {
    api: Api<Secret>,
    values: MemoryValues,
}

impl GlobalValuesSync {
    pub fn new(client: Client, namespace: &str, values: MemoryValues) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            values,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut events = watcher(
            self.api.clone(),
            watcher::Config::default().fields(&format!("metadata.name={DECKHOUSE_REGISTRY_SECRET}")),
        )
        .default_backoff()
        .applied_objects()
        .boxed();

        info!(secret = DECKHOUSE_REGISTRY_SECRET, "Starting global registry values sync");
        while let Some(event) = events.next().await {
            match event {
                Ok(secret) => {
                    if let Err(e) = mirror_registry_secret(&self.values, &secret) {
                        warn!(secret = %secret.name_any(), error = %e, "Cannot update global registry values");
                    }
                }
                Err(e) => warn!(error = %e, "Registry secret watch error"),
            }
        }
        Err(Error::ConfigError("Registry secret watch ended".to_string()))
    }
}

/// Store the global values derived from `secret`; true when they changed
pub fn mirror_registry_secret(store: &dyn ValuesStore, secret: &Secret) -> Result<bool> {
    let global = DeckhouseRegistryConfig::from_secret(secret)?.global_values();
    let current: Option<GlobalRegistryValues> = values::get_optional(store, GLOBAL_REGISTRY_PATH)?;
    if current.as_ref() == Some(&global) {
        debug!("Global registry values unchanged");
        return Ok(false);
    }

    info!(address = %global.address, path = %global.path, "Updating global registry values");
    values::set_typed(store, GLOBAL_REGISTRY_PATH, &global)?;
    Ok(true)
}
