//! Reflector-backed Secret reads with a direct API fallback

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::Client;
use tracing::debug;

use crate::error::Result;

/// Secrets of the module namespace
///
/// The store is filled by the watch stream the controller consumes. Reads
/// prefer it and hit the API server only on a miss.
#[derive(Clone)]
pub struct SecretCache {
    api: Api<Secret>,
    store: Store<Secret>,
    namespace: String,
}

impl SecretCache {
    pub fn new(client: Client, namespace: &str) -> (Self, Writer<Secret>) {
        let (store, writer) = reflector::store();
        let cache = Self {
            api: Api::namespaced(client, namespace),
            store,
            namespace: namespace.to_string(),
        };
        (cache, writer)
    }

    pub fn api(&self) -> &Api<Secret> {
        &self.api
    }

    pub async fn get(&self, name: &str) -> Result<Option<Secret>> {
        let key = ObjectRef::new(name).within(&self.namespace);
        if let Some(secret) = self.store.get(&key) {
            return Ok(Some((*secret).clone()));
        }
        debug!(secret = name, "Secret cache miss, reading from API");
        Ok(self.api.get_opt(name).await?)
    }

    /// Every secret in the namespace; an empty store means it has not synced
    pub async fn list(&self) -> Result<Vec<Secret>> {
        let cached = self.store.state();
        if !cached.is_empty() {
            return Ok(cached.iter().map(|s| (**s).clone()).collect());
        }
        debug!("Secret cache empty, listing from API");
        Ok(self.api.list(&ListParams::default()).await?.items)
    }
}
