//! Opaque shared secrets of the registry (the distribution HTTP secret)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::patch::{data_string, owned_secret, same_data, PatchCollector, SecretData};
use crate::constants;
use crate::helpers::{generate_random_string, SECRET_LENGTH};

pub const KEY_HTTP: &str = "http";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http: String,
}

impl State {
    /// Make sure `http` is set. Once set it is never rotated.
    pub fn process(&mut self, secret: Option<&SecretData>, patches: &mut PatchCollector) {
        if self.http.is_empty() {
            let stored = secret
                .map(|data| data_string(data, KEY_HTTP))
                .unwrap_or_default();
            if stored.is_empty() {
                info!("Generating registry HTTP secret");
                self.http = generate_random_string(SECRET_LENGTH);
            } else {
                self.http = stored;
            }
        }

        let desired: SecretData =
            BTreeMap::from([(KEY_HTTP.to_string(), self.http.clone().into_bytes())]);
        if !same_data(secret, &desired) {
            patches.apply_secret(owned_secret(constants::SECRETS_SECRET, None, &[], desired));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_once_and_persists() {
        let mut state = State::default();
        let mut patches = PatchCollector::new();
        state.process(None, &mut patches);

        assert_eq!(state.http.len(), SECRET_LENGTH);
        assert_eq!(patches.applied_secret_names(), vec![constants::SECRETS_SECRET]);

        let stored = BTreeMap::from([(KEY_HTTP.to_string(), state.http.clone().into_bytes())]);
        let before = state.http.clone();
        let mut patches = PatchCollector::new();
        state.process(Some(&stored), &mut patches);
        assert_eq!(state.http, before);
        assert!(patches.is_empty());
    }

    #[test]
    fn adopts_existing_secret() {
        let stored = BTreeMap::from([(KEY_HTTP.to_string(), b"existing".to_vec())]);
        let mut state = State::default();
        let mut patches = PatchCollector::new();
        state.process(Some(&stored), &mut patches);

        assert_eq!(state.http, "existing");
        assert!(patches.is_empty());
    }
}
