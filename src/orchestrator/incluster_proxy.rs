//! The Direct mode translating proxy
//!
//! A single Deployment in the cluster serves the embedded registry address
//! and forwards to the upstream, rewriting image paths. Its whole config is
//! kept in the `registry-incluster-proxy-config` Secret.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::node_services::NodePki;
use super::patch::{data_string, owned_secret, same_data, PatchCollector, SecretData};
use super::pki::GlobalPki;
use super::users::User;
use crate::constants;
use crate::deckhouse_registry::UpstreamParams;
use crate::error::Result;
use crate::helpers::{compute_hash, registry_address_and_path};
use crate::pki::CertKey;

pub const KEY_VERSION: &str = "version";
pub const KEY_CONFIG: &str = "config";

const PKI_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", constants::SERVICE_DNS];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub ca_cert: String,
    pub auth_cert: String,
    pub auth_key: String,
    pub token_cert: String,
    pub token_key: String,
    pub distribution_cert: String,
    pub distribution_key: String,
    pub http_secret: String,
    pub upstream: Upstream,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

impl Config {
    fn proxy_pki(&self) -> NodePki {
        NodePki {
            auth: CertKey {
                cert: self.auth_cert.clone(),
                key: self.auth_key.clone(),
            },
            distribution: CertKey {
                cert: self.distribution_cert.clone(),
                key: self.distribution_key.clone(),
            },
        }
    }
}

pub struct Params {
    pub pki: GlobalPki,
    pub http_secret: String,
    pub upstream: UpstreamParams,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyPod {
    pub name: String,
    pub ready: bool,
    /// Value of the incluster-proxy-version annotation
    pub version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    pub config_secret: Option<SecretData>,
    pub pods: Vec<ProxyPod>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub ready: bool,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Config>,
}

impl State {
    pub fn process(
        &mut self,
        params: &Params,
        inputs: &Inputs,
        patches: &mut PatchCollector,
    ) -> Result<ProcessResult> {
        let stored: Option<Config> = inputs
            .config_secret
            .as_ref()
            .map(|data| data_string(data, KEY_CONFIG))
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| match serde_yaml::from_str(&raw) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(error = %e, "Cannot decode in-cluster proxy config");
                    None
                }
            });
        let previous = self.config.as_ref().or(stored.as_ref());

        let proxy_pki = match previous.map(Config::proxy_pki) {
            Some(current) => match current.validate_for_hosts(&params.pki.ca, &PKI_HOSTS) {
                Ok(()) => current,
                Err(e) => {
                    warn!(error = %e, "In-cluster proxy PKI is invalid, regenerating");
                    NodePki::generate_for_hosts(&params.pki.ca, &PKI_HOSTS)?
                }
            },
            None => {
                info!("Generating in-cluster proxy PKI");
                NodePki::generate_for_hosts(&params.pki.ca, &PKI_HOSTS)?
            }
        };

        let (host, path) = registry_address_and_path(&params.upstream.images_repo);
        let mut user = User {
            name: params.upstream.username.clone(),
            password: params.upstream.password.clone(),
            hashed_password: previous
                .filter(|c| c.upstream.user.password == params.upstream.password)
                .map(|c| c.upstream.user.hashed_password.clone())
                .unwrap_or_default(),
        };
        user.ensure_password_hash()?;

        let config = Config {
            ca_cert: params.pki.ca.cert.clone(),
            auth_cert: proxy_pki.auth.cert,
            auth_key: proxy_pki.auth.key,
            token_cert: params.pki.token.cert.clone(),
            token_key: params.pki.token.key.clone(),
            distribution_cert: proxy_pki.distribution.cert,
            distribution_key: proxy_pki.distribution.key,
            http_secret: params.http_secret.clone(),
            upstream: Upstream {
                scheme: params.upstream.scheme.to_lowercase(),
                host,
                path,
                user,
                ca_cert: Some(params.upstream.ca.clone()).filter(|ca| !ca.is_empty()),
            },
        };
        let version = compute_hash(&config)?;

        let data = BTreeMap::from([
            (KEY_VERSION.to_string(), version.clone().into_bytes()),
            (
                KEY_CONFIG.to_string(),
                serde_yaml::to_string(&config)?.into_bytes(),
            ),
        ]);
        if !same_data(inputs.config_secret.as_ref(), &data) {
            info!(version = %version, "Updating in-cluster proxy config");
            patches.apply_secret(owned_secret(
                constants::INCLUSTER_PROXY_CONFIG_SECRET,
                None,
                &[],
                data,
            ));
        }
        self.config = Some(config);

        Ok(pods_result(&inputs.pods, &version))
    }

    /// Remove the proxy config; ready once no proxy pod is left
    pub fn stop(&mut self, inputs: &Inputs, patches: &mut PatchCollector) -> ProcessResult {
        self.config = None;
        if inputs.config_secret.is_some() {
            patches.delete_secret(constants::INCLUSTER_PROXY_CONFIG_SECRET);
        }
        if inputs.pods.is_empty() {
            ProcessResult {
                ready: true,
                message: String::new(),
            }
        } else {
            ProcessResult {
                ready: false,
                message: format!(
                    "Waiting for {} in-cluster proxy pod(s) to terminate",
                    inputs.pods.len()
                ),
            }
        }
    }
}

fn pods_result(pods: &[ProxyPod], version: &str) -> ProcessResult {
    if pods.is_empty() {
        return ProcessResult {
            ready: false,
            message: "Waiting for in-cluster proxy pods to start".to_string(),
        };
    }
    let mut pending: Vec<&str> = pods
        .iter()
        .filter(|p| !p.ready || p.version != version)
        .map(|p| p.name.as_str())
        .collect();
    if pending.is_empty() {
        return ProcessResult {
            ready: true,
            message: String::new(),
        };
    }
    pending.sort_unstable();
    ProcessResult {
        ready: false,
        message: format!(
            "{}/{} in-cluster proxy pod(s) ready, waiting for: {}",
            pods.len() - pending.len(),
            pods.len(),
            pending.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pki: GlobalPki, password: &str) -> Params {
        Params {
            pki,
            http_secret: "http".to_string(),
            upstream: UpstreamParams {
                images_repo: "registry.example.com/deckhouse/ee".to_string(),
                scheme: "HTTPS".to_string(),
                ca: String::new(),
                username: "puller".to_string(),
                password: password.to_string(),
            },
        }
    }

    #[test]
    fn renders_config_and_waits_for_pods() {
        let mut state = State::default();
        let mut patches = PatchCollector::new();
        let result = state
            .process(
                &params(GlobalPki::generate().unwrap(), "secret"),
                &Inputs::default(),
                &mut patches,
            )
            .unwrap();

        assert!(!result.ready);
        let config = state.config.as_ref().unwrap();
        assert_eq!(config.upstream.host, "registry.example.com");
        assert_eq!(config.upstream.path, "/deckhouse/ee");
        assert_eq!(config.upstream.scheme, "https");
        assert!(config.upstream.user.is_password_hash_valid());
        assert_eq!(
            patches.applied_secret_names(),
            vec![constants::INCLUSTER_PROXY_CONFIG_SECRET]
        );
    }

    #[test]
    fn hash_and_pki_stay_stable() {
        let pki = GlobalPki::generate().unwrap();
        let mut state = State::default();
        let mut patches = PatchCollector::new();
        state
            .process(&params(pki.clone(), "secret"), &Inputs::default(), &mut patches)
            .unwrap();
        let first = state.config.clone().unwrap();
        let secret = patches
            .applied_secret_data(constants::INCLUSTER_PROXY_CONFIG_SECRET)
            .unwrap();
        let version = data_string(&secret, KEY_VERSION);

        let inputs = Inputs {
            config_secret: Some(secret),
            pods: vec![ProxyPod {
                name: "proxy-0".to_string(),
                ready: true,
                version,
            }],
        };
        // a restarted controller starts from the secret alone
        let mut restarted = State::default();
        let mut patches = PatchCollector::new();
        let result = restarted
            .process(&params(pki, "secret"), &inputs, &mut patches)
            .unwrap();

        assert!(result.ready, "{}", result.message);
        assert!(patches.is_empty());
        assert_eq!(restarted.config.unwrap(), first);
    }

    #[test]
    fn password_change_rehashes() {
        let pki = GlobalPki::generate().unwrap();
        let mut state = State::default();
        state
            .process(&params(pki.clone(), "old"), &Inputs::default(), &mut PatchCollector::new())
            .unwrap();
        let old_hash = state.config.as_ref().unwrap().upstream.user.hashed_password.clone();

        state
            .process(&params(pki, "new"), &Inputs::default(), &mut PatchCollector::new())
            .unwrap();
        let user = &state.config.as_ref().unwrap().upstream.user;
        assert_ne!(user.hashed_password, old_hash);
        assert!(user.is_password_hash_valid());
    }

    #[test]
    fn stop_waits_for_pods() {
        let mut state = State::default();
        let mut patches = PatchCollector::new();
        let inputs = Inputs {
            config_secret: Some(SecretData::new()),
            pods: vec![ProxyPod::default()],
        };
        assert!(!state.stop(&inputs, &mut patches).ready);
        assert_eq!(
            patches.deleted_secret_names(),
            vec![constants::INCLUSTER_PROXY_CONFIG_SECRET]
        );
        assert!(state.stop(&Inputs::default(), &mut PatchCollector::new()).ready);
    }
}
