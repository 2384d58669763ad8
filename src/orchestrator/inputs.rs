//! Typed parameters and cluster observations for one reconcile

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::patch::SecretData;
use super::{bashible, incluster_proxy, node_services, registry_switcher};
use crate::constants::ModeType;
use crate::crd::{RegistrySettings, UpstreamSettings};
use crate::deckhouse_registry::UpstreamParams;
use crate::error::{Error, Result};

/// Module config as stored in the values store under `systemRegistry.config`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleParams {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub settings: RegistrySettings,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub upstream: UpstreamParams,
    pub ttl: Option<String>,
}

impl From<&UpstreamSettings> for UpstreamConfig {
    fn from(settings: &UpstreamSettings) -> Self {
        Self {
            upstream: UpstreamParams {
                images_repo: settings.images_repo(),
                scheme: settings.scheme.to_lowercase(),
                ca: settings.ca.clone(),
                username: settings.user.clone(),
                password: settings.password.clone(),
            },
            ttl: settings.ttl.clone().filter(|t| !t.is_empty()),
        }
    }
}

/// Requested mode with the parameters only that mode needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeParams {
    Unmanaged,
    Direct(UpstreamConfig),
    Proxy(UpstreamConfig),
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Params {
    pub generation: i64,
    pub mode: ModeParams,
}

impl Params {
    pub fn from_settings(settings: &RegistrySettings, generation: i64) -> Result<Self> {
        let mode = ModeType::parse(&settings.mode)
            .ok_or_else(|| Error::ConfigError(format!("unknown registry mode {:?}", settings.mode)))?
            .normalize();

        let mode = match mode {
            ModeType::Unmanaged => ModeParams::Unmanaged,
            ModeType::Local | ModeType::Detached => ModeParams::Local,
            ModeType::Direct => ModeParams::Direct(
                settings
                    .direct
                    .as_ref()
                    .ok_or(Error::MissingModeParams { block: "direct", mode })?
                    .into(),
            ),
            ModeType::Proxy => ModeParams::Proxy(
                settings
                    .proxy
                    .as_ref()
                    .ok_or(Error::MissingModeParams { block: "proxy", mode })?
                    .into(),
            ),
        };
        Ok(Self { generation, mode })
    }

    pub fn mode(&self) -> ModeType {
        match self.mode {
            ModeParams::Unmanaged => ModeType::Unmanaged,
            ModeParams::Direct(_) => ModeType::Direct,
            ModeParams::Proxy(_) => ModeType::Proxy,
            ModeParams::Local => ModeType::Local,
        }
    }
}

/// Everything the orchestrator observes in the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    pub pki_secret: Option<SecretData>,
    pub secrets_secret: Option<SecretData>,
    /// `registry-user-*` secrets keyed by role
    pub user_secrets: BTreeMap<String, SecretData>,
    /// Names of every existing node PKI secret
    pub node_pki_secret_names: Vec<String>,
    /// CA the ingress uses to verify mirrorer client certificates
    pub ingress_client_ca: Option<String>,
    pub registry_switcher: registry_switcher::Inputs,
    pub bashible: bashible::Inputs,
    pub node_services: node_services::Inputs,
    pub incluster_proxy: incluster_proxy::Inputs,
}
