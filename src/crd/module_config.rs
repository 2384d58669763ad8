//! ModuleConfig for the system-registry module
//!
//! Only the fields the orchestrator consumes are typed. Every field carries a
//! serde default so a partially filled object still decodes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleConfig",
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigSpec {
    /// Absent means the module default, which is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default)]
    pub settings: RegistrySettings,
}

impl ModuleConfigSpec {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// `spec.settings` of the system-registry ModuleConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySettings {
    /// `Direct`, `Proxy`, `Detached` (or `Local`). Empty means Unmanaged.
    #[serde(default)]
    pub mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<UpstreamSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<UpstreamSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detached: Option<DetachedSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images_override: Option<ImagesOverride>,
}

/// Upstream registry for Proxy and Direct modes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// PEM encoded CA of the upstream registry
    #[serde(default)]
    pub ca: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_mode: String,
    /// Cache TTL, e.g. `72h`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl UpstreamSettings {
    /// `host/path` without a trailing slash
    pub fn images_repo(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let path = self.path.trim_matches('/');
        if path.is_empty() {
            host.to_string()
        } else {
            format!("{host}/{path}")
        }
    }
}

fn default_scheme() -> String {
    "HTTPS".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DetachedSettings {
    #[serde(default)]
    pub storage_mode: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImagesOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirrorer: Option<String>,
}
