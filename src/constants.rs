//! Registry-wide constants shared by the orchestrator, the bashible
//! configurator and the node-services configurator.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const REGISTRY_PORT: u16 = 5001;
pub const SCHEME: &str = "https";
pub const SERVICE_DNS: &str = "embedded-registry.d8-system.svc";
pub const HOST: &str = "embedded-registry.d8-system.svc:5001";
pub const PROXY_HOST: &str = "127.0.0.1:5001";
pub const PATH: &str = "/system/deckhouse";
pub const HOST_WITH_PATH: &str = "embedded-registry.d8-system.svc:5001/system/deckhouse";
/// Rewrite source applied to Direct-mode mirrors
pub const PATH_REGEXP: &str = "^system/deckhouse";

/// Version reported by nodes that do not run a managed bashible registry config
pub const UNKNOWN_VERSION: &str = "unknown";

pub const NAMESPACE: &str = "d8-system";
pub const MODULE_NAME: &str = "system-registry";

pub const NODE_AGENT_PORT: u16 = 4577;

// Annotations
pub const BASHIBLE_VERSION_ANNOTATION: &str = "registry.deckhouse.io/version";
pub const INCLUSTER_PROXY_VERSION_ANNOTATION: &str =
    "registry.deckhouse.io/incluster-proxy-version";
pub const NODE_SERVICES_VERSION_ANNOTATION: &str = "registry.deckhouse.io/config-version";
pub const DEPLOYMENT_REGISTRY_VERSION_ANNOTATION: &str = "checksum/registry-version";

// Labels
pub const MASTER_NODE_LABEL: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_HERITAGE: &str = "heritage";
pub const LABEL_HERITAGE_VALUE: &str = "deckhouse";
pub const LABEL_MODULE: &str = "module";
pub const LABEL_TYPE: &str = "type";
pub const INCLUSTER_PROXY_APP: &str = "registry-incluster-proxy";
pub const NODE_AGENT_APP: &str = "system-registry-staticpod-manager";

// Secrets
pub const PKI_SECRET: &str = "registry-pki";
pub const SECRETS_SECRET: &str = "registry-secrets";
pub const BASHIBLE_CONFIG_SECRET: &str = "registry-bashible-config";
pub const DECKHOUSE_REGISTRY_SECRET: &str = "deckhouse-registry";
pub const INCLUSTER_PROXY_CONFIG_SECRET: &str = "registry-incluster-proxy-config";
/// CA the ingress uses to verify mirrorer client certificates, key `ca.crt`
pub const INGRESS_CLIENT_CA_SECRET: &str = "registry-ingress-client-ca";
pub const INGRESS_CLIENT_CA_KEY: &str = "ca.crt";
pub const USER_SECRET_TYPE: &str = "registry/user";
pub const NODE_PKI_SECRET_TYPE_LABEL: &str = "node-secret";

// Workloads
pub const DECKHOUSE_DEPLOYMENT: &str = "deckhouse";
pub const STATE_CONFIGMAP: &str = "registry-orchestrator-state";

/// Common names of the issued certificates
pub const CA_COMMON_NAME: &str = "embedded-registry-ca";
pub const TOKEN_COMMON_NAME: &str = "embedded-registry-auth-token";
pub const AUTH_COMMON_NAME: &str = "embedded-registry-auth";
pub const DISTRIBUTION_COMMON_NAME: &str = "embedded-registry-distribution";

pub const USER_SECRET_PREFIX: &str = "registry-user-";

pub fn user_secret_name(role: &str) -> String {
    format!("{USER_SECRET_PREFIX}{role}")
}

pub fn node_pki_secret_name(node_name: &str) -> String {
    format!("registry-node-{node_name}-pki")
}

pub fn node_config_secret_name(node_name: &str) -> String {
    format!("registry-node-config-{node_name}")
}

/// Labels carried by the node-services static pods
pub fn node_services_pod_labels() -> [(&'static str, &'static str); 5] {
    [
        ("heritage", "deckhouse"),
        ("app", "system-registry"),
        ("module", "system-registry"),
        ("component", "system-registry"),
        ("type", "node-services"),
    ]
}

/// Proxy endpoints (`ip:5001`) for every master node, sorted and deduplicated
pub fn generate_proxy_endpoints(master_ips: &[String]) -> Vec<String> {
    let mut endpoints: Vec<String> = master_ips
        .iter()
        .map(|ip| format!("{ip}:{REGISTRY_PORT}"))
        .collect();
    endpoints.sort();
    endpoints.dedup();
    endpoints
}

/// Registry operating mode.
///
/// `Detached` is accepted on the wire for compatibility and normalized to
/// [`ModeType::Local`] by [`ModeType::normalize`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ModeType {
    #[default]
    Unmanaged,
    Direct,
    Proxy,
    Local,
    Detached,
}

impl ModeType {
    pub fn normalize(self) -> Self {
        match self {
            ModeType::Detached => ModeType::Local,
            other => other,
        }
    }

    /// Parse a user supplied mode. Empty means Unmanaged.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "Unmanaged" => Some(ModeType::Unmanaged),
            "Direct" => Some(ModeType::Direct),
            "Proxy" => Some(ModeType::Proxy),
            "Local" => Some(ModeType::Local),
            "Detached" => Some(ModeType::Detached),
            _ => None,
        }
    }

    /// Modes served by the distribution static pods on master nodes
    pub fn runs_node_services(self) -> bool {
        matches!(self.normalize(), ModeType::Proxy | ModeType::Local)
    }
}

impl fmt::Display for ModeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModeType::Unmanaged => "Unmanaged",
            ModeType::Direct => "Direct",
            ModeType::Proxy => "Proxy",
            ModeType::Local => "Local",
            ModeType::Detached => "Detached",
        };
        f.write_str(s)
    }
}
