//! Node services: the distribution and auth static pods on master nodes
//!
//! For every master that should run the registry the configurator keeps a
//! node PKI, renders a [`NodeServicesConfig`] and asks the node agent to
//! (re)create the static pods. Masters that should not run it are told to
//! delete them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::patch::{data_string, owned_secret, same_data, EventType, PatchCollector, SecretData};
use super::pki::GlobalPki;
use super::users::User;
use crate::constants;
use crate::error::{Error, Result};
use crate::helpers::compute_hash;
use crate::pki::{self, CertKey};

pub const KEY_AUTH_CERT: &str = "auth.crt";
pub const KEY_AUTH_KEY: &str = "auth.key";
pub const KEY_DISTRIBUTION_CERT: &str = "distribution.crt";
pub const KEY_DISTRIBUTION_KEY: &str = "distribution.key";
pub const KEY_VERSION: &str = "version";
pub const KEY_CONFIG: &str = "config";

pub const EVENT_NODE_PKI_GENERATED: &str = "NodePKIGenerated";

/// Concurrent agent calls per reconcile
pub const MAX_CONCURRENT_RPC: usize = 10;

/// Per-node agent managing the static pods
#[async_trait]
pub trait StaticPodClient: Send + Sync {
    /// `POST /staticpod/create`
    async fn create(&self, pod_ip: &str, config: &NodeServicesConfig) -> Result<()>;
    /// `DELETE /staticpod/delete`
    async fn delete(&self, pod_ip: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePki {
    pub auth: CertKey,
    pub distribution: CertKey,
}

/// Hosts every node certificate must be valid for
pub fn node_pki_hosts(node_ip: &str) -> [&str; 4] {
    ["127.0.0.1", "localhost", node_ip, constants::SERVICE_DNS]
}

impl NodePki {
    pub fn generate(ca: &CertKey, node_ip: &str) -> Result<Self> {
        Self::generate_for_hosts(ca, &node_pki_hosts(node_ip))
    }

    pub fn validate(&self, ca: &CertKey, node_ip: &str) -> Result<()> {
        self.validate_for_hosts(ca, &node_pki_hosts(node_ip))
    }

    pub fn generate_for_hosts(ca: &CertKey, hosts: &[&str]) -> Result<Self> {
        Ok(Self {
            auth: pki::generate_cert(constants::AUTH_COMMON_NAME, ca, hosts)?,
            distribution: pki::generate_cert(constants::DISTRIBUTION_COMMON_NAME, ca, hosts)?,
        })
    }

    /// Both pairs decode, chain to `ca` and cover every host
    pub fn validate_for_hosts(&self, ca: &CertKey, hosts: &[&str]) -> Result<()> {
        for cert_key in [&self.auth, &self.distribution] {
            pki::decode_cert_key(cert_key.cert.as_bytes(), cert_key.key.as_bytes())?;
            pki::validate_cert_with_ca_chain(&cert_key.cert, &[&ca.cert])?;
            for host in hosts {
                pki::verify_hostname(&cert_key.cert, host)?;
            }
        }
        Ok(())
    }

    pub fn from_secret_data(data: &SecretData) -> Self {
        Self {
            auth: CertKey {
                cert: data_string(data, KEY_AUTH_CERT),
                key: data_string(data, KEY_AUTH_KEY),
            },
            distribution: CertKey {
                cert: data_string(data, KEY_DISTRIBUTION_CERT),
                key: data_string(data, KEY_DISTRIBUTION_KEY),
            },
        }
    }

    pub fn to_secret_data(&self) -> SecretData {
        BTreeMap::from([
            (KEY_AUTH_CERT.to_string(), self.auth.cert.clone().into_bytes()),
            (KEY_AUTH_KEY.to_string(), self.auth.key.clone().into_bytes()),
            (
                KEY_DISTRIBUTION_CERT.to_string(),
                self.distribution.cert.clone().into_bytes(),
            ),
            (
                KEY_DISTRIBUTION_KEY.to_string(),
                self.distribution.key.clone().into_bytes(),
            ),
        ])
    }
}

/// Reuse `current` when it still chains to `ca` and covers the node's
/// hosts, otherwise issue a new pair.
pub fn process_node_pki(
    ca: &CertKey,
    node_name: &str,
    node_ip: &str,
    current: Option<&NodePki>,
) -> Result<NodePki> {
    if let Some(current) = current {
        match current.validate(ca, node_ip) {
            Ok(()) => return Ok(current.clone()),
            Err(e) => warn!(node = %node_name, error = %e, "Node PKI is invalid, regenerating"),
        }
    }
    info!(node = %node_name, ip = %node_ip, "Generating node PKI");
    NodePki::generate(ca, node_ip)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeServicesConfig {
    pub version: String,
    pub config: Config,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub ca_cert: String,
    pub token_cert: String,
    pub token_key: String,
    pub auth_cert: String,
    pub auth_key: String,
    pub distribution_cert: String,
    pub distribution_key: String,
    pub http_secret: String,
    pub user_ro: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_mode: Option<LocalMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_mode: Option<ProxyMode>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMode {
    pub user_rw: User,
    pub user_puller: User,
    pub user_pusher: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_client_ca_cert: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMode {
    pub upstream: Upstream,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_registry_ca_cert: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub user: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Mode specific part of the rendered config
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeParams {
    Local(LocalMode),
    Proxy(ProxyMode),
}

impl Config {
    /// Every PEM present, every leaf chains to the CA, exactly one mode block
    pub fn validate(&self) -> Result<()> {
        let pems = [
            ("caCert", &self.ca_cert),
            ("tokenCert", &self.token_cert),
            ("tokenKey", &self.token_key),
            ("authCert", &self.auth_cert),
            ("authKey", &self.auth_key),
            ("distributionCert", &self.distribution_cert),
            ("distributionKey", &self.distribution_key),
            ("httpSecret", &self.http_secret),
        ];
        for (field, value) in pems {
            if value.is_empty() {
                return Err(Error::ValidationError(format!("{field} is empty")));
            }
        }

        for cert in [&self.token_cert, &self.auth_cert, &self.distribution_cert] {
            pki::validate_cert_with_ca_chain(cert, &[&self.ca_cert])?;
        }

        match (&self.local_mode, &self.proxy_mode) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(Error::ValidationError(
                "both localMode and proxyMode are set".to_string(),
            )),
            (None, None) => Err(Error::ValidationError(
                "neither localMode nor proxyMode is set".to_string(),
            )),
        }
    }
}

/// Render and validate the config for one node
pub fn render_config(
    global: &GlobalPki,
    node: &NodePki,
    http_secret: &str,
    user_ro: &User,
    mode: &ModeParams,
) -> Result<NodeServicesConfig> {
    let (local_mode, proxy_mode) = match mode {
        ModeParams::Local(local) => (Some(local.clone()), None),
        ModeParams::Proxy(proxy) => (None, Some(proxy.clone())),
    };
    let config = Config {
        ca_cert: global.ca.cert.clone(),
        token_cert: global.token.cert.clone(),
        token_key: global.token.key.clone(),
        auth_cert: node.auth.cert.clone(),
        auth_key: node.auth.key.clone(),
        distribution_cert: node.distribution.cert.clone(),
        distribution_key: node.distribution.key.clone(),
        http_secret: http_secret.to_string(),
        user_ro: user_ro.clone(),
        local_mode,
        proxy_mode,
    };
    config.validate()?;
    Ok(NodeServicesConfig {
        version: compute_hash(&config)?,
        config,
    })
}

pub struct Params {
    pub pki: GlobalPki,
    pub http_secret: String,
    pub user_ro: User,
    pub mode: ModeParams,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticPodStatus {
    pub ready: bool,
    /// Value of the config-version annotation
    pub config_version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterNode {
    pub name: String,
    pub internal_ip: String,
    pub created_at: Option<DateTime<Utc>>,
    pub pki_secret: Option<SecretData>,
    pub config_secret: Option<SecretData>,
    pub agent_pod_ip: Option<String>,
    pub static_pod: Option<StaticPodStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    pub masters: Vec<MasterNode>,
}

impl Inputs {
    /// The master created first; name breaks ties
    pub fn first_master(&self) -> Option<&MasterNode> {
        self.masters
            .iter()
            .min_by(|a, b| match (a.created_at, b.created_at) {
                (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.name.cmp(&b.name),
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeResult {
    pub ready: bool,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub nodes: BTreeMap<String, NodeResult>,
}

impl ProcessResult {
    pub fn is_ready(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.values().all(|n| n.ready)
    }

    pub fn condition_message(&self) -> String {
        if self.nodes.is_empty() {
            return "No master nodes found".to_string();
        }
        let mut message = String::new();
        let unready: Vec<_> = self.nodes.iter().filter(|(_, r)| !r.ready).collect();
        let _ = writeln!(
            message,
            "{}/{} node(s) ready",
            self.nodes.len() - unready.len(),
            self.nodes.len()
        );
        for (name, result) in unready {
            let _ = writeln!(message, "- {name}: {}", result.message);
        }
        message
    }
}

enum Command {
    Create(NodeServicesConfig),
    Delete,
}

struct Job {
    node: String,
    pod_ip: Option<String>,
    command: Command,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Node PKI keyed by node name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodePki>,
}

impl State {
    pub async fn process(
        &mut self,
        params: &Params,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Result<ProcessResult> {
        let run_on: BTreeSet<&str> = match params.mode {
            ModeParams::Local(_) => inputs
                .first_master()
                .map(|m| m.name.as_str())
                .into_iter()
                .collect(),
            ModeParams::Proxy(_) => inputs.masters.iter().map(|m| m.name.as_str()).collect(),
        };

        let masters: BTreeSet<&str> = inputs.masters.iter().map(|m| m.name.as_str()).collect();
        self.nodes.retain(|name, _| masters.contains(name.as_str()));

        let mut jobs = Vec::with_capacity(inputs.masters.len());
        for master in &inputs.masters {
            if !run_on.contains(master.name.as_str()) {
                self.forget_node(master, patches);
                jobs.push(Job {
                    node: master.name.clone(),
                    pod_ip: master.agent_pod_ip.clone(),
                    command: Command::Delete,
                });
                continue;
            }

            if master.internal_ip.is_empty() {
                return Err(Error::ValidationError(format!(
                    "master node {} has no internal IP",
                    master.name
                )));
            }

            let stored = master.pki_secret.as_ref().map(NodePki::from_secret_data);
            let current = stored.as_ref().or(self.nodes.get(&master.name));
            let node_pki =
                process_node_pki(&params.pki.ca, &master.name, &master.internal_ip, current)?;
            if current != Some(&node_pki) {
                patches.event(
                    EventType::Normal,
                    EVENT_NODE_PKI_GENERATED,
                    format!("Node PKI issued for {}", master.name),
                );
            }

            let pki_data = node_pki.to_secret_data();
            if !same_data(master.pki_secret.as_ref(), &pki_data) {
                patches.apply_secret(owned_secret(
                    &constants::node_pki_secret_name(&master.name),
                    None,
                    &[(constants::LABEL_TYPE, constants::NODE_PKI_SECRET_TYPE_LABEL)],
                    pki_data,
                ));
            }

            let config = render_config(
                &params.pki,
                &node_pki,
                &params.http_secret,
                &params.user_ro,
                &params.mode,
            )?;
            self.nodes.insert(master.name.clone(), node_pki);

            let config_data = BTreeMap::from([
                (KEY_VERSION.to_string(), config.version.clone().into_bytes()),
                (
                    KEY_CONFIG.to_string(),
                    serde_yaml::to_string(&config.config)?.into_bytes(),
                ),
            ]);
            if !same_data(master.config_secret.as_ref(), &config_data) {
                patches.apply_secret(owned_secret(
                    &constants::node_config_secret_name(&master.name),
                    None,
                    &[],
                    config_data,
                ));
            }

            jobs.push(Job {
                node: master.name.clone(),
                pod_ip: master.agent_pod_ip.clone(),
                command: Command::Create(config),
            });
        }

        let outcomes = run_jobs(client, jobs).await;

        let mut result = ProcessResult::default();
        for master in &inputs.masters {
            let Some((command, rpc)) = outcomes.get(&master.name) else {
                continue;
            };
            let node_result = match (command, rpc) {
                (_, Err(e)) => NodeResult {
                    ready: false,
                    message: e.clone(),
                },
                (Some(version), Ok(())) => match &master.static_pod {
                    Some(pod) if pod.ready && &pod.config_version == version => NodeResult {
                        ready: true,
                        message: String::new(),
                    },
                    Some(pod) if &pod.config_version != version => NodeResult {
                        ready: false,
                        message: format!("waiting for static pods with config version {}", short(version)),
                    },
                    Some(_) => NodeResult {
                        ready: false,
                        message: "waiting for static pods to become ready".to_string(),
                    },
                    None => NodeResult {
                        ready: false,
                        message: "waiting for static pods to start".to_string(),
                    },
                },
                (None, Ok(())) => match master.static_pod {
                    Some(_) => NodeResult {
                        ready: false,
                        message: "waiting for static pods to be removed".to_string(),
                    },
                    None => NodeResult {
                        ready: true,
                        message: String::new(),
                    },
                },
            };
            result.nodes.insert(master.name.clone(), node_result);
        }

        Ok(result)
    }

    /// Tell every master to remove the static pods and delete per-node
    /// secrets. Returns the nodes that still run (or could not be told to
    /// stop) the static pods.
    pub async fn stop(
        &mut self,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Vec<String> {
        let mut jobs = Vec::with_capacity(inputs.masters.len());
        for master in &inputs.masters {
            self.forget_node(master, patches);
            if master.static_pod.is_some() || master.agent_pod_ip.is_some() {
                jobs.push(Job {
                    node: master.name.clone(),
                    pod_ip: master.agent_pod_ip.clone(),
                    command: Command::Delete,
                });
            }
        }
        self.nodes.clear();

        let outcomes = run_jobs(client, jobs).await;

        let mut pending: Vec<String> = inputs
            .masters
            .iter()
            .filter(|m| {
                m.static_pod.is_some()
                    || matches!(outcomes.get(&m.name), Some((_, Err(_))))
            })
            .map(|m| m.name.clone())
            .collect();
        pending.sort();
        pending
    }

    fn forget_node(&mut self, master: &MasterNode, patches: &mut PatchCollector) {
        self.nodes.remove(&master.name);
        if master.pki_secret.is_some() {
            patches.delete_secret(constants::node_pki_secret_name(&master.name));
        }
        if master.config_secret.is_some() {
            patches.delete_secret(constants::node_config_secret_name(&master.name));
        }
    }
}

/// Outcome per node: the version that was requested (None for delete) and
/// the RPC result
type JobOutcome = (Option<String>, std::result::Result<(), String>);

async fn run_jobs(client: &dyn StaticPodClient, jobs: Vec<Job>) -> BTreeMap<String, JobOutcome> {
    stream::iter(jobs.into_iter().map(|job| async move {
        let version = match &job.command {
            Command::Create(config) => Some(config.version.clone()),
            Command::Delete => None,
        };
        let Some(pod_ip) = job.pod_ip.as_deref() else {
            warn!(node = %job.node, "Static pod agent not found on node");
            return (job.node, (version, Err("static pod agent not found".to_string())));
        };

        let rpc = match &job.command {
            Command::Create(config) => client.create(pod_ip, config).await,
            Command::Delete => client.delete(pod_ip).await,
        };
        match rpc {
            Ok(()) => {
                debug!(node = %job.node, "Static pod agent call succeeded");
                (job.node, (version, Ok(())))
            }
            Err(e) => {
                warn!(node = %job.node, error = %e, "Static pod agent call failed");
                (job.node, (version, Err(e.to_string())))
            }
        }
    }))
    .buffer_unordered(MAX_CONCURRENT_RPC)
    .collect()
    .await
}

fn short(version: &str) -> &str {
    version.get(..12).unwrap_or(version)
}

#[cfg(test)]
#[path = "node_services_test.rs"]
mod node_services_test;
