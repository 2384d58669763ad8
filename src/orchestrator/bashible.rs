//! Registry configuration consumed by bashible on every node
//!
//! The rendered [`Config`] lives in the `registry-bashible-config` Secret.
//! Switching registries happens in two stages: the first stage renders the
//! new parameters on top of the ones already on the fleet (so lagging nodes
//! keep a working mirror), the second stage renders the new parameters
//! alone. [`ActualParams`] tracks what is currently live.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::patch::{owned_secret, same_data, PatchCollector, SecretData};
use crate::constants::{self, ModeType};
use crate::deckhouse_registry::{DeckhouseRegistryConfig, UpstreamParams};
use crate::error::{Error, Result};
use crate::helpers::{compute_hash, dedup_and_sort, registry_address_and_path, trim_with_ellipsis};

pub const KEY_CONFIG: &str = "config";

const MAX_WAITING_NODES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ProcessFirst,
    ProcessSecond,
    CleanupFirst,
    CleanupSecond,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ProcessFirst => "Process stage 1: apply new configs with existing ones",
            Stage::ProcessSecond => "Process stage 2: apply new configs only, remove old if exist",
            Stage::CleanupFirst => "Cleanup stage 1: apply Unmanaged configs with existing ones",
            Stage::CleanupSecond => {
                "Cleanup stage 2: cleanup old configs and remove registry-bashible-config secret"
            }
        }
    }

    pub fn failed_message(self) -> String {
        format!("{self}\nFailed to process Bashible configuration.")
    }

    fn for_mode(mode: ModeType, with_actual: bool) -> Self {
        match (mode.normalize(), with_actual) {
            (ModeType::Unmanaged, true) => Stage::CleanupFirst,
            (ModeType::Unmanaged, false) => Stage::CleanupSecond,
            (_, true) => Stage::ProcessFirst,
            (_, false) => Stage::ProcessSecond,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedded registry credentials used by Proxy and Local
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyLocalParams {
    #[serde(default)]
    pub ca: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    pub mode: ModeType,
    pub proxy_local: Option<ProxyLocalParams>,
    pub unmanaged: Option<UpstreamParams>,
    pub direct: Option<UpstreamParams>,
}

impl Params {
    fn validate(&self) -> Result<()> {
        let mode = self.mode.normalize();
        let missing = match mode {
            ModeType::Proxy | ModeType::Local if self.proxy_local.is_none() => Some("proxyLocal"),
            ModeType::Unmanaged if self.unmanaged.is_none() => Some("unmanaged"),
            ModeType::Direct if self.direct.is_none() => Some("direct"),
            _ => None,
        };
        match missing {
            Some(block) => Err(Error::MissingModeParams { block, mode }),
            None => Ok(()),
        }
    }

    fn images_base(&self) -> String {
        match (self.mode.normalize(), &self.unmanaged) {
            (ModeType::Unmanaged, Some(unmanaged)) => unmanaged.images_repo.clone(),
            _ => constants::HOST_WITH_PATH.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    /// Current `registry-bashible-config` data, if the Secret exists
    pub secret: Option<SecretData>,
    pub master_node_ips: Vec<String>,
    /// Version reported by every node, `unknown` when not managed
    pub node_status: BTreeMap<String, String>,
}

/// Parameters live on the fleet
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActualParams {
    pub mode: ModeType,
    pub images_base: String,
    #[serde(default)]
    pub master_node_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_local: Option<ProxyLocalParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmanaged: Option<UpstreamParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub direct: Vec<UpstreamParams>,
}

impl ActualParams {
    fn from_params(params: &Params, inputs: &Inputs) -> Self {
        Self {
            mode: params.mode.normalize(),
            images_base: params.images_base(),
            master_node_ips: dedup_and_sort(inputs.master_node_ips.clone()),
            proxy_local: params.proxy_local.clone(),
            unmanaged: params.unmanaged.clone(),
            direct: params.direct.iter().cloned().collect(),
        }
    }

    /// What a cluster running from `registry` looks like before any managed
    /// config was rendered
    pub fn from_registry_secret(registry: &DeckhouseRegistryConfig) -> Result<Self> {
        if registry.address.is_empty() {
            return Err(Error::ConfigError(
                "registry secret has no address to seed bashible params from".to_string(),
            ));
        }
        if registry.docker_config.is_empty() {
            return Err(Error::ConfigError(format!(
                "registry secret for {} has no docker config",
                registry.address
            )));
        }
        let upstream = registry.to_upstream()?;
        if registry.is_embedded() {
            return Ok(Self {
                mode: ModeType::Local,
                images_base: constants::HOST_WITH_PATH.to_string(),
                proxy_local: Some(ProxyLocalParams {
                    ca: upstream.ca,
                    username: upstream.username,
                    password: upstream.password,
                }),
                ..Default::default()
            });
        }
        Ok(Self {
            mode: ModeType::Unmanaged,
            images_base: upstream.images_repo.clone(),
            unmanaged: Some(upstream),
            ..Default::default()
        })
    }

    /// Overlay `new` while keeping the mode blocks that are still live
    pub fn merge(&mut self, new: &ActualParams) {
        self.mode = new.mode;
        self.images_base = new.images_base.clone();
        self.master_node_ips = new.master_node_ips.clone();
        if new.proxy_local.is_some() {
            self.proxy_local = new.proxy_local.clone();
        }
        if new.unmanaged.is_some() {
            self.unmanaged = new.unmanaged.clone();
        }
        for direct in &new.direct {
            if !self.direct.contains(direct) {
                self.direct.push(direct.clone());
            }
        }
    }

    pub fn set(&mut self, new: &ActualParams) {
        *self = new.clone();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub mode: ModeType,
    pub version: String,
    pub images_base: String,
    pub proxy_endpoints: Vec<String>,
    pub hosts: BTreeMap<String, Hosts>,
    pub prepull_hosts: BTreeMap<String, Hosts>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hosts {
    #[serde(default)]
    pub ca: Vec<String>,
    #[serde(default)]
    pub mirrors: Vec<MirrorHost>,
}

impl Hosts {
    fn add(&mut self, ca: &str, mirrors: impl IntoIterator<Item = MirrorHost>) {
        if !ca.is_empty() {
            self.ca.push(ca.to_string());
        }
        for mirror in mirrors {
            if !self.mirrors.contains(&mirror) {
                self.mirrors.push(mirror);
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorHost {
    pub host: String,
    pub scheme: String,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrites: Vec<Rewrite>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    pub from: String,
    pub to: String,
}

impl Config {
    /// Render the node configuration for everything in `actual`
    pub fn build(actual: &ActualParams) -> Result<Self> {
        let mut config = Config {
            mode: actual.mode,
            images_base: actual.images_base.clone(),
            ..Default::default()
        };

        if let Some(proxy_local) = &actual.proxy_local {
            let auth = Auth {
                username: proxy_local.username.clone(),
                password: proxy_local.password.clone(),
            };
            let mirror = |host: &str| MirrorHost {
                host: host.to_string(),
                scheme: constants::SCHEME.to_string(),
                auth: auth.clone(),
                rewrites: Vec::new(),
            };
            config.proxy_endpoints = constants::generate_proxy_endpoints(&actual.master_node_ips);

            config
                .hosts
                .entry(constants::HOST.to_string())
                .or_default()
                .add(&proxy_local.ca, [mirror(constants::PROXY_HOST)]);
            config
                .prepull_hosts
                .entry(constants::HOST.to_string())
                .or_default()
                .add(
                    &proxy_local.ca,
                    std::iter::once(mirror(constants::PROXY_HOST))
                        .chain(config.proxy_endpoints.iter().map(|ep| mirror(ep))),
                );
        }

        if let Some(unmanaged) = &actual.unmanaged {
            let (host, _) = registry_address_and_path(&unmanaged.images_repo);
            let mirror = MirrorHost {
                host: host.clone(),
                scheme: unmanaged.scheme.to_lowercase(),
                auth: Auth {
                    username: unmanaged.username.clone(),
                    password: unmanaged.password.clone(),
                },
                rewrites: Vec::new(),
            };
            for hosts in [&mut config.hosts, &mut config.prepull_hosts] {
                hosts
                    .entry(host.clone())
                    .or_default()
                    .add(&unmanaged.ca, [mirror.clone()]);
            }
        }

        for direct in &actual.direct {
            let (host, path) = registry_address_and_path(&direct.images_repo);
            let mirror = MirrorHost {
                host,
                scheme: direct.scheme.to_lowercase(),
                auth: Auth {
                    username: direct.username.clone(),
                    password: direct.password.clone(),
                },
                rewrites: vec![Rewrite {
                    from: constants::PATH_REGEXP.to_string(),
                    to: path.trim_start_matches('/').to_string(),
                }],
            };
            for hosts in [&mut config.hosts, &mut config.prepull_hosts] {
                hosts
                    .entry(constants::HOST.to_string())
                    .or_default()
                    .add(&direct.ca, [mirror.clone()]);
            }
        }

        for hosts in config
            .hosts
            .values_mut()
            .chain(config.prepull_hosts.values_mut())
        {
            hosts.ca = dedup_and_sort(std::mem::take(&mut hosts.ca));
        }

        config.version = config.content_hash()?;
        Ok(config)
    }

    /// Hash of the config with the version itself blanked
    pub fn content_hash(&self) -> Result<String> {
        let mut unversioned = self.clone();
        unversioned.version.clear();
        compute_hash(&unversioned)
    }

    fn to_secret_data(&self) -> Result<SecretData> {
        Ok(BTreeMap::from([(
            KEY_CONFIG.to_string(),
            serde_yaml::to_string(self)?.into_bytes(),
        )]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub ready: bool,
    pub message: String,
}

impl ProcessResult {
    fn new(ready: bool, stage: Stage, body: impl fmt::Display) -> Self {
        Self {
            ready,
            message: format!("{stage}\n{body}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_params: Option<ActualParams>,
    /// Upstream to return to when switching back to Unmanaged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unmanaged_params: Option<UpstreamParams>,
}

impl State {
    /// Seed the live parameters from the current pull secret the first time
    /// the configurator sees the cluster
    fn ensure_actual(&mut self, registry: &DeckhouseRegistryConfig) -> Result<&mut ActualParams> {
        if self.actual_params.is_none() {
            let seeded = ActualParams::from_registry_secret(registry)?;
            info!(mode = %seeded.mode, images_base = %seeded.images_base, "Seeding bashible params from registry secret");
            if self.unmanaged_params.is_none() {
                self.unmanaged_params = seeded.unmanaged.clone();
            }
            self.actual_params = Some(seeded);
        }
        Ok(self.actual_params.get_or_insert_with(ActualParams::default))
    }

    /// Stage 1: render `params` together with what is already on the fleet
    pub fn process_transition(
        &mut self,
        params: &Params,
        registry: &DeckhouseRegistryConfig,
        inputs: &Inputs,
        patches: &mut PatchCollector,
    ) -> Result<ProcessResult> {
        self.process(params, registry, inputs, true, patches)
    }

    /// Stage 2: render `params` alone
    pub fn process_final(
        &mut self,
        params: &Params,
        registry: &DeckhouseRegistryConfig,
        inputs: &Inputs,
        patches: &mut PatchCollector,
    ) -> Result<ProcessResult> {
        self.process(params, registry, inputs, false, patches)
    }

    fn process(
        &mut self,
        params: &Params,
        registry: &DeckhouseRegistryConfig,
        inputs: &Inputs,
        with_actual: bool,
        patches: &mut PatchCollector,
    ) -> Result<ProcessResult> {
        let stage = Stage::for_mode(params.mode, with_actual);
        self.render(stage, params, registry, inputs, with_actual, patches)
            .map_err(|e| {
                warn!(error = %e, "{}", stage.failed_message());
                e
            })
    }

    fn render(
        &mut self,
        stage: Stage,
        params: &Params,
        registry: &DeckhouseRegistryConfig,
        inputs: &Inputs,
        with_actual: bool,
        patches: &mut PatchCollector,
    ) -> Result<ProcessResult> {
        params.validate()?;
        let new = ActualParams::from_params(params, inputs);

        let actual = self.ensure_actual(registry)?;
        if with_actual {
            if *actual == new {
                debug!(stage = %stage, "Bashible params unchanged, nothing to overlap");
                return Ok(ProcessResult::new(true, stage, "Bashible already processed."));
            }
            actual.merge(&new);
        } else {
            actual.set(&new);
        }

        let config = Config::build(actual)?;
        let data = config.to_secret_data()?;
        if !same_data(inputs.secret.as_ref(), &data) {
            info!(stage = %stage, version = %config.version, "Updating bashible config");
            patches.apply_secret(owned_secret(
                constants::BASHIBLE_CONFIG_SECRET,
                None,
                &[],
                data,
            ));
        }

        Ok(build_result(inputs, false, &config.version, stage))
    }

    /// Drop the managed config from the fleet
    pub fn stop(&mut self, inputs: &Inputs, patches: &mut PatchCollector) -> ProcessResult {
        self.actual_params = None;
        if inputs.secret.is_some() {
            patches.delete_secret(constants::BASHIBLE_CONFIG_SECRET);
        }
        build_result(
            inputs,
            true,
            constants::UNKNOWN_VERSION,
            Stage::CleanupSecond,
        )
    }
}

fn build_result(inputs: &Inputs, is_stop: bool, version: &str, stage: Stage) -> ProcessResult {
    match (is_stop, inputs.secret.is_some()) {
        (true, true) => {
            return ProcessResult::new(false, stage, "Bashible secret exists. Deleting now...")
        }
        (false, false) => {
            return ProcessResult::new(false, stage, "Bashible secret is not deployed. Proceeding...")
        }
        _ => {}
    }

    let total = inputs.node_status.len();
    let waiting: Vec<(&String, &String)> = inputs
        .node_status
        .iter()
        .filter(|(_, node_version)| node_version.as_str() != version)
        .collect();

    if waiting.is_empty() {
        let body = if is_stop {
            format!("All {total} node(s) have been updated with Unmanaged configuration.")
        } else {
            format!(
                "All {total} node(s) have been updated to registry version: {}.",
                trim_with_ellipsis(version)
            )
        };
        return ProcessResult::new(true, stage, body);
    }

    let mut body = if is_stop {
        format!(
            "{}/{total} node(s) are ready with Unmanaged configuration.\nWaiting for the following node(s):\n",
            total - waiting.len()
        )
    } else {
        format!(
            "{}/{total} node(s) have been updated to registry version \"{}\".\nWaiting for the following node(s):\n",
            total - waiting.len(),
            trim_with_ellipsis(version)
        )
    };
    for (i, (name, node_version)) in waiting.iter().take(MAX_WAITING_NODES).enumerate() {
        let _ = writeln!(
            body,
            "\t{}. {name:?} (currently running version \"{}\")",
            i + 1,
            trim_with_ellipsis(node_version)
        );
    }
    if waiting.len() > MAX_WAITING_NODES {
        let _ = writeln!(body, "\t...and {} more", waiting.len() - MAX_WAITING_NODES);
    }
    ProcessResult::new(false, stage, body)
}

#[cfg(test)]
#[path = "bashible_test.rs"]
mod bashible_test;
