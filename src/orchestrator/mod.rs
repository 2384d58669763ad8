//! Registry mode orchestration
//!
//! [`State`] drives the cluster from whatever registry mode it runs to the
//! requested one. Every call of [`State::process`] makes as much progress as
//! the observed [`Inputs`] allow, records the Kubernetes writes it needs in a
//! [`PatchCollector`] and reports progress through conditions.

pub mod bashible;
pub mod conditions;
pub mod incluster_proxy;
pub mod inputs;
pub mod node_services;
pub mod patch;
pub mod pki;
pub mod registry_switcher;
pub mod secrets;
pub mod users;

#[cfg(test)]
pub(crate) mod testing;


use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::constants::{self, ModeType};
use crate::crd::Condition;
use crate::deckhouse_registry::ManagedParams;
use crate::error::{Error, Result};
use crate::helpers::registry_address_and_path;

use conditions::{
    set_condition, ConditionReason, ConditionType, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
};
pub use inputs::{Inputs, ModeParams, ModuleParams, Params, UpstreamConfig};
pub use node_services::StaticPodClient;
pub use patch::{EventType, PatchCollector, PatchOperation};
use pki::{GlobalPki, PkiOutcome};
use users::{Role, User};

pub const EVENT_NODE_PKI_INVALIDATED: &str = "NodePKIInvalidated";

/// Result of one orchestration pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub ready: bool,
    /// Set when the state cannot progress without operator action
    pub fatal: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    pub mode: ModeType,
    #[serde(default)]
    pub target_mode: ModeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki: Option<GlobalPki>,
    #[serde(default)]
    pub secrets: secrets::State,
    #[serde(default)]
    pub users: users::State,
    #[serde(default)]
    pub node_services: node_services::State,
    #[serde(default)]
    pub incluster_proxy: incluster_proxy::State,
    #[serde(default)]
    pub bashible: bashible::State,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Which bashible stage to run
#[derive(Clone, Copy)]
enum BashibleStage {
    Transition,
    Final,
}

impl State {
    pub fn is_ready(&self) -> bool {
        conditions::is_condition_true(&self.conditions, ConditionType::Ready)
    }

    #[instrument(skip_all, fields(mode = %self.mode, target = %params.mode(), generation = params.generation))]
    pub async fn process(
        &mut self,
        params: &Params,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Result<ProcessOutcome> {
        let target = params.mode();
        if matches!(
            (self.mode, target),
            (ModeType::Local, ModeType::Proxy) | (ModeType::Proxy, ModeType::Local)
        ) {
            return Err(Error::TransitionNotSupported {
                from: self.mode,
                to: target,
            });
        }

        if self.target_mode != target {
            info!(from = %self.mode, to = %target, "Starting registry mode transition");
            self.target_mode = target;
            self.conditions.clear();
        }

        match &params.mode {
            ModeParams::Local => self.transition_to_local(params, inputs, client, patches).await,
            ModeParams::Proxy(upstream) => {
                self.transition_to_proxy(params, upstream, inputs, client, patches)
                    .await
            }
            ModeParams::Direct(upstream) => {
                self.transition_to_direct(params, upstream, inputs, client, patches)
                    .await
            }
            ModeParams::Unmanaged => {
                self.transition_to_unmanaged(params, inputs, client, patches)
                    .await
            }
        }
    }

    async fn transition_to_local(
        &mut self,
        params: &Params,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Result<ProcessOutcome> {
        let generation = params.generation;
        let global = match self.ensure_pki(inputs, patches, generation)? {
            Ok(global) => global,
            Err(fatal) => return Ok(fatal),
        };
        self.ensure_secrets(inputs, patches, generation);
        self.ensure_users(
            users::Params {
                ro: true,
                rw: true,
                mirrorer: true,
            },
            inputs,
            patches,
            generation,
        )?;

        let user_ro = self.users.require(Role::Ro)?.clone();
        if inputs.ingress_client_ca.is_none() {
            warn!("Ingress client CA is not available, mirrorer client authentication is disabled");
        }
        let node_params = node_services::Params {
            pki: global.clone(),
            http_secret: self.secrets.http.clone(),
            user_ro: user_ro.clone(),
            mode: node_services::ModeParams::Local(node_services::LocalMode {
                user_rw: self.users.require(Role::Rw)?.clone(),
                user_puller: self.users.require(Role::MirrorPuller)?.clone(),
                user_pusher: self.users.require(Role::MirrorPusher)?.clone(),
                ingress_client_ca_cert: inputs.ingress_client_ca.clone(),
            }),
        };
        if !self
            .ensure_node_services(&node_params, inputs, client, patches, generation)
            .await?
        {
            return Ok(self.set_ready(false, generation));
        }

        let bashible_params = proxy_local_bashible_params(ModeType::Local, &global, &user_ro);
        let switch = managed_switch(&global, &user_ro);
        if !self.switch_via_bashible(&bashible_params, &switch, inputs, patches, generation)? {
            return Ok(self.set_ready(false, generation));
        }

        if !self.stop_incluster_proxy(inputs, patches, generation) {
            return Ok(self.set_ready(false, generation));
        }

        self.mode = ModeType::Local;
        Ok(self.set_ready(true, generation))
    }

    async fn transition_to_proxy(
        &mut self,
        params: &Params,
        upstream: &UpstreamConfig,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Result<ProcessOutcome> {
        let generation = params.generation;
        let global = match self.ensure_pki(inputs, patches, generation)? {
            Ok(global) => global,
            Err(fatal) => return Ok(fatal),
        };
        self.ensure_secrets(inputs, patches, generation);
        // nodes still on the previous config keep using its users until the switch
        let during_switch = self.users_during_switch(inputs);
        self.ensure_users(during_switch, inputs, patches, generation)?;
        let user_ro = self.users.require(Role::Ro)?.clone();

        let upstream_ca = match upstream.upstream.ca.as_str() {
            "" => None,
            ca => match crate::pki::decode_certificate(ca) {
                Ok(pem) => Some(pem),
                Err(e) => {
                    let message = format!("Cannot decode upstream registry CA: {e}");
                    warn!("{message}");
                    set_condition(
                        &mut self.conditions,
                        ConditionType::NodeServices,
                        CONDITION_STATUS_FALSE,
                        ConditionReason::Error,
                        &message,
                        generation,
                    );
                    return Ok(self.set_ready(false, generation));
                }
            },
        };

        let (host, path) = registry_address_and_path(&upstream.upstream.images_repo);
        let node_params = node_services::Params {
            pki: global.clone(),
            http_secret: self.secrets.http.clone(),
            user_ro: user_ro.clone(),
            mode: node_services::ModeParams::Proxy(node_services::ProxyMode {
                upstream: node_services::Upstream {
                    scheme: upstream.upstream.scheme.to_lowercase(),
                    host,
                    path,
                    user: upstream.upstream.username.clone(),
                    password: upstream.upstream.password.clone(),
                    ttl: upstream.ttl.clone(),
                },
                upstream_registry_ca_cert: upstream_ca,
            }),
        };
        if !self
            .ensure_node_services(&node_params, inputs, client, patches, generation)
            .await?
        {
            return Ok(self.set_ready(false, generation));
        }

        let bashible_params = proxy_local_bashible_params(ModeType::Proxy, &global, &user_ro);
        let switch = managed_switch(&global, &user_ro);
        if !self.switch_via_bashible(&bashible_params, &switch, inputs, patches, generation)? {
            return Ok(self.set_ready(false, generation));
        }

        // mirror users only exist in Local
        self.ensure_users(
            users::Params {
                ro: true,
                ..Default::default()
            },
            inputs,
            patches,
            generation,
        )?;

        if !self.stop_incluster_proxy(inputs, patches, generation) {
            return Ok(self.set_ready(false, generation));
        }

        self.bashible.unmanaged_params = Some(upstream.upstream.clone());
        self.mode = ModeType::Proxy;
        Ok(self.set_ready(true, generation))
    }

    async fn transition_to_direct(
        &mut self,
        params: &Params,
        upstream: &UpstreamConfig,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Result<ProcessOutcome> {
        let generation = params.generation;
        let global = match self.ensure_pki(inputs, patches, generation)? {
            Ok(global) => global,
            Err(fatal) => return Ok(fatal),
        };
        self.ensure_secrets(inputs, patches, generation);

        let proxy = self.incluster_proxy.process(
            &incluster_proxy::Params {
                pki: global.clone(),
                http_secret: self.secrets.http.clone(),
                upstream: upstream.upstream.clone(),
            },
            &inputs.incluster_proxy,
            patches,
        )?;
        self.set_progress(ConditionType::InClusterProxy, proxy.ready, &proxy.message, generation);
        if !proxy.ready {
            return Ok(self.set_ready(false, generation));
        }

        let bashible_params = bashible::Params {
            mode: ModeType::Direct,
            direct: Some(upstream.upstream.clone()),
            ..Default::default()
        };
        let switch = registry_switcher::Params::Managed(ManagedParams {
            ca: global.ca.cert.clone(),
            username: upstream.upstream.username.clone(),
            password: upstream.upstream.password.clone(),
        });
        if !self.switch_via_bashible(&bashible_params, &switch, inputs, patches, generation)? {
            return Ok(self.set_ready(false, generation));
        }

        let pending = self
            .node_services
            .stop(&inputs.node_services, client, patches)
            .await;
        self.users
            .process(users::Params::default(), &inputs.user_secrets, patches)?;
        if !self.set_cleanup(&pending, None, generation) {
            return Ok(self.set_ready(false, generation));
        }

        self.bashible.unmanaged_params = Some(upstream.upstream.clone());
        self.mode = ModeType::Direct;
        Ok(self.set_ready(true, generation))
    }

    async fn transition_to_unmanaged(
        &mut self,
        params: &Params,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
    ) -> Result<ProcessOutcome> {
        let generation = params.generation;

        match self.bashible.unmanaged_params.clone() {
            Some(upstream) => {
                let bashible_params = bashible::Params {
                    mode: ModeType::Unmanaged,
                    unmanaged: Some(upstream.clone()),
                    ..Default::default()
                };
                let switch = registry_switcher::Params::Unmanaged(upstream);
                if !self.switch_via_bashible(&bashible_params, &switch, inputs, patches, generation)? {
                    return Ok(self.set_ready(false, generation));
                }
                // switched back, the managed config can go
                self.bashible.unmanaged_params = None;
            }
            None if inputs.registry_switcher.registry_secret.is_embedded() => {
                set_condition(
                    &mut self.conditions,
                    ConditionType::DeckhouseRegistrySwitch,
                    CONDITION_STATUS_FALSE,
                    ConditionReason::Error,
                    "Upstream registry to return to is unknown, the registry secret still points at the embedded registry",
                    generation,
                );
                return Ok(self.set_ready(false, generation));
            }
            None => {}
        }

        let bashible = self.bashible.stop(&inputs.bashible, patches);
        self.set_progress(
            ConditionType::BashibleFinalStage,
            bashible.ready,
            &bashible.message,
            generation,
        );
        if !bashible.ready {
            return Ok(self.set_ready(false, generation));
        }

        let pending = self
            .node_services
            .stop(&inputs.node_services, client, patches)
            .await;
        let proxy = self.incluster_proxy.stop(&inputs.incluster_proxy, patches);
        let proxy_message = (!proxy.ready).then_some(proxy.message.as_str());
        if !self.set_cleanup(&pending, proxy_message, generation) {
            return Ok(self.set_ready(false, generation));
        }

        self.pki = None;
        if inputs.pki_secret.is_some() {
            patches.delete_secret(constants::PKI_SECRET);
        }
        self.secrets = secrets::State::default();
        if inputs.secrets_secret.is_some() {
            patches.delete_secret(constants::SECRETS_SECRET);
        }
        self.users
            .process(users::Params::default(), &inputs.user_secrets, patches)?;

        self.mode = ModeType::Unmanaged;
        Ok(self.set_ready(true, generation))
    }

    /// The global PKI, or the outcome to return when it is unusable
    fn ensure_pki(
        &mut self,
        inputs: &Inputs,
        patches: &mut PatchCollector,
        generation: i64,
    ) -> Result<std::result::Result<GlobalPki, ProcessOutcome>> {
        match pki::process(&mut self.pki, inputs.pki_secret.as_ref(), patches)? {
            PkiOutcome::Ready { pki, replaced } => {
                if replaced {
                    self.invalidate_node_pki(inputs, patches);
                }
                self.set_progress(ConditionType::Pki, true, "", generation);
                Ok(Ok(pki))
            }
            PkiOutcome::Fatal(message) => {
                set_condition(
                    &mut self.conditions,
                    ConditionType::Pki,
                    CONDITION_STATUS_FALSE,
                    ConditionReason::Error,
                    &message,
                    generation,
                );
                let mut outcome = self.set_ready(false, generation);
                outcome.fatal = Some(message);
                Ok(Err(outcome))
            }
        }
    }

    /// A new CA makes every issued node certificate useless
    fn invalidate_node_pki(&mut self, inputs: &Inputs, patches: &mut PatchCollector) {
        self.node_services.nodes.clear();
        for name in &inputs.node_pki_secret_names {
            warn!(secret = %name, "Deleting node PKI issued by the previous CA");
            patches.delete_secret(name.clone());
            patches.event(
                EventType::Warning,
                EVENT_NODE_PKI_INVALIDATED,
                format!("Node PKI secret {name} deleted after registry CA rotation"),
            );
        }
    }

    fn ensure_secrets(&mut self, inputs: &Inputs, patches: &mut PatchCollector, generation: i64) {
        self.secrets.process(inputs.secrets_secret.as_ref(), patches);
        self.set_progress(ConditionType::Secrets, true, "", generation);
    }

    /// The read-only user plus every user already known from state or secrets
    fn users_during_switch(&self, inputs: &Inputs) -> users::Params {
        let stored = |role: Role| inputs.user_secrets.contains_key(role.as_str());
        let current = self.users.params();
        users::Params {
            ro: true,
            rw: current.rw || stored(Role::Rw),
            mirrorer: current.mirrorer
                || (stored(Role::MirrorPuller) && stored(Role::MirrorPusher)),
        }
    }

    fn ensure_users(
        &mut self,
        params: users::Params,
        inputs: &Inputs,
        patches: &mut PatchCollector,
        generation: i64,
    ) -> Result<()> {
        self.users.process(params, &inputs.user_secrets, patches)?;
        self.set_progress(ConditionType::Users, true, "", generation);
        Ok(())
    }

    async fn ensure_node_services(
        &mut self,
        params: &node_services::Params,
        inputs: &Inputs,
        client: &dyn StaticPodClient,
        patches: &mut PatchCollector,
        generation: i64,
    ) -> Result<bool> {
        let result = self
            .node_services
            .process(params, &inputs.node_services, client, patches)
            .await?;
        let ready = result.is_ready();
        let message = if ready {
            String::new()
        } else {
            result.condition_message()
        };
        self.set_progress(ConditionType::NodeServices, ready, &message, generation);
        Ok(ready)
    }

    /// Bashible stage 1, the pull secret switch, then bashible stage 2
    fn switch_via_bashible(
        &mut self,
        bashible_params: &bashible::Params,
        switch: &registry_switcher::Params,
        inputs: &Inputs,
        patches: &mut PatchCollector,
        generation: i64,
    ) -> Result<bool> {
        if !self.run_bashible(BashibleStage::Transition, bashible_params, inputs, patches, generation)? {
            return Ok(false);
        }

        let switched = registry_switcher::process(switch, &inputs.registry_switcher, patches)?;
        self.set_progress(
            ConditionType::DeckhouseRegistrySwitch,
            switched.ready,
            &switched.message,
            generation,
        );
        if !switched.ready {
            return Ok(false);
        }

        self.run_bashible(BashibleStage::Final, bashible_params, inputs, patches, generation)
    }

    fn run_bashible(
        &mut self,
        stage: BashibleStage,
        params: &bashible::Params,
        inputs: &Inputs,
        patches: &mut PatchCollector,
        generation: i64,
    ) -> Result<bool> {
        let registry = &inputs.registry_switcher.registry_secret;
        let (condition, result) = match stage {
            BashibleStage::Transition => (
                ConditionType::BashibleTransitionStage,
                self.bashible
                    .process_transition(params, registry, &inputs.bashible, patches)?,
            ),
            BashibleStage::Final => (
                ConditionType::BashibleFinalStage,
                self.bashible
                    .process_final(params, registry, &inputs.bashible, patches)?,
            ),
        };
        self.set_progress(condition, result.ready, &result.message, generation);
        Ok(result.ready)
    }

    fn stop_incluster_proxy(
        &mut self,
        inputs: &Inputs,
        patches: &mut PatchCollector,
        generation: i64,
    ) -> bool {
        let result = self.incluster_proxy.stop(&inputs.incluster_proxy, patches);
        self.set_progress(ConditionType::Cleanup, result.ready, &result.message, generation);
        result.ready
    }

    /// Cleanup condition for node services and the in-cluster proxy
    fn set_cleanup(&mut self, pending_nodes: &[String], proxy: Option<&str>, generation: i64) -> bool {
        let mut lines = Vec::new();
        if !pending_nodes.is_empty() {
            lines.push(format!("Waiting for nodes cleanup:\n- {}", pending_nodes.join("\n- ")));
        }
        if let Some(proxy) = proxy {
            lines.push(proxy.to_string());
        }
        let ready = lines.is_empty();
        self.set_progress(ConditionType::Cleanup, ready, &lines.join("\n"), generation);
        ready
    }

    fn set_progress(&mut self, type_: ConditionType, ready: bool, message: &str, generation: i64) {
        let (status, reason) = if ready {
            (CONDITION_STATUS_TRUE, ConditionReason::Ready)
        } else {
            (CONDITION_STATUS_FALSE, ConditionReason::Processing)
        };
        set_condition(&mut self.conditions, type_, status, reason, message, generation);
    }

    fn set_ready(&mut self, ready: bool, generation: i64) -> ProcessOutcome {
        conditions::prune_unsupported(&mut self.conditions);
        let message = if ready {
            String::new()
        } else {
            format!("Transitioning to {}", self.target_mode)
        };
        self.set_progress(ConditionType::Ready, ready, &message, generation);
        ProcessOutcome { ready, fatal: None }
    }
}

fn proxy_local_bashible_params(mode: ModeType, global: &GlobalPki, user_ro: &User) -> bashible::Params {
    bashible::Params {
        mode,
        proxy_local: Some(bashible::ProxyLocalParams {
            ca: global.ca.cert.clone(),
            username: user_ro.name.clone(),
            password: user_ro.password.clone(),
        }),
        ..Default::default()
    }
}

fn managed_switch(global: &GlobalPki, user_ro: &User) -> registry_switcher::Params {
    registry_switcher::Params::Managed(ManagedParams {
        ca: global.ca.cert.clone(),
        username: user_ro.name.clone(),
        password: user_ro.password.clone(),
    })
}
