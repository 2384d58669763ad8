//! Collects the cluster observations the orchestrator works from

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::cache::SecretCache;
use crate::constants::{self, NODE_AGENT_APP};
use crate::deckhouse_registry::{DeckhouseRegistryConfig, GlobalRegistryValues};
use crate::error::{Error, Result};
use crate::orchestrator::incluster_proxy::{self, ProxyPod};
use crate::orchestrator::node_services::{self, MasterNode, StaticPodStatus};
use crate::orchestrator::patch::{data_string, secret_data, SecretData};
use crate::orchestrator::registry_switcher::{self, DeploymentStatus};
use crate::orchestrator::{bashible, Inputs};
use crate::values::{self, ValuesStore, GLOBAL_REGISTRY_PATH};

pub struct InputsCollector<'a> {
    pub client: &'a Client,
    pub namespace: &'a str,
    pub secrets: &'a SecretCache,
    pub values: &'a dyn ValuesStore,
}

impl InputsCollector<'_> {
    pub async fn collect(&self) -> Result<Inputs> {
        let listed = self.secrets.list().await?;
        let node_pki_secret_names = node_pki_secret_names(&listed);
        let secrets: BTreeMap<String, SecretData> = listed
            .iter()
            .map(|s| (s.name_any(), secret_data(s)))
            .collect();

        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes.list(&ListParams::default()).await?.items;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), self.namespace);
        let agent_pods = pods
            .list(&ListParams::default().labels(&format!("app={NODE_AGENT_APP}")))
            .await?
            .items;
        let static_pods = pods
            .list(&ListParams::default().labels(&static_pod_selector()))
            .await?
            .items;
        let proxy_pods = pods
            .list(&ListParams::default().labels(&format!("app={}", constants::INCLUSTER_PROXY_APP)))
            .await?
            .items;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), self.namespace);
        let deployment = deployments.get_opt(constants::DECKHOUSE_DEPLOYMENT).await?;

        let registry_secret = self.registry_secret().await?;
        // written by GlobalValuesSync, may lag behind the secret
        let global: GlobalRegistryValues =
            values::get_optional(self.values, GLOBAL_REGISTRY_PATH)?.unwrap_or_default();

        Ok(build_inputs(Observed {
            secrets,
            node_pki_secret_names,
            nodes: &nodes,
            agent_pods: &agent_pods,
            static_pods: &static_pods,
            proxy_pods: &proxy_pods,
            deployment: deployment.as_ref(),
            registry_secret,
            global,
        }))
    }

    async fn registry_secret(&self) -> Result<DeckhouseRegistryConfig> {
        match self.secrets.get(constants::DECKHOUSE_REGISTRY_SECRET).await? {
            Some(secret) => DeckhouseRegistryConfig::from_secret(&secret),
            None => Err(Error::ConfigError(format!(
                "secret {} not found",
                constants::DECKHOUSE_REGISTRY_SECRET
            ))),
        }
    }
}

/// Per-node PKI secrets, recognised by their type label
fn node_pki_secret_names(secrets: &[Secret]) -> Vec<String> {
    let mut names: Vec<String> = secrets
        .iter()
        .filter(|s| {
            s.labels().get(constants::LABEL_TYPE).map(String::as_str)
                == Some(constants::NODE_PKI_SECRET_TYPE_LABEL)
        })
        .map(|s| s.name_any())
        .collect();
    names.sort();
    names
}

fn static_pod_selector() -> String {
    constants::node_services_pod_labels()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Raw objects read in one pass
struct Observed<'a> {
    secrets: BTreeMap<String, SecretData>,
    node_pki_secret_names: Vec<String>,
    nodes: &'a [Node],
    agent_pods: &'a [Pod],
    static_pods: &'a [Pod],
    proxy_pods: &'a [Pod],
    deployment: Option<&'a Deployment>,
    registry_secret: DeckhouseRegistryConfig,
    global: GlobalRegistryValues,
}

fn build_inputs(observed: Observed<'_>) -> Inputs {
    let Observed {
        secrets,
        node_pki_secret_names,
        nodes,
        agent_pods,
        static_pods,
        proxy_pods,
        deployment,
        registry_secret,
        global,
    } = observed;

    let agent_ips = pod_ips_by_node(agent_pods);
    let static_pods: BTreeMap<String, StaticPodStatus> = static_pods
        .iter()
        .filter_map(|pod| Some((pod_node_name(pod)?, static_pod_status(pod))))
        .collect();

    let mut masters: Vec<MasterNode> = nodes
        .iter()
        .filter(|node| is_master(node))
        .filter_map(|node| {
            let mut master = master_node(node)?;
            master.pki_secret = secrets
                .get(&constants::node_pki_secret_name(&master.name))
                .cloned();
            master.config_secret = secrets
                .get(&constants::node_config_secret_name(&master.name))
                .cloned();
            master.agent_pod_ip = agent_ips.get(&master.name).cloned();
            master.static_pod = static_pods.get(&master.name).cloned();
            Some(master)
        })
        .collect();
    masters.sort_by(|a, b| a.name.cmp(&b.name));

    let mut master_node_ips: Vec<String> = masters.iter().map(|m| m.internal_ip.clone()).collect();
    master_node_ips.sort();

    let node_status = nodes
        .iter()
        .map(|node| (node.name_any(), bashible_version(node)))
        .collect();

    let user_secrets = secrets
        .iter()
        .filter_map(|(name, data)| {
            name.strip_prefix(constants::USER_SECRET_PREFIX)
                .map(|role| (role.to_string(), data.clone()))
        })
        .collect();

    let ingress_client_ca = secrets
        .get(constants::INGRESS_CLIENT_CA_SECRET)
        .map(|data| data_string(data, constants::INGRESS_CLIENT_CA_KEY))
        .filter(|ca| !ca.is_empty());

    debug!(
        masters = masters.len(),
        nodes = nodes.len(),
        proxy_pods = proxy_pods.len(),
        "Collected inputs"
    );

    Inputs {
        pki_secret: secrets.get(constants::PKI_SECRET).cloned(),
        secrets_secret: secrets.get(constants::SECRETS_SECRET).cloned(),
        user_secrets,
        node_pki_secret_names,
        ingress_client_ca,
        registry_switcher: registry_switcher::Inputs {
            registry_secret,
            global,
            deployment: deployment.map(deployment_status),
        },
        bashible: bashible::Inputs {
            secret: secrets.get(constants::BASHIBLE_CONFIG_SECRET).cloned(),
            master_node_ips,
            node_status,
        },
        node_services: node_services::Inputs { masters },
        incluster_proxy: incluster_proxy::Inputs {
            config_secret: secrets.get(constants::INCLUSTER_PROXY_CONFIG_SECRET).cloned(),
            pods: proxy_pods.iter().map(proxy_pod).collect(),
        },
    }
}

fn is_master(node: &Node) -> bool {
    node.labels().contains_key(constants::MASTER_NODE_LABEL)
}

/// Master without its secrets and pods; `None` until it reports an InternalIP
fn master_node(node: &Node) -> Option<MasterNode> {
    let internal_ip = node
        .status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")?
        .address
        .clone();

    Some(MasterNode {
        name: node.name_any(),
        internal_ip,
        created_at: node.creation_timestamp().map(|t| t.0),
        ..Default::default()
    })
}

fn bashible_version(node: &Node) -> String {
    node.annotations()
        .get(constants::BASHIBLE_VERSION_ANNOTATION)
        .cloned()
        .unwrap_or_else(|| constants::UNKNOWN_VERSION.to_string())
}

fn pod_node_name(pod: &Pod) -> Option<String> {
    pod.spec.as_ref()?.node_name.clone()
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn pod_ips_by_node(pods: &[Pod]) -> BTreeMap<String, String> {
    pods.iter()
        .filter_map(|pod| {
            let ip = pod.status.as_ref()?.pod_ip.clone()?;
            Some((pod_node_name(pod)?, ip))
        })
        .collect()
}

fn static_pod_status(pod: &Pod) -> StaticPodStatus {
    StaticPodStatus {
        ready: pod_ready(pod),
        config_version: pod
            .annotations()
            .get(constants::NODE_SERVICES_VERSION_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
    }
}

fn proxy_pod(pod: &Pod) -> ProxyPod {
    ProxyPod {
        name: pod.name_any(),
        ready: pod_ready(pod),
        version: pod
            .annotations()
            .get(constants::INCLUSTER_PROXY_VERSION_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
    }
}

fn deployment_status(deployment: &Deployment) -> DeploymentStatus {
    let status = deployment.status.clone().unwrap_or_default();
    let spec = deployment.spec.as_ref();
    DeploymentStatus {
        generation: deployment.metadata.generation.unwrap_or_default(),
        observed_generation: status.observed_generation.unwrap_or_default(),
        desired_replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        replicas: status.replicas.unwrap_or_default(),
        updated_replicas: status.updated_replicas.unwrap_or_default(),
        available_replicas: status.available_replicas.unwrap_or_default(),
        registry_version: spec
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(constants::DEPLOYMENT_REGISTRY_VERSION_ANNOTATION))
            .cloned(),
    }
}

#[cfg(test)]
#[path = "inputs_test.rs"]
mod inputs_test;
