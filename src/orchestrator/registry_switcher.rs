//! Gate for switching the platform pull secret
//!
//! The `deckhouse-registry` Secret is only reported as switched once the
//! global values have caught up and the deckhouse Deployment rolled out
//! with the new registry version.

use tracing::info;

use super::patch::PatchCollector;
use crate::constants;
use crate::deckhouse_registry::{
    DeckhouseRegistryConfig, GlobalRegistryValues, ManagedParams, UpstreamParams,
};
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Params {
    /// Point the platform at the embedded registry
    Managed(ManagedParams),
    /// Point the platform at an external registry
    Unmanaged(UpstreamParams),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub generation: i64,
    pub observed_generation: i64,
    /// `spec.replicas`
    pub desired_replicas: i32,
    pub replicas: i32,
    pub updated_replicas: i32,
    pub available_replicas: i32,
    /// Pod template `checksum/registry-version` annotation
    pub registry_version: Option<String>,
}

impl DeploymentStatus {
    /// `None` when the rollout is complete, otherwise what it waits for
    pub fn readiness_message(&self) -> Option<String> {
        if self.generation > self.observed_generation {
            return Some("Waiting for deckhouse deployment spec update to be observed".to_string());
        }
        if self.updated_replicas < self.desired_replicas {
            return Some(format!(
                "Waiting for deckhouse deployment rollout to finish: {} out of {} new replicas have been updated",
                self.updated_replicas, self.desired_replicas
            ));
        }
        if self.replicas > self.updated_replicas {
            return Some(format!(
                "Waiting for deckhouse deployment rollout to finish: {} old replicas are pending termination",
                self.replicas - self.updated_replicas
            ));
        }
        if self.replicas < self.updated_replicas || self.replicas > self.desired_replicas {
            return Some(format!(
                "Waiting for deckhouse deployment rollout to finish: {} replicas reported, {} updated, {} desired",
                self.replicas, self.updated_replicas, self.desired_replicas
            ));
        }
        if self.available_replicas < self.updated_replicas {
            return Some(format!(
                "Waiting for deckhouse deployment rollout to finish: {} of {} updated replicas are available",
                self.available_replicas, self.updated_replicas
            ));
        }
        None
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    pub registry_secret: DeckhouseRegistryConfig,
    pub global: GlobalRegistryValues,
    pub deployment: Option<DeploymentStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub ready: bool,
    pub message: String,
}

impl ProcessResult {
    fn waiting(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: message.into(),
        }
    }
}

pub fn process(
    params: &Params,
    inputs: &Inputs,
    patches: &mut PatchCollector,
) -> Result<ProcessResult> {
    let target = match params {
        Params::Managed(managed) => DeckhouseRegistryConfig::managed(managed)?,
        Params::Unmanaged(upstream) => DeckhouseRegistryConfig::unmanaged(upstream)?,
    };

    if target != inputs.registry_secret {
        info!(address = %target.address, path = %target.path, "Updating deckhouse registry secret");
        patches.merge_secret_data(constants::DECKHOUSE_REGISTRY_SECRET, target.to_secret_data());
        return Ok(ProcessResult::waiting("Waiting secret update"));
    }

    if inputs.global != target.global_values() {
        return Ok(ProcessResult::waiting("Waiting global vars update"));
    }

    let Some(deployment) = &inputs.deployment else {
        return Ok(ProcessResult::waiting("Deckhouse deployment not found"));
    };

    let version = target.version()?;
    if deployment.registry_version.as_deref() != Some(version.as_str()) {
        info!(version = %version, "Rolling deckhouse deployment to new registry version");
        patches.annotate_deployment_template(
            constants::DECKHOUSE_DEPLOYMENT,
            constants::DEPLOYMENT_REGISTRY_VERSION_ANNOTATION,
            version,
        );
        return Ok(ProcessResult::waiting(
            "Waiting for deckhouse deployment to pick up registry version",
        ));
    }

    if let Some(message) = deployment.readiness_message() {
        return Ok(ProcessResult::waiting(message));
    }

    Ok(ProcessResult {
        ready: true,
        message: "Switch is ready".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::patch::PatchOperation;

    fn managed() -> Params {
        Params::Managed(ManagedParams {
            ca: "CA".to_string(),
            username: "ro".to_string(),
            password: "pass".to_string(),
        })
    }

    fn settled(params: &Params) -> Inputs {
        let Params::Managed(m) = params else {
            unreachable!()
        };
        let target = DeckhouseRegistryConfig::managed(m).unwrap();
        Inputs {
            global: target.global_values(),
            deployment: Some(DeploymentStatus {
                generation: 2,
                observed_generation: 2,
                desired_replicas: 1,
                replicas: 1,
                updated_replicas: 1,
                available_replicas: 1,
                registry_version: Some(target.version().unwrap()),
            }),
            registry_secret: target,
        }
    }

    #[test]
    fn patches_secret_when_it_differs() {
        let mut patches = PatchCollector::new();
        let result = process(&managed(), &Inputs::default(), &mut patches).unwrap();

        assert_eq!(result.message, "Waiting secret update");
        assert!(matches!(
            &patches.operations()[0],
            PatchOperation::MergeSecretData { name, .. } if name == constants::DECKHOUSE_REGISTRY_SECRET
        ));
    }

    #[test]
    fn waits_for_global_values() {
        let params = managed();
        let mut inputs = settled(&params);
        inputs.global = GlobalRegistryValues::default();

        let mut patches = PatchCollector::new();
        let result = process(&params, &inputs, &mut patches).unwrap();
        assert_eq!(result.message, "Waiting global vars update");
        assert!(patches.is_empty());
    }

    #[test]
    fn annotates_deployment_with_registry_version() {
        let params = managed();
        let mut inputs = settled(&params);
        if let Some(d) = inputs.deployment.as_mut() {
            d.registry_version = None;
        }

        let mut patches = PatchCollector::new();
        let result = process(&params, &inputs, &mut patches).unwrap();
        assert!(!result.ready);
        assert!(matches!(
            &patches.operations()[0],
            PatchOperation::AnnotateDeploymentTemplate { annotation, .. }
                if annotation == constants::DEPLOYMENT_REGISTRY_VERSION_ANNOTATION
        ));
    }

    #[test]
    fn waits_for_rollout() {
        let params = managed();
        let mut inputs = settled(&params);
        if let Some(d) = inputs.deployment.as_mut() {
            d.replicas = 2;
        }

        let result = process(&params, &inputs, &mut PatchCollector::new()).unwrap();
        assert!(result.message.contains("1 old replicas are pending termination"));
    }

    #[test]
    fn scaling_down_is_not_ready() {
        let params = managed();
        let mut inputs = settled(&params);
        if let Some(d) = inputs.deployment.as_mut() {
            d.desired_replicas = 1;
            d.replicas = 1;
            d.updated_replicas = 2;
            d.available_replicas = 2;
        }

        let result = process(&params, &inputs, &mut PatchCollector::new()).unwrap();
        assert!(!result.ready);
        assert!(result.message.contains("1 replicas reported, 2 updated"));

        if let Some(d) = inputs.deployment.as_mut() {
            d.replicas = 3;
            d.updated_replicas = 3;
            d.available_replicas = 3;
        }
        let result = process(&params, &inputs, &mut PatchCollector::new()).unwrap();
        assert!(!result.ready);
        assert!(result.message.contains("1 desired"));
    }

    #[test]
    fn ready_when_everything_settled() {
        let params = managed();
        let mut patches = PatchCollector::new();
        let result = process(&params, &settled(&params), &mut patches).unwrap();
        assert!(result.ready);
        assert_eq!(result.message, "Switch is ready");
        assert!(patches.is_empty());
    }

    #[test]
    fn identical_docker_config_emits_no_patch() {
        let upstream = UpstreamParams {
            images_repo: "registry.example.com/deckhouse".to_string(),
            scheme: "https".to_string(),
            ca: String::new(),
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let inputs = Inputs {
            registry_secret: DeckhouseRegistryConfig::unmanaged(&upstream).unwrap(),
            ..Default::default()
        };
        let mut patches = PatchCollector::new();
        process(&Params::Unmanaged(upstream), &inputs, &mut patches).unwrap();
        assert!(patches.is_empty());
    }
}
