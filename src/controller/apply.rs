//! Applies recorded [`PatchOperation`]s to the cluster

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::crd::ModuleConfig;
use crate::error::{Error, Result};
use crate::orchestrator::patch::MANAGER_NAME;
use crate::orchestrator::{EventType, PatchOperation};

pub struct Applier<'a> {
    pub client: &'a Client,
    pub namespace: &'a str,
    /// Object the events are reported against
    pub module_config: &'a ModuleConfig,
}

impl Applier<'_> {
    pub async fn apply_all(&self, operations: Vec<PatchOperation>) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), self.namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), self.namespace);

        for op in operations {
            match op {
                PatchOperation::ApplySecret(mut secret) => {
                    let name = secret.name_any();
                    secret.metadata.namespace = Some(self.namespace.to_string());
                    secrets
                        .patch(&name, &PatchParams::apply(MANAGER_NAME).force(), &Patch::Apply(&secret))
                        .await?;
                    debug!(secret = %name, "Applied secret");
                }
                PatchOperation::DeleteSecret { name } => {
                    match secrets.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => info!(secret = %name, "Deleted secret"),
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(e) => return Err(Error::KubeError(e)),
                    }
                }
                PatchOperation::MergeSecretData { name, data } => {
                    let patch = json!({ "data": data });
                    secrets
                        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    info!(secret = %name, "Patched secret data");
                }
                PatchOperation::AnnotateDeploymentTemplate {
                    name,
                    annotation,
                    value,
                } => {
                    let patch = json!({
                        "spec": { "template": { "metadata": { "annotations": { annotation: value } } } }
                    });
                    deployments
                        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    info!(deployment = %name, "Annotated deployment template");
                }
                PatchOperation::Event {
                    type_,
                    reason,
                    message,
                } => {
                    // Events are best effort
                    if let Err(e) = emit_event(self.client, self.module_config, type_, &reason, &message).await {
                        warn!(reason = %reason, "Failed to emit event: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Create a core/v1 Event about `module_config`
pub async fn emit_event(
    client: &Client,
    module_config: &ModuleConfig,
    type_: EventType,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = module_config
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", module_config.name_any())),
            ..Default::default()
        },
        type_: Some(type_.as_str().to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: module_config.object_ref(&()),
        reporting_component: Some(MANAGER_NAME.to_string()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events.create(&PostParams::default(), &event).await?;
    Ok(())
}
