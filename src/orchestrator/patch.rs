//! Kubernetes writes produced by a reconcile
//!
//! Orchestration never talks to the API server directly. Each write is
//! recorded here in order and applied by the controller once
//! [`State::process`](super::State::process) returns.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::constants;

pub const MANAGER_NAME: &str = "registry-orchestrator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PatchOperation {
    /// Server-side apply of a Secret owned by the orchestrator
    ApplySecret(Secret),
    DeleteSecret { name: String },
    /// Merge patch of `data` on a Secret the orchestrator does not own
    MergeSecretData {
        name: String,
        data: BTreeMap<String, ByteString>,
    },
    /// Merge patch of a pod template annotation on a Deployment
    AnnotateDeploymentTemplate {
        name: String,
        annotation: String,
        value: String,
    },
    /// Kubernetes Event on the module config
    Event {
        type_: EventType,
        reason: String,
        message: String,
    },
}

#[derive(Clone, Debug, Default)]
pub struct PatchCollector {
    operations: Vec<PatchOperation>,
}

impl PatchCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_secret(&mut self, secret: Secret) {
        self.operations.push(PatchOperation::ApplySecret(secret));
    }

    pub fn delete_secret(&mut self, name: impl Into<String>) {
        self.operations
            .push(PatchOperation::DeleteSecret { name: name.into() });
    }

    pub fn merge_secret_data(&mut self, name: impl Into<String>, data: BTreeMap<String, ByteString>) {
        self.operations.push(PatchOperation::MergeSecretData {
            name: name.into(),
            data,
        });
    }

    pub fn annotate_deployment_template(
        &mut self,
        name: impl Into<String>,
        annotation: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.operations
            .push(PatchOperation::AnnotateDeploymentTemplate {
                name: name.into(),
                annotation: annotation.into(),
                value: value.into(),
            });
    }

    pub fn event(&mut self, type_: EventType, reason: &str, message: impl Into<String>) {
        self.operations.push(PatchOperation::Event {
            type_,
            reason: reason.to_string(),
            message: message.into(),
        });
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<PatchOperation> {
        self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Names of all secrets applied so far, in order
    pub fn applied_secret_names(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                PatchOperation::ApplySecret(secret) => secret.metadata.name.clone(),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_secret_names(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                PatchOperation::DeleteSecret { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Data of the last apply recorded for `name`
    pub fn applied_secret_data(&self, name: &str) -> Option<SecretData> {
        self.operations.iter().rev().find_map(|op| match op {
            PatchOperation::ApplySecret(secret) if secret.metadata.name.as_deref() == Some(name) => {
                Some(secret_data(secret))
            }
            _ => None,
        })
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                PatchOperation::Event { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Secret carrying the orchestrator's ownership labels
pub fn owned_secret(
    name: &str,
    type_: Option<&str>,
    extra_labels: &[(&str, &str)],
    data: BTreeMap<String, Vec<u8>>,
) -> Secret {
    let mut labels = BTreeMap::from([
        (constants::LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
        (
            constants::LABEL_HERITAGE.to_string(),
            constants::LABEL_HERITAGE_VALUE.to_string(),
        ),
        (
            constants::LABEL_MODULE.to_string(),
            constants::MODULE_NAME.to_string(),
        ),
    ]);
    for (k, v) in extra_labels {
        labels.insert((*k).to_string(), (*v).to_string());
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: type_.map(str::to_string),
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Raw Secret `data`, as the components see it
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Convert API Secret data into [`SecretData`]
pub fn secret_data(secret: &Secret) -> SecretData {
    secret
        .data
        .as_ref()
        .map(|data| data.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
        .unwrap_or_default()
}

/// Whether the stored data equals what would be applied
pub fn same_data(current: Option<&SecretData>, desired: &SecretData) -> bool {
    current.map(|c| c == desired).unwrap_or(false)
}

pub fn data_string(data: &SecretData, key: &str) -> String {
    data.get(key)
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default()
}
