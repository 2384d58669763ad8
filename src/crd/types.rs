//! Shared status types
//!
//! [`Condition`] follows the Kubernetes `metav1.Condition` convention and is
//! used both in the orchestrator state and in the published status ConfigMap.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition for status reporting (Kubernetes convention)
///
/// # Examples
///
/// ```rust,no_run
/// use system_registry_orchestrator::crd::Condition;
///
/// let condition = Condition::new("PKI", "True", "", "", Some(3));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. "Ready", "PKI", "NodeServices")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition status changed (RFC 3339)
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Module config generation the condition was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: &str,
        reason: &str,
        message: &str,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}
