//! UserOperation: a one-shot administrative action against a Dex user

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "deckhouse.io",
    version = "v1",
    kind = "UserOperation",
    status = "UserOperationStatus",
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.user"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationSpec {
    /// Dex username the operation targets
    pub user: String,

    #[serde(rename = "type")]
    pub type_: UserOperationType,

    #[serde(default)]
    pub initiator_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_password: Option<ResetPasswordSpec>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UserOperationType {
    Lock,
    Unlock,
    ResetPassword,
    #[serde(rename = "Reset2FA")]
    Reset2Fa,
}

impl std::fmt::Display for UserOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserOperationType::Lock => "Lock",
            UserOperationType::Unlock => "Unlock",
            UserOperationType::ResetPassword => "ResetPassword",
            UserOperationType::Reset2Fa => "Reset2FA",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LockSpec {
    /// Lock duration in Go duration notation (`30m`, `1h30m`)
    #[serde(rename = "for")]
    pub for_: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordSpec {
    /// Raw bcrypt hash (`$2a$...`), not base64 encoded
    pub new_password_hash: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationStatus {
    /// Empty until the operation has been executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<UserOperationPhase>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UserOperationPhase {
    Succeeded,
    Failed,
}
