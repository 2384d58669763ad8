//! Dex storage objects touched by user operations
//!
//! Dex keeps its state in `dex.coreos.com/v1` custom resources whose fields
//! sit at the top level of the object. No typed bindings exist, so objects are
//! read and patched through [`DynamicObject`].

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEX_GROUP: &str = "dex.coreos.com";
pub const DEX_VERSION: &str = "v1";
pub const DEX_NAMESPACE: &str = "d8-user-authn";

/// Marks a password locked by an operator rather than by failed logins
pub const LOCKED_BY_ADMINISTRATOR_ANNOTATION: &str = "deckhouse.io/locked-by-administrator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DexKind {
    Password,
    OfflineSessions,
    RefreshToken,
}

impl DexKind {
    fn kind(self) -> &'static str {
        match self {
            DexKind::Password => "Password",
            DexKind::OfflineSessions => "OfflineSessions",
            DexKind::RefreshToken => "RefreshToken",
        }
    }

    fn api_resource(self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(DEX_GROUP, DEX_VERSION, self.kind());
        // plurals as registered by the Dex CRDs
        let plural = match self {
            DexKind::Password => "passwords",
            DexKind::OfflineSessions => "offlinesessionses",
            DexKind::RefreshToken => "refreshtokens",
        };
        ApiResource::from_gvk_with_plural(&gvk, plural)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Password {
    pub name: String,
    pub username: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OfflineSession {
    pub name: String,
    pub user_id: String,
    /// IDs of the refresh tokens the session references
    pub refresh_token_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshToken {
    /// Object name, which is also the token ID
    pub name: String,
    pub claims_user_id: String,
    pub claims_username: String,
    pub claims_preferred_username: String,
}

impl RefreshToken {
    pub fn belongs_to(&self, user: &str) -> bool {
        self.claims_username == user
            || self.claims_user_id == user
            || self.claims_preferred_username == user
    }
}

/// First string found at any of `paths`
fn nested_string(data: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        path.iter()
            .try_fold(data, |v, key| v.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

impl Password {
    pub fn from_object(obj: &DynamicObject) -> Self {
        Self {
            name: obj.name_any(),
            username: nested_string(&obj.data, &[&["username"]]).unwrap_or_default(),
        }
    }
}

impl OfflineSession {
    pub fn from_object(obj: &DynamicObject) -> Self {
        let user_id = nested_string(
            &obj.data,
            &[&["userID"], &["userId"], &["spec", "userID"], &["spec", "userId"]],
        )
        .unwrap_or_default();

        let refresh_token_ids = obj
            .data
            .get("refresh")
            .and_then(Value::as_object)
            .map(|refresh| {
                refresh
                    .values()
                    .filter_map(|r| nested_string(r, &[&["ID"], &["id"]]))
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: obj.name_any(),
            user_id,
            refresh_token_ids,
        }
    }

    /// Whether the session belongs to `user`, directly or through the claims
    /// of a referenced refresh token
    pub fn belongs_to(&self, user: &str, tokens: &BTreeMap<String, &RefreshToken>) -> bool {
        if !self.user_id.is_empty() {
            return self.user_id == user;
        }
        self.refresh_token_ids
            .iter()
            .filter_map(|id| tokens.get(id))
            .any(|token| token.belongs_to(user))
    }
}

impl RefreshToken {
    pub fn from_object(obj: &DynamicObject) -> Self {
        let data = &obj.data;
        Self {
            name: obj.name_any(),
            claims_user_id: nested_string(data, &[&["claims", "userID"], &["claims", "userId"]])
                .unwrap_or_default(),
            claims_username: nested_string(data, &[&["claims", "username"]]).unwrap_or_default(),
            claims_preferred_username: nested_string(
                data,
                &[&["claims", "preferredUsername"], &["claims", "preferred_username"]],
            )
            .unwrap_or_default(),
        }
    }
}

/// Change to one Dex object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DexPatch {
    LockPassword { name: String, until: DateTime<Utc> },
    UnlockPassword { name: String },
    /// `hash` is already base64 encoded, as Dex stores it
    ResetPassword { name: String, hash: String },
    DeleteOfflineSessions { name: String },
    DeleteRefreshToken { name: String },
}

impl DexPatch {
    fn target(&self) -> (DexKind, &str) {
        match self {
            DexPatch::LockPassword { name, .. }
            | DexPatch::UnlockPassword { name }
            | DexPatch::ResetPassword { name, .. } => (DexKind::Password, name.as_str()),
            DexPatch::DeleteOfflineSessions { name } => (DexKind::OfflineSessions, name.as_str()),
            DexPatch::DeleteRefreshToken { name } => (DexKind::RefreshToken, name.as_str()),
        }
    }

    /// JSON merge patch body, `None` for deletions
    pub fn merge_patch(&self) -> Option<Value> {
        match self {
            DexPatch::LockPassword { until, .. } => Some(json!({
                "lockedUntil": until.to_rfc3339_opts(SecondsFormat::Secs, true),
                "metadata": { "annotations": { LOCKED_BY_ADMINISTRATOR_ANNOTATION: "" } },
            })),
            DexPatch::UnlockPassword { .. } => Some(json!({
                "lockedUntil": null,
                "metadata": { "annotations": { LOCKED_BY_ADMINISTRATOR_ANNOTATION: null } },
            })),
            DexPatch::ResetPassword { hash, .. } => Some(json!({
                "hash": hash,
                "requireResetHashOnNextSuccLogin": true,
            })),
            DexPatch::DeleteOfflineSessions { .. } | DexPatch::DeleteRefreshToken { .. } => None,
        }
    }
}

/// Dex objects living in one namespace
#[derive(Clone)]
pub struct DexClient {
    client: Client,
    namespace: String,
}

impl DexClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self, kind: DexKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &kind.api_resource())
    }

    /// All objects of `kind`; a missing CRD yields an empty list
    async fn list(&self, kind: DexKind) -> Result<Vec<DynamicObject>> {
        match self.api(kind).list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(kind = kind.kind(), "Dex resource is not installed");
                Ok(Vec::new())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    pub async fn passwords(&self) -> Result<Vec<Password>> {
        Ok(self
            .list(DexKind::Password)
            .await?
            .iter()
            .map(Password::from_object)
            .collect())
    }

    pub async fn offline_sessions(&self) -> Result<Vec<OfflineSession>> {
        Ok(self
            .list(DexKind::OfflineSessions)
            .await?
            .iter()
            .map(OfflineSession::from_object)
            .collect())
    }

    pub async fn refresh_tokens(&self) -> Result<Vec<RefreshToken>> {
        Ok(self
            .list(DexKind::RefreshToken)
            .await?
            .iter()
            .map(RefreshToken::from_object)
            .collect())
    }

    pub async fn apply(&self, patch: &DexPatch) -> Result<()> {
        let (kind, name) = patch.target();
        let api = self.api(kind);
        match patch.merge_patch() {
            Some(body) => {
                api.patch(name, &PatchParams::default(), &Patch::Merge(&body))
                    .await?;
            }
            None => match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(kind = kind.kind(), name, "Dex object already deleted");
                }
                Err(e) => return Err(Error::KubeError(e)),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(kind: DexKind, name: &str, data: Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &kind.api_resource());
        obj.data = data;
        obj
    }

    #[test]
    fn offline_session_reads_user_id_variants() {
        let direct = object(DexKind::OfflineSessions, "s1", json!({ "userID": "alice" }));
        assert_eq!(OfflineSession::from_object(&direct).user_id, "alice");

        let nested = object(DexKind::OfflineSessions, "s2", json!({ "spec": { "userId": "bob" } }));
        assert_eq!(OfflineSession::from_object(&nested).user_id, "bob");
    }

    #[test]
    fn offline_session_matches_through_refresh_tokens() {
        let session = OfflineSession::from_object(&object(
            DexKind::OfflineSessions,
            "s1",
            json!({ "refresh": { "kubernetes": { "ID": "rt-1" }, "other": { "id": "rt-2" } } }),
        ));
        assert_eq!(session.refresh_token_ids.len(), 2);

        let token = RefreshToken::from_object(&object(
            DexKind::RefreshToken,
            "rt-2",
            json!({ "claims": { "preferred_username": "alice" } }),
        ));
        let tokens = BTreeMap::from([(token.name.clone(), &token)]);
        assert!(session.belongs_to("alice", &tokens));
        assert!(!session.belongs_to("bob", &tokens));
    }

    #[test]
    fn lock_patch_sets_annotation() {
        let until = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = DexPatch::LockPassword {
            name: "p".to_string(),
            until,
        }
        .merge_patch()
        .unwrap();
        assert_eq!(body["lockedUntil"], "2026-01-02T03:04:05Z");
        assert_eq!(
            body["metadata"]["annotations"][LOCKED_BY_ADMINISTRATOR_ANNOTATION],
            ""
        );

        let unlock = DexPatch::UnlockPassword { name: "p".to_string() }
            .merge_patch()
            .unwrap();
        assert!(unlock["lockedUntil"].is_null());
    }
}
