//! Executor for `UserOperation` objects
//!
//! Pending operations run once against the Dex storage objects and get a
//! terminal phase. Finished operations are garbage collected after a day.
//! A pass runs on every UserOperation watch event and on a cron tick.

pub mod dex;
mod duration;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{UserOperation, UserOperationPhase, UserOperationSpec, UserOperationStatus, UserOperationType};
use crate::error::{Error, Result};
use dex::{DexClient, DexPatch, OfflineSession, Password, RefreshToken};
pub use duration::parse_duration;

/// Every five minutes, on the minute
pub const SCHEDULE: &str = "0 */5 * * * *";

const RETENTION_HOURS: i64 = 24;

/// Dex objects an operation may touch
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub passwords: Vec<Password>,
    pub offline_sessions: Vec<OfflineSession>,
    pub refresh_tokens: Vec<RefreshToken>,
}

/// One pending operation with its outcome
#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub operation: String,
    pub patches: Vec<DexPatch>,
    pub status: UserOperationStatus,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub executions: Vec<Execution>,
    /// Finished operations past retention
    pub expired: Vec<String>,
}

/// Decide what to do with every operation
pub fn plan(operations: &[UserOperation], snapshot: &Snapshot, now: DateTime<Utc>) -> Plan {
    let mut plan = Plan::default();
    for operation in operations {
        let name = operation.name_any();
        let phase = operation.status.as_ref().and_then(|s| s.phase);
        if phase.is_none() {
            let result = execute(&operation.spec, snapshot, now);
            if let Err(e) = &result {
                warn!(operation = %name, error = %e, "UserOperation failed");
            }
            let (patches, status) = match result {
                Ok(patches) => (patches, completed(UserOperationPhase::Succeeded, String::new(), now)),
                Err(e) => (Vec::new(), completed(UserOperationPhase::Failed, failure_message(&e), now)),
            };
            plan.executions.push(Execution {
                operation: name,
                patches,
                status,
            });
            continue;
        }

        let created = operation.creation_timestamp().map(|t| t.0);
        if created.is_some_and(|t| now - t >= Duration::hours(RETENTION_HOURS)) {
            plan.expired.push(name);
        }
    }
    plan
}

fn completed(phase: UserOperationPhase, message: String, now: DateTime<Utc>) -> UserOperationStatus {
    UserOperationStatus {
        phase: Some(phase),
        message,
        completed_at: Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

fn failure_message(e: &Error) -> String {
    match e {
        Error::UserOperation(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Dex changes performing `spec`
pub fn execute(spec: &UserOperationSpec, snapshot: &Snapshot, now: DateTime<Utc>) -> Result<Vec<DexPatch>> {
    match spec.type_ {
        UserOperationType::Lock => {
            let lock = spec
                .lock
                .as_ref()
                .ok_or_else(|| Error::UserOperation("lock spec is nil".to_string()))?;
            let duration = parse_duration(&lock.for_)
                .map_err(|e| Error::UserOperation(format!("lock.for is invalid: {e}")))?;
            let password = find_password(snapshot, &spec.user)?;
            info!(user = %spec.user, duration = %lock.for_, "Locking user password");
            Ok(vec![DexPatch::LockPassword {
                name: password.name.clone(),
                until: now + duration,
            }])
        }
        UserOperationType::Unlock => {
            let password = find_password(snapshot, &spec.user)?;
            info!(user = %spec.user, "Unlocking user password");
            Ok(vec![DexPatch::UnlockPassword {
                name: password.name.clone(),
            }])
        }
        UserOperationType::ResetPassword => {
            let reset = spec
                .reset_password
                .as_ref()
                .ok_or_else(|| Error::UserOperation("resetPassword spec is nil".to_string()))?;
            let raw = &reset.new_password_hash;
            // Dex stores the hash base64 encoded, an encoded input would be encoded twice
            if !raw.starts_with("$2") {
                return Err(Error::UserOperation(format!(
                    "resetPassword.newPasswordHash must be a raw bcrypt hash (starting with $2*), got: {raw:?}"
                )));
            }
            bcrypt_cost(raw).map_err(|e| {
                Error::UserOperation(format!(
                    "resetPassword.newPasswordHash must be a valid bcrypt hash: {e}"
                ))
            })?;
            let password = find_password(snapshot, &spec.user)?;
            info!(user = %spec.user, "Resetting user password");
            Ok(vec![DexPatch::ResetPassword {
                name: password.name.clone(),
                hash: STANDARD.encode(raw.as_bytes()),
            }])
        }
        UserOperationType::Reset2Fa => Ok(reset_2fa(&spec.user, snapshot)),
    }
}

fn find_password<'a>(snapshot: &'a Snapshot, user: &str) -> Result<&'a Password> {
    snapshot
        .passwords
        .iter()
        .find(|p| p.username == user)
        .ok_or_else(|| Error::UserOperation(format!("cannot find password for user: {user}")))
}

/// Cost of a `$2x$NN$...` hash
fn bcrypt_cost(hash: &str) -> std::result::Result<u32, String> {
    let parts = bcrypt::HashParts::from_str(hash).map_err(|e| e.to_string())?;
    let cost = parts.get_cost();
    if !(4..=31).contains(&cost) {
        return Err(format!("cost {cost} is outside the allowed range"));
    }
    Ok(cost)
}

/// Delete every offline session and refresh token of `user`. Finding none
/// is not an error.
fn reset_2fa(user: &str, snapshot: &Snapshot) -> Vec<DexPatch> {
    let tokens: BTreeMap<String, &RefreshToken> = snapshot
        .refresh_tokens
        .iter()
        .map(|t| (t.name.clone(), t))
        .collect();

    let mut patches = Vec::new();
    for session in &snapshot.offline_sessions {
        if !session.belongs_to(user, &tokens) {
            debug!(offline_session = %session.name, user, "OfflineSessions belongs to another user");
            continue;
        }
        info!(user, offline_session = %session.name, "Resetting 2FA: deleting OfflineSessions");
        patches.push(DexPatch::DeleteOfflineSessions {
            name: session.name.clone(),
        });
    }
    for token in &snapshot.refresh_tokens {
        if token.belongs_to(user) {
            info!(user, refresh_token = %token.name, "Resetting 2FA: deleting RefreshToken");
            patches.push(DexPatch::DeleteRefreshToken {
                name: token.name.clone(),
            });
        }
    }
    if patches.is_empty() {
        info!(user, "Reset2FA found no objects to delete");
    }
    patches
}

/// Runs user operations while this replica holds the lease
pub struct UserOperationRunner {
    client: Client,
    dex: DexClient,
    is_leader: Arc<AtomicBool>,
}

impl UserOperationRunner {
    pub fn new(client: Client, dex_namespace: &str, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            dex: DexClient::new(client.clone(), dex_namespace),
            client,
            is_leader,
        }
    }

    pub async fn run(self) -> Result<()> {
        let schedule = cron::Schedule::from_str(SCHEDULE)
            .map_err(|e| Error::ConfigError(format!("invalid schedule {SCHEDULE:?}: {e}")))?;
        let api: Api<UserOperation> = Api::all(self.client.clone());
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .applied_objects()
            .boxed();

        info!(schedule = SCHEDULE, "Starting UserOperation executor");
        loop {
            let until_tick = schedule
                .upcoming(Utc)
                .next()
                .and_then(|next| (next - Utc::now()).to_std().ok())
                .unwrap_or(std::time::Duration::from_secs(300));

            tokio::select! {
                _ = tokio::time::sleep(until_tick) => {
                    debug!("UserOperation cron tick");
                }
                event = events.next() => match event {
                    Some(Ok(op)) => debug!(operation = %op.name_any(), "UserOperation changed"),
                    Some(Err(e)) => {
                        warn!(error = %e, "UserOperation watch error");
                        continue;
                    }
                    None => return Err(Error::ConfigError("UserOperation watch ended".to_string())),
                },
            }

            if !self.is_leader.load(Ordering::Relaxed) {
                continue;
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, "UserOperation pass failed");
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<()> {
        let api: Api<UserOperation> = Api::all(self.client.clone());
        let operations = api.list(&ListParams::default()).await?.items;
        let snapshot = Snapshot {
            passwords: self.dex.passwords().await?,
            offline_sessions: self.dex.offline_sessions().await?,
            refresh_tokens: self.dex.refresh_tokens().await?,
        };

        let plan = plan(&operations, &snapshot, Utc::now());
        info!(
            execute = plan.executions.len(),
            clean_up = plan.expired.len(),
            "UserOperation pass"
        );

        for execution in plan.executions {
            let mut status = execution.status;
            for patch in &execution.patches {
                if let Err(e) = self.dex.apply(patch).await {
                    warn!(operation = %execution.operation, error = %e, "Applying Dex change failed");
                    status.phase = Some(UserOperationPhase::Failed);
                    status.message = e.to_string();
                    break;
                }
            }
            let body = json!({ "status": status });
            api.patch_status(&execution.operation, &PatchParams::default(), &Patch::Merge(&body))
                .await?;
        }

        for name in plan.expired {
            info!(operation = %name, "Deleting expired UserOperation");
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LockSpec, ResetPasswordSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    // bcrypt of "password" with cost 10
    const HASH: &str = "$2a$10$N9qo8uLOickgx2ZMRZoMyeIjZAgcfl7p92ldGxad68LJZdL17lhWy";

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn operation(name: &str, spec: UserOperationSpec) -> UserOperation {
        let mut op = UserOperation::new(name, spec);
        op.metadata.creation_timestamp = Some(Time(now() - Duration::minutes(1)));
        op
    }

    fn spec(user: &str, type_: UserOperationType) -> UserOperationSpec {
        UserOperationSpec {
            user: user.to_string(),
            type_,
            initiator_type: "admin".to_string(),
            lock: None,
            reset_password: None,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            passwords: vec![Password {
                name: "mfxgszlbmfxgszlbmfxgszlbmfxgszlb".to_string(),
                username: "alice".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn reset_password_for_unknown_user_fails() {
        let mut s = spec("ghost", UserOperationType::ResetPassword);
        s.reset_password = Some(ResetPasswordSpec {
            new_password_hash: HASH.to_string(),
        });

        let plan = plan(&[operation("op-1", s)], &snapshot(), now());

        let execution = &plan.executions[0];
        assert!(execution.patches.is_empty());
        assert_eq!(execution.status.phase, Some(UserOperationPhase::Failed));
        assert_eq!(execution.status.message, "cannot find password for user: ghost");
        assert_eq!(execution.status.completed_at.as_deref(), Some("2026-03-01T12:00:00Z"));
    }

    #[test]
    fn reset_password_stores_base64_hash() {
        let mut s = spec("alice", UserOperationType::ResetPassword);
        s.reset_password = Some(ResetPasswordSpec {
            new_password_hash: HASH.to_string(),
        });

        let patches = execute(&s, &snapshot(), now()).unwrap();
        let DexPatch::ResetPassword { hash, .. } = &patches[0] else {
            panic!("expected a password reset");
        };
        assert_eq!(STANDARD.decode(hash).unwrap(), HASH.as_bytes());
    }

    #[test]
    fn reset_password_rejects_encoded_hash() {
        let mut s = spec("alice", UserOperationType::ResetPassword);
        s.reset_password = Some(ResetPasswordSpec {
            new_password_hash: STANDARD.encode(HASH),
        });
        let err = failure_message(&execute(&s, &snapshot(), now()).unwrap_err());
        assert!(err.starts_with("resetPassword.newPasswordHash must be a raw bcrypt hash"));

        s.reset_password = Some(ResetPasswordSpec {
            new_password_hash: "$2a$99$short".to_string(),
        });
        let err = failure_message(&execute(&s, &snapshot(), now()).unwrap_err());
        assert!(err.starts_with("resetPassword.newPasswordHash must be a valid bcrypt hash"));
    }

    #[test]
    fn lock_requires_spec_and_sets_deadline() {
        let s = spec("alice", UserOperationType::Lock);
        let err = execute(&s, &snapshot(), now()).unwrap_err();
        assert_eq!(failure_message(&err), "lock spec is nil");

        let mut s = spec("alice", UserOperationType::Lock);
        s.lock = Some(LockSpec {
            for_: "1h30m".to_string(),
        });
        let patches = execute(&s, &snapshot(), now()).unwrap();
        assert_eq!(
            patches,
            vec![DexPatch::LockPassword {
                name: "mfxgszlbmfxgszlbmfxgszlbmfxgszlb".to_string(),
                until: now() + Duration::minutes(90),
            }]
        );
    }

    #[test]
    fn reset_2fa_deletes_matching_objects_only() {
        let snapshot = Snapshot {
            offline_sessions: vec![
                OfflineSession {
                    name: "direct".to_string(),
                    user_id: "alice".to_string(),
                    ..Default::default()
                },
                OfflineSession {
                    name: "via-token".to_string(),
                    refresh_token_ids: vec!["rt-1".to_string()],
                    ..Default::default()
                },
                OfflineSession {
                    name: "other".to_string(),
                    user_id: "bob".to_string(),
                    ..Default::default()
                },
            ],
            refresh_tokens: vec![
                RefreshToken {
                    name: "rt-1".to_string(),
                    claims_preferred_username: "alice".to_string(),
                    ..Default::default()
                },
                RefreshToken {
                    name: "rt-2".to_string(),
                    claims_username: "bob".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let patches = execute(&spec("alice", UserOperationType::Reset2Fa), &snapshot, now()).unwrap();
        assert_eq!(
            patches,
            vec![
                DexPatch::DeleteOfflineSessions { name: "direct".to_string() },
                DexPatch::DeleteOfflineSessions { name: "via-token".to_string() },
                DexPatch::DeleteRefreshToken { name: "rt-1".to_string() },
            ]
        );

        let nothing = execute(&spec("carol", UserOperationType::Reset2Fa), &snapshot, now()).unwrap();
        assert!(nothing.is_empty());
    }

    #[test]
    fn finished_operations_expire_after_a_day() {
        let finished = |name: &str, age: Duration| {
            let mut op = operation(name, spec("alice", UserOperationType::Unlock));
            op.metadata.creation_timestamp = Some(Time(now() - age));
            op.status = Some(UserOperationStatus {
                phase: Some(UserOperationPhase::Succeeded),
                ..Default::default()
            });
            op
        };

        let plan = plan(
            &[
                finished("old", Duration::hours(25)),
                finished("fresh", Duration::hours(2)),
            ],
            &snapshot(),
            now(),
        );
        assert!(plan.executions.is_empty());
        assert_eq!(plan.expired, vec!["old".to_string()]);
    }

    #[test]
    fn schedule_parses() {
        let schedule = cron::Schedule::from_str(SCHEDULE).unwrap();
        let next = schedule.after(&now()).next().unwrap();
        assert_eq!(next, now() + Duration::minutes(5));
    }
}
