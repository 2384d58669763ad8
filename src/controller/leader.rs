//! Lease based leader election
//!
//! Only the holder of the lease reconciles, which makes the in-process
//! reconcile mutex hold across replicas as well.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{info, warn};

pub const LEASE_NAME: &str = "registry-orchestrator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Pod name when running in a cluster, the host name otherwise
pub fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

#[derive(Debug, PartialEq, Eq)]
enum LeaseAction {
    Renew,
    TakeOver,
    Wait,
}

fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration.into())
        })
        .unwrap_or(true);

    if expired {
        LeaseAction::TakeOver
    } else {
        LeaseAction::Wait
    }
}

pub async fn run_leader_election(
    client: Client,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, &namespace);

    loop {
        match try_acquire_or_renew(&leases, &namespace, &identity).await {
            Ok(true) => {
                if !is_leader.swap(true, Ordering::Relaxed) {
                    info!(lease = LEASE_NAME, identity = %identity, "Acquired leadership");
                }
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if is_leader.swap(false, Ordering::Relaxed) {
                    warn!(lease = LEASE_NAME, "Lost leadership");
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {e}");
                is_leader.store(false, Ordering::Relaxed);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let Some(existing) = leases.get_opt(LEASE_NAME).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        leases.create(&PostParams::default(), &lease).await?;
        info!(lease = LEASE_NAME, identity, "Created lease");
        return Ok(true);
    };

    let patch = match decide(existing.spec.as_ref(), identity, now) {
        LeaseAction::Wait => return Ok(false),
        LeaseAction::Renew => serde_json::json!({
            "spec": {
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        }),
        LeaseAction::TakeOver => {
            info!(
                previous = ?existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref()),
                "Lease expired, taking over"
            );
            serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            })
        }
    };
    leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(holder: &str, renewed_secs_ago: i64, now: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            renew_time: Some(MicroTime(now - chrono::Duration::seconds(renewed_secs_ago))),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            ..Default::default()
        }
    }

    #[test]
    fn holder_renews() {
        let now = Utc::now();
        assert_eq!(decide(Some(&spec("me", 100, now)), "me", now), LeaseAction::Renew);
    }

    #[test]
    fn live_lease_of_another_holder_is_respected() {
        let now = Utc::now();
        assert_eq!(decide(Some(&spec("other", 5, now)), "me", now), LeaseAction::Wait);
    }

    #[test]
    fn expired_or_empty_lease_is_taken_over() {
        let now = Utc::now();
        assert_eq!(decide(Some(&spec("other", 30, now)), "me", now), LeaseAction::TakeOver);
        assert_eq!(decide(None, "me", now), LeaseAction::TakeOver);
    }
}
