//! Fixtures shared by the orchestrator tests

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use super::node_services::{MasterNode, NodeServicesConfig, StaticPodClient};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create { ip: String, version: String },
    Delete { ip: String },
}

/// Records every agent call; IPs in `failing` return an error
#[derive(Default)]
pub struct MockStaticPodClient {
    pub calls: Mutex<Vec<Call>>,
    pub failing: BTreeSet<String>,
}

impl MockStaticPodClient {
    pub fn failing_on(ip: &str) -> Self {
        Self {
            failing: BTreeSet::from([ip.to_string()]),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created_ips(&self) -> BTreeSet<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create { ip, .. } => Some(ip),
                Call::Delete { .. } => None,
            })
            .collect()
    }

    pub fn deleted_ips(&self) -> BTreeSet<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete { ip } => Some(ip),
                Call::Create { .. } => None,
            })
            .collect()
    }

    /// Version sent in the last create call to `ip`
    pub fn created_version(&self, ip: &str) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Create { ip: i, version } if i == ip => Some(version),
            _ => None,
        })
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn check(&self, ip: &str) -> Result<()> {
        if self.failing.contains(ip) {
            return Err(Error::ConfigError(format!("agent {ip} unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl StaticPodClient for MockStaticPodClient {
    async fn create(&self, pod_ip: &str, config: &NodeServicesConfig) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Create {
            ip: pod_ip.to_string(),
            version: config.version.clone(),
        });
        self.check(pod_ip)
    }

    async fn delete(&self, pod_ip: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Delete {
            ip: pod_ip.to_string(),
        });
        self.check(pod_ip)
    }
}

/// A master whose agent pod shares the node IP
pub fn master(name: &str, ip: &str, created_at_secs: i64) -> MasterNode {
    MasterNode {
        name: name.to_string(),
        internal_ip: ip.to_string(),
        created_at: Utc.timestamp_opt(created_at_secs, 0).single(),
        agent_pod_ip: Some(ip.to_string()),
        ..Default::default()
    }
}
