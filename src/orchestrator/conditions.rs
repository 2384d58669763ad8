//! Condition management following Kubernetes API conventions

use std::fmt;

use chrono::Utc;

use crate::crd::Condition;

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Ready,
    Pki,
    Secrets,
    Users,
    NodeServices,
    InClusterProxy,
    BashibleTransitionStage,
    BashibleFinalStage,
    DeckhouseRegistrySwitch,
    Cleanup,
}

impl ConditionType {
    pub const ALL: [ConditionType; 10] = [
        ConditionType::Ready,
        ConditionType::Pki,
        ConditionType::Secrets,
        ConditionType::Users,
        ConditionType::NodeServices,
        ConditionType::InClusterProxy,
        ConditionType::BashibleTransitionStage,
        ConditionType::BashibleFinalStage,
        ConditionType::DeckhouseRegistrySwitch,
        ConditionType::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Pki => "PKI",
            ConditionType::Secrets => "Secrets",
            ConditionType::Users => "Users",
            ConditionType::NodeServices => "NodeServices",
            ConditionType::InClusterProxy => "InClusterProxy",
            ConditionType::BashibleTransitionStage => "BashibleTransitionStage",
            ConditionType::BashibleFinalStage => "BashibleFinalStage",
            ConditionType::DeckhouseRegistrySwitch => "DeckhouseRegistrySwitch",
            ConditionType::Cleanup => "Cleanup",
        }
    }

    pub fn is_supported(type_: &str) -> bool {
        Self::ALL.iter().any(|t| t.as_str() == type_)
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionReason {
    Ready,
    Processing,
    Error,
}

impl ConditionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionReason::Ready => "Ready",
            ConditionReason::Processing => "Processing",
            ConditionReason::Error => "Error",
        }
    }
}

/// Update or add a condition.
///
/// Nothing changes when status, reason, message and generation all match.
/// `last_transition_time` moves only when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: &str,
    reason: ConditionReason,
    message: &str,
    observed_generation: i64,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_.as_str()) {
        let unchanged = existing.status == status
            && existing.reason == reason.as_str()
            && existing.message == message
            && existing.observed_generation == Some(observed_generation);
        if unchanged {
            return;
        }

        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.as_str().to_string();
        existing.message = message.to_string();
        existing.observed_generation = Some(observed_generation);
    } else {
        conditions.push(Condition {
            type_: type_.as_str().to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.as_str().to_string(),
            message: message.to_string(),
            observed_generation: Some(observed_generation),
        });
    }
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Drop conditions whose type the orchestrator no longer manages
pub fn prune_unsupported(conditions: &mut Vec<Condition>) {
    conditions.retain(|c| ConditionType::is_supported(&c.type_));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            ConditionType::Pki,
            CONDITION_STATUS_TRUE,
            ConditionReason::Ready,
            "",
            4,
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "PKI");
        assert_eq!(conditions[0].observed_generation, Some(4));
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut conditions = vec![Condition {
            type_: "Users".to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "Processing".to_string(),
            message: "waiting".to_string(),
            observed_generation: Some(1),
        }];

        set_condition(
            &mut conditions,
            ConditionType::Users,
            CONDITION_STATUS_FALSE,
            ConditionReason::Processing,
            "still waiting",
            2,
        );
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "still waiting");
        assert_eq!(conditions[0].observed_generation, Some(2));

        set_condition(
            &mut conditions,
            ConditionType::Users,
            CONDITION_STATUS_TRUE,
            ConditionReason::Ready,
            "",
            2,
        );
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert!(is_condition_true(&conditions, ConditionType::Users));
    }

    #[test]
    fn prune_keeps_known_types() {
        let mut conditions = vec![
            Condition::new("Ready", "True", "Ready", "", Some(1)),
            Condition::new("RegistryContainsRequiredImages", "True", "Ready", "", Some(1)),
        ];
        prune_unsupported(&mut conditions);
        assert_eq!(conditions.len(), 1);
        assert!(find_condition(&conditions, ConditionType::Ready).is_some());
    }
}
