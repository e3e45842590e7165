//! Status conditions shared by the infrastructure CRDs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the backing server exists and is bound
pub const CONDITION_INSTANCE_PROVISIONED: &str = "InstanceProvisioned";

/// Condition type reporting whether the cluster network is claimed
pub const CONDITION_NETWORK_READY: &str = "NetworkReady";

/// A Kubernetes-style status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "InstanceProvisioned")
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,

    /// Human-readable detail
    #[serde(default)]
    pub message: String,

    /// When `status` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    Unknown,
}

impl Condition {
    /// Create a condition stamped with the current time.
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Insert or replace a condition by type.
///
/// `lastTransitionTime` is only moved when the status actually flips, so
/// re-asserting an unchanged condition does not produce a status diff.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type.
#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts_new_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(CONDITION_NETWORK_READY, ConditionStatus::True, "Claimed", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = vec![Condition {
            type_: CONDITION_INSTANCE_PROVISIONED.to_string(),
            status: ConditionStatus::False,
            reason: "Creating".to_string(),
            message: String::new(),
            last_transition_time: None,
        }];

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_INSTANCE_PROVISIONED, ConditionStatus::False, "Cloning", "clone in progress"),
        );
        assert_eq!(conditions[0].reason, "Cloning");
        assert!(conditions[0].last_transition_time.is_none());

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_INSTANCE_PROVISIONED, ConditionStatus::True, "Bound", ""),
        );
        assert!(conditions[0].last_transition_time.is_some());
        assert_eq!(find_condition(&conditions, CONDITION_INSTANCE_PROVISIONED).map(|c| c.status), Some(ConditionStatus::True));
    }
}
