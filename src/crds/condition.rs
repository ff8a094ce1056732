/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/crds/condition.rs
* Shared status condition structure. This follows the usual Kubernetes
* pattern for detailed status reporting: a typed entry with a True/False
* status, machine reason, human message, and a transition timestamp that
* only moves when the status flips.
* SPDX-License-Identifier: Apache-2.0 */

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_GIT_POLLING: &str = "GitPolling";
/// Written by the downstream agent, read by the upstream projection.
pub const CONDITION_DEPLOYED: &str = "Deployed";
pub const CONDITION_MONITORED: &str = "Monitored";

/// Represents a single condition in the status of a resource.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Condition {
    /// The type of the condition (e.g. "Ready", "GitPolling").
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False", or "Unknown".
    pub status: String,

    /// Machine-readable reason for the last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// A human-readable message providing details about the condition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn new_true(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: None,
            message: None,
            last_transition_time: Some(Time(Utc::now())),
        }
    }

    pub fn new_false(type_: &str, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: "False".to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_transition_time: Some(Time(Utc::now())),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Insert or replace `cond` in `conditions`, keyed by type. The transition
/// timestamp is preserved when the status does not flip, so watchers see a
/// stable `lastTransitionTime`.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}

/// Remove a condition by type, if present.
pub fn clear_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_preserves_transition_time_when_status_unchanged() {
        let mut conds = Vec::new();
        set_condition(&mut conds, Condition::new_true(CONDITION_READY));
        let first = conds[0].last_transition_time.clone();

        let mut again = Condition::new_true(CONDITION_READY);
        again.message = Some("still fine".into());
        set_condition(&mut conds, again);

        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].last_transition_time, first);
        assert_eq!(conds[0].message.as_deref(), Some("still fine"));
    }

    #[test]
    fn set_replaces_on_status_flip() {
        let mut conds = vec![Condition::new_true(CONDITION_READY)];
        set_condition(
            &mut conds,
            Condition::new_false(CONDITION_READY, "TargetingError", "bad selector"),
        );
        assert_eq!(conds.len(), 1);
        assert!(!conds[0].is_true());
        assert_eq!(conds[0].reason.as_deref(), Some("TargetingError"));
    }
}
