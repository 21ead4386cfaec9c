use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Conditions shared by all serving resources
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Last time the condition transitioned from one status or reason to another
    pub last_transition_time: Option<Time>,

    /// Human-readable message indicating details about last transition
    pub message: Option<String>,

    /// Reason for the condition's last transition
    pub reason: Option<String>,

    /// Status is the status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Type of condition (Ready, ConfigurationsReady, RoutesReady, LatestCreatedReady)
    pub r#type: String,
}

impl Condition {
    pub fn new(
        r#type: &str,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            last_transition_time: None,
            message: Some(message.into()),
            reason: Some(reason.into()),
            status,
            r#type: r#type.into(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Resources whose status carries a list of conditions
pub trait HasConditions {
    fn conditions(&self) -> Option<&[Condition]>;
}

pub fn find<'a>(conditions: Option<&'a [Condition]>, r#type: &str) -> Option<&'a Condition> {
    conditions?.iter().find(|c| c.r#type == r#type)
}

pub fn is_ready(conditions: Option<&[Condition]>) -> bool {
    find(conditions, READY).is_some_and(Condition::is_true)
}

/// Insert or replace the condition of the same type.
///
/// The transition time of the previous condition is kept unless the status or the reason
/// changed, so that re-applying an identical condition leaves the list untouched.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    let existing = conditions.iter().position(|c| c.r#type == condition.r#type);

    condition.last_transition_time = match existing.map(|i| &conditions[i]) {
        Some(previous)
            if previous.status == condition.status && previous.reason == condition.reason =>
        {
            previous.last_transition_time.clone().or(Some(Time(now)))
        }
        _ => Some(Time(now)),
    };

    match existing {
        Some(i) => conditions[i] = condition,
        None => conditions.push(condition),
    }
}
