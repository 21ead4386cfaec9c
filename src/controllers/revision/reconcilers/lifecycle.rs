use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetStatus};

use crate::controllers::reconciler::RETRY_BUDGET_EXCEEDED;
use crate::resources::conditions::{self, Condition, ConditionStatus, HasConditions, READY};
use crate::resources::revisions::{Revision, RevisionPhase, RevisionStatus};

pub const REASON_PENDING: &str = "Pending";
pub const REASON_DEPLOYING: &str = "Deploying";
pub const REASON_READY: &str = "Ready";
pub const REASON_PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// What the ReplicaSet of a revision currently reports
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentObservation {
    Missing,
    Progressing { ready: i32, desired: i32 },
    Available,
    Failed { reason: String, message: String },
}

impl DeploymentObservation {
    pub fn observe(replicaset: Option<&ReplicaSet>) -> Self {
        let Some(replicaset) = replicaset else {
            return Self::Missing;
        };

        let desired = replicaset
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);

        let Some(status) = replicaset.status.as_ref() else {
            return Self::Progressing { ready: 0, desired };
        };

        if let Some(failure) = status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "ReplicaFailure" && c.status == "True")
        {
            return Self::Failed {
                reason: failure
                    .reason
                    .clone()
                    .unwrap_or_else(|| "ReplicaFailure".into()),
                message: failure.message.clone().unwrap_or_default(),
            };
        }

        let ReplicaSetStatus {
            replicas,
            ready_replicas,
            available_replicas,
            ..
        } = status;

        let ready = ready_replicas.unwrap_or(0);
        if *replicas == desired && ready >= desired && available_replicas.unwrap_or(0) >= desired {
            Self::Available
        } else {
            Self::Progressing { ready, desired }
        }
    }
}

/// Result of planning a revision's next status
#[derive(Clone, Debug, PartialEq)]
pub struct LifecyclePlan {
    pub status: RevisionStatus,
    /// When the revision should be looked at again regardless of watch events
    pub requeue_after: Option<Duration>,
}

/// Derive the next status of `rev` from what its ReplicaSet reports.
///
/// Ready is sticky, and a ReplicaSet failure is terminal. Running out of the progress
/// deadline fails the revision too, but a later successful rollout still makes it Ready.
pub fn next_status(
    rev: &Revision,
    deployment_name: &str,
    observation: &DeploymentObservation,
    progress_deadline: Duration,
    now: DateTime<Utc>,
) -> LifecyclePlan {
    let mut status = rev.status.clone().unwrap_or_default();
    status.observed_generation = rev.metadata.generation;
    status.deployment_name = Some(deployment_name.to_owned());

    let mut conditions = status.conditions.take().unwrap_or_default();
    let ready = conditions::find(rev.conditions(), READY);

    let mut requeue_after = None;

    let (phase, condition) = match (rev.phase(), observation) {
        (RevisionPhase::Ready, _) if ready.is_some_and(Condition::is_true) => {
            (RevisionPhase::Ready, ready.cloned())
        }
        // running out of retries says nothing about the deployment, readiness stays
        (RevisionPhase::Ready, _) if is_retry_budget_marker(ready) => (
            RevisionPhase::Ready,
            Some(Condition::new(
                READY,
                ConditionStatus::True,
                REASON_READY,
                format!("ReplicaSet {deployment_name} is available"),
            )),
        ),
        (RevisionPhase::Failed, _) if is_terminal_failure(ready) => {
            (RevisionPhase::Failed, ready.cloned())
        }
        (_, DeploymentObservation::Available) => (
            RevisionPhase::Ready,
            Some(Condition::new(
                READY,
                ConditionStatus::True,
                REASON_READY,
                format!("ReplicaSet {deployment_name} is available"),
            )),
        ),
        (_, DeploymentObservation::Failed { reason, message }) => (
            RevisionPhase::Failed,
            Some(Condition::new(
                READY,
                ConditionStatus::False,
                reason.as_str(),
                message.as_str(),
            )),
        ),
        (_, DeploymentObservation::Missing) => (
            RevisionPhase::Pending,
            Some(Condition::new(
                READY,
                ConditionStatus::Unknown,
                REASON_PENDING,
                format!("Waiting for ReplicaSet {deployment_name} to be created"),
            )),
        ),
        (RevisionPhase::Failed, DeploymentObservation::Progressing { .. }) => {
            // out of deadline; stays failed until the ReplicaSet becomes available
            (RevisionPhase::Failed, ready.cloned())
        }
        (_, DeploymentObservation::Progressing { ready: n, desired }) => {
            let started = ready
                .filter(|c| c.reason.as_deref() == Some(REASON_DEPLOYING))
                .and_then(|c| c.last_transition_time.as_ref())
                .map_or(now, |t| t.0);
            let elapsed = (now - started).to_std().unwrap_or_default();

            if elapsed >= progress_deadline {
                (
                    RevisionPhase::Failed,
                    Some(Condition::new(
                        READY,
                        ConditionStatus::False,
                        REASON_PROGRESS_DEADLINE_EXCEEDED,
                        format!(
                            "ReplicaSet {deployment_name} did not become available within {}s",
                            progress_deadline.as_secs()
                        ),
                    )),
                )
            } else {
                requeue_after = Some(progress_deadline - elapsed);
                (
                    RevisionPhase::Building,
                    Some(Condition::new(
                        READY,
                        ConditionStatus::Unknown,
                        REASON_DEPLOYING,
                        format!("{n}/{desired} replicas of ReplicaSet {deployment_name} are ready"),
                    )),
                )
            }
        }
    };

    if let Some(condition) = condition {
        conditions::set(&mut conditions, condition, now);
    }

    status.phase = Some(phase);
    status.conditions = Some(conditions);

    LifecyclePlan {
        status,
        requeue_after,
    }
}

fn is_retry_budget_marker(ready: Option<&Condition>) -> bool {
    ready.is_some_and(|c| c.reason.as_deref() == Some(RETRY_BUDGET_EXCEEDED))
}

// Only running out of the progress deadline can still be recovered from
fn is_terminal_failure(ready: Option<&Condition>) -> bool {
    ready.is_some_and(|c| {
        c.status == ConditionStatus::False
            && c.reason.as_deref() != Some(REASON_PROGRESS_DEADLINE_EXCEEDED)
            && !is_retry_budget_marker(Some(c))
    })
}
