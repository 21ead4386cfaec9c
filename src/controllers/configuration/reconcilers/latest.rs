use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use super::revisions::generation_from_name;
use crate::resources::conditions::{self, Condition, ConditionStatus, HasConditions, READY};
use crate::resources::configurations::{Configuration, ConfigurationStatus, LATEST_CREATED_READY};
use crate::resources::revisions::Revision;
use crate::Error;

/// Pick the latest ready revision among the revisions a configuration owns.
///
/// The newest Ready revision wins, but only if it is at least as new as the one already
/// recorded. A late readiness signal from a superseded generation therefore never moves the
/// pointer backwards.
pub fn latest_ready(owned: &[Arc<Revision>], recorded: Option<&str>) -> Option<String> {
    let candidate = owned
        .iter()
        .filter(|rev| rev.is_ready())
        .filter_map(|rev| Some((rev.configuration_generation()?, rev)))
        .max_by_key(|(generation, _)| *generation);

    let recorded_generation = recorded.and_then(|name| {
        owned
            .iter()
            .find(|rev| rev.name_any() == name)
            .and_then(|rev| rev.configuration_generation())
            .or_else(|| generation_from_name(name))
    });

    match (candidate, recorded) {
        (Some((generation, rev)), _) if recorded_generation.is_none_or(|g| generation >= g) => {
            Some(rev.name_any())
        }
        (_, recorded) => recorded.map(str::to_owned),
    }
}

/// Compute the next status of a configuration.
///
/// `minted` is the revision for the current generation, or the terminal error that kept it
/// from being minted.
pub fn next_status(
    config: &Configuration,
    minted: Result<&Revision, &Error>,
    owned: &[Arc<Revision>],
    now: DateTime<Utc>,
) -> ConfigurationStatus {
    let mut status = config.status.clone().unwrap_or_default();
    status.observed_generation = config.metadata.generation;

    if let Ok(rev) = minted {
        status.latest_created_revision_name = Some(rev.name_any());
    }
    status.latest_ready_revision_name =
        latest_ready(owned, status.latest_ready_revision_name.as_deref());

    let latest_created_ready = match minted {
        Ok(rev) if rev.is_ready() => Condition::new(
            LATEST_CREATED_READY,
            ConditionStatus::True,
            "Ready",
            format!("Revision {} is ready", rev.name_any()),
        ),
        Ok(rev) if rev.is_failed() => {
            let ready = conditions::find(rev.conditions(), READY);
            Condition::new(
                LATEST_CREATED_READY,
                ConditionStatus::False,
                ready
                    .and_then(|c| c.reason.clone())
                    .unwrap_or_else(|| "RevisionFailed".into()),
                format!(
                    "Revision {} failed: {}",
                    rev.name_any(),
                    ready.and_then(|c| c.message.as_deref()).unwrap_or_default()
                ),
            )
        }
        Ok(rev) => Condition::new(
            LATEST_CREATED_READY,
            ConditionStatus::Unknown,
            "RevisionNotReady",
            format!("Waiting for Revision {} to become ready", rev.name_any()),
        ),
        Err(Error::InvalidSpec { reason, message }) => Condition::new(
            LATEST_CREATED_READY,
            ConditionStatus::False,
            reason.as_str(),
            message.as_str(),
        ),
        Err(err) => Condition::new(
            LATEST_CREATED_READY,
            ConditionStatus::False,
            err.metric_label(),
            err.to_string(),
        ),
    };

    let ready = match (&status.latest_ready_revision_name, &latest_created_ready) {
        (Some(latest_ready), _) => Condition::new(
            READY,
            ConditionStatus::True,
            "Ready",
            format!("Latest ready Revision is {latest_ready}"),
        ),
        (None, created) if created.status == ConditionStatus::False => Condition {
            r#type: READY.into(),
            ..created.clone()
        },
        (None, _) => Condition::new(
            READY,
            ConditionStatus::Unknown,
            "NoReadyRevision",
            "No Revision of this Configuration is ready yet",
        ),
    };

    let mut conditions = status.conditions.take().unwrap_or_default();
    conditions::set(&mut conditions, ready, now);
    conditions::set(&mut conditions, latest_created_ready, now);
    status.conditions = Some(conditions);

    status
}
