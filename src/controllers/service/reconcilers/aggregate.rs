use chrono::{DateTime, Utc};

use crate::resources::conditions::{self, Condition, ConditionStatus, HasConditions, READY};
use crate::resources::configurations::Configuration;
use crate::resources::routes::Route;
use crate::resources::services::{Service, ServiceStatus, CONFIGURATIONS_READY, ROUTES_READY};
use crate::Error;

/// Copy the Ready condition of a child into a condition of type `r#type` on the parent
fn child_condition(
    r#type: &str,
    kind: &str,
    child: Option<&impl HasConditions>,
) -> Condition {
    let Some(child) = child else {
        return Condition::new(
            r#type,
            ConditionStatus::Unknown,
            format!("{kind}Missing"),
            format!("The {kind} has not been created yet"),
        );
    };

    match conditions::find(child.conditions(), READY) {
        Some(ready) => Condition {
            r#type: r#type.into(),
            last_transition_time: None,
            ..ready.clone()
        },
        None => Condition::new(
            r#type,
            ConditionStatus::Unknown,
            format!("{kind}NotReady"),
            format!("The {kind} has not reported readiness yet"),
        ),
    }
}

/// Compute the next status of a service from its children.
///
/// `failure` is the terminal error that kept the children from being reconciled, if any. It
/// turns Ready False while the conditions mirrored from the children stay informative.
pub fn next_status(
    svc: &Service,
    config: Option<&Configuration>,
    route: Option<&Route>,
    failure: Option<&Error>,
    now: DateTime<Utc>,
) -> ServiceStatus {
    let mut status = svc.status.clone().unwrap_or_default();
    status.observed_generation = svc.metadata.generation;

    if let Some(config_status) = config.and_then(|c| c.status.as_ref()) {
        status.latest_created_revision_name = config_status.latest_created_revision_name.clone();
        status.latest_ready_revision_name = config_status.latest_ready_revision_name.clone();
    }

    if let Some(route_status) = route.and_then(|r| r.status.as_ref()) {
        status.domain = route_status.domain.clone();
        status.domain_internal = route_status.domain_internal.clone();
        status.url = route_status.url.clone();
        status.traffic = route_status.traffic.clone();
    }

    let configurations_ready = child_condition(CONFIGURATIONS_READY, "Configuration", config);
    let routes_ready = child_condition(ROUTES_READY, "Route", route);

    let ready = match failure {
        Some(Error::InvalidSpec { reason, message }) => Condition::new(
            READY,
            ConditionStatus::False,
            reason.as_str(),
            message.as_str(),
        ),
        Some(err) => Condition::new(
            READY,
            ConditionStatus::False,
            err.metric_label(),
            err.to_string(),
        ),
        None => match (configurations_ready.status, routes_ready.status) {
            (ConditionStatus::True, ConditionStatus::True) => Condition::new(
                READY,
                ConditionStatus::True,
                "Ready",
                "Configuration and Route are ready",
            ),
            (ConditionStatus::False, _) => Condition {
                r#type: READY.into(),
                ..configurations_ready.clone()
            },
            (_, ConditionStatus::False) => Condition {
                r#type: READY.into(),
                ..routes_ready.clone()
            },
            (ConditionStatus::Unknown, _) => Condition {
                r#type: READY.into(),
                ..configurations_ready.clone()
            },
            (_, ConditionStatus::Unknown) => Condition {
                r#type: READY.into(),
                ..routes_ready.clone()
            },
        },
    };

    let mut conditions = status.conditions.take().unwrap_or_default();
    conditions::set(&mut conditions, configurations_ready, now);
    conditions::set(&mut conditions, routes_ready, now);
    conditions::set(&mut conditions, ready, now);
    status.conditions = Some(conditions);

    status
}
