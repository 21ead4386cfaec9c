use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use regex::Regex;

use super::domain::RouteDomains;
use crate::resources::conditions::{self, Condition, ConditionStatus, READY};
use crate::resources::configurations::Configuration;
use crate::resources::revisions::Revision;
use crate::resources::routes::{ResolvedTrafficTarget, Route, RouteStatus, TrafficTarget};
use crate::{Error, Result};

/// Whether `name` is a valid DNS-1123 label
pub fn is_dns_label(name: &str) -> bool {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    name.len() <= 63
        && REGEX
            .get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap())
            .is_match(name)
}

/// Reject traffic specs that cannot be routed as written.
///
/// When any target is named, the named targets carry all of the traffic and must sum to 100,
/// with unnamed targets at 0. Without named targets the unnamed ones must sum to 100.
pub fn validate(traffic: &[TrafficTarget]) -> Result<()> {
    if traffic.is_empty() {
        return Err(Error::invalid_spec(
            "EmptyTraffic",
            "spec.traffic must contain at least one target",
        ));
    }

    let mut names = HashSet::new();

    for (i, target) in traffic.iter().enumerate() {
        let revision = target.revision_name.as_deref().filter(|n| !n.is_empty());
        let configuration = target
            .configuration_name
            .as_deref()
            .filter(|n| !n.is_empty());

        if revision.is_some() == configuration.is_some() {
            return Err(Error::invalid_spec(
                "InvalidTrafficTarget",
                format!(
                    "spec.traffic[{i}] must set exactly one of revisionName or configurationName"
                ),
            ));
        }

        if !(0..=100).contains(&target.percent) {
            return Err(Error::invalid_spec(
                "InvalidPercent",
                format!(
                    "spec.traffic[{i}].percent must be between 0 and 100, got {}",
                    target.percent
                ),
            ));
        }

        if let Some(name) = target.name.as_deref().filter(|n| !n.is_empty()) {
            if !is_dns_label(name) {
                return Err(Error::invalid_spec(
                    "InvalidTargetName",
                    format!("spec.traffic[{i}].name {name:?} is not a valid DNS-1123 label"),
                ));
            }
            if !names.insert(name) {
                return Err(Error::invalid_spec(
                    "DuplicateTargetName",
                    format!("spec.traffic[{i}].name {name:?} is used more than once"),
                ));
            }
        }
    }

    let (named, unnamed): (Vec<_>, Vec<_>) = traffic.iter().partition(|t| t.is_named());

    if named.is_empty() {
        let sum: i64 = unnamed.iter().map(|t| t.percent).sum();
        if sum != 100 {
            return Err(Error::invalid_spec(
                "InvalidPercentSum",
                format!("traffic percentages sum to {sum} instead of 100"),
            ));
        }
    } else {
        let sum: i64 = named.iter().map(|t| t.percent).sum();
        if sum != 100 {
            return Err(Error::invalid_spec(
                "InvalidPercentSum",
                format!("named traffic percentages sum to {sum} instead of 100"),
            ));
        }
        if unnamed.iter().any(|t| t.percent != 0) {
            return Err(Error::invalid_spec(
                "InvalidPercentSum",
                "unnamed traffic targets must carry 0 percent when named targets exist",
            ));
        }
    }

    Ok(())
}

/// Read access to the objects traffic targets point at
pub trait TargetLookup {
    fn revision(&self, name: &str) -> Option<Arc<Revision>>;
    fn configuration(&self, name: &str) -> Option<Arc<Configuration>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Every target points at a ready revision
    Resolved(Vec<ResolvedTrafficTarget>),
    /// Some target is waiting on a dependency to become ready
    Pending { reason: String, message: String },
    /// Some target points at a revision that does not exist or failed
    Failed { reason: String, message: String },
}

/// Resolve every target to a concrete revision. Failures take precedence over pending targets.
pub fn resolve(
    traffic: &[TrafficTarget],
    lookup: &impl TargetLookup,
    domains: &RouteDomains,
) -> Resolution {
    let mut resolved = Vec::with_capacity(traffic.len());
    let mut pending = None;

    for target in traffic {
        let revision = target.revision_name.as_deref().filter(|n| !n.is_empty());
        let configuration = target
            .configuration_name
            .as_deref()
            .filter(|n| !n.is_empty());

        let revision_name = match (revision, configuration) {
            (Some(revision_name), _) => match lookup.revision(revision_name) {
                None => {
                    return Resolution::Failed {
                        reason: "RevisionMissing".into(),
                        message: format!("Revision {revision_name} does not exist"),
                    }
                }
                Some(rev) if rev.is_failed() => {
                    return Resolution::Failed {
                        reason: "RevisionFailed".into(),
                        message: format!("Revision {revision_name} failed"),
                    }
                }
                Some(rev) if !rev.is_ready() => {
                    pending.get_or_insert_with(|| {
                        (
                            "RevisionNotReady".to_owned(),
                            format!("Revision {revision_name} is not ready yet"),
                        )
                    });
                    continue;
                }
                Some(rev) => rev.name_any(),
            },
            (None, Some(configuration_name)) => {
                match lookup
                    .configuration(configuration_name)
                    .as_deref()
                    .map(Configuration::latest_ready_revision_name)
                {
                    Some(Some(latest_ready)) => latest_ready.to_owned(),
                    Some(None) => {
                        pending.get_or_insert_with(|| {
                            (
                                "ConfigurationNotReady".to_owned(),
                                format!("Configuration {configuration_name} has no ready Revision yet"),
                            )
                        });
                        continue;
                    }
                    None => {
                        pending.get_or_insert_with(|| {
                            (
                                "ConfigurationMissing".to_owned(),
                                format!("Configuration {configuration_name} does not exist"),
                            )
                        });
                        continue;
                    }
                }
            }
            (None, None) => continue,
        };

        let name = target.name.clone().filter(|n| !n.is_empty());
        resolved.push(ResolvedTrafficTarget {
            domain: name.as_deref().map(|n| domains.target_domain(n)),
            name,
            revision_name,
            configuration_name: configuration.map(str::to_owned),
            percent: target.percent,
        });
    }

    match pending {
        Some((reason, message)) => Resolution::Pending { reason, message },
        None => Resolution::Resolved(resolved),
    }
}

/// Compute the next status of a route from the outcome of validating and resolving its traffic.
///
/// The published traffic only changes when resolution succeeded, so a route that cannot be
/// resolved keeps serving its previous mapping.
pub fn next_status(
    route: &Route,
    outcome: Result<&Resolution, &Error>,
    domains: &RouteDomains,
    now: DateTime<Utc>,
) -> RouteStatus {
    let mut status = route.status.clone().unwrap_or_default();
    status.observed_generation = route.metadata.generation;
    status.domain = Some(domains.domain.clone());
    status.domain_internal = Some(domains.domain_internal.clone());
    status.url = Some(domains.url.to_string());

    let ready = match outcome {
        Ok(Resolution::Resolved(targets)) => {
            status.traffic = Some(targets.clone());
            Condition::new(
                READY,
                ConditionStatus::True,
                "Ready",
                "All traffic targets are resolved",
            )
        }
        Ok(Resolution::Pending { reason, message }) => Condition::new(
            READY,
            ConditionStatus::Unknown,
            reason.as_str(),
            message.as_str(),
        ),
        Ok(Resolution::Failed { reason, message })
        | Err(Error::InvalidSpec { reason, message }) => Condition::new(
            READY,
            ConditionStatus::False,
            reason.as_str(),
            message.as_str(),
        ),
        Err(err) => Condition::new(
            READY,
            ConditionStatus::False,
            err.metric_label(),
            err.to_string(),
        ),
    };

    let mut conditions = status.conditions.take().unwrap_or_default();
    conditions::set(&mut conditions, ready, now);
    status.conditions = Some(conditions);

    status
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::resources::configurations::ConfigurationStatus;
    use crate::resources::revisions::{RevisionPhase, RevisionStatus};

    #[derive(Default)]
    struct Lookup {
        revisions: HashMap<String, Arc<Revision>>,
        configurations: HashMap<String, Arc<Configuration>>,
    }

    impl Lookup {
        fn with_revision(mut self, name: &str, phase: RevisionPhase) -> Self {
            let mut rev = Revision::new(name, Default::default());
            let ready = match phase {
                RevisionPhase::Ready => ConditionStatus::True,
                RevisionPhase::Failed => ConditionStatus::False,
                _ => ConditionStatus::Unknown,
            };
            rev.status = Some(RevisionStatus {
                phase: Some(phase),
                conditions: Some(vec![Condition::new(READY, ready, "Test", "")]),
                ..Default::default()
            });
            self.revisions.insert(name.into(), Arc::new(rev));
            self
        }

        fn with_configuration(mut self, name: &str, latest_ready: Option<&str>) -> Self {
            let mut config = Configuration::new(name, Default::default());
            config.status = Some(ConfigurationStatus {
                latest_ready_revision_name: latest_ready.map(str::to_owned),
                ..Default::default()
            });
            self.configurations.insert(name.into(), Arc::new(config));
            self
        }
    }

    impl TargetLookup for Lookup {
        fn revision(&self, name: &str) -> Option<Arc<Revision>> {
            self.revisions.get(name).cloned()
        }

        fn configuration(&self, name: &str) -> Option<Arc<Configuration>> {
            self.configurations.get(name).cloned()
        }
    }

    fn domains() -> RouteDomains {
        RouteDomains::new("hello", "serving", "example.com").unwrap()
    }

    fn unnamed_revision(revision_name: &str, percent: i64) -> TrafficTarget {
        TrafficTarget {
            revision_name: Some(revision_name.into()),
            percent,
            ..Default::default()
        }
    }

    fn reason(result: Result<()>) -> String {
        match result {
            Err(Error::InvalidSpec { reason, .. }) => reason,
            other => panic!("expected an invalid spec, got {other:?}"),
        }
    }

    #[test]
    fn accepts_named_split() {
        assert!(validate(&[
            TrafficTarget::named_revision("current", "hello-00001", 58),
            TrafficTarget::named_revision("next", "hello-00002", 42),
            TrafficTarget::named_revision("hello-00001", "hello-00001", 0),
            TrafficTarget::named_configuration("latest", "hello", 0),
        ])
        .is_ok());
    }

    #[test]
    fn accepts_unnamed_split() {
        assert!(validate(&[
            unnamed_revision("hello-00001", 90),
            unnamed_revision("hello-00002", 10),
        ])
        .is_ok());
    }

    #[test]
    fn rejects_invalid_traffic() {
        assert_eq!(reason(validate(&[])), "EmptyTraffic");

        assert_eq!(
            reason(validate(&[TrafficTarget {
                name: Some("both".into()),
                revision_name: Some("hello-00001".into()),
                configuration_name: Some("hello".into()),
                percent: 100,
            }])),
            "InvalidTrafficTarget"
        );

        assert_eq!(
            reason(validate(&[TrafficTarget::named_revision(
                "current",
                "hello-00001",
                101
            )])),
            "InvalidPercent"
        );

        assert_eq!(
            reason(validate(&[TrafficTarget::named_revision(
                "Not_A_Label",
                "hello-00001",
                100
            )])),
            "InvalidTargetName"
        );

        assert_eq!(
            reason(validate(&[
                TrafficTarget::named_revision("current", "hello-00001", 50),
                TrafficTarget::named_revision("current", "hello-00002", 50),
            ])),
            "DuplicateTargetName"
        );

        assert_eq!(
            reason(validate(&[
                TrafficTarget::named_revision("current", "hello-00001", 50),
                TrafficTarget::named_revision("next", "hello-00002", 40),
            ])),
            "InvalidPercentSum"
        );

        assert_eq!(
            reason(validate(&[
                TrafficTarget::named_revision("current", "hello-00001", 100),
                unnamed_revision("hello-00002", 10),
            ])),
            "InvalidPercentSum"
        );

        assert_eq!(
            reason(validate(&[unnamed_revision("hello-00001", 99)])),
            "InvalidPercentSum"
        );
    }

    #[test]
    fn resolves_configuration_to_latest_ready() {
        let lookup = Lookup::default().with_configuration("hello", Some("hello-00001"));

        let resolution = resolve(
            &[TrafficTarget::named_configuration("latest", "hello", 100)],
            &lookup,
            &domains(),
        );

        assert_eq!(
            resolution,
            Resolution::Resolved(vec![ResolvedTrafficTarget {
                name: Some("latest".into()),
                revision_name: "hello-00001".into(),
                configuration_name: Some("hello".into()),
                percent: 100,
                domain: Some("latest.hello.serving.example.com".into()),
            }])
        );
    }

    #[test]
    fn empty_revision_name_falls_back_to_configuration() {
        let lookup = Lookup::default().with_configuration("hello", Some("hello-00001"));
        let traffic = [TrafficTarget {
            revision_name: Some(String::new()),
            ..TrafficTarget::named_configuration("latest", "hello", 100)
        }];

        assert!(validate(&traffic).is_ok());
        assert!(matches!(
            resolve(&traffic, &lookup, &domains()),
            Resolution::Resolved(targets) if targets.len() == 1
                && targets[0].revision_name == "hello-00001"
                && targets[0].configuration_name.as_deref() == Some("hello")
        ));
    }

    #[test]
    fn waits_for_dependencies() {
        let lookup = Lookup::default()
            .with_configuration("hello", None)
            .with_revision("hello-00001", RevisionPhase::Building);

        assert!(matches!(
            resolve(
                &[TrafficTarget::named_configuration("latest", "hello", 100)],
                &lookup,
                &domains()
            ),
            Resolution::Pending { reason, .. } if reason == "ConfigurationNotReady"
        ));
        assert!(matches!(
            resolve(
                &[TrafficTarget::named_configuration("latest", "other", 100)],
                &lookup,
                &domains()
            ),
            Resolution::Pending { reason, .. } if reason == "ConfigurationMissing"
        ));
        assert!(matches!(
            resolve(&[unnamed_revision("hello-00001", 100)], &lookup, &domains()),
            Resolution::Pending { reason, .. } if reason == "RevisionNotReady"
        ));
    }

    #[test]
    fn missing_or_failed_revisions_fail() {
        let lookup = Lookup::default()
            .with_configuration("hello", None)
            .with_revision("hello-00002", RevisionPhase::Failed);

        // failure wins over a pending target listed first
        assert!(matches!(
            resolve(
                &[
                    TrafficTarget::named_configuration("latest", "hello", 50),
                    TrafficTarget::named_revision("next", "hello-00002", 50),
                ],
                &lookup,
                &domains()
            ),
            Resolution::Failed { reason, .. } if reason == "RevisionFailed"
        ));
        assert!(matches!(
            resolve(&[unnamed_revision("gone", 100)], &lookup, &domains()),
            Resolution::Failed { reason, .. } if reason == "RevisionMissing"
        ));
    }

    #[test]
    fn unresolvable_routes_keep_their_traffic() {
        let now = Utc::now();
        let domains = domains();
        let mut route = Route::new("hello", Default::default());

        let served = Resolution::Resolved(vec![ResolvedTrafficTarget {
            name: Some("latest".into()),
            revision_name: "hello-00001".into(),
            configuration_name: Some("hello".into()),
            percent: 100,
            domain: Some(domains.target_domain("latest")),
        }]);
        route.status = Some(next_status(&route, Ok(&served), &domains, now));
        assert!(route.is_ready());

        let pending = Resolution::Pending {
            reason: "ConfigurationNotReady".into(),
            message: String::new(),
        };
        let status = next_status(&route, Ok(&pending), &domains, now);
        assert_eq!(
            status.traffic,
            route.status.as_ref().and_then(|s| s.traffic.clone())
        );
        assert!(!conditions::is_ready(status.conditions.as_deref()));

        let invalid = Error::invalid_spec("InvalidPercentSum", "sum is 90");
        let status = next_status(&route, Err(&invalid), &domains, now);
        assert_eq!(
            status.traffic,
            route.status.as_ref().and_then(|s| s.traffic.clone())
        );
        let ready = conditions::find(status.conditions.as_deref(), READY).cloned();
        assert_eq!(ready.map(|c| c.status), Some(ConditionStatus::False));
    }
}
