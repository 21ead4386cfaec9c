use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::conditions::{self, Condition, HasConditions};
use super::configurations::ConfigurationSpec;
use super::routes::ResolvedTrafficTarget;

pub static SERVICE_FINALIZER: &str = "services.serving.knative.dev";
pub static SERVICE_LABEL: &str = "serving.knative.dev/service";

pub const CONFIGURATIONS_READY: &str = "ConfigurationsReady";
pub const ROUTES_READY: &str = "RoutesReady";

/// Service owns a Configuration and a Route and keeps them in line with a single rollout mode.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    kind = "Service",
    group = "serving.knative.dev",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Domain", "type":"string", "jsonPath":".status.domain"}"#,
    printcolumn = r#"{"name":"LatestCreated", "type":"string", "jsonPath":".status.latestCreatedRevisionName"}"#,
    printcolumn = r#"{"name":"LatestReady", "type":"string", "jsonPath":".status.latestReadyRevisionName"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#
)]
#[kube(status = "ServiceStatus", shortname = "ksvc")]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Always route all traffic to the latest ready Revision of the Configuration.
    /// Exactly one of `runLatest`, `release` or `manual` must be specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_latest: Option<RunLatestType>,

    /// Route traffic to one or two pinned Revisions, splitting by `rolloutPercent`.
    /// Exactly one of `runLatest`, `release` or `manual` must be specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseType>,

    /// Leave the Configuration and Route alone so that they can be edited directly.
    /// Exactly one of `runLatest`, `release` or `manual` must be specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualType>,
}

// Custom JsonSchema implementation so that we can make one of runLatest, release, manual required.
impl JsonSchema for ServiceSpec {
    fn schema_name() -> String {
        "ServiceSpec".into()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> Schema {
        let run_latest = serde_json::to_value(RunLatestType::json_schema(gen)).unwrap();
        let release = serde_json::to_value(ReleaseType::json_schema(gen)).unwrap();
        let manual = serde_json::to_value(ManualType::json_schema(gen)).unwrap();

        serde_json::from_value(json!({
            "description": "The rollout mode of the Service. Exactly one of `runLatest`, `release` or `manual` must be specified",
            "properties": {
                "runLatest": run_latest,
                "release": release,
                "manual": manual,
            },
            "oneOf": [
                {"required": ["runLatest"]},
                {"required": ["release"]},
                {"required": ["manual"]}
            ],
            "type": "object"
        }))
        .unwrap()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RunLatestType {
    /// The Configuration to create and route to
    pub configuration: ConfigurationSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseType {
    /// One or two Revision names. The first is the current revision, the second the
    /// candidate that receives `rolloutPercent` of the traffic.
    #[schemars(length(min = 1, max = 2))]
    pub revisions: Vec<String>,

    /// The percentage of traffic sent to the second revision. Defaults to 0.
    #[serde(default)]
    #[schemars(range(min = 0, max = 100))]
    pub rollout_percent: i64,

    /// The Configuration to create
    pub configuration: ConfigurationSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManualType {}

/// The rollout mode selected by a ServiceSpec
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RolloutMode<'a> {
    RunLatest(&'a RunLatestType),
    Release(&'a ReleaseType),
    Manual,
}

impl ServiceSpec {
    pub fn mode(&self) -> Result<RolloutMode<'_>, crate::Error> {
        match (
            self.run_latest.as_ref(),
            self.release.as_ref(),
            self.manual.as_ref(),
        ) {
            (Some(run_latest), None, None) => Ok(RolloutMode::RunLatest(run_latest)),
            (None, Some(release), None) => {
                release.validate()?;
                Ok(RolloutMode::Release(release))
            }
            (None, None, Some(_)) => Ok(RolloutMode::Manual),
            _ => Err(crate::Error::invalid_spec(
                "InvalidRolloutMode",
                "Exactly one of `runLatest`, `release` or `manual` must be specified in spec",
            )),
        }
    }

    /// The Configuration spec to mirror, if the mode carries one
    pub fn configuration(&self) -> Option<&ConfigurationSpec> {
        match self.mode().ok()? {
            RolloutMode::RunLatest(run_latest) => Some(&run_latest.configuration),
            RolloutMode::Release(release) => Some(&release.configuration),
            RolloutMode::Manual => None,
        }
    }
}

impl ReleaseType {
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self.revisions.as_slice() {
            [] => {
                return Err(crate::Error::invalid_spec(
                    "InvalidRelease",
                    "release.revisions must name at least one revision",
                ))
            }
            [current, next] if current == next => {
                return Err(crate::Error::invalid_spec(
                    "InvalidRelease",
                    format!("release.revisions names {current} twice"),
                ))
            }
            [_] | [_, _] => {}
            _ => {
                return Err(crate::Error::invalid_spec(
                    "InvalidRelease",
                    format!(
                        "release.revisions must name at most two revisions, got {}",
                        self.revisions.len()
                    ),
                ))
            }
        }

        if let Some(empty) = self.revisions.iter().position(String::is_empty) {
            return Err(crate::Error::invalid_spec(
                "InvalidRelease",
                format!("release.revisions[{empty}] is empty"),
            ));
        }

        if !(0..=100).contains(&self.rollout_percent) {
            return Err(crate::Error::invalid_spec(
                "InvalidRelease",
                format!(
                    "release.rolloutPercent must be between 0 and 100, got {}",
                    self.rollout_percent
                ),
            ));
        }

        Ok(())
    }
}

/// Status of the Service
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// The externally resolvable domain of the Service's Route
    pub domain: Option<String>,

    /// The domain of the Service's Route inside the cluster
    pub domain_internal: Option<String>,

    /// URL of the Service's Route
    pub url: Option<String>,

    /// Copied from the owned Configuration
    pub latest_created_revision_name: Option<String>,

    /// Copied from the owned Configuration
    pub latest_ready_revision_name: Option<String>,

    /// Copied from the owned Route
    pub traffic: Option<Vec<ResolvedTrafficTarget>>,

    /// The generation observed by the controller
    pub observed_generation: Option<i64>,

    /// Represents the latest available observations of current state
    pub conditions: Option<Vec<Condition>>,
}

impl HasConditions for Service {
    fn conditions(&self) -> Option<&[Condition]> {
        self.status.as_ref().and_then(|s| s.conditions.as_deref())
    }
}

impl Service {
    pub fn is_ready(&self) -> bool {
        conditions::is_ready(self.conditions())
    }
}
