use k8s_openapi::api::core::v1::{Container, Volume};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::{self, Condition, HasConditions};

pub static CONFIGURATION_LABEL: &str = "serving.knative.dev/configuration";
pub static CONFIGURATION_GENERATION_LABEL: &str = "serving.knative.dev/configurationGeneration";
pub static REVISION_LABEL: &str = "serving.knative.dev/revision";
pub static TEMPLATE_HASH_ANNOTATION: &str = "serving.knative.dev/templateHash";

/// Revision is an immutable snapshot of code and configuration, minted by a Configuration
/// for each of its generations.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Revision",
    group = "serving.knative.dev",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Config Name", "type":"string", "jsonPath":".metadata.labels['serving\\.knative\\.dev/configuration']"}"#,
    printcolumn = r#"{"name":"Generation", "type":"string", "jsonPath":".metadata.labels['serving\\.knative\\.dev/configurationGeneration']"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#
)]
#[kube(status = "RevisionStatus", shortname = "rev")]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    /// The container to run. Only an allow-listed subset of the container fields is kept.
    pub container: Container,

    /// Volumes that the container may mount. Only secret and config map sources are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,

    /// The maximum number of concurrent requests per container instance. 0 means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0, max = 1000))]
    pub container_concurrency: Option<i64>,

    /// The maximum duration in seconds that a request will be allowed to take.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub timeout_seconds: Option<i64>,

    /// The service account the revision's pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Lifecycle phase of a Revision
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum RevisionPhase {
    #[default]
    Pending,
    Building,
    Ready,
    Failed,
}

/// Status of the Revision
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    /// Where the revision is in its lifecycle
    pub phase: Option<RevisionPhase>,

    /// The name of the ReplicaSet deploying this revision
    pub deployment_name: Option<String>,

    /// The generation observed by the controller
    pub observed_generation: Option<i64>,

    /// Represents the latest available observations of current state
    pub conditions: Option<Vec<Condition>>,
}

impl HasConditions for Revision {
    fn conditions(&self) -> Option<&[Condition]> {
        self.status.as_ref().and_then(|s| s.conditions.as_deref())
    }
}

impl Revision {
    /// The Configuration generation this revision was minted for
    pub fn configuration_generation(&self) -> Option<i64> {
        self.labels()
            .get(CONFIGURATION_GENERATION_LABEL)
            .and_then(|g| g.parse().ok())
    }

    pub fn configuration_name(&self) -> Option<&str> {
        self.labels().get(CONFIGURATION_LABEL).map(String::as_str)
    }

    pub fn phase(&self) -> RevisionPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == RevisionPhase::Ready
            && conditions::is_ready(self.conditions())
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == RevisionPhase::Failed
    }
}
