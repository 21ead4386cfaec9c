use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::{self, Condition, HasConditions};
use super::revisions::RevisionSpec;

/// Configuration keeps the latest desired spec for a workload and mints a Revision
/// every time that spec changes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Configuration",
    group = "serving.knative.dev",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"LatestCreated", "type":"string", "jsonPath":".status.latestCreatedRevisionName"}"#,
    printcolumn = r#"{"name":"LatestReady", "type":"string", "jsonPath":".status.latestReadyRevisionName"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#
)]
#[kube(status = "ConfigurationStatus", shortname = "config")]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    /// Template for the Revisions minted from this Configuration
    pub revision_template: RevisionTemplateSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RevisionTemplateSpec {
    /// Labels and annotations copied onto every Revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RevisionTemplateMetadata>,

    /// The spec of the Revisions
    pub spec: RevisionSpec,
}

/// RevisionTemplateMetadata is the subset of ObjectMeta that is propagated to Revisions
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RevisionTemplateMetadata {
    /// Annotations propagated to each Revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Labels propagated to each Revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Status of the Configuration
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStatus {
    /// The Revision minted for the most recent generation
    pub latest_created_revision_name: Option<String>,

    /// The newest Revision of this Configuration that has become Ready
    pub latest_ready_revision_name: Option<String>,

    /// The generation observed by the controller
    pub observed_generation: Option<i64>,

    /// Represents the latest available observations of current state
    pub conditions: Option<Vec<Condition>>,
}

pub const LATEST_CREATED_READY: &str = "LatestCreatedReady";

impl HasConditions for Configuration {
    fn conditions(&self) -> Option<&[Condition]> {
        self.status.as_ref().and_then(|s| s.conditions.as_deref())
    }
}

impl Configuration {
    pub fn latest_created_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.latest_created_revision_name.as_deref())
    }

    pub fn latest_ready_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.latest_ready_revision_name.as_deref())
    }

    pub fn is_ready(&self) -> bool {
        conditions::is_ready(self.conditions())
    }
}
