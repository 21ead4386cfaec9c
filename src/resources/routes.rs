use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::{self, Condition, HasConditions};

/// Route maps named traffic targets onto Revisions, either directly or through the latest
/// ready Revision of a Configuration.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Route",
    group = "serving.knative.dev",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Domain", "type":"string", "jsonPath":".status.domain"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].reason"}"#
)]
#[kube(status = "RouteStatus", shortname = "rt")]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Traffic targets, in order
    #[serde(default)]
    pub traffic: Vec<TrafficTarget>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    /// Optional name; a named target is also reachable on its own subdomain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// A specific Revision to send traffic to.
    /// Exactly one of `revisionName` or `configurationName` must be specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    /// A Configuration whose latest ready Revision receives the traffic.
    /// Exactly one of `revisionName` or `configurationName` must be specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_name: Option<String>,

    /// Percentage of the default traffic sent to this target
    #[serde(default)]
    #[schemars(range(min = 0, max = 100))]
    pub percent: i64,
}

impl TrafficTarget {
    pub fn named_revision(name: &str, revision_name: &str, percent: i64) -> Self {
        Self {
            name: Some(name.into()),
            revision_name: Some(revision_name.into()),
            configuration_name: None,
            percent,
        }
    }

    pub fn named_configuration(name: &str, configuration_name: &str, percent: i64) -> Self {
        Self {
            name: Some(name.into()),
            revision_name: None,
            configuration_name: Some(configuration_name.into()),
            percent,
        }
    }

    /// Whether this target carries a non-empty name
    pub fn is_named(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// A traffic target after resolution to a concrete Revision
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTrafficTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The Revision serving this target
    pub revision_name: String,

    /// The Configuration this target was resolved through, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_name: Option<String>,

    pub percent: i64,

    /// The domain on which this named target is reachable by itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Status of the Route
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    /// The externally resolvable domain of this route
    pub domain: Option<String>,

    /// The domain of this route inside the cluster
    pub domain_internal: Option<String>,

    /// URL of the route
    pub url: Option<String>,

    /// The last successfully resolved traffic mapping, as consumed by the data-plane
    pub traffic: Option<Vec<ResolvedTrafficTarget>>,

    /// The generation observed by the controller
    pub observed_generation: Option<i64>,

    /// Represents the latest available observations of current state
    pub conditions: Option<Vec<Condition>>,
}

impl HasConditions for Route {
    fn conditions(&self) -> Option<&[Condition]> {
        self.status.as_ref().and_then(|s| s.conditions.as_deref())
    }
}

impl Route {
    pub fn is_ready(&self) -> bool {
        conditions::is_ready(self.conditions())
    }

    /// Revisions named by the spec or by the published mapping
    pub fn referenced_revisions(&self) -> impl Iterator<Item = &str> {
        let from_spec = self
            .spec
            .traffic
            .iter()
            .filter_map(|t| t.revision_name.as_deref());
        let from_status = self
            .status
            .iter()
            .flat_map(|s| s.traffic.iter().flatten())
            .map(|t| t.revision_name.as_str());
        from_spec.chain(from_status)
    }

    pub fn references_configuration(&self, name: &str) -> bool {
        self.spec
            .traffic
            .iter()
            .any(|t| t.configuration_name.as_deref() == Some(name))
    }
}
