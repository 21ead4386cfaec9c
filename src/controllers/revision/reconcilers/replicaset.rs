use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::*;

use crate::controllers::reconciler::{
    is_controlled_by, namespace, owner_reference, APP_MANAGED_BY_LABEL, FIELD_MANAGER,
};
use crate::fieldmask;
use crate::resources::revisions::{Revision, CONFIGURATION_LABEL, REVISION_LABEL};
use crate::resources::services::SERVICE_LABEL;
use crate::{Error, Result};

pub const USER_CONTAINER_NAME: &str = "user-container";

/// Render the ReplicaSet that deploys `rev`. It is named after the revision and runs a single
/// replica of the masked container.
pub fn replicaset(rev: &Revision) -> Result<ReplicaSet> {
    let name = rev.name_any();
    let selector = BTreeMap::from([(REVISION_LABEL.to_owned(), name.clone())]);

    let mut labels = selector.clone();
    for key in [CONFIGURATION_LABEL, SERVICE_LABEL] {
        if let Some(value) = rev.labels().get(key) {
            labels.insert(key.to_owned(), value.clone());
        }
    }

    let mut replicaset_labels = labels.clone();
    replicaset_labels.insert(APP_MANAGED_BY_LABEL.to_owned(), FIELD_MANAGER.to_owned());

    let container = Container {
        name: USER_CONTAINER_NAME.into(),
        ..fieldmask::container(&rev.spec.container)
    };

    let volumes = rev
        .spec
        .volumes
        .as_ref()
        .map(|volumes| volumes.iter().map(fieldmask::volume).collect());

    Ok(ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace(rev).to_owned()),
            labels: Some(replicaset_labels),
            owner_references: Some(vec![owner_reference(rev)?]),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                match_expressions: None,
            },
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes,
                    service_account_name: rev.spec.service_account_name.clone(),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Ensure the ReplicaSet of `rev` exists, creating it if the cache has not seen it.
pub async fn reconcile_replicaset(
    rs_api: &Api<ReplicaSet>,
    replicasets_store: &Store<ReplicaSet>,
    rev: &Revision,
) -> Result<ReplicaSet> {
    let name = rev.name_any();
    let namespace = namespace(rev);
    let uid = rev.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    let existing = match replicasets_store.get(&ObjectRef::new(&name).within(namespace)) {
        Some(cached) => Some(cached.as_ref().clone()),
        None => {
            let desired = replicaset(rev)?;
            match rs_api
                .create(
                    &PostParams {
                        dry_run: false,
                        field_manager: Some(FIELD_MANAGER.to_owned()),
                    },
                    &desired,
                )
                .await
            {
                Ok(created) => {
                    debug!("Created ReplicaSet {name} in namespace {namespace}");
                    return Ok(created);
                }
                Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => {
                    rs_api.get_opt(&name).await?
                }
                Err(err) => return Err(err.into()),
            }
        }
    };

    match existing {
        Some(existing) if is_controlled_by(&existing.metadata, &uid) => Ok(existing),
        Some(_) => Err(Error::NameConflict {
            kind: "ReplicaSet".into(),
            name,
        }),
        // deleted between the create and the get; the next reconcile recreates it
        None => Err(Error::NotReady {
            message: format!("ReplicaSet {name} disappeared while being created"),
            reason: "ReplicaSetDeleted".into(),
            requeue_after: Some(std::time::Duration::from_secs(1)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use k8s_openapi::api::core::v1::EnvVar;
    use serde_json::json;

    use super::*;
    use crate::resources::revisions::RevisionSpec;

    #[test]
    fn renders_a_single_masked_replica() {
        let mut rev = Revision::new(
            "hello-00002",
            RevisionSpec {
                container: Container {
                    name: "ignored".into(),
                    image: Some("ghcr.io/example/hello:2".into()),
                    working_dir: Some("/tmp".into()),
                    env: Some(vec![EnvVar {
                        name: "TARGET".into(),
                        value: Some("world".into()),
                        value_from: None,
                    }]),
                    ..Default::default()
                },
                service_account_name: Some("hello".into()),
                ..Default::default()
            },
        );
        rev.metadata.namespace = Some("serving".into());
        rev.metadata.uid = Some("rev-uid".into());
        rev.metadata.labels = Some(BTreeMap::from([
            (CONFIGURATION_LABEL.to_owned(), "hello".to_owned()),
            ("unrelated".to_owned(), "x".to_owned()),
        ]));

        let rs = replicaset(&rev).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&rs).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "hello-00002",
                    "namespace": "serving",
                    "labels": {
                        "app.kubernetes.io/managed-by": "serving-operator",
                        "serving.knative.dev/configuration": "hello",
                        "serving.knative.dev/revision": "hello-00002",
                    },
                    "ownerReferences": [{
                        "kind": "Revision",
                        "name": "hello-00002",
                        "uid": "rev-uid",
                        "controller": true,
                    }],
                },
                "spec": {
                    "replicas": 1,
                    "selector": {"matchLabels": {"serving.knative.dev/revision": "hello-00002"}},
                    "template": {
                        "metadata": {"labels": {"serving.knative.dev/revision": "hello-00002"}},
                        "spec": {
                            "serviceAccountName": "hello",
                            "containers": [{
                                "name": "user-container",
                                "image": "ghcr.io/example/hello:2",
                                "env": [{"name": "TARGET", "value": "world"}],
                            }],
                        },
                    },
                },
            })
        );

        let pod = rs.spec.and_then(|s| s.template).and_then(|t| t.spec).unwrap();
        assert_eq!(pod.containers[0].working_dir, None);
        assert!(!rs
            .metadata
            .labels
            .unwrap_or_default()
            .contains_key("unrelated"));
    }

    #[test]
    fn requires_a_uid_for_the_owner_reference() {
        let rev = Revision::new("hello-00001", Default::default());
        assert!(matches!(
            replicaset(&rev),
            Err(Error::MissingObjectKey(_))
        ));
    }
}
