use std::collections::BTreeMap;
use std::hash::Hasher;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::*;

use crate::controllers::reconciler::{is_controlled_by, namespace, owner_reference, FIELD_MANAGER};
use crate::fieldmask;
use crate::resources::configurations::{Configuration, RevisionTemplateSpec};
use crate::resources::revisions::{
    Revision, RevisionSpec, CONFIGURATION_GENERATION_LABEL, CONFIGURATION_LABEL,
    TEMPLATE_HASH_ANNOTATION,
};
use crate::resources::services::SERVICE_LABEL;
use crate::{Error, Result};

/// Revisions are named after their configuration and generation, so minting one twice for the
/// same generation collides on the name instead of producing a duplicate.
pub fn revision_name(configuration_name: &str, generation: i64) -> String {
    format!("{configuration_name}-{generation:05}")
}

/// Best effort inverse of [`revision_name`]
pub fn generation_from_name(revision_name: &str) -> Option<i64> {
    revision_name.rsplit_once('-')?.1.parse().ok()
}

pub fn validate_template(spec: &RevisionSpec) -> Result<()> {
    if spec.container.image.as_deref().is_none_or(str::is_empty) {
        return Err(Error::invalid_spec(
            "MissingImage",
            "revisionTemplate.spec.container.image must be set",
        ));
    }

    if let Some(concurrency) = spec.container_concurrency {
        if !(0..=1000).contains(&concurrency) {
            return Err(Error::invalid_spec(
                "InvalidContainerConcurrency",
                format!("containerConcurrency must be between 0 and 1000, got {concurrency}"),
            ));
        }
    }

    if let Some(timeout) = spec.timeout_seconds {
        if timeout <= 0 {
            return Err(Error::invalid_spec(
                "InvalidTimeout",
                format!("timeoutSeconds must be positive, got {timeout}"),
            ));
        }
    }

    Ok(())
}

/// Generate a hash of a revision template, used to tell our own revisions from name collisions
pub fn template_hash(template: &RevisionTemplateSpec) -> Result<String> {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(&serde_json::to_vec(template)?);

    let hash_bytes = hasher.finish().to_be_bytes();

    let mut first_4: [u8; 4] = [0; 4];
    first_4.clone_from_slice(&hash_bytes[..4]);

    Ok(safe_encode_u32(u32::from_be_bytes(first_4)))
}

// Kubernetes encodes template hashes with digits partially swapped out for letters so they never
// spell words. We match it so things 'look' right.
fn safe_encode_u32(mut val: u32) -> String {
    const NUMBER_MAP: &[char] = &['4', '5', '6', '7', '8', '9', 'b', 'c', 'd', 'f'];

    // 10^10 - 1 > 2^32 - 1
    let mut out = String::with_capacity(10);

    // this gets decimal digits in reverse, because it doesn't really matter.
    while val > 0 {
        let n = val % 10;
        val /= 10;
        out.push(NUMBER_MAP[n as usize]);
    }

    out
}

/// Render the Revision minted by `config` for `generation`, with a masked copy of the template.
pub fn revision(config: &Configuration, generation: i64, hash: &str) -> Result<Revision> {
    let template = &config.spec.revision_template;
    let template_meta = template.metadata.as_ref();
    let config_name = config.name_any();

    let mut labels: BTreeMap<String, String> = template_meta
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(CONFIGURATION_LABEL.to_owned(), config_name.clone());
    labels.insert(
        CONFIGURATION_GENERATION_LABEL.to_owned(),
        generation.to_string(),
    );
    if let Some(service) = config.labels().get(SERVICE_LABEL) {
        labels.insert(SERVICE_LABEL.to_owned(), service.clone());
    }

    let mut annotations: BTreeMap<String, String> = template_meta
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();
    annotations.insert(TEMPLATE_HASH_ANNOTATION.to_owned(), hash.to_owned());

    let spec = RevisionSpec {
        container: fieldmask::container(&template.spec.container),
        volumes: template
            .spec
            .volumes
            .as_ref()
            .map(|volumes| volumes.iter().map(fieldmask::volume).collect()),
        ..template.spec.clone()
    };

    let mut revision = Revision::new(&revision_name(&config_name, generation), spec);
    revision.metadata = ObjectMeta {
        name: revision.metadata.name.take(),
        namespace: Some(namespace(config).to_owned()),
        labels: Some(labels),
        annotations: Some(annotations),
        owner_references: Some(vec![owner_reference(config)?]),
        ..Default::default()
    };

    Ok(revision)
}

/// Ensure the Revision for the configuration's current generation exists.
///
/// Creating is idempotent: if the name is taken by a Revision we control that was minted from
/// the same template, that Revision is ours. Anything else is a name conflict.
pub async fn reconcile_revision(
    rev_api: &Api<Revision>,
    revisions_store: &Store<Revision>,
    config: &Configuration,
    generation: i64,
) -> Result<Revision> {
    let namespace = namespace(config);
    let uid = config
        .uid()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let hash = template_hash(&config.spec.revision_template)?;
    let name = revision_name(&config.name_any(), generation);

    let existing = match revisions_store.get(&ObjectRef::new(&name).within(namespace)) {
        Some(cached) => Some(cached.as_ref().clone()),
        None => {
            let desired = revision(config, generation, &hash)?;
            match rev_api
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
                    info!("Created Revision {name} in namespace {namespace}");
                    return Ok(created);
                }
                Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => {
                    rev_api.get_opt(&name).await?
                }
                Err(err) => return Err(err.into()),
            }
        }
    };

    match existing {
        Some(existing)
            if is_controlled_by(&existing.metadata, &uid)
                && existing.annotations().get(TEMPLATE_HASH_ANNOTATION) == Some(&hash) =>
        {
            debug!("Found existing Revision {name} in namespace {namespace}");
            Ok(existing)
        }
        Some(_) => Err(Error::NameConflict {
            kind: "Revision".into(),
            name,
        }),
        None => Err(Error::NotReady {
            message: format!("Revision {name} disappeared while being created"),
            reason: "RevisionDeleted".into(),
            requeue_after: Some(std::time::Duration::from_secs(1)),
        }),
    }
}
