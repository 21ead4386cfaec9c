use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::object::HasSpec;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::*;

use crate::controllers::reconciler::{
    is_controlled_by, namespace, owner_reference, APP_MANAGED_BY_LABEL, FIELD_MANAGER,
};
use crate::controllers::route::reconcilers::traffic::is_dns_label;
use crate::resources::configurations::{Configuration, ConfigurationSpec};
use crate::resources::routes::{Route, RouteSpec, TrafficTarget};
use crate::resources::services::{RolloutMode, Service, SERVICE_LABEL};
use crate::{Error, Result};

pub const LATEST_TARGET: &str = "latest";
pub const CURRENT_TARGET: &str = "current";
pub const NEXT_TARGET: &str = "next";

fn child_meta(svc: &Service) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(svc.name_any()),
        namespace: Some(namespace(svc).to_owned()),
        labels: Some(BTreeMap::from([
            (SERVICE_LABEL.to_owned(), svc.name_any()),
            (APP_MANAGED_BY_LABEL.to_owned(), FIELD_MANAGER.to_owned()),
        ])),
        owner_references: Some(vec![owner_reference(svc)?]),
        ..Default::default()
    })
}

/// The Configuration a Service owns, named after the Service
pub fn configuration(svc: &Service, spec: &ConfigurationSpec) -> Result<Configuration> {
    let mut config = Configuration::new(&svc.name_any(), spec.clone());
    config.metadata = child_meta(svc)?;
    Ok(config)
}

/// The Route a Service owns, named after the Service
pub fn route(svc: &Service, traffic: Vec<TrafficTarget>) -> Result<Route> {
    let mut route = Route::new(&svc.name_any(), RouteSpec { traffic });
    route.metadata = child_meta(svc)?;
    Ok(route)
}

/// The traffic targets a rollout mode asks for.
///
/// `latest_created` is the latest created revision of the owned Configuration as currently
/// observed. In release mode `latest` pins the first listed revision while it is the latest
/// created one, and follows the Configuration otherwise. Manual mode synthesizes nothing.
pub fn route_traffic(
    mode: RolloutMode<'_>,
    config_name: &str,
    latest_created: Option<&str>,
) -> Vec<TrafficTarget> {
    let release = match mode {
        RolloutMode::Manual => return vec![],
        RolloutMode::RunLatest(_) => {
            return vec![TrafficTarget::named_configuration(
                LATEST_TARGET,
                config_name,
                100,
            )]
        }
        RolloutMode::Release(release) => release,
    };

    let mut traffic = match release.revisions.as_slice() {
        [current] => vec![TrafficTarget::named_revision(CURRENT_TARGET, current, 100)],
        [current, next, ..] => {
            let mut traffic = vec![
                TrafficTarget::named_revision(
                    CURRENT_TARGET,
                    current,
                    100 - release.rollout_percent,
                ),
                TrafficTarget::named_revision(NEXT_TARGET, next, release.rollout_percent),
            ];
            // each pinned revision is also reachable under its own name
            traffic.extend(
                [current, next]
                    .into_iter()
                    .filter(|name| {
                        ![LATEST_TARGET, CURRENT_TARGET, NEXT_TARGET].contains(&name.as_str())
                    })
                    .filter(|name| is_dns_label(name))
                    .map(|name| TrafficTarget::named_revision(name, name, 0)),
            );
            traffic
        }
        [] => vec![],
    };

    let latest = match release.revisions.first() {
        Some(first) if latest_created == Some(first.as_str()) => {
            TrafficTarget::named_revision(LATEST_TARGET, first, 0)
        }
        _ => TrafficTarget::named_configuration(LATEST_TARGET, config_name, 0),
    };
    traffic.push(latest);

    traffic
}

/// Ensure the child `desired` exists and carries the desired spec.
///
/// A missing child is created. An existing child must be controlled by `owner_uid`; when its
/// spec drifted it is replaced, conditional on the resourceVersion we read.
pub async fn ensure_child<K>(api: &Api<K>, desired: K, owner_uid: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + HasSpec + Clone + DeserializeOwned + Serialize + Debug,
    K::Spec: PartialEq + Clone,
{
    let name = desired.name_any();
    let kind = K::kind(&()).to_string();
    let params = PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_owned()),
    };

    let Some(existing) = api.get_opt(&name).await? else {
        let created = api.create(&params, &desired).await?;
        info!("Created {kind} {name} in namespace {}", namespace(&desired));
        return Ok(created);
    };

    if !is_controlled_by(existing.meta(), owner_uid) {
        return Err(Error::NameConflict { kind, name });
    }

    if existing.spec() == desired.spec() {
        return Ok(existing);
    }

    let mut updated = existing;
    *updated.spec_mut() = desired.spec().clone();
    let replaced = api.replace(&name, &params, &updated).await?;
    info!("Updated {kind} {name} in namespace {}", namespace(&desired));

    Ok(replaced)
}

/// Delete the child `name` if it is controlled by `owner_uid`
pub async fn delete_child<K>(api: &Api<K>, name: &str, owner_uid: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let Some(existing) = api.get_opt(name).await? else {
        return Ok(());
    };
    if !is_controlled_by(existing.meta(), owner_uid) {
        return Ok(());
    }

    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!("Deleted {} {name}", K::kind(&()));
            Ok(())
        }
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}
