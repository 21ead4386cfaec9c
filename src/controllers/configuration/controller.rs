use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use itertools::Itertools;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::Recorder;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config;
use kube::runtime::{reflector, watcher, Predicate, WatchStreamExt};
use kube::Resource;
use tokio::sync::RwLock;
use tracing::*;

use crate::controllers::reconciler::{
    self, changed_predicate, ensure_deletion_change, forget_deleted, is_controlled_by,
    status_predicate_serde, ErrorBackoff, FIELD_MANAGER, RESYNC_INTERVAL,
};
use crate::controllers::{Diagnostics, State};
use crate::resources::configurations::Configuration;
use crate::resources::revisions::Revision;
use crate::resources::routes::Route;
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::{gc, latest, revisions};

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Store for all Revisions
    pub revisions_store: Store<Revision>,
    /// Store for all Routes, which pin Revisions against garbage collection
    pub routes_store: Store<Route>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Consecutive failures per object
    pub backoff: Arc<ErrorBackoff>,
    pub retained_revisions: usize,
}

impl Context {
    pub fn new(
        client: Client,
        revisions_store: Store<Revision>,
        routes_store: Store<Route>,
        metrics: Metrics,
        backoff: Arc<ErrorBackoff>,
        state: State,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.to_string().into()),
            revisions_store,
            routes_store,
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff,
            retained_revisions: state.settings().retained_revisions,
        })
    }

    /// Revisions in `namespace` controlled by the configuration with `uid`
    fn owned_revisions(&self, namespace: &str, uid: &str) -> Vec<Arc<Revision>> {
        self.revisions_store
            .state()
            .into_iter()
            .filter(|rev| rev.namespace().as_deref() == Some(namespace))
            .filter(|rev| is_controlled_by(&rev.metadata, uid))
            .collect()
    }

    /// Revisions named by any Route in `namespace`
    fn routed_revisions(&self, namespace: &str) -> HashSet<String> {
        self.routes_store
            .state()
            .iter()
            .filter(|route| route.namespace().as_deref() == Some(namespace))
            .flat_map(|route| {
                route
                    .referenced_revisions()
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[instrument(skip(ctx, config), fields(trace_id))]
async fn reconcile(config: Arc<Configuration>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Configuration>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = reconciler::namespace(config.as_ref());
    let config_api: Api<Configuration> = Api::namespaced(ctx.client.clone(), namespace);

    if config.meta().deletion_timestamp.is_some() {
        ctx.backoff.forget(config.as_ref());
        // revisions are garbage collected through their owner references
        return Ok(Action::await_change());
    }

    info!(
        "Reconciling Configuration {} in namespace {namespace}",
        config.name_any()
    );

    let result = config.reconcile_status(&ctx, &config_api, namespace).await;

    reconciler::finish(
        config.as_ref(),
        &config_api,
        result,
        &ctx.recorder,
        &ctx.metrics,
        &ctx.backoff,
    )
    .await
}

fn error_policy(config: Arc<Configuration>, error: &Error, ctx: Arc<Context>) -> Action {
    reconciler::requeue_on_error(config.as_ref(), error, &ctx.backoff)
}

impl Configuration {
    async fn reconcile_status(
        &self,
        ctx: &Context,
        config_api: &Api<Configuration>,
        namespace: &str,
    ) -> Result<Action> {
        let rev_api: Api<Revision> = Api::namespaced(ctx.client.clone(), namespace);
        let uid = self.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        let generation = self
            .metadata
            .generation
            .ok_or(Error::MissingObjectKey(".metadata.generation"))?;

        let minted = match revisions::validate_template(&self.spec.revision_template.spec) {
            Ok(()) => {
                revisions::reconcile_revision(&rev_api, &ctx.revisions_store, self, generation)
                    .await
            }
            Err(err) => Err(err),
        };

        // transient failures leave the status alone, terminal ones are reported
        let minted = match minted {
            Err(err) if err.is_retryable() => return Err(err),
            minted => minted,
        };

        let owned = ctx.owned_revisions(namespace, &uid);
        let status = latest::next_status(self, minted.as_ref(), &owned, Utc::now());

        if self.status.as_ref() != Some(&status) {
            debug!(
                latest_created = ?status.latest_created_revision_name,
                latest_ready = ?status.latest_ready_revision_name,
                "Updating status of Configuration {}",
                self.name_any()
            );
            reconciler::patch_status(config_api, self, &status).await?;
        }

        let minted = minted?;

        let mut keep = ctx.routed_revisions(namespace);
        keep.insert(minted.name_any());
        keep.extend(status.latest_created_revision_name.clone());
        keep.extend(status.latest_ready_revision_name.clone());

        let collectable = gc::revisions_to_collect(&owned, &keep, ctx.retained_revisions);
        gc::collect_revisions(&rev_api, &collectable).await?;

        Ok(Action::requeue(RESYNC_INTERVAL))
    }
}

/// Run the Configuration controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let configurations: Api<Configuration> = Api::all(client.clone());
    let revisions: Api<Revision> = Api::all(client.clone());
    let routes: Api<Route> = Api::all(client.clone());

    if let Err(e) = configurations.list(&ListParams::default().limit(1)).await {
        error!("Configuration is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let (revisions_store, revisions_writer) = reflector::store();
    let revision_reflector = reflector(revisions_writer, watcher(revisions, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        // readiness lives in the status
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let (routes_store, routes_writer) = reflector::store();
    let route_reflector = reflector(routes_writer, watcher(routes, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let backoff = Arc::new(ErrorBackoff::new(state.settings().retry.clone()));
    let (configurations_store, configurations_writer) = reflector::store();
    let configuration_reflector = reflector(
        configurations_writer,
        watcher(configurations, Config::default()),
    )
    .map(|event| ensure_deletion_change(event))
    .inspect(forget_deleted(&backoff))
    .touched_objects()
    .default_backoff()
    .predicate_filter(changed_predicate);

    // a route letting go of a revision may make it collectable
    let route_revisions = revisions_store.clone();
    let route_mapper = move |route: Route| {
        let namespace = route.namespace().unwrap_or_default();
        route
            .referenced_revisions()
            .filter_map(|name| route_revisions.get(&ObjectRef::new(name).within(&namespace)))
            .filter_map(|rev| rev.configuration_name().map(str::to_owned))
            .chain(
                route
                    .spec
                    .traffic
                    .iter()
                    .filter_map(|t| t.configuration_name.clone()),
            )
            .unique()
            .map(|name| ObjectRef::<Configuration>::new(&name).within(&namespace))
            .collect::<Vec<_>>()
    };

    Controller::for_stream(configuration_reflector, configurations_store)
        .shutdown_on_signal()
        .owns_stream(revision_reflector)
        .watches_stream(route_reflector, route_mapper)
        .run(
            reconcile,
            error_policy,
            Context::new(client, revisions_store, routes_store, metrics, backoff, state),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
