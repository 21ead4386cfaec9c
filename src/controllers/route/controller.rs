use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
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
    self, changed_predicate, ensure_deletion_change, forget_deleted, status_predicate_serde,
    ErrorBackoff, FIELD_MANAGER, RESYNC_INTERVAL,
};
use crate::controllers::{Diagnostics, State};
use crate::resources::configurations::Configuration;
use crate::resources::revisions::Revision;
use crate::resources::routes::Route;
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::domain::RouteDomains;
use super::reconcilers::traffic::{self, Resolution, TargetLookup};

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Store for all Revisions
    pub revisions_store: Store<Revision>,
    /// Store for all Configurations
    pub configurations_store: Store<Configuration>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Consecutive failures per object
    pub backoff: Arc<ErrorBackoff>,
    pub domain_suffix: String,
}

impl Context {
    pub fn new(
        client: Client,
        revisions_store: Store<Revision>,
        configurations_store: Store<Configuration>,
        metrics: Metrics,
        backoff: Arc<ErrorBackoff>,
        state: State,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.to_string().into()),
            revisions_store,
            configurations_store,
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff,
            domain_suffix: state.settings().domain_suffix.clone(),
        })
    }
}

/// Resolves traffic targets against the caches of one namespace
struct NamespacedLookup<'a> {
    ctx: &'a Context,
    namespace: &'a str,
}

impl TargetLookup for NamespacedLookup<'_> {
    fn revision(&self, name: &str) -> Option<Arc<Revision>> {
        self.ctx
            .revisions_store
            .get(&ObjectRef::new(name).within(self.namespace))
    }

    fn configuration(&self, name: &str) -> Option<Arc<Configuration>> {
        self.ctx
            .configurations_store
            .get(&ObjectRef::new(name).within(self.namespace))
    }
}

#[instrument(skip(ctx, route), fields(trace_id))]
async fn reconcile(route: Arc<Route>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Route>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = reconciler::namespace(route.as_ref());
    let route_api: Api<Route> = Api::namespaced(ctx.client.clone(), namespace);

    if route.meta().deletion_timestamp.is_some() {
        ctx.backoff.forget(route.as_ref());
        return Ok(Action::await_change());
    }

    info!(
        "Reconciling Route {} in namespace {namespace}",
        route.name_any()
    );

    let result = route.reconcile_status(&ctx, &route_api, namespace).await;

    reconciler::finish(
        route.as_ref(),
        &route_api,
        result,
        &ctx.recorder,
        &ctx.metrics,
        &ctx.backoff,
    )
    .await
}

fn error_policy(route: Arc<Route>, error: &Error, ctx: Arc<Context>) -> Action {
    reconciler::requeue_on_error(route.as_ref(), error, &ctx.backoff)
}

impl Route {
    async fn reconcile_status(
        &self,
        ctx: &Context,
        route_api: &Api<Route>,
        namespace: &str,
    ) -> Result<Action> {
        let domains = RouteDomains::new(&self.name_any(), namespace, &ctx.domain_suffix)?;

        let outcome = traffic::validate(&self.spec.traffic).map(|()| {
            traffic::resolve(
                &self.spec.traffic,
                &NamespacedLookup { ctx, namespace },
                &domains,
            )
        });

        let status = traffic::next_status(self, outcome.as_ref(), &domains, Utc::now());

        if self.status.as_ref() != Some(&status) {
            debug!(
                traffic = ?status.traffic,
                "Updating status of Route {}",
                self.name_any()
            );
            reconciler::patch_status(route_api, self, &status).await?;
        }

        match outcome? {
            Resolution::Resolved(_) => Ok(Action::requeue(RESYNC_INTERVAL)),
            // progress on the targets triggers another reconcile through the watches
            Resolution::Pending { .. } | Resolution::Failed { .. } => Ok(Action::await_change()),
        }
    }
}

/// Routes in `namespace` for which `references` holds
fn referencing_routes(
    routes: &Store<Route>,
    namespace: Option<String>,
    references: impl Fn(&Route) -> bool,
) -> Vec<ObjectRef<Route>> {
    routes
        .state()
        .iter()
        .filter(|route| route.namespace() == namespace)
        .filter(|route| references(route))
        .map(|route| ObjectRef::from_obj(route.as_ref()))
        .collect()
}

/// Run the Route controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let routes: Api<Route> = Api::all(client.clone());
    let revisions: Api<Revision> = Api::all(client.clone());
    let configurations: Api<Configuration> = Api::all(client.clone());

    if let Err(e) = routes.list(&ListParams::default().limit(1)).await {
        error!("Route is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let (revisions_store, revisions_writer) = reflector::store();
    let revision_reflector = reflector(revisions_writer, watcher(revisions, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let (configurations_store, configurations_writer) = reflector::store();
    let configuration_reflector = reflector(
        configurations_writer,
        watcher(configurations, Config::default()),
    )
    .map(|event| ensure_deletion_change(event))
    .touched_objects()
    .default_backoff()
    .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let backoff = Arc::new(ErrorBackoff::new(state.settings().retry.clone()));
    let (routes_store, routes_writer) = reflector::store();
    let route_reflector = reflector(routes_writer, watcher(routes, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .inspect(forget_deleted(&backoff))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let revision_routes = routes_store.clone();
    let revision_mapper = move |rev: Revision| {
        let name = rev.name_any();
        referencing_routes(&revision_routes, rev.namespace(), |route| {
            route.referenced_revisions().any(|r| r == name)
        })
    };

    let configuration_routes = routes_store.clone();
    let configuration_mapper = move |config: Configuration| {
        let name = config.name_any();
        referencing_routes(&configuration_routes, config.namespace(), |route| {
            route.references_configuration(&name)
        })
    };

    Controller::for_stream(route_reflector, routes_store)
        .shutdown_on_signal()
        .watches_stream(revision_reflector, revision_mapper)
        .watches_stream(configuration_reflector, configuration_mapper)
        .run(
            reconcile,
            error_policy,
            Context::new(
                client,
                revisions_store,
                configurations_store,
                metrics,
                backoff,
                state,
            ),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
