use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
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
use crate::resources::routes::Route;
use crate::resources::services::{RolloutMode, Service, SERVICE_FINALIZER, SERVICE_LABEL};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::{aggregate, children};

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Store for the Configurations created by Services
    pub configurations_store: Store<Configuration>,
    /// Store for the Routes created by Services
    pub routes_store: Store<Route>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Consecutive failures per object
    pub backoff: Arc<ErrorBackoff>,
}

impl Context {
    pub fn new(
        client: Client,
        configurations_store: Store<Configuration>,
        routes_store: Store<Route>,
        metrics: Metrics,
        backoff: Arc<ErrorBackoff>,
        state: State,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.to_string().into()),
            configurations_store,
            routes_store,
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff,
        })
    }
}

#[instrument(skip(ctx, svc), fields(trace_id))]
async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Service>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = reconciler::namespace(svc.as_ref());
    let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);

    info!(
        "Reconciling Service {} in namespace {namespace}",
        svc.name_any()
    );

    let result = finalizer(&svc_api, SERVICE_FINALIZER, svc.clone(), |event| async {
        match event {
            Finalizer::Apply(svc) => svc.reconcile_status(&ctx, &svc_api, namespace).await,
            Finalizer::Cleanup(svc) => svc.cleanup(&ctx, namespace).await,
        }
    })
    .await
    .map_err(|err| Error::FinalizerError(Box::new(err)));

    reconciler::finish(
        svc.as_ref(),
        &svc_api,
        result,
        &ctx.recorder,
        &ctx.metrics,
        &ctx.backoff,
    )
    .await
}

fn error_policy(svc: Arc<Service>, error: &Error, ctx: Arc<Context>) -> Action {
    reconciler::requeue_on_error(svc.as_ref(), error, &ctx.backoff)
}

impl Service {
    async fn reconcile_status(
        &self,
        ctx: &Context,
        svc_api: &Api<Service>,
        namespace: &str,
    ) -> Result<Action> {
        let uid = self.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        let applied = match self.spec.mode() {
            Ok(RolloutMode::Manual) => Ok(None),
            Ok(mode) => self
                .apply_children(ctx, mode, namespace, &uid)
                .await
                .map(Some),
            Err(err) => Err(err),
        };

        // transient failures leave the status alone, terminal ones are reported
        let applied = match applied {
            Err(err) if err.is_retryable() => return Err(err),
            applied => applied,
        };

        let (config, route) = match &applied {
            Ok(Some((config, route))) => (Some(config.clone()), Some(route.clone())),
            // in manual mode, or when the spec is invalid, report on whatever children exist
            _ => self.observed_children(ctx, namespace, &uid),
        };

        let status = aggregate::next_status(
            self,
            config.as_deref(),
            route.as_deref(),
            applied.as_ref().err(),
            Utc::now(),
        );

        if self.status.as_ref() != Some(&status) {
            debug!(
                latest_ready = ?status.latest_ready_revision_name,
                "Updating status of Service {}",
                self.name_any()
            );
            reconciler::patch_status(svc_api, self, &status).await?;
        }

        applied?;

        Ok(Action::requeue(RESYNC_INTERVAL))
    }

    /// Mirror the spec into the owned Configuration and Route
    async fn apply_children(
        &self,
        ctx: &Context,
        mode: RolloutMode<'_>,
        namespace: &str,
        uid: &str,
    ) -> Result<(Arc<Configuration>, Arc<Route>)> {
        let config_api: Api<Configuration> = Api::namespaced(ctx.client.clone(), namespace);
        let route_api: Api<Route> = Api::namespaced(ctx.client.clone(), namespace);

        let config = match self.spec.configuration() {
            Some(spec) => {
                let desired = children::configuration(self, spec)?;
                children::ensure_child(&config_api, desired, uid).await?
            }
            None => {
                return Err(Error::invalid_spec(
                    "InvalidRolloutMode",
                    "The rollout mode carries no Configuration",
                ))
            }
        };

        let traffic = children::route_traffic(
            mode,
            &config.name_any(),
            config.latest_created_revision_name(),
        );
        let desired = children::route(self, traffic)?;
        let route = children::ensure_child(&route_api, desired, uid).await?;

        Ok((Arc::new(config), Arc::new(route)))
    }

    fn observed_children(
        &self,
        ctx: &Context,
        namespace: &str,
        uid: &str,
    ) -> (Option<Arc<Configuration>>, Option<Arc<Route>>) {
        let name = self.name_any();
        let config = ctx
            .configurations_store
            .get(&ObjectRef::new(&name).within(namespace))
            .filter(|config| is_controlled_by(&config.metadata, uid));
        let route = ctx
            .routes_store
            .get(&ObjectRef::new(&name).within(namespace))
            .filter(|route| is_controlled_by(&route.metadata, uid));
        (config, route)
    }

    // Finalizer cleanup (the object was deleted, ensure the children go with it)
    async fn cleanup(&self, ctx: &Context, namespace: &str) -> Result<Action> {
        let name = self.name_any();
        let uid = self.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        ctx.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{name}`")),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;

        let config_api: Api<Configuration> = Api::namespaced(ctx.client.clone(), namespace);
        let route_api: Api<Route> = Api::namespaced(ctx.client.clone(), namespace);

        children::delete_child(&route_api, &name, &uid).await?;
        children::delete_child(&config_api, &name, &uid).await?;

        Ok(Action::await_change())
    }
}

/// Run the Service controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let services: Api<Service> = Api::all(client.clone());
    let configurations: Api<Configuration> = Api::all(client.clone());
    let routes: Api<Route> = Api::all(client.clone());

    if let Err(e) = services.list(&ListParams::default().limit(1)).await {
        error!("Service is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all children we create have this label
    let cfg = Config::default().labels(SERVICE_LABEL);

    let (configurations_store, configurations_writer) = reflector::store();
    let configuration_reflector =
        reflector(configurations_writer, watcher(configurations, cfg.clone()))
            .map(|event| ensure_deletion_change(event))
            .touched_objects()
            .default_backoff()
            .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let (routes_store, routes_writer) = reflector::store();
    let route_reflector = reflector(routes_writer, watcher(routes, cfg))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let backoff = Arc::new(ErrorBackoff::new(state.settings().retry.clone()));
    let (services_store, services_writer) = reflector::store();
    let service_reflector = reflector(services_writer, watcher(services, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .inspect(forget_deleted(&backoff))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    Controller::for_stream(service_reflector, services_store)
        .shutdown_on_signal()
        .owns_stream(configuration_reflector)
        .owns_stream(route_reflector)
        .run(
            reconcile,
            error_policy,
            Context::new(client, configurations_store, routes_store, metrics, backoff, state),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
