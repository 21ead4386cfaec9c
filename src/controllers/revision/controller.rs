use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::Recorder;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config;
use kube::runtime::{reflector, watcher, Predicate, WatchStreamExt};
use kube::Resource;
use tokio::sync::RwLock;
use tracing::*;

use crate::controllers::reconciler::{
    self, changed_predicate, ensure_deletion_change, forget_deleted, status_predicate_serde,
    ErrorBackoff, APP_MANAGED_BY_LABEL, FIELD_MANAGER, RESYNC_INTERVAL,
};
use crate::controllers::{Diagnostics, State};
use crate::resources::conditions::{self, Condition, ConditionStatus, READY};
use crate::resources::revisions::{Revision, RevisionPhase};
use crate::{telemetry, Error, Metrics, Result};

use super::reconcilers::lifecycle::{self, DeploymentObservation};
use super::reconcilers::replicaset::reconcile_replicaset;

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Store for the ReplicaSets we created
    pub replicasets_store: Store<ReplicaSet>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Consecutive failures per object
    pub backoff: Arc<ErrorBackoff>,
    /// How long a revision may stay Building
    pub progress_deadline: Duration,
}

impl Context {
    pub fn new(
        client: Client,
        replicasets_store: Store<ReplicaSet>,
        metrics: Metrics,
        backoff: Arc<ErrorBackoff>,
        state: State,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, FIELD_MANAGER.to_string().into()),
            replicasets_store,
            diagnostics: state.diagnostics.clone(),
            metrics,
            backoff,
            progress_deadline: state.settings().progress_deadline,
        })
    }
}

#[instrument(skip(ctx, rev), fields(trace_id))]
async fn reconcile(rev: Arc<Revision>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Revision>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = reconciler::namespace(rev.as_ref());
    let rev_api: Api<Revision> = Api::namespaced(ctx.client.clone(), namespace);

    if rev.meta().deletion_timestamp.is_some() {
        ctx.backoff.forget(rev.as_ref());
        // the ReplicaSet is garbage collected through its owner reference
        return Ok(Action::await_change());
    }

    info!(
        "Reconciling Revision {} in namespace {namespace}",
        rev.name_any()
    );

    let result = rev.reconcile_status(&ctx, &rev_api, namespace).await;

    reconciler::finish(
        rev.as_ref(),
        &rev_api,
        result,
        &ctx.recorder,
        &ctx.metrics,
        &ctx.backoff,
    )
    .await
}

fn error_policy(rev: Arc<Revision>, error: &Error, ctx: Arc<Context>) -> Action {
    reconciler::requeue_on_error(rev.as_ref(), error, &ctx.backoff)
}

impl Revision {
    async fn reconcile_status(
        &self,
        ctx: &Context,
        rev_api: &Api<Revision>,
        namespace: &str,
    ) -> Result<Action> {
        let rs_api = Api::<ReplicaSet>::namespaced(ctx.client.clone(), namespace);
        let now = Utc::now();

        let replicaset = match reconcile_replicaset(&rs_api, &ctx.replicasets_store, self).await {
            Ok(replicaset) => replicaset,
            Err(err) if !err.is_retryable() => {
                // terminal for this revision, surface it instead of retrying
                let mut status = self.status.clone().unwrap_or_default();
                let mut conditions = status.conditions.take().unwrap_or_default();
                conditions::set(
                    &mut conditions,
                    Condition::new(
                        READY,
                        ConditionStatus::False,
                        err.metric_label(),
                        err.to_string(),
                    ),
                    now,
                );
                status.phase = Some(RevisionPhase::Failed);
                status.conditions = Some(conditions);
                status.observed_generation = self.metadata.generation;

                if self.status.as_ref() != Some(&status) {
                    reconciler::patch_status(rev_api, self, &status).await?;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let observation = DeploymentObservation::observe(Some(&replicaset));
        let plan = lifecycle::next_status(
            self,
            &replicaset.name_any(),
            &observation,
            ctx.progress_deadline,
            now,
        );

        if self.status.as_ref() != Some(&plan.status) {
            debug!(
                phase = ?plan.status.phase,
                "Revision {} moves on after observing {observation:?}",
                self.name_any()
            );
            reconciler::patch_status(rev_api, self, &plan.status).await?;
        }

        Ok(Action::requeue(
            plan.requeue_after
                .map_or(RESYNC_INTERVAL, |after| after.min(RESYNC_INTERVAL)),
        ))
    }
}

/// Run the Revision controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let revisions: Api<Revision> = Api::all(client.clone());
    let replicasets: Api<ReplicaSet> = Api::all(client.clone());

    if let Err(e) = revisions.list(&ListParams::default().limit(1)).await {
        error!("Revision is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all ReplicaSets we create have this label
    let cfg = Config::default().labels(&format!("{APP_MANAGED_BY_LABEL}={FIELD_MANAGER}"));

    let (replicasets_store, replicasets_writer) = reflector::store();
    let replicaset_reflector = reflector(replicasets_writer, watcher(replicasets, cfg))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    // revisions: spec changes and deletions only, we write their status ourselves
    let backoff = Arc::new(ErrorBackoff::new(state.settings().retry.clone()));
    let (revisions_store, revisions_writer) = reflector::store();
    let revision_reflector = reflector(revisions_writer, watcher(revisions, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .inspect(forget_deleted(&backoff))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    Controller::for_stream(revision_reflector, revisions_store)
        .shutdown_on_signal()
        .owns_stream(replicaset_reflector)
        .run(
            reconcile,
            error_policy,
            Context::new(client, replicasets_store, metrics, backoff, state),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
