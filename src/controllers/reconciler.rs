//! Plumbing shared by the four controllers: owner references, optimistic status writes,
//! per-key error backoff and watch predicates.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::*;

use super::RetryPolicy;
use crate::resources::conditions::{self, Condition, ConditionStatus, HasConditions, READY};
use crate::resources::configurations::{Configuration, ConfigurationStatus};
use crate::resources::revisions::{Revision, RevisionStatus};
use crate::resources::routes::{Route, RouteStatus};
use crate::{Error, Metrics, Result};

pub const FIELD_MANAGER: &str = "serving-operator";
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Successful reconciles are repeated at this interval even without watch events
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// A write that lost an optimistic concurrency race is retried after this delay
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

pub const RETRY_BUDGET_EXCEEDED: &str = "RetryBudgetExceeded";

pub fn namespace<K: Resource>(obj: &K) -> &str {
    match obj.meta().namespace.as_deref() {
        Some("") | None => "default",
        Some(ns) => ns,
    }
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    owner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))
}

/// Whether `meta` names `owner_uid` as its controller
pub fn is_controlled_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == owner_uid)
}

/// Patch `status` onto `obj`, conditional on the resourceVersion we observed.
///
/// A 404 means the object went away while we were reconciling it, the result is dropped.
pub async fn patch_status<K, S>(api: &Api<K>, obj: &K, status: &S) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let name = obj.name_any();
    let patch = json!({
        "metadata": { "resourceVersion": obj.resource_version() },
        "status": status,
    });

    debug!(
        "Updating status of {} {name} in namespace {}",
        K::kind(&()),
        namespace(obj)
    );

    match api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => {
            debug!("{} {name} was deleted before its status could be written", K::kind(&()));
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Consecutive failure counts per object, used to derive requeue delays
pub struct ErrorBackoff {
    policy: RetryPolicy,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn key<K: Resource>(obj: &K) -> String {
        format!("{}/{}", namespace(obj), obj.meta().name.as_deref().unwrap_or_default())
    }

    /// Count a failure and return the number of consecutive failures so far
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(key.to_owned()).or_default();
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drop the failure count of an object that is going away
    pub fn forget<K: Resource>(&self, obj: &K) {
        self.reset(&Self::key(obj));
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn delay(&self, key: &str) -> Duration {
        self.policy.delay(self.attempts(key).max(1))
    }

    pub fn budget_exceeded(&self, attempts: u32) -> bool {
        attempts >= self.policy.budget
    }
}

/// Watch hook dropping the failure count of deleted objects, some of which are never
/// reconciled again once they are gone
pub fn forget_deleted<K: Resource, E>(
    backoff: &Arc<ErrorBackoff>,
) -> impl FnMut(&Result<watcher::Event<K>, E>) {
    let backoff = backoff.clone();
    move |event| {
        if let Ok(watcher::Event::Delete(obj)) = event {
            backoff.forget(obj);
        }
    }
}

/// Shared error policy: conflicts requeue quickly, retryable errors back off, the rest wait
/// for the object to change.
pub fn requeue_on_error<K: Resource>(obj: &K, err: &Error, backoff: &ErrorBackoff) -> Action {
    if err.is_conflict() {
        return Action::requeue(CONFLICT_REQUEUE);
    }

    if !err.is_retryable() {
        return Action::await_change();
    }

    match err.root() {
        Error::NotReady {
            requeue_after: Some(requeue_after),
            ..
        } => Action::requeue(*requeue_after),
        _ => Action::requeue(backoff.delay(&ErrorBackoff::key(obj))),
    }
}

/// Bookkeeping after a reconcile: resets the backoff on success, and on failure publishes a
/// Warning event, counts the failure and flips Ready to False once the retry budget is spent.
pub async fn finish<K>(
    obj: &K,
    api: &Api<K>,
    result: Result<Action>,
    recorder: &Recorder,
    metrics: &Metrics,
    backoff: &ErrorBackoff,
) -> Result<Action>
where
    K: Resource<DynamicType = ()> + HasConditions + Clone + DeserializeOwned + Debug,
{
    let key = ErrorBackoff::key(obj);

    let err = match result {
        Ok(action) => {
            backoff.reset(&key);
            return Ok(action);
        }
        Err(err) => err,
    };

    if err.is_conflict() {
        debug!("{} {key} was modified concurrently, requeueing", K::kind(&()));
        return Err(err);
    }

    warn!("reconcile failed: {:?}", err);

    if let Err(publish_err) = recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await
    {
        warn!("failed to publish event for {} {key}: {publish_err}", K::kind(&()));
    }

    metrics.reconcile_failure(obj, &err);

    if err.is_retryable() {
        let attempts = backoff.record_failure(&key);
        if backoff.budget_exceeded(attempts) {
            if let Err(patch_err) = mark_retry_budget_exceeded(api, obj, &err, attempts).await {
                warn!("failed to report exhausted retries for {} {key}: {patch_err}", K::kind(&()));
            }
        }
    }

    Err(err)
}

async fn mark_retry_budget_exceeded<K>(api: &Api<K>, obj: &K, err: &Error, attempts: u32) -> Result<()>
where
    K: Resource<DynamicType = ()> + HasConditions + Clone + DeserializeOwned + Debug,
{
    let mut conditions = obj.conditions().map(<[Condition]>::to_vec).unwrap_or_default();
    conditions::set(
        &mut conditions,
        Condition::new(
            READY,
            ConditionStatus::False,
            RETRY_BUDGET_EXCEEDED,
            format!("Reconcile failed {attempts} times in a row: {err}"),
        ),
        Utc::now(),
    );

    patch_status(api, obj, &json!({ "conditions": conditions })).await
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
pub fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<watcher::Event<K>, E>,
) -> Result<watcher::Event<K>, E> {
    if let Ok(watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

pub fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.meta().deletion_timestamp.is_some().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}

pub trait MyHasStatus {
    type Status;

    fn status(&self) -> Option<&Self::Status>;
}

impl MyHasStatus for ReplicaSet {
    type Status = ReplicaSetStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for Revision {
    type Status = RevisionStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for Configuration {
    type Status = ConfigurationStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl MyHasStatus for Route {
    type Status = RouteStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

pub fn status_predicate_serde<K: Resource + MyHasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        // serializing plain structs and maps into a hash key cannot fail
        if let Ok(key) = serde_hashkey::to_key(s) {
            key.hash(&mut hasher);
        }
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};

    use super::*;
    use crate::controllers::fixtures::{self, api_error};
    use crate::resources::revisions::RevisionPhase;

    fn revision(name: &str) -> Revision {
        let mut rev = Revision::new(name, Default::default());
        rev.metadata.namespace = Some("serving".into());
        rev
    }

    #[test]
    fn backoff_grows_and_resets() {
        let backoff = ErrorBackoff::new(RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            budget: 3,
        });
        let key = "serving/hello";

        assert_eq!(backoff.delay(key), Duration::from_secs(1));
        assert_eq!(backoff.record_failure(key), 1);
        assert_eq!(backoff.record_failure(key), 2);
        assert_eq!(backoff.delay(key), Duration::from_secs(2));
        assert!(!backoff.budget_exceeded(2));
        assert_eq!(backoff.record_failure(key), 3);
        assert!(backoff.budget_exceeded(3));

        backoff.reset(key);
        assert_eq!(backoff.attempts(key), 0);
        assert_eq!(backoff.delay(key), Duration::from_secs(1));
    }

    #[test]
    fn error_policy_classifies() {
        let backoff = ErrorBackoff::new(RetryPolicy::default());
        let rev = revision("hello-00001");

        let invalid = Error::invalid_spec("InvalidTraffic", "percentages do not sum to 100");
        assert_eq!(requeue_on_error(&rev, &invalid, &backoff), Action::await_change());

        let not_ready = Error::NotReady {
            message: "waiting".into(),
            reason: "Waiting".into(),
            requeue_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(
            requeue_on_error(&rev, &not_ready, &backoff),
            Action::requeue(Duration::from_secs(7))
        );

        let conflict = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }));
        assert_eq!(
            requeue_on_error(&rev, &conflict, &backoff),
            Action::requeue(CONFLICT_REQUEUE)
        );

        let unavailable = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "etcdserver: request timed out".into(),
            reason: "InternalError".into(),
            code: 500,
        }));
        assert_eq!(
            requeue_on_error(&rev, &unavailable, &backoff),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn controlled_by_requires_controller_flag() {
        let meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                uid: "abc".into(),
                controller: Some(false),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(!is_controlled_by(&meta, "abc"));

        let meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                uid: "abc".into(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(is_controlled_by(&meta, "abc"));
        assert!(!is_controlled_by(&meta, "def"));
    }

    #[test]
    fn predicates_ignore_status_only_changes() {
        let mut rev = revision("hello-00001");
        rev.metadata.generation = Some(1);
        let before = changed_predicate(&rev);

        rev.status = Some(RevisionStatus {
            phase: Some(crate::resources::revisions::RevisionPhase::Ready),
            ..Default::default()
        });
        assert_eq!(changed_predicate(&rev), before);
        assert_ne!(status_predicate_serde(&rev), status_predicate_serde(&revision("x")));

        rev.metadata.generation = Some(2);
        assert_ne!(changed_predicate(&rev), before);
    }

    const REVISION_STATUS: &str =
        "/apis/serving.knative.dev/v1alpha1/namespaces/serving/revisions/hello-00001/status";

    fn observed_revision() -> Revision {
        let mut rev = revision("hello-00001");
        rev.metadata.resource_version = Some("12".into());
        rev.status = Some(RevisionStatus {
            phase: Some(RevisionPhase::Building),
            conditions: Some(vec![Condition::new(
                READY,
                ConditionStatus::Unknown,
                "Deploying",
                "",
            )]),
            ..Default::default()
        });
        rev
    }

    fn server_error() -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "etcdserver: request timed out".into(),
            reason: "InternalError".into(),
            code: 500,
        }))
    }

    #[tokio::test]
    async fn status_patch_is_conditional_on_the_observed_version() {
        let rev = observed_revision();
        let (client, mut server) = fixtures::client();
        let api: Api<Revision> = Api::namespaced(client, "serving");
        let status = RevisionStatus {
            phase: Some(RevisionPhase::Ready),
            ..Default::default()
        };

        let (result, ()) = tokio::join!(patch_status(&api, &rev, &status), async {
            let body = server
                .expect(
                    Method::PATCH,
                    REVISION_STATUS,
                    StatusCode::OK,
                    serde_json::to_value(&rev).unwrap(),
                )
                .await;
            assert_eq!(body["metadata"]["resourceVersion"], "12");
            assert_eq!(body["status"]["phase"], "Ready");
        });

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn status_patch_of_a_deleted_object_is_dropped() {
        let rev = observed_revision();
        let (client, mut server) = fixtures::client();
        let api: Api<Revision> = Api::namespaced(client, "serving");

        let patch = json!({});
        let (result, ()) = tokio::join!(patch_status(&api, &rev, &patch), async {
            server
                .expect(
                    Method::PATCH,
                    REVISION_STATUS,
                    StatusCode::NOT_FOUND,
                    api_error(StatusCode::NOT_FOUND, "NotFound"),
                )
                .await;
        });

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn status_patch_conflict_is_surfaced_as_a_conflict() {
        let rev = observed_revision();
        let (client, mut server) = fixtures::client();
        let api: Api<Revision> = Api::namespaced(client, "serving");

        let patch = json!({});
        let (result, ()) = tokio::join!(patch_status(&api, &rev, &patch), async {
            server
                .expect(
                    Method::PATCH,
                    REVISION_STATUS,
                    StatusCode::CONFLICT,
                    api_error(StatusCode::CONFLICT, "Conflict"),
                )
                .await;
        });

        assert!(result.is_err_and(|err| err.is_conflict()));
    }

    #[tokio::test]
    async fn conflicts_requeue_without_backoff_or_events() {
        let rev = observed_revision();
        let (client, server) = fixtures::client();
        let api: Api<Revision> = Api::namespaced(client.clone(), "serving");
        let recorder = Recorder::new(client, FIELD_MANAGER.to_string().into());
        let backoff = ErrorBackoff::new(RetryPolicy::default());
        let conflict = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }));

        let err = finish(&rev, &api, Err(conflict), &recorder, &Metrics::default(), &backoff)
            .await
            .unwrap_err();

        assert_eq!(backoff.attempts(&ErrorBackoff::key(&rev)), 0);
        assert_eq!(
            requeue_on_error(&rev, &err, &backoff),
            Action::requeue(CONFLICT_REQUEUE)
        );
        drop((api, recorder));
        server.done().await;
    }

    #[tokio::test]
    async fn spent_retry_budget_turns_ready_false() {
        let rev = observed_revision();
        let (client, mut server) = fixtures::client();
        let api: Api<Revision> = Api::namespaced(client.clone(), "serving");
        let recorder = Recorder::new(client, FIELD_MANAGER.to_string().into());
        let backoff = ErrorBackoff::new(RetryPolicy {
            budget: 1,
            ..Default::default()
        });

        let metrics = Metrics::default();
        let (result, ()) = tokio::join!(
            finish(&rev, &api, Err(server_error()), &recorder, &metrics, &backoff),
            async {
                let event = server.expect_event("serving").await;
                assert_eq!(event["reason"], "FailedReconcile");
                assert_eq!(event["type"], "Warning");

                let body = server
                    .expect(
                        Method::PATCH,
                        REVISION_STATUS,
                        StatusCode::OK,
                        serde_json::to_value(&rev).unwrap(),
                    )
                    .await;
                assert_eq!(body["metadata"]["resourceVersion"], "12");
                let conditions = body["status"]["conditions"].as_array().unwrap();
                assert_eq!(conditions.len(), 1);
                assert_eq!(conditions[0]["type"], READY);
                assert_eq!(conditions[0]["status"], "False");
                assert_eq!(conditions[0]["reason"], RETRY_BUDGET_EXCEEDED);
            }
        );

        assert!(result.is_err());
        assert_eq!(backoff.attempts(&ErrorBackoff::key(&rev)), 1);

        // the next success forgets the failures
        let action = finish(
            &rev,
            &api,
            Ok(Action::await_change()),
            &recorder,
            &Metrics::default(),
            &backoff,
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(backoff.attempts(&ErrorBackoff::key(&rev)), 0);
    }

    #[test]
    fn deleted_objects_lose_their_failure_count() {
        let backoff = Arc::new(ErrorBackoff::new(RetryPolicy::default()));
        let rev = revision("hello-00001");
        let key = ErrorBackoff::key(&rev);
        backoff.record_failure(&key);
        backoff.record_failure(&key);

        let mut on_event = forget_deleted::<Revision, ()>(&backoff);
        on_event(&Ok(watcher::Event::Apply(rev.clone())));
        assert_eq!(backoff.attempts(&key), 2);

        on_event(&Ok(watcher::Event::Delete(rev)));
        assert_eq!(backoff.attempts(&key), 0);
    }
}
