use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::client::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Metrics;

pub mod configuration;
pub mod reconciler;
pub mod revision;
pub mod route;
pub mod service;

#[cfg(test)]
pub(crate) mod fixtures;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Exponential backoff applied to reconciles that failed with a retryable error
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which the resource is reported as Failed
    pub budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            budget: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-based) attempt is retried
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Operator wide settings
#[derive(Clone, Debug)]
pub struct Settings {
    /// Suffix appended to `<route>.<namespace>` to form the external domain of a Route
    pub domain_suffix: String,
    /// Number of newest Revisions a Configuration keeps regardless of references
    pub retained_revisions: usize,
    /// How long a Revision may stay Building before it is reported as Failed
    pub progress_deadline: Duration,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            domain_suffix: "example.com".into(),
            retained_revisions: 10,
            progress_deadline: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    settings: Settings,
}

impl Default for State {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: Settings) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            settings,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

/// Run all four controllers until shutdown
pub async fn run(client: Client, state: State) -> Result<(), prometheus::Error> {
    let metrics = Metrics::default().register(&state.registry)?;

    tokio::join!(
        revision::run(client.clone(), metrics.clone(), state.clone()),
        configuration::run(client.clone(), metrics.clone(), state.clone()),
        route::run(client.clone(), metrics.clone(), state.clone()),
        service::run(client, metrics, state),
    );

    Ok(())
}
