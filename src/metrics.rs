use crate::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "serving_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "serving_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("serving_operator_reconciliations_total", "reconciliations").unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    /// Count a failed reconcile of `obj`, labelled by kind, `namespace/name` and error class
    pub fn reconcile_failure<K: kube::Resource<DynamicType = ()>>(&self, obj: &K, e: &Error) {
        let instance = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
        self.failures
            .with_label_values(&[K::kind(&()).as_ref(), instance.as_str(), e.metric_label()])
            .inc()
    }

    pub fn count_and_measure<K: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<K> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<K: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<K>,
}

impl<K: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<K> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[K::kind(&()).as_ref()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::routes::Route;

    #[test]
    fn failures_are_labelled_per_object_and_error() {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();

        let mut route = Route::new("hello", Default::default());
        route.metadata.namespace = Some("serving".into());

        let err = Error::invalid_spec("InvalidPercentSum", "sum is 90");
        metrics.reconcile_failure(&route, &err);
        metrics.reconcile_failure(&route, &err);

        let count = metrics
            .failures
            .with_label_values(&["Route", "serving/hello", "InvalidSpec"])
            .get();
        assert_eq!(count, 2);
    }

    #[test]
    fn measured_reconciles_are_counted() {
        let metrics = Metrics::default();
        drop(metrics.count_and_measure::<Route>());

        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .reconcile_duration
                .with_label_values(&["Route"])
                .get_sample_count(),
            1
        );
    }
}
