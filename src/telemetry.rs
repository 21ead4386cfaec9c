use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Name reported to the trace collector
const SERVICE_NAME: &str = "serving-operator";

/// Environment variable holding the OTLP collector endpoint
#[cfg(feature = "telemetry")]
const ENDPOINT_ENV: &str = "OPENTELEMETRY_ENDPOINT_URL";

/// Trace id of the current span, if it belongs to a sampled trace.
///
/// Reconcilers record it on their span so log lines can be joined with the exported trace.
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    let context = tracing::Span::current().context();
    let trace_id = context.span().span_context().trace_id();
    (trace_id != TraceId::INVALID).then_some(trace_id)
}

#[cfg(feature = "telemetry")]
fn tracer_provider() -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    use anyhow::Context as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

    let endpoint = std::env::var(ENDPOINT_ENV)
        .with_context(|| format!("{ENDPOINT_ENV} must point at an OTLP trace collector"))?;

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("Failed to build the OTLP span exporter")?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build())
}

/// `RUST_LOG` when set, `default_filter` otherwise
fn env_filter(default_filter: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_filter)?),
    }
}

/// Install the global subscriber: compact logs, plus OTLP export with the `telemetry` feature
pub fn init(default_filter: &str) -> anyhow::Result<()> {
    let logger = tracing_subscriber::fmt::layer().compact();
    let filter = env_filter(default_filter)?;

    #[cfg(feature = "telemetry")]
    let subscriber = {
        use opentelemetry::trace::TracerProvider as _;
        let provider = tracer_provider()?;
        let tracer = provider.tracer(SERVICE_NAME);
        // the global provider keeps the exporter alive
        opentelemetry::global::set_tracer_provider(provider);
        Registry::default()
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(logger)
            .with(filter)
    };
    #[cfg(not(feature = "telemetry"))]
    let subscriber = Registry::default().with(logger).with(filter);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_trace_id_outside_of_a_trace() {
        assert_eq!(get_trace_id(), None);
    }

    #[test]
    fn invalid_default_filter_is_an_error() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("serving_operator=notalevel").is_err());
            assert!(env_filter("serving_operator=debug").is_ok());
        }
    }

    // needs OPENTELEMETRY_ENDPOINT_URL pointing at a reachable collector
    #[cfg(feature = "telemetry")]
    #[test]
    #[ignore = "requires a trace exporter"]
    fn reconcile_spans_carry_a_trace_id() {
        init("info").unwrap();
        #[tracing::instrument(name = "reconcile")]
        fn traced() -> Option<TraceId> {
            get_trace_id()
        }
        assert!(traced().is_some());
    }
}
