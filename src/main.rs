use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

use serving_operator::{controllers, telemetry, RetryPolicy, Settings, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Suffix of the external domain of every Route, `<route>.<namespace>.<suffix>`
    #[arg(
        long = "domain-suffix",
        env = "SERVING_DOMAIN_SUFFIX",
        default_value = "example.com"
    )]
    domain_suffix: String,

    /// Number of newest Revisions each Configuration keeps even when no Route references them
    #[arg(
        long = "retained-revisions",
        env = "SERVING_RETAINED_REVISIONS",
        default_value_t = 10
    )]
    retained_revisions: usize,

    /// How long a Revision may stay Building before it is marked Failed
    #[arg(
        long = "progress-deadline-seconds",
        env = "SERVING_PROGRESS_DEADLINE_SECONDS",
        default_value_t = 600
    )]
    progress_deadline_seconds: u64,

    #[arg(
        long = "retry-initial-delay-seconds",
        env = "SERVING_RETRY_INITIAL_DELAY_SECONDS",
        default_value_t = 5
    )]
    retry_initial_delay_seconds: u64,

    #[arg(
        long = "retry-max-delay-seconds",
        env = "SERVING_RETRY_MAX_DELAY_SECONDS",
        default_value_t = 300
    )]
    retry_max_delay_seconds: u64,

    /// Consecutive failed reconciles after which a resource is reported as not Ready
    #[arg(long = "retry-budget", env = "SERVING_RETRY_BUDGET", default_value_t = 10)]
    retry_budget: u32,

    #[arg(
        long = "bind-address",
        env = "SERVING_BIND_ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    bind_address: String,
}

impl Arguments {
    fn settings(&self) -> Settings {
        Settings {
            domain_suffix: self.domain_suffix.clone(),
            retained_revisions: self.retained_revisions,
            progress_deadline: Duration::from_secs(self.progress_deadline_seconds),
            retry: RetryPolicy {
                initial_delay: Duration::from_secs(self.retry_initial_delay_seconds),
                max_delay: Duration::from_secs(self.retry_max_delay_seconds),
                budget: self.retry_budget,
            },
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info")?;

    let args: Arguments = Arguments::parse();
    info!(?args, "Starting serving-operator");

    // Initiatilize Kubernetes controller state
    let state = State::new(args.settings());
    let client = Client::try_default().await?;
    let controller = controllers::run(client, state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    controller?;
    server?;
    Ok(())
}
