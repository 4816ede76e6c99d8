//! Pipeline Service
//!
//! Reference entry point: serves a demo router behind the request pipeline
//! with health, metrics, version and optional diagnostic endpoints.

use axum::{routing::get, Router};
use pipeline_service::config::{env_prefix, Config};
use pipeline_service::errors::PipelineError;
use pipeline_service::health::{FnChecker, HealthAggregator};
use pipeline_service::observability::logging::init_logging;
use pipeline_service::observability::MetricsCollector;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::TracerProvider;
use pipeline_service::middleware::TRACER_NAME;
use pipeline_service::reporting::init_error_tracking;
use pipeline_service::version::BuildInfo;
use pipeline_service::PipelineBuilder;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let build_info = BuildInfo::current();
    let config = Config::from_env(&env_prefix(&build_info.app))?;

    init_logging(&config.environment)?;

    info!(
        app = %build_info.app,
        version = %build_info.version,
        config = ?config,
        "Starting Pipeline Service"
    );

    let metrics = Arc::new(MetricsCollector::builder(&build_info.app).build().map_err(|e| {
        error!(error = %e, "Failed to build metrics collector");
        e
    })?);

    let mut health = HealthAggregator::new(&build_info);
    health.register(FnChecker::new("liveness", || async { Ok(()) }));

    // Held until main returns so queued events are flushed on shutdown
    let error_tracking = init_error_tracking(
        config.sentry_dsn.as_deref(),
        &config.environment,
        &build_info.version,
    )
    .map_err(|e| {
        error!(error = %e, "Failed to initialise error tracking");
        e
    })?;
    info!(enabled = error_tracking.is_enabled(), "Error tracking initialised");

    // Spans are recorded without an exporter so ids correlate with logs
    let tracer_provider = TracerProvider::builder().build();

    let app = PipelineBuilder::new(build_info, metrics)
        .health(health)
        .reporter(error_tracking.reporter())
        .tracer(tracer_provider.tracer(TRACER_NAME))
        .pprof_enabled(config.pprof_enabled)
        .global_middleware(|router| router.layer(TraceLayer::new_for_http()))
        .build(demo_routes());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_bind_port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        e
    })?;
    info!(addr = %addr, "Pipeline Service listening");

    let shutdown_token = CancellationToken::new();
    let server_token = shutdown_token.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result?;
            info!("Pipeline Service stopped");
            return Ok(());
        }
        () = shutdown_signal() => {}
    }

    shutdown_token.cancel();
    let graceful_timeout = config.graceful_timeout();
    info!(
        timeout_seconds = graceful_timeout.as_secs(),
        "Draining in-flight requests"
    );

    match tokio::time::timeout(graceful_timeout, server).await {
        Ok(result) => result?,
        Err(_) => warn!("Graceful shutdown timed out, dropping remaining connections"),
    }

    info!("Pipeline Service shutdown complete");
    Ok(())
}

fn demo_routes() -> Router {
    Router::new().route("/api/v1/ping", get(|| async { "pong" }))
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = on_signal("SIGINT", signal::ctrl_c());

    #[cfg(unix)]
    let terminate = on_signal("SIGTERM", async {
        let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        stream.recv().await;
        Ok::<(), std::io::Error>(())
    });

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Resolves once `listener` reports its signal. A listener that cannot be installed
/// never resolves, so the other signal still governs shutdown.
async fn on_signal(name: &str, listener: impl Future<Output = std::io::Result<()>>) {
    match listener.await {
        Ok(()) => info!("Received {}, starting graceful shutdown...", name),
        Err(e) => {
            error!("Failed to listen for {}: {}", name, e);
            std::future::pending::<()>().await;
        }
    }
}
