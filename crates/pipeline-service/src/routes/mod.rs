//! Pipeline composition.
//!
//! Wraps the downstream router in a fixed order, outermost first:
//!
//! ```text
//! global middleware → http_metrics → panic_guard → trace_context
//!     → service middleware (optional) → downstream router
//! ```
//!
//! Metrics observe total latency including panic recovery. The panic guard
//! sits outside tracing so a tracing failure cannot crash the request, and
//! trace context / mesh metadata run closest to the router.
//!
//! Auxiliary endpoints are mounted on an outer router and are served without
//! passing through the pipeline. Everything else falls through to the
//! wrapped downstream router:
//! - `/health/check` - aggregated health report
//! - `/metrics` - Prometheus exposition
//! - `/version` - build info and uptime
//! - `/debug/pprof/*` - diagnostics, only when enabled

use axum::{middleware, routing::get, Router};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::Tracer;
use std::sync::Arc;
use std::time::Instant;

use crate::handlers::{self, debug, VersionState};
use crate::health::HealthAggregator;
use crate::middleware::{
    http_metrics_middleware, panic_guard_middleware, trace_context_middleware, TraceInterceptor,
};
use crate::observability::MetricsCollector;
use crate::reporting::{ErrorReporter, LogReporter};
use crate::version::BuildInfo;

/// Optional capability of the downstream service: wrapping its own router
/// before the pipeline is applied around it.
pub trait ServiceMiddleware: Send + Sync {
    fn wrap(&self, router: Router) -> Router;
}

type GlobalMiddleware = Box<dyn FnOnce(Router) -> Router + Send>;

/// Builds the request pipeline around a downstream router.
pub struct PipelineBuilder {
    build_info: BuildInfo,
    metrics: Arc<MetricsCollector>,
    health: HealthAggregator,
    reporter: Arc<dyn ErrorReporter>,
    interceptor: TraceInterceptor,
    pprof_enabled: bool,
    global_middleware: Option<GlobalMiddleware>,
    service_middleware: Option<Arc<dyn ServiceMiddleware>>,
}

impl PipelineBuilder {
    /// Start a pipeline with no health checkers, a log-only error reporter,
    /// W3C trace context propagation and diagnostics disabled.
    pub fn new(build_info: BuildInfo, metrics: Arc<MetricsCollector>) -> Self {
        let health = HealthAggregator::new(&build_info);
        Self {
            build_info,
            metrics,
            health,
            reporter: Arc::new(LogReporter),
            interceptor: TraceInterceptor::default(),
            pprof_enabled: false,
            global_middleware: None,
            service_middleware: None,
        }
    }

    /// Use a health aggregator with its checkers already registered.
    pub fn health(mut self, health: HealthAggregator) -> Self {
        self.health = health;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.interceptor = self.interceptor.with_propagator(propagator);
        self
    }

    /// Start request spans with `tracer` instead of the global provider's.
    pub fn tracer<T>(mut self, tracer: T) -> Self
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        self.interceptor = self.interceptor.with_tracer(tracer);
        self
    }

    pub fn pprof_enabled(mut self, enabled: bool) -> Self {
        self.pprof_enabled = enabled;
        self
    }

    /// Outermost hook around the whole pipeline (identity by default).
    pub fn global_middleware(
        mut self,
        middleware: impl FnOnce(Router) -> Router + Send + 'static,
    ) -> Self {
        self.global_middleware = Some(Box::new(middleware));
        self
    }

    pub fn service_middleware(mut self, middleware: Arc<dyn ServiceMiddleware>) -> Self {
        self.service_middleware = Some(middleware);
        self
    }

    /// Compose the pipeline around `router` and mount the auxiliary endpoints.
    pub fn build(self, router: Router) -> Router {
        let started_at = Instant::now();

        let router = match &self.service_middleware {
            Some(service) => service.wrap(router),
            None => router,
        };

        // Layer order (bottom-to-top execution):
        // 1. trace_context - mesh metadata and span (innermost)
        // 2. panic_guard - contain downstream panics
        // 3. http_metrics - record ALL responses, including recovered panics
        let pipeline = router
            .layer(middleware::from_fn_with_state(
                Arc::new(self.interceptor),
                trace_context_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                self.reporter,
                panic_guard_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                self.metrics.clone(),
                http_metrics_middleware,
            ));

        let pipeline = match self.global_middleware {
            Some(global) => global(pipeline),
            None => pipeline,
        };

        let health_routes = Router::new()
            .route("/health/check", get(handlers::health_check))
            .with_state(Arc::new(self.health));

        let metrics_routes = Router::new()
            .route("/metrics", get(handlers::metrics_handler))
            .with_state(self.metrics.clone());

        let version_routes = Router::new()
            .route("/version", get(handlers::version_handler))
            .with_state(Arc::new(VersionState {
                build_info: self.build_info,
                started_at,
            }));

        let mut aux = health_routes.merge(metrics_routes).merge(version_routes);

        if self.pprof_enabled {
            tracing::info!(prefix = debug::DEBUG_PREFIX, "Diagnostic endpoints enabled");
            aux = aux.merge(debug_routes(self.metrics));
        }

        aux.fallback_service(pipeline)
    }
}

fn debug_routes(metrics: Arc<MetricsCollector>) -> Router {
    Router::new()
        .route("/debug/pprof/", get(debug::index))
        .route("/debug/pprof/cmdline", get(debug::cmdline))
        .route("/debug/pprof/process", get(debug::process))
        .route("/debug/pprof/runtime", get(debug::runtime))
        .with_state(metrics)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::health::{CheckError, FnChecker};
    use crate::middleware::{Mesh, MeshMetadata, RequestSpan};
    use pipeline_test_utils::metric_sample as sample;
    use crate::reporting::{PanicReport, SentryReporter};
    use axum::{
        body::Body,
        extract::Request,
        http::{HeaderValue, Request as HttpRequest, StatusCode},
        response::Response,
        Json,
    };
    use http_body_util::BodyExt;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
    use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    #[derive(Default)]
    struct CountingReporter {
        count: AtomicUsize,
    }

    impl ErrorReporter for CountingReporter {
        fn report(&self, _report: &PanicReport) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn panicking() -> &'static str {
        panic!("downstream failure");
    }

    async fn mesh(Mesh(mesh): Mesh) -> Json<MeshMetadata> {
        Json(mesh)
    }

    async fn traced(request: Request) -> String {
        request
            .extensions()
            .get::<RequestSpan>()
            .map(|span| span.name.clone())
            .unwrap_or_default()
    }

    fn downstream() -> Router {
        Router::new()
            .route("/api/ping", get(|| async { "pong" }))
            .route("/api/panic", get(panicking))
            .route("/api/mesh", get(mesh))
            .route("/api/orders/:id", get(traced))
    }

    fn collector() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::builder("test").build().unwrap())
    }

    fn build_info() -> BuildInfo {
        BuildInfo::new("test", "1.0.0", "build-time")
    }

    async fn get_request(app: &Router, uri: &str) -> Response {
        let request = HttpRequest::builder().uri(uri).body(Body::empty()).unwrap();
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_panic_yields_one_500_one_report_one_sample() {
        let metrics = collector();
        let reporter = Arc::new(CountingReporter::default());
        let app = PipelineBuilder::new(build_info(), metrics.clone())
            .reporter(reporter.clone())
            .build(downstream());

        let response = get_request(&app, "/api/panic").await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reporter.count.load(Ordering::SeqCst), 1);
        let labels = [("code", "500"), ("method", "GET"), ("handler", "GET /api/panic")];
        assert_eq!(sample(&metrics.render(), "test_rest_requests_total", &labels), Some(1.0));
    }

    #[test]
    fn test_panic_through_pipeline_captures_one_sentry_event() {
        let metrics = collector();
        let app = PipelineBuilder::new(build_info(), metrics.clone())
            .reporter(Arc::new(SentryReporter))
            .build(downstream());

        // The test hub is thread-local, so the request runs on this thread.
        let events = sentry::test::with_captured_events(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let response = runtime.block_on(get_request(&app, "/api/panic"));
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message.as_deref(), Some("downstream failure"));
        assert_eq!(events[0].transaction.as_deref(), Some("GET /api/panic"));
        let labels = [("code", "500"), ("handler", "GET /api/panic")];
        assert_eq!(sample(&metrics.render(), "test_rest_requests_total", &labels), Some(1.0));
    }

    #[tokio::test]
    async fn test_builder_tracer_records_request_spans() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let app = PipelineBuilder::new(build_info(), collector())
            .tracer(provider.tracer("pipeline-test"))
            .build(downstream());
        let request = HttpRequest::builder()
            .uri("/api/orders/77777777")
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let _ = provider.force_flush();
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "GET /api/orders/:id");
        assert_eq!(spans[0].parent_span_id.to_string(), "00f067aa0ba902b7");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_all_counted() {
        let metrics = collector();
        let app = PipelineBuilder::new(build_info(), metrics.clone()).build(downstream());

        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { get_request(&app, "/api/ping").await.status() })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), StatusCode::OK);
        }

        let labels = [("code", "200"), ("handler", "GET /api/ping")];
        assert_eq!(
            sample(&metrics.render(), "test_rest_requests_total", &labels),
            Some(1000.0)
        );
    }

    #[tokio::test]
    async fn test_mesh_metadata_visible_to_downstream() {
        let app = PipelineBuilder::new(build_info(), collector()).build(downstream());
        let request = HttpRequest::builder()
            .uri("/api/mesh")
            .header("X-Service-Region", "eu")
            .header("X-Service-Tenant", "acme")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json, serde_json::json!({ "region": "eu", "tenant": "acme" }));
    }

    #[tokio::test]
    async fn test_trace_span_named_by_route_identity() {
        let app = PipelineBuilder::new(build_info(), collector()).build(downstream());
        let request = HttpRequest::builder()
            .uri("/api/orders/77777777")
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(body_bytes(response).await, b"GET /api/orders/:id");
    }

    #[tokio::test]
    async fn test_bad_trace_header_still_succeeds() {
        let app = PipelineBuilder::new(build_info(), collector()).build(downstream());
        let request = HttpRequest::builder()
            .uri("/api/orders/77777777")
            .header("traceparent", "garbage")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_path_counted_with_normalized_identity() {
        let metrics = collector();
        let app = PipelineBuilder::new(build_info(), metrics.clone()).build(downstream());

        let response = get_request(&app, "/api/items12345/detail").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let labels = [("code", "404"), ("handler", "GET /api/{param}/detail")];
        assert_eq!(sample(&metrics.render(), "test_rest_requests_total", &labels), Some(1.0));
    }

    #[tokio::test]
    async fn test_auxiliary_endpoints_bypass_pipeline() {
        let metrics = collector();
        let app = PipelineBuilder::new(build_info(), metrics.clone()).build(downstream());

        assert_eq!(get_request(&app, "/version").await.status(), StatusCode::OK);
        assert_eq!(get_request(&app, "/health/check").await.status(), StatusCode::OK);
        assert_eq!(get_request(&app, "/metrics").await.status(), StatusCode::OK);

        let rendered = metrics.render();
        assert_eq!(sample(&rendered, "test_rest_requests_total", &[]), None, "{rendered}");
    }

    #[tokio::test]
    async fn test_health_endpoint_reflects_checkers() {
        let mut health = HealthAggregator::with_host(&build_info(), "host");
        health.register(FnChecker::new("ok", || async { Ok(()) }));
        health.register(FnChecker::new("down", || async {
            Err::<(), CheckError>("unreachable".into())
        }));
        let app = PipelineBuilder::new(build_info(), collector())
            .health(health)
            .build(downstream());

        let response = get_request(&app, "/health/check").await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["checks"][1]["error"], "unreachable");
    }

    #[tokio::test]
    async fn test_version_endpoint_reports_build_info() {
        let app = PipelineBuilder::new(build_info(), collector()).build(downstream());

        let response = get_request(&app, "/version").await;

        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["app"], "test");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["buildTime"], "build-time");
        assert!(json["upTime"].as_str().unwrap().ends_with('s'));
    }

    #[tokio::test]
    async fn test_debug_endpoints_gated_by_flag() {
        let disabled = PipelineBuilder::new(build_info(), collector()).build(downstream());
        assert_eq!(
            get_request(&disabled, "/debug/pprof/cmdline").await.status(),
            StatusCode::NOT_FOUND
        );

        let enabled = PipelineBuilder::new(build_info(), collector())
            .pprof_enabled(true)
            .build(downstream());
        assert_eq!(get_request(&enabled, "/debug/pprof/").await.status(), StatusCode::OK);
        assert_eq!(
            get_request(&enabled, "/debug/pprof/cmdline").await.status(),
            StatusCode::OK
        );
        assert_eq!(
            get_request(&enabled, "/debug/pprof/runtime").await.status(),
            StatusCode::OK
        );
    }

    struct TagResponses;

    impl ServiceMiddleware for TagResponses {
        fn wrap(&self, router: Router) -> Router {
            router.layer(middleware::map_response(|mut response: Response| async move {
                response
                    .headers_mut()
                    .insert("x-service-wrapped", HeaderValue::from_static("1"));
                response
            }))
        }
    }

    #[tokio::test]
    async fn test_service_middleware_wraps_router() {
        let app = PipelineBuilder::new(build_info(), collector())
            .service_middleware(Arc::new(TagResponses))
            .build(downstream());

        let response = get_request(&app, "/api/ping").await;
        assert_eq!(response.headers().get("x-service-wrapped").unwrap(), "1");

        let aux = get_request(&app, "/version").await;
        assert!(aux.headers().get("x-service-wrapped").is_none());
    }

    #[tokio::test]
    async fn test_global_middleware_is_outermost() {
        let app = PipelineBuilder::new(build_info(), collector())
            .global_middleware(|router| {
                router.layer(middleware::map_request(|request: Request| async move {
                    // Runs before the metrics layer resolves the identity.
                    assert!(request
                        .extensions()
                        .get::<crate::observability::RouteIdentity>()
                        .is_none());
                    request
                }))
            })
            .build(downstream());

        assert_eq!(get_request(&app, "/api/ping").await.status(), StatusCode::OK);
    }
}
