//! Distributed trace context propagation.
//!
//! The interceptor sits closest to the router. For every request it:
//!
//! 1. attaches `MeshMetadata` (always, possibly empty);
//! 2. extracts a remote parent context through the configured
//!    `TextMapPropagator` (W3C `traceparent` by default);
//! 3. if the parent is valid, starts a child span named by the
//!    `RouteIdentity`, attaches it to the request and ends it when the
//!    downstream call completes or is dropped. When the downstream call
//!    panics, the span is closed with an error status and the panic is
//!    resumed for the panic guard.
//!
//! A missing or malformed trace header only means no span is created.
//!
//! Spans go to the tracer injected with `with_tracer`, falling back to the
//! globally installed provider (a no-op unless the host sets one).

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::{SpanId, Status, TraceContextExt, TraceId, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::Instrument;

use crate::middleware::mesh::MeshMetadata;
use crate::observability::RouteIdentity;

/// Instrumentation scope name used for spans started by the interceptor.
pub const TRACER_NAME: &str = "pipeline-service";

/// Request-scoped description of the span started for a traced request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpan {
    pub name: String,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Span id of the remote parent taken from the incoming headers.
    pub parent_span_id: SpanId,
    pub started_at: SystemTime,
}

/// Trace context extraction and span creation shared by all requests.
pub struct TraceInterceptor {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    tracer: BoxedTracer,
}

impl TraceInterceptor {
    /// Use the given propagator and the globally configured tracer provider.
    pub fn new(propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        Self {
            propagator,
            tracer: global::tracer(TRACER_NAME),
        }
    }

    /// Replace the propagator used to read the remote parent.
    pub fn with_propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.propagator = propagator;
        self
    }

    /// Start spans with `tracer` instead of the global provider's tracer.
    pub fn with_tracer<T>(mut self, tracer: T) -> Self
    where
        T: Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        self.tracer = BoxedTracer::new(Box::new(tracer));
        self
    }

    /// Extract the remote parent context, if the headers carry a valid one.
    pub fn extract_parent(&self, headers: &HeaderMap) -> Option<Context> {
        let cx = self.propagator.extract(&HeaderExtractor(headers));
        if cx.span().span_context().is_valid() {
            Some(cx)
        } else {
            None
        }
    }

    fn start_span(&self, parent: &Context, route: &RouteIdentity, method: &str) -> (Context, RequestSpan) {
        let parent_span_id = parent.span().span_context().span_id();
        let started_at = SystemTime::now();

        let span = self.tracer.start_with_context(route.to_string(), parent);
        let cx = parent.with_span(span);
        cx.span()
            .set_attribute(KeyValue::new("http.request.method", method.to_string()));

        let span_context = cx.span().span_context().clone();
        let request_span = RequestSpan {
            name: route.to_string(),
            trace_id: span_context.trace_id(),
            span_id: span_context.span_id(),
            parent_span_id,
            started_at,
        };

        (cx, request_span)
    }
}

impl Default for TraceInterceptor {
    fn default() -> Self {
        Self::new(Arc::new(TraceContextPropagator::new()))
    }
}

/// Reads propagation fields out of request headers.
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Ends the span when the downstream call completes, panics or is cancelled.
struct SpanGuard(Context);

impl SpanGuard {
    fn fail(&self, description: &'static str) {
        self.0.span().set_status(Status::error(description));
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.0.span().end();
    }
}

/// Middleware attaching mesh metadata and, when possible, a child span.
pub async fn trace_context_middleware(
    State(interceptor): State<Arc<TraceInterceptor>>,
    request: Request,
    next: Next,
) -> Response {
    let route = RouteIdentity::for_request(&request);
    let (mut parts, body) = request.into_parts();

    parts
        .extensions
        .insert(MeshMetadata::from_headers(&parts.headers));

    let Some(parent) = interceptor.extract_parent(&parts.headers) else {
        tracing::trace!(target: "pipeline.tracing", route = %route, "No trace context, span skipped");
        return next.run(Request::from_parts(parts, body)).await;
    };

    let (cx, request_span) = interceptor.start_span(&parent, &route, parts.method.as_str());
    let log_span = tracing::info_span!(
        "request",
        route = %route,
        trace_id = %request_span.trace_id,
        span_id = %request_span.span_id,
    );

    parts.extensions.insert(cx.clone());
    parts.extensions.insert(request_span);
    let guard = SpanGuard(cx);

    let outcome = AssertUnwindSafe(next.run(Request::from_parts(parts, body)).instrument(log_span))
        .catch_unwind()
        .await;

    match outcome {
        Ok(response) => response,
        Err(payload) => {
            // Close the span as failed, then let the panic guard answer.
            guard.fail("panic in request handler");
            drop(guard);
            std::panic::resume_unwind(payload)
        }
    }
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
    use crate::middleware::mesh::Mesh;
    use crate::middleware::panic_guard_middleware;
    use crate::reporting::{ErrorReporter, LogReporter};
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Json, Router,
    };
    use http_body_util::BodyExt;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::export::trace::SpanData;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
    use opentelemetry_sdk::trace::TracerProvider;
    use tower::ServiceExt;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const PARENT_ID: &str = "00f067aa0ba902b7";

    async fn span_echo(request: Request) -> Json<serde_json::Value> {
        let span = request.extensions().get::<RequestSpan>().cloned();
        let mesh = request.extensions().get::<MeshMetadata>().cloned();
        Json(serde_json::json!({
            "span": span.map(|s| serde_json::json!({
                "name": s.name,
                "trace_id": s.trace_id.to_string(),
                "span_id": s.span_id.to_string(),
                "parent_span_id": s.parent_span_id.to_string(),
            })),
            "mesh": mesh,
        }))
    }

    async fn mesh_echo(Mesh(mesh): Mesh) -> Json<MeshMetadata> {
        Json(mesh)
    }

    fn test_app() -> Router {
        let interceptor = Arc::new(TraceInterceptor::default());
        Router::new()
            .route("/orders/:id", get(span_echo))
            .route("/mesh", get(mesh_echo))
            .layer(middleware::from_fn_with_state(interceptor, trace_context_middleware))
    }

    async fn call(request: HttpRequest<Body>) -> serde_json::Value {
        let response = test_app().oneshot(request).await.unwrap();
        assert!(response.status().is_success());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_valid_traceparent_creates_child_span() {
        let request = HttpRequest::builder()
            .uri("/orders/12345678")
            .header("traceparent", format!("00-{TRACE_ID}-{PARENT_ID}-01"))
            .body(Body::empty())
            .unwrap();

        let body = call(request).await;

        assert_eq!(body["span"]["name"], "GET /orders/:id");
        assert_eq!(body["span"]["trace_id"], TRACE_ID);
        assert_eq!(body["span"]["parent_span_id"], PARENT_ID);
    }

    #[tokio::test]
    async fn test_absent_traceparent_skips_span() {
        let request = HttpRequest::builder()
            .uri("/orders/12345678")
            .body(Body::empty())
            .unwrap();

        let body = call(request).await;

        assert!(body["span"].is_null());
        assert_eq!(body["mesh"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_malformed_traceparent_skips_span() {
        let request = HttpRequest::builder()
            .uri("/orders/12345678")
            .header("traceparent", "not-a-trace-header")
            .body(Body::empty())
            .unwrap();

        let body = call(request).await;

        assert!(body["span"].is_null());
    }

    #[tokio::test]
    async fn test_mesh_metadata_reaches_handler_without_trace() {
        let request = HttpRequest::builder()
            .uri("/mesh")
            .header("X-Service-Region", "eu")
            .header("X-Service-Tenant", "acme")
            .body(Body::empty())
            .unwrap();

        let body = call(request).await;

        assert_eq!(body, serde_json::json!({ "region": "eu", "tenant": "acme" }));
    }

    #[tokio::test]
    async fn test_mesh_metadata_reaches_handler_with_trace() {
        let request = HttpRequest::builder()
            .uri("/orders/12345678")
            .header("traceparent", format!("00-{TRACE_ID}-{PARENT_ID}-01"))
            .header("X-Service-Region", "eu")
            .body(Body::empty())
            .unwrap();

        let body = call(request).await;

        assert_eq!(body["mesh"], serde_json::json!({ "region": "eu" }));
        assert!(!body["span"].is_null());
    }

    /// Interceptor exporting finished spans into memory. The provider must be
    /// kept alive for as long as spans are expected.
    fn recording_interceptor() -> (TraceInterceptor, TracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let interceptor = TraceInterceptor::default().with_tracer(provider.tracer(TRACER_NAME));
        (interceptor, provider, exporter)
    }

    async fn boom() -> &'static str {
        panic!("handler exploded");
    }

    fn recorded_app(interceptor: TraceInterceptor) -> Router {
        let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);
        Router::new()
            .route("/orders/:id", get(span_echo))
            .route("/boom", get(boom))
            .layer(middleware::from_fn_with_state(
                Arc::new(interceptor),
                trace_context_middleware,
            ))
            .layer(middleware::from_fn_with_state(reporter, panic_guard_middleware))
    }

    fn traced_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("traceparent", format!("00-{TRACE_ID}-{PARENT_ID}-01"))
            .body(Body::empty())
            .unwrap()
    }

    fn finished_spans(provider: &TracerProvider, exporter: &InMemorySpanExporter) -> Vec<SpanData> {
        let _ = provider.force_flush();
        exporter.get_finished_spans().unwrap()
    }

    #[tokio::test]
    async fn test_child_span_is_exported_and_linked_to_parent() {
        let (interceptor, provider, exporter) = recording_interceptor();

        let response = recorded_app(interceptor)
            .oneshot(traced_request("/orders/12345678"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        let spans = finished_spans(&provider, &exporter);
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "GET /orders/:id");
        assert_eq!(span.span_context.trace_id().to_string(), TRACE_ID);
        assert_eq!(span.parent_span_id.to_string(), PARENT_ID);
        assert_ne!(span.span_context.span_id().to_string(), PARENT_ID);
        assert_eq!(span.status, Status::Unset);

        // The handler saw the child span, not the remote parent
        assert_eq!(body["span"]["span_id"], span.span_context.span_id().to_string());
        assert_eq!(body["span"]["parent_span_id"], PARENT_ID);
    }

    #[tokio::test]
    async fn test_span_is_ended_with_error_when_handler_panics() {
        let (interceptor, provider, exporter) = recording_interceptor();

        let response = recorded_app(interceptor)
            .oneshot(traced_request("/boom"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let spans = finished_spans(&provider, &exporter);
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "GET /boom");
        assert_eq!(span.parent_span_id.to_string(), PARENT_ID);
        assert!(matches!(span.status, Status::Error { .. }), "{:?}", span.status);
    }

    #[tokio::test]
    async fn test_no_span_exported_without_parent() {
        let (interceptor, provider, exporter) = recording_interceptor();

        let request = HttpRequest::builder()
            .uri("/orders/12345678")
            .body(Body::empty())
            .unwrap();
        let response = recorded_app(interceptor).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(finished_spans(&provider, &exporter).is_empty());
    }

    #[test]
    fn test_extract_parent_rejects_all_zero_trace_id() {
        let interceptor = TraceInterceptor::default();
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            format!("00-{}-{PARENT_ID}-01", "0".repeat(32)).parse().unwrap(),
        );

        assert!(interceptor.extract_parent(&headers).is_none());
    }
}
