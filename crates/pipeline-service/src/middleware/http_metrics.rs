//! HTTP metrics middleware for capturing all request/response metrics
//!
//! This middleware captures metrics for ALL HTTP responses including
//! framework-level errors that occur before handlers run (404, 405, 415)
//! and the 500 produced by the panic guard below it.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::observability::{MetricsCollector, RouteIdentity};

/// Middleware that records HTTP request metrics for all responses
///
/// This captures:
/// - Request method
/// - Route identity (normalized to prevent cardinality explosion)
/// - Response status code
/// - Request duration, including panic recovery
///
/// The resolved route identity is attached to the request for inner layers.
pub async fn http_metrics_middleware(
    State(metrics): State<Arc<MetricsCollector>>,
    mut request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = RouteIdentity::for_request(&request);
    request.extensions_mut().insert(route.clone());

    // Execute the request
    let response = next.run(request).await;

    // Record metrics
    metrics.record_request(&route, &method, response.status().as_u16(), start.elapsed());

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pipeline_test_utils::metric_sample as sample;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn handler_200() -> &'static str {
        "OK"
    }

    async fn handler_500() -> (StatusCode, &'static str) {
        (StatusCode::INTERNAL_SERVER_ERROR, "Error")
    }

    fn test_app(metrics: Arc<MetricsCollector>) -> Router {
        Router::new()
            .route("/success", get(handler_200))
            .route("/error", get(handler_500))
            .route("/items/:id", get(handler_200))
            .layer(middleware::from_fn_with_state(metrics, http_metrics_middleware))
    }

    async fn call(app: Router, uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");

        app.oneshot(request)
            .await
            .expect("request should succeed")
            .status()
    }

    #[tokio::test]
    async fn test_middleware_records_success() {
        let metrics = Arc::new(MetricsCollector::builder("test").build().unwrap());

        assert_eq!(call(test_app(metrics.clone()), "/success").await, StatusCode::OK);

        let rendered = metrics.render();
        let labels = [("method", "GET"), ("code", "200"), ("handler", "GET /success")];
        assert_eq!(sample(&rendered, "test_rest_requests_total", &labels), Some(1.0), "{rendered}");
    }

    #[tokio::test]
    async fn test_middleware_records_error() {
        let metrics = Arc::new(MetricsCollector::builder("test").build().unwrap());

        assert_eq!(
            call(test_app(metrics.clone()), "/error").await,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let labels = [("code", "500"), ("handler", "GET /error")];
        assert_eq!(sample(&metrics.render(), "test_rest_requests_total", &labels), Some(1.0));
    }

    #[tokio::test]
    async fn test_middleware_uses_matched_route_template() {
        let metrics = Arc::new(MetricsCollector::builder("test").build().unwrap());

        call(test_app(metrics.clone()), "/items/9876543").await;
        call(test_app(metrics.clone()), "/items/1234567").await;

        let rendered = metrics.render();
        let labels = [("code", "200"), ("handler", "GET /items/:id")];
        assert_eq!(sample(&rendered, "test_rest_requests_total", &labels), Some(2.0), "{rendered}");
    }

    #[tokio::test]
    async fn test_middleware_records_not_found_with_normalized_path() {
        let metrics = Arc::new(MetricsCollector::builder("test").build().unwrap());

        assert_eq!(
            call(test_app(metrics.clone()), "/nonexistent/abc123456").await,
            StatusCode::NOT_FOUND
        );

        let rendered = metrics.render();
        let labels = [("code", "404"), ("handler", "GET /nonexistent/{param}")];
        assert_eq!(sample(&rendered, "test_rest_requests_total", &labels), Some(1.0), "{rendered}");
    }
}
