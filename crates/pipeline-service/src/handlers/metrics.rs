//! Prometheus metrics endpoint handler.
//!
//! # Security
//!
//! This endpoint is unauthenticated to allow Prometheus to scrape metrics.
//! Labels carry only normalized route identities, never raw IDs.

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};
use std::sync::Arc;

use crate::observability::MetricsCollector;

/// Content type of the Prometheus text exposition format.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Handler for GET /metrics
///
/// Returns 200 OK with Prometheus text format:
/// ```text
/// # HELP svc_rest_requests_total Total number of rest requests
/// # TYPE svc_rest_requests_total counter
/// svc_rest_requests_total{method="GET",code="200",handler="GET /api/v1/ping"} 42
/// ```
#[tracing::instrument(skip_all, name = "pipeline.metrics.scrape")]
pub async fn metrics_handler(State(metrics): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        metrics.render(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::observability::RouteIdentity;
    use axum::http::{Method, Uri};
    use http_body_util::BodyExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_metrics_handler_renders_exposition() {
        let metrics = Arc::new(MetricsCollector::builder("svc").build().unwrap());
        let uri: Uri = "/ping".parse().unwrap();
        metrics.record_request(
            &RouteIdentity::resolve(&Method::GET, &uri, None),
            "GET",
            200,
            Duration::from_millis(3),
        );

        let response = metrics_handler(State(metrics)).await.into_response();

        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            EXPOSITION_CONTENT_TYPE
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# TYPE svc_rest_requests_total counter"), "{text}");
        assert!(text.contains("svc_runtime_workers"), "{text}");
    }
}
