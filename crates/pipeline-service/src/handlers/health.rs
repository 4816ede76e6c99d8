//! Health check handler.
//!
//! `/health/check` runs every registered checker and returns the aggregated
//! report. 200 when all checks pass, 503 otherwise.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

use crate::health::HealthAggregator;

/// Handler for GET /health/check
#[tracing::instrument(skip_all, name = "pipeline.health.check")]
pub async fn health_check(State(health): State<Arc<HealthAggregator>>) -> impl IntoResponse {
    let report = health.evaluate().await;

    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        tracing::warn!(
            target: "pipeline.health",
            failing = report.failures().count(),
            "Health check reported unhealthy"
        );
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::health::{CheckError, FnChecker};
    use crate::version::BuildInfo;
    use http_body_util::BodyExt;

    fn aggregator() -> HealthAggregator {
        HealthAggregator::with_host(&BuildInfo::new("svc", "0.1.0", "today"), "host-a")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_report_returns_200() {
        let mut health = aggregator();
        health.register(FnChecker::new("db", || async { Ok(()) }));

        let response = health_check(State(Arc::new(health))).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["app"], "svc");
        assert_eq!(json["host"], "host-a");
        assert_eq!(json["checks"][0]["name"], "db");
    }

    #[tokio::test]
    async fn test_unhealthy_report_returns_503() {
        let mut health = aggregator();
        health.register(FnChecker::new("queue", || async {
            Err::<(), CheckError>("broker unreachable".into())
        }));

        let response = health_check(State(Arc::new(health))).await.into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["checks"][0]["error"], "broker unreachable");
    }
}
