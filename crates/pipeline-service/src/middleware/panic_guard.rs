//! Panic isolation for the downstream pipeline.
//!
//! This is the only place a downstream failure is turned into a response.
//! The downstream future is polled under `catch_unwind`, and the boundary
//! returns `Result<Response, PanicReport>`. A `PanicReport` is handed to the
//! error reporter once and answered with a bare 500.
//!
//! Axum responses are returned by value, so nothing has been written to the
//! client when a handler panics. The 500 is therefore always sent.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::observability::RouteIdentity;
use crate::reporting::{ErrorReporter, PanicReport};

/// Run the rest of the pipeline, capturing an unwinding panic as a report.
pub async fn invoke_guarded(request: Request, next: Next) -> Result<Response, PanicReport> {
    let method = request.method().clone();
    let route = RouteIdentity::for_request(&request);

    AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
        .map_err(|payload| PanicReport::from_payload(payload.as_ref(), &method, &route))
}

/// Middleware converting downstream panics into 500 responses.
pub async fn panic_guard_middleware(
    State(reporter): State<Arc<dyn ErrorReporter>>,
    request: Request,
    next: Next,
) -> Response {
    match invoke_guarded(request, next).await {
        Ok(response) => response,
        Err(report) => {
            reporter.report(&report);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
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
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Router};
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct CapturingReporter {
        reports: Mutex<Vec<PanicReport>>,
    }

    impl ErrorReporter for CapturingReporter {
        fn report(&self, report: &PanicReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    async fn boom() -> &'static str {
        panic!("handler exploded");
    }

    async fn fine() -> (StatusCode, &'static str) {
        (StatusCode::CREATED, "created")
    }

    fn test_app(reporter: Arc<CapturingReporter>) -> Router {
        let reporter: Arc<dyn ErrorReporter> = reporter;
        Router::new()
            .route("/boom", get(boom))
            .route("/fine", get(fine))
            .layer(middleware::from_fn_with_state(reporter, panic_guard_middleware))
    }

    async fn call(app: Router, uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_panic_becomes_500_and_one_report() {
        let reporter = Arc::new(CapturingReporter::default());

        let status = call(test_app(reporter.clone()), "/boom").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let reports = reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "handler exploded");
        assert_eq!(reports[0].route, "GET /boom");
        assert_eq!(reports[0].method, "GET");
    }

    #[tokio::test]
    async fn test_normal_response_passes_through() {
        let reporter = Arc::new(CapturingReporter::default());

        let status = call(test_app(reporter.clone()), "/fine").await;

        assert_eq!(status, StatusCode::CREATED);
        assert!(reporter.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_survives_repeated_panics() {
        let reporter = Arc::new(CapturingReporter::default());
        let app = test_app(reporter.clone());

        for _ in 0..3 {
            assert_eq!(call(app.clone(), "/boom").await, StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(call(app, "/fine").await, StatusCode::CREATED);
        assert_eq!(reporter.reports.lock().unwrap().len(), 3);
    }
}
