//! Diagnostic endpoints mounted under `/debug/pprof/` when profiling is
//! enabled in the configuration.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::observability::MetricsCollector;

/// Path prefix of the diagnostic endpoints.
pub const DEBUG_PREFIX: &str = "/debug/pprof";

const INDEX: &str = "\
/debug/pprof/ diagnostics

cmdline: the command line invocation of the current program
process: resource usage of the current process
runtime: async runtime worker and task counts
";

/// Handler for GET /debug/pprof/
pub async fn index() -> &'static str {
    INDEX
}

/// Handler for GET /debug/pprof/cmdline
///
/// Arguments are separated by NUL bytes.
pub async fn cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\0")
}

/// Handler for GET /debug/pprof/process
pub async fn process(State(metrics): State<Arc<MetricsCollector>>) -> Response {
    match metrics.process().process_snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_IMPLEMENTED, "process statistics unavailable").into_response(),
    }
}

/// Handler for GET /debug/pprof/runtime
pub async fn runtime(State(metrics): State<Arc<MetricsCollector>>) -> Response {
    match metrics.process().runtime_snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_IMPLEMENTED, "runtime statistics unavailable").into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_index_lists_endpoints() {
        let text = index().await;
        for endpoint in ["cmdline", "process", "runtime"] {
            assert!(text.contains(endpoint));
        }
    }

    #[tokio::test]
    async fn test_cmdline_starts_with_program() {
        let line = cmdline().await;
        let program = std::env::args().next().unwrap();
        assert!(line.starts_with(&program));
    }

    #[tokio::test]
    async fn test_runtime_inside_tokio() {
        let metrics = Arc::new(MetricsCollector::builder("svc").build().unwrap());
        let response = runtime(State(metrics)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
