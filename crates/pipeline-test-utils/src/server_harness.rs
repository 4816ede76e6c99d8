//! Test server harness for E2E testing
//!
//! Provides `TestPipelineServer` for spawning a real listener serving a
//! router behind the full request pipeline.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use pipeline_service::health::HealthAggregator;
use pipeline_service::middleware::{Mesh, MeshMetadata};
use pipeline_service::observability::MetricsCollector;
use pipeline_service::reporting::{ErrorReporter, PanicReport};
use pipeline_service::version::BuildInfo;
use pipeline_service::PipelineBuilder;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Service name used by the harness. Metric series are prefixed `test_service_`.
pub const TEST_SERVICE_NAME: &str = "test-service";

/// Version reported by the harness' build info.
pub const TEST_SERVICE_VERSION: &str = "0.0.0-test";

/// Error reporter that keeps every report for later assertions.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<PanicReport>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<PanicReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: &PanicReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

/// Downstream router used when a test does not bring its own.
///
/// - `GET /api/ping` - `pong`
/// - `GET /api/items/:id` - echoes the id
/// - `GET /api/panic` - panics
/// - `GET /api/teapot` - 418 from the handler itself
/// - `GET /api/mesh` - mesh metadata as JSON
pub fn default_app() -> Router {
    Router::new()
        .route("/api/ping", get(|| async { "pong" }))
        .route("/api/items/:id", get(|Path(id): Path<String>| async move { id }))
        .route("/api/panic", get(panicking))
        .route("/api/teapot", get(|| async { StatusCode::IM_A_TEAPOT }))
        .route("/api/mesh", get(mesh_echo))
}

async fn panicking() -> &'static str {
    panic!("test handler panic");
}

async fn mesh_echo(Mesh(mesh): Mesh) -> Json<MeshMetadata> {
    Json(mesh)
}

/// Value of the first sample of `name` carrying every given label, read
/// from Prometheus text exposition.
pub fn metric_sample(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let with_labels = format!("{name}{{");
    let without_labels = format!("{name} ");
    rendered
        .lines()
        .filter(|line| line.starts_with(&with_labels) || line.starts_with(&without_labels))
        .find(|line| {
            labels
                .iter()
                .all(|(k, v)| line.contains(&format!("{k}=\"{v}\"")))
        })
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

/// Test harness for spawning the pipeline in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_panic_flow_e2e() -> Result<(), anyhow::Error> {
///     let server = TestPipelineServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/api/panic", server.url())).await?;
///
///     assert_eq!(response.status(), 500);
///     assert_eq!(server.reporter().count(), 1);
///     Ok(())
/// }
/// ```
pub struct TestPipelineServer {
    addr: SocketAddr,
    metrics: Arc<MetricsCollector>,
    reporter: Arc<RecordingReporter>,
    _handle: JoinHandle<()>,
}

impl TestPipelineServer {
    /// Spawn the default app behind a default pipeline.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(default_app(), |builder| builder).await
    }

    /// Spawn `router` behind a pipeline customised by `configure`.
    ///
    /// The harness installs its own metrics collector, a `RecordingReporter`
    /// and an empty health aggregator before `configure` runs, so
    /// `configure` may override any of them.
    pub async fn spawn_with(
        router: Router,
        configure: impl FnOnce(PipelineBuilder) -> PipelineBuilder,
    ) -> Result<Self, anyhow::Error> {
        let build_info = test_build_info();
        let metrics = Arc::new(
            MetricsCollector::builder(TEST_SERVICE_NAME)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build metrics: {}", e))?,
        );
        let reporter = Arc::new(RecordingReporter::default());

        let builder = PipelineBuilder::new(build_info.clone(), Arc::clone(&metrics))
            .health(HealthAggregator::with_host(&build_info, "test-host"))
            .reporter(reporter.clone());
        let app = configure(builder).build(router);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            metrics,
            reporter,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn reporter(&self) -> &RecordingReporter {
        &self.reporter
    }
}

impl Drop for TestPipelineServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

/// Build info used by every harness instance.
pub fn test_build_info() -> BuildInfo {
    BuildInfo::new(TEST_SERVICE_NAME, TEST_SERVICE_VERSION, "test-build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestPipelineServer::spawn().await?;

        assert!(server.url().starts_with("http://127.0.0.1:"));

        let response = reqwest::get(format!("{}/api/ping", server.url())).await?;
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await?, "pong");

        Ok(())
    }

    #[tokio::test]
    async fn test_multiple_servers_different_ports() -> Result<(), anyhow::Error> {
        let server1 = TestPipelineServer::spawn().await?;
        let server2 = TestPipelineServer::spawn().await?;

        assert_ne!(server1.addr(), server2.addr());

        Ok(())
    }

    #[test]
    fn test_metric_sample_matches_labels() {
        let rendered = "\
# TYPE svc_requests_total counter
svc_requests_total{code=\"200\",handler=\"GET /a\"} 3
svc_requests_total{code=\"500\",handler=\"GET /a\"} 1
svc_up 1
";

        assert_eq!(metric_sample(rendered, "svc_requests_total", &[("code", "500")]), Some(1.0));
        assert_eq!(metric_sample(rendered, "svc_up", &[]), Some(1.0));
        assert_eq!(metric_sample(rendered, "svc_requests", &[]), None);
    }
}
