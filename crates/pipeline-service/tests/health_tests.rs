//! Auxiliary endpoint integration tests.
//!
//! Tests `/health/check`, `/version`, `/metrics` and `/debug/pprof` using the
//! `TestPipelineServer` harness.

use pipeline_service::health::{CheckError, FnChecker, HealthAggregator};
use pipeline_test_utils::{default_app, test_build_info, TestPipelineServer, TEST_SERVICE_VERSION};

/// Test that health endpoint returns 200 and healthy status with no checkers.
#[tokio::test]
async fn test_health_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let server = TestPipelineServer::spawn().await?;

    let response = reqwest::get(format!("{}/health/check", server.url())).await?;

    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok());
    assert!(
        content_type.is_some_and(|ct| ct.contains("application/json")),
        "Expected application/json content type, got {:?}",
        content_type
    );

    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["app"], "test-service");
    assert_eq!(body["version"], TEST_SERVICE_VERSION);
    assert_eq!(body["host"], "test-host");
    assert_eq!(body["checks"], serde_json::json!([]));

    Ok(())
}

/// Test that one failing checker turns the report unhealthy with a 503.
#[tokio::test]
async fn test_failing_checker_returns_503() -> Result<(), anyhow::Error> {
    let server = TestPipelineServer::spawn_with(default_app(), |builder| {
        let mut health = HealthAggregator::new(&test_build_info());
        health.register(FnChecker::new("database", || async { Ok(()) }));
        health.register(FnChecker::new("cache", || async {
            Err::<(), CheckError>("connection refused".into())
        }));
        builder.health(health)
    })
    .await?;

    let response = reqwest::get(format!("{}/health/check", server.url())).await?;

    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"][0]["name"], "database");
    assert_eq!(body["checks"][0]["status"], "healthy");
    assert_eq!(body["checks"][1]["name"], "cache");
    assert_eq!(body["checks"][1]["error"], "connection refused");

    Ok(())
}

#[tokio::test]
async fn test_version_endpoint() -> Result<(), anyhow::Error> {
    let server = TestPipelineServer::spawn().await?;

    let body: serde_json::Value = reqwest::get(format!("{}/version", server.url()))
        .await?
        .json()
        .await?;

    assert_eq!(body["app"], "test-service");
    assert_eq!(body["version"], TEST_SERVICE_VERSION);
    assert_eq!(body["buildTime"], "test-build");
    assert!(body["upTime"].as_str().is_some_and(|up| up.ends_with('s')));

    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_process_series() -> Result<(), anyhow::Error> {
    let server = TestPipelineServer::spawn().await?;

    let response = reqwest::get(format!("{}/metrics", server.url())).await?;

    assert_eq!(response.status(), 200);
    let text = response.text().await?;
    assert!(text.contains("test_service_runtime_workers"), "{text}");

    Ok(())
}

#[tokio::test]
async fn test_debug_endpoints_disabled_by_default() -> Result<(), anyhow::Error> {
    let server = TestPipelineServer::spawn().await?;

    let response = reqwest::get(format!("{}/debug/pprof/", server.url())).await?;

    assert_eq!(response.status(), 404);

    Ok(())
}

#[tokio::test]
async fn test_debug_endpoints_when_enabled() -> Result<(), anyhow::Error> {
    let server =
        TestPipelineServer::spawn_with(default_app(), |builder| builder.pprof_enabled(true)).await?;

    let index = reqwest::get(format!("{}/debug/pprof/", server.url())).await?;
    assert_eq!(index.status(), 200);

    let process = reqwest::get(format!("{}/debug/pprof/process", server.url())).await?;
    assert_eq!(process.status(), 200);
    let body: serde_json::Value = process.json().await?;
    assert_eq!(body["pid"], std::process::id());

    Ok(())
}
