//! Health aggregation.
//!
//! Checkers are registered once during startup while the aggregator is still
//! exclusively owned (`register` takes `&mut self`). The pipeline builder then
//! freezes it behind an `Arc`, so the registry is read-only while serving.
//!
//! `evaluate()` runs every checker concurrently, each bounded by a timeout.
//! A checker that errors, times out or panics is reported as failing; the
//! evaluation itself never fails.

use crate::version::BuildInfo;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Default upper bound on a single checker's run time.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Error returned by a failing checker.
pub type CheckError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single probe.
pub type CheckResult = Result<(), CheckError>;

/// A named, side-effect-free probe of one dependency or subsystem.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Name reported alongside the outcome.
    fn name(&self) -> &str;

    async fn check(&self) -> CheckResult;
}

/// Adapter turning an async closure into a `HealthChecker`.
pub struct FnChecker<F> {
    name: String,
    probe: F,
}

impl<F, Fut> FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CheckResult> + Send,
{
    pub fn new(name: impl Into<String>, probe: F) -> Self {
        Self {
            name: name.into(),
            probe,
        }
    }
}

#[async_trait]
impl<F, Fut> HealthChecker for FnChecker<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CheckResult> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> CheckResult {
        (self.probe)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of one checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckOutcome {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            error: None,
        }
    }

    fn failed(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            error: Some(error),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Composite verdict served by `/health/check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub app: String,
    pub version: String,
    pub host: String,
    pub checks: Vec<CheckOutcome>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Failing checks, in registration order.
    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.is_healthy())
    }
}

/// Registry of health checkers plus the static identity of the process.
pub struct HealthAggregator {
    app: String,
    version: String,
    host: String,
    check_timeout: Duration,
    checkers: Vec<Box<dyn HealthChecker>>,
}

impl HealthAggregator {
    /// Create an empty aggregator. The host name is resolved once, here.
    pub fn new(build_info: &BuildInfo) -> Self {
        Self::with_host(build_info, crate::observability::process::host_name())
    }

    pub fn with_host(build_info: &BuildInfo, host: impl Into<String>) -> Self {
        Self {
            app: build_info.app.clone(),
            version: build_info.version.clone(),
            host: host.into(),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            checkers: Vec::new(),
        }
    }

    /// Override the per-checker timeout.
    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn register(&mut self, checker: impl HealthChecker + 'static) {
        tracing::debug!(target: "pipeline.health", checker = checker.name(), "Health checker registered");
        self.checkers.push(Box::new(checker));
    }

    /// Run every checker and aggregate the results.
    pub async fn evaluate(&self) -> HealthReport {
        let checks = join_all(
            self.checkers
                .iter()
                .map(|checker| run_checker(checker.as_ref(), self.check_timeout)),
        )
        .await;

        let status = if checks.iter().all(CheckOutcome::is_healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            app: self.app.clone(),
            version: self.version.clone(),
            host: self.host.clone(),
            checks,
        }
    }
}

async fn run_checker(checker: &dyn HealthChecker, timeout: Duration) -> CheckOutcome {
    let name = checker.name();
    let probe = AssertUnwindSafe(checker.check()).catch_unwind();

    let outcome = match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(Ok(()))) => CheckOutcome::healthy(name),
        Ok(Ok(Err(e))) => CheckOutcome::failed(name, e.to_string()),
        Ok(Err(_panic)) => CheckOutcome::failed(name, "health checker panicked".to_string()),
        Err(_elapsed) => CheckOutcome::failed(
            name,
            format!("health checker timed out after {}ms", timeout.as_millis()),
        ),
    };

    if let Some(error) = &outcome.error {
        tracing::warn!(target: "pipeline.health", checker = name, error = %error, "Health check failed");
    }

    outcome
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

    fn aggregator() -> HealthAggregator {
        HealthAggregator::with_host(&BuildInfo::new("svc", "1.2.3", "now"), "test-host")
    }

    #[tokio::test]
    async fn test_no_checkers_is_healthy() {
        let report = aggregator().evaluate().await;
        assert!(report.is_healthy());
        assert!(report.checks.is_empty());
        assert_eq!(report.app, "svc");
        assert_eq!(report.version, "1.2.3");
        assert_eq!(report.host, "test-host");
    }

    #[tokio::test]
    async fn test_one_failing_checker_makes_report_unhealthy() {
        let mut health = aggregator();
        health.register(FnChecker::new("db", || async { Ok(()) }));
        health.register(FnChecker::new("cache", || async {
            Err::<(), CheckError>("connection refused".into())
        }));

        let report = health.evaluate().await;
        assert!(!report.is_healthy());

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "cache");
        assert_eq!(failures[0].error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_outcomes_keep_registration_order() {
        let mut health = aggregator();
        for name in ["a", "b", "c"] {
            health.register(FnChecker::new(name, || async { Ok(()) }));
        }
        let names: Vec<_> = health
            .evaluate()
            .await
            .checks
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_checker_times_out() {
        let mut health = aggregator().check_timeout(Duration::from_millis(50));
        health.register(FnChecker::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }));

        let report = health.evaluate().await;
        assert!(!report.is_healthy());
        let error = report.checks[0].error.clone().unwrap();
        assert!(error.contains("timed out"), "{error}");
    }

    #[tokio::test]
    async fn test_panicking_checker_is_recorded_as_failure() {
        let mut health = aggregator();
        health.register(FnChecker::new("broken", || async {
            if true {
                panic!("probe bug");
            }
            Ok(())
        }));

        let report = health.evaluate().await;
        assert!(!report.is_healthy());
        assert_eq!(
            report.checks[0].error.as_deref(),
            Some("health checker panicked")
        );
    }

    #[test]
    fn test_report_serialization_omits_error_for_healthy_checks() {
        let report = HealthReport {
            status: HealthStatus::Unhealthy,
            app: "svc".to_string(),
            version: "1".to_string(),
            host: "h".to_string(),
            checks: vec![
                CheckOutcome::healthy("db"),
                CheckOutcome::failed("cache", "down".to_string()),
            ],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["checks"][0]["status"], "healthy");
        assert!(json["checks"][0].get("error").is_none());
        assert_eq!(json["checks"][1]["error"], "down");
    }
}
