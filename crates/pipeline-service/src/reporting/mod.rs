//! Error-tracking collaborator.
//!
//! The panic guard hands every captured failure to an `ErrorReporter`
//! exactly once. Two implementations exist:
//!
//! - `LogReporter` - structured `tracing` event only
//! - `SentryReporter` - logs, then captures a fatal event on the current
//!   Sentry hub
//!
//! `init_error_tracking` picks one from the configured DSN and owns the
//! Sentry client for as long as the returned `ErrorTracking` lives. The
//! client's transport delivers events in the background, so capturing never
//! blocks the request that failed.

use crate::observability::RouteIdentity;
use axum::http::Method;
use chrono::{DateTime, Utc};
use sentry::protocol::{Event, Level};
use sentry::types::{Dsn, ParseDsnError};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on flushing queued events when error tracking shuts down.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// A failure captured while a downstream handler was running.
#[derive(Debug, Clone, Serialize)]
pub struct PanicReport {
    pub event_id: Uuid,
    pub message: String,
    pub method: String,
    pub route: String,
    pub timestamp: DateTime<Utc>,
}

impl PanicReport {
    /// Build a report from a `catch_unwind` payload.
    pub fn from_payload(payload: &(dyn Any + Send), method: &Method, route: &RouteIdentity) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        Self {
            event_id: Uuid::new_v4(),
            message,
            method: method.to_string(),
            route: route.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn to_event(&self) -> Event<'static> {
        let mut event = Event {
            event_id: self.event_id,
            message: Some(self.message.clone()),
            level: Level::Fatal,
            timestamp: SystemTime::from(self.timestamp),
            transaction: Some(self.route.clone()),
            ..Default::default()
        };
        event.tags.insert("route".to_string(), self.route.clone());
        event.tags.insert("method".to_string(), self.method.clone());
        event
    }
}

/// Receives failures captured by the panic guard.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: &PanicReport);
}

/// Reporter that only emits a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, report: &PanicReport) {
        log_report(report);
    }
}

fn log_report(report: &PanicReport) {
    tracing::error!(
        target: "pipeline.report",
        event_id = %report.event_id,
        route = %report.route,
        method = %report.method,
        error = %report.message,
        "Recovered from panic in request handler"
    );
}

/// Reporter that captures a fatal event on the current Sentry hub.
///
/// Without a bound client the capture is a no-op and only the log event
/// remains.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentryReporter;

impl ErrorReporter for SentryReporter {
    fn report(&self, report: &PanicReport) {
        log_report(report);

        let captured = sentry::capture_event(report.to_event());
        if captured.is_nil() {
            tracing::debug!(target: "pipeline.report", event_id = %report.event_id, "No error-tracking client bound, event dropped");
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Invalid error-tracking DSN: {0}")]
    InvalidDsn(#[from] ParseDsnError),
}

/// Error tracking for the lifetime of the process.
///
/// Dropping it flushes pending events (bounded by `FLUSH_TIMEOUT`) and
/// closes the Sentry client.
pub struct ErrorTracking {
    reporter: Arc<dyn ErrorReporter>,
    client: Option<sentry::ClientInitGuard>,
}

impl ErrorTracking {
    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        Arc::clone(&self.reporter)
    }

    /// Whether events leave the process.
    pub fn is_enabled(&self) -> bool {
        self.client.as_ref().is_some_and(|guard| guard.is_enabled())
    }
}

/// Initialise error tracking for the configured DSN.
///
/// With no DSN, failures are only logged.
///
/// # Errors
///
/// Returns `ReportError::InvalidDsn` if the DSN cannot be parsed.
pub fn init_error_tracking(
    dsn: Option<&str>,
    environment: &str,
    release: &str,
) -> Result<ErrorTracking, ReportError> {
    let Some(dsn) = dsn else {
        return Ok(ErrorTracking {
            reporter: Arc::new(LogReporter),
            client: None,
        });
    };

    let dsn: Dsn = dsn.trim().parse()?;
    let guard = sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        environment: Some(environment.to_string().into()),
        release: Some(release.to_string().into()),
        shutdown_timeout: FLUSH_TIMEOUT,
        ..Default::default()
    });

    Ok(ErrorTracking {
        reporter: Arc::new(SentryReporter),
        client: Some(guard),
    })
}
