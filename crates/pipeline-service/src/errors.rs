//! Startup error types.
//!
//! Per-request failures never surface here: downstream panics become 500
//! responses and failing health checks become 503 bodies. These are the
//! fatal conditions reported by `main` before the listener starts serving.

use thiserror::Error;

use crate::config::ConfigError;
use crate::observability::MetricsError;
use crate::reporting::ReportError;

/// Fatal startup failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics setup error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Error tracking setup error: {0}")]
    Reporting(#[from] ReportError),

    #[error("Logging setup error: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
