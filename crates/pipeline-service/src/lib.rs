//! Pipeline Service Library
//!
//! Wraps any axum `Router` in a fixed request pipeline and serves the
//! operational endpoints every service is expected to expose.
//!
//! # Architecture
//!
//! ```text
//! request → auxiliary routes (/health/check, /metrics, /version, /debug/pprof)
//!         ↘ global middleware → http_metrics → panic_guard → trace_context
//!             → service middleware → downstream router
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Startup error types
//! - `handlers` - Auxiliary endpoint handlers
//! - `health` - Health checkers and the aggregator
//! - `middleware` - Pipeline middleware layers
//! - `observability` - Route identity, metrics, process stats, logging
//! - `reporting` - Panic reports and error-tracking delivery
//! - `routes` - Pipeline composition
//! - `version` - Build information

pub mod config;
pub mod errors;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod reporting;
pub mod routes;
pub mod version;

pub use routes::{PipelineBuilder, ServiceMiddleware};
