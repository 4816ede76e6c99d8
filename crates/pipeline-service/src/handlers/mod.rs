//! HTTP handlers for the auxiliary endpoints mounted next to the router.

pub mod debug;
pub mod health;
pub mod metrics;
pub mod version;

pub use health::health_check;
pub use metrics::metrics_handler;
pub use version::{version_handler, VersionState};
