//! Observability building blocks: route naming, metrics, process
//! collectors and logging setup.

pub mod logging;
pub mod metrics;
pub mod process;
pub mod route_name;

pub use metrics::{MetricsCollector, MetricsError};
pub use route_name::RouteIdentity;
