//! Request pipeline middleware.
//!
//! # Components
//!
//! - `http_metrics` - request count and latency per route identity (outermost)
//! - `panic_guard` - converts downstream panics into 500 responses
//! - `trace_context` - trace context propagation and mesh metadata (innermost)
//! - `mesh` - `X-Service-*` header metadata and its extractor

pub mod http_metrics;
pub mod mesh;
pub mod panic_guard;
pub mod trace_context;

pub use http_metrics::http_metrics_middleware;
pub use mesh::{Mesh, MeshMetadata};
pub use panic_guard::panic_guard_middleware;
pub use trace_context::{trace_context_middleware, RequestSpan, TraceInterceptor, TRACER_NAME};
