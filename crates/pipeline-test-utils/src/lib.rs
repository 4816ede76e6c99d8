//! # Pipeline Test Utilities
//!
//! Shared test utilities for the pipeline service.
//!
//! This crate provides:
//! - Server test harness (`TestPipelineServer` for E2E tests)
//! - `RecordingReporter` capturing panic reports
//! - `metric_sample` for reading values out of `/metrics` output
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pipeline_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestPipelineServer::spawn().await?;
//!     let client = reqwest::Client::new();
//!
//!     let response = client
//!         .get(format!("{}/health/check", server.url()))
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod server_harness;

// Re-export commonly used items
pub use server_harness::*;
