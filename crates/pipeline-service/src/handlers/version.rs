//! Build information endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::version::BuildInfo;

/// Build identity plus the instant the pipeline started serving.
#[derive(Debug)]
pub struct VersionState {
    pub build_info: BuildInfo,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub app: String,
    pub version: String,
    #[serde(rename = "buildTime")]
    pub build_time: String,
    #[serde(rename = "upTime")]
    pub up_time: String,
}

/// Handler for GET /version
pub async fn version_handler(State(state): State<Arc<VersionState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        app: state.build_info.app.clone(),
        version: state.build_info.version.clone(),
        build_time: state.build_info.build_time.clone(),
        up_time: format!("{:.6}s", state.started_at.elapsed().as_secs_f64()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_version_response_fields() {
        let state = Arc::new(VersionState {
            build_info: BuildInfo::new("svc", "2.0.1", "2024-05-01T10:00:00Z"),
            started_at: Instant::now() - Duration::from_secs(3),
        });

        let Json(response) = version_handler(State(state)).await;
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["app"], "svc");
        assert_eq!(json["version"], "2.0.1");
        assert_eq!(json["buildTime"], "2024-05-01T10:00:00Z");
        let up_time = json["upTime"].as_str().unwrap();
        assert!(up_time.ends_with('s'), "{up_time}");
        let secs: f64 = up_time.trim_end_matches('s').parse().unwrap();
        assert!(secs >= 3.0, "{up_time}");
    }
}
