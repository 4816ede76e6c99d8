//! Build identity of the running service.

use serde::Serialize;

/// Build timestamp injected at compile time through the `BUILD_TIME`
/// environment variable, if the build pipeline sets it.
pub const BUILD_TIME: Option<&str> = option_env!("BUILD_TIME");

/// Static identity fields reported by `/version` and `/health/check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub app: String,
    pub version: String,
    pub build_time: String,
}

impl BuildInfo {
    pub fn new(
        app: impl Into<String>,
        version: impl Into<String>,
        build_time: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            version: version.into(),
            build_time: build_time.into(),
        }
    }

    /// Identity of this binary, taken from the Cargo manifest.
    pub fn current() -> Self {
        Self::new(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            BUILD_TIME.unwrap_or("unknown"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_uses_manifest() {
        let info = BuildInfo::current();
        assert_eq!(info.app, "pipeline-service");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(!info.build_time.is_empty());
    }
}
