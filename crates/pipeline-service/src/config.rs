//! Pipeline service configuration.
//!
//! Configuration is loaded from environment variables sharing a prefix
//! derived from the service name (`pipeline-service` → `PIPELINE_SERVICE`).
//! The error-tracking DSN is redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP listener port.
pub const DEFAULT_HTTP_BIND_PORT: u16 = 8001;

/// Default shutdown drain timeout in seconds.
pub const DEFAULT_GRACEFUL_TIMEOUT_SECONDS: u64 = 10;

/// Default deployment environment.
pub const DEFAULT_ENVIRONMENT: &str = "local";

/// Pipeline service configuration.
#[derive(Clone)]
pub struct Config {
    /// Port the HTTP listener binds on all interfaces (default: 8001).
    pub http_bind_port: u16,

    /// Upper bound on draining in-flight requests at shutdown.
    pub graceful_timeout_seconds: u64,

    /// Error-tracking endpoint. `None` means panics are only logged.
    pub sentry_dsn: Option<String>,

    /// Deployment environment tag (default: "local").
    pub environment: String,

    /// Expose the `/debug/pprof` diagnostic endpoints.
    pub pprof_enabled: bool,
}

/// Custom Debug implementation that redacts the DSN.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("http_bind_port", &self.http_bind_port)
            .field("graceful_timeout_seconds", &self.graceful_timeout_seconds)
            .field(
                "sentry_dsn",
                &self.sentry_dsn.as_ref().map(|_| "[REDACTED]"),
            )
            .field("environment", &self.environment)
            .field("pprof_enabled", &self.pprof_enabled)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid HTTP bind port: {0}")]
    InvalidBindPort(String),

    #[error("Invalid graceful timeout: {0}")]
    InvalidGracefulTimeout(String),

    #[error("Invalid boolean flag: {0}")]
    InvalidFlag(String),
}

/// Derive the variable prefix from a service name.
pub fn env_prefix(service_name: &str) -> String {
    service_name.to_uppercase().replace('-', "_")
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_vars(prefix, &env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(prefix: &str, vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let var = |name: &str| vars.get(&format!("{prefix}_{name}"));

        let http_bind_port = match var("HTTP_BIND_PORT") {
            Some(value_str) => {
                let value: u16 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidBindPort(format!(
                        "{prefix}_HTTP_BIND_PORT must be an integer in 1-65535, got '{value_str}': {e}"
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidBindPort(format!(
                        "{prefix}_HTTP_BIND_PORT must be greater than 0"
                    )));
                }

                value
            }
            None => DEFAULT_HTTP_BIND_PORT,
        };

        let graceful_timeout_seconds = match var("GRACEFUL_TIMEOUT_SECONDS") {
            Some(value_str) => value_str.parse().map_err(|e| {
                ConfigError::InvalidGracefulTimeout(format!(
                    "{prefix}_GRACEFUL_TIMEOUT_SECONDS must be a non-negative integer, got '{value_str}': {e}"
                ))
            })?,
            None => DEFAULT_GRACEFUL_TIMEOUT_SECONDS,
        };

        // Empty DSN is treated as unset
        let sentry_dsn = var("SENTRY_DSN")
            .filter(|dsn| !dsn.trim().is_empty())
            .cloned();

        let environment = var("ENV")
            .filter(|env| !env.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let pprof_enabled = match var("PPROF_ENABLED") {
            Some(value_str) => parse_flag(value_str).ok_or_else(|| {
                ConfigError::InvalidFlag(format!(
                    "{prefix}_PPROF_ENABLED must be a boolean, got '{value_str}'"
                ))
            })?,
            None => false,
        };

        Ok(Config {
            http_bind_port,
            graceful_timeout_seconds,
            sentry_dsn,
            environment,
            pprof_enabled,
        })
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_seconds)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const PREFIX: &str = "PIPELINE_SERVICE";

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{PREFIX}_{k}"), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_prefix_from_service_name() {
        assert_eq!(env_prefix("pipeline-service"), "PIPELINE_SERVICE");
        assert_eq!(env_prefix("orders"), "ORDERS");
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(PREFIX, &HashMap::new())
            .expect("Config should load successfully");

        assert_eq!(config.http_bind_port, DEFAULT_HTTP_BIND_PORT);
        assert_eq!(config.graceful_timeout(), Duration::from_secs(10));
        assert_eq!(config.sentry_dsn, None);
        assert_eq!(config.environment, "local");
        assert!(!config.pprof_enabled);
    }

    #[test]
    fn test_from_vars_reads_every_variable() {
        let config = Config::from_vars(
            PREFIX,
            &vars(&[
                ("HTTP_BIND_PORT", "9090"),
                ("GRACEFUL_TIMEOUT_SECONDS", "3"),
                ("SENTRY_DSN", "https://key@tracker.example/1"),
                ("ENV", "production"),
                ("PPROF_ENABLED", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(config.http_bind_port, 9090);
        assert_eq!(config.graceful_timeout_seconds, 3);
        assert_eq!(config.sentry_dsn.as_deref(), Some("https://key@tracker.example/1"));
        assert_eq!(config.environment, "production");
        assert!(config.pprof_enabled);
    }

    #[test]
    fn test_other_prefixes_are_ignored() {
        let mut other = HashMap::new();
        other.insert("OTHER_HTTP_BIND_PORT".to_string(), "9090".to_string());

        let config = Config::from_vars(PREFIX, &other).unwrap();

        assert_eq!(config.http_bind_port, DEFAULT_HTTP_BIND_PORT);
    }

    #[test]
    fn test_invalid_port_rejected() {
        for bad in ["0", "70000", "http", "-1"] {
            let result = Config::from_vars(PREFIX, &vars(&[("HTTP_BIND_PORT", bad)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidBindPort(_))),
                "port {bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_graceful_timeout_rejected() {
        let result = Config::from_vars(PREFIX, &vars(&[("GRACEFUL_TIMEOUT_SECONDS", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidGracefulTimeout(_))));
    }

    #[test]
    fn test_pprof_flag_parsing() {
        for (raw, expected) in [("1", true), ("T", true), ("false", false), ("0", false)] {
            let config = Config::from_vars(PREFIX, &vars(&[("PPROF_ENABLED", raw)])).unwrap();
            assert_eq!(config.pprof_enabled, expected, "flag {raw}");
        }

        let result = Config::from_vars(PREFIX, &vars(&[("PPROF_ENABLED", "yes")]));
        assert!(matches!(result, Err(ConfigError::InvalidFlag(_))));
    }

    #[test]
    fn test_blank_dsn_treated_as_unset() {
        let config = Config::from_vars(PREFIX, &vars(&[("SENTRY_DSN", "  ")])).unwrap();
        assert_eq!(config.sentry_dsn, None);
    }

    #[test]
    fn test_debug_redacts_dsn() {
        let config = Config::from_vars(
            PREFIX,
            &vars(&[("SENTRY_DSN", "https://secret-key@tracker.example/1")]),
        )
        .unwrap();

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("secret-key"));
    }
}
