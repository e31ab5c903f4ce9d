//! Server configuration
//!
//! Layered the usual way: built-in defaults, then the TOML config file,
//! then `HALLEY_*` environment variables, then command-line flags. The
//! config file also selects which modules compose the handler chain.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{
    HighWaterBytes, HighWaterParts, IdleTimeoutSecs, ListenBacklog, LowWaterBytes, LowWaterParts,
    MaxConnections, MaxHeaderBytes, QueueCapacity, WorkerCount,
};

/// Configuration errors. These map to exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("environment variable {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("config file error: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },
}

/// How a route pattern is matched against the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum RouteSpec {
    /// The whole path equals `path`.
    Exact { path: String },
    /// The path starts with `pattern`.
    Prefix { pattern: String },
    /// The path ends with `pattern`.
    Suffix { pattern: String },
    /// The path contains `pattern` away from both ends.
    Middle { pattern: String },
    /// The path matches the regular expression `pattern`.
    Regex { pattern: String },
}

/// One module in the configured handler chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleSpec {
    /// Serves a fixed body.
    Content {
        route: RouteSpec,
        body: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    /// Serves files under `root` through the file I/O helper.
    StaticFiles { route: RouteSpec, root: PathBuf },
    /// Accepts streamed uploads and echoes them back.
    Upload { route: RouteSpec },
    /// Reports server counters as JSON.
    Status { route: RouteSpec },
}

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: ListenBacklog,
    pub reader_workers: WorkerCount,
    pub handler_workers: WorkerCount,
    pub writer_workers: WorkerCount,
    pub file_io_workers: WorkerCount,
    pub db_workers: WorkerCount,
    pub queue_capacity: QueueCapacity,
    pub max_connections: MaxConnections,
    pub idle_timeout_secs: IdleTimeoutSecs,
    pub max_header_bytes: MaxHeaderBytes,
    pub high_water_parts: HighWaterParts,
    pub high_water_bytes: HighWaterBytes,
    pub low_water_parts: LowWaterParts,
    pub low_water_bytes: LowWaterBytes,
    pub mime_types: PathBuf,
    pub access_log: Option<PathBuf>,
    pub modules: Vec<ModuleSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            backlog: ListenBacklog::default(),
            reader_workers: WorkerCount::single(),
            handler_workers: WorkerCount::per_cpu(),
            writer_workers: WorkerCount::single(),
            file_io_workers: WorkerCount::try_new(2).expect("2 is a valid worker count"),
            db_workers: WorkerCount::try_new(2).expect("2 is a valid worker count"),
            queue_capacity: QueueCapacity::default(),
            max_connections: MaxConnections::default(),
            idle_timeout_secs: IdleTimeoutSecs::default(),
            max_header_bytes: MaxHeaderBytes::default(),
            high_water_parts: HighWaterParts::default(),
            high_water_bytes: HighWaterBytes::default(),
            low_water_parts: LowWaterParts::default(),
            low_water_bytes: LowWaterBytes::default(),
            mime_types: PathBuf::from("/etc/mime.types"),
            access_log: None,
            modules: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads a TOML config file over the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Applies `HALLEY_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_var("HALLEY_WORKERS")? {
            self.handler_workers = value
                .parse::<usize>()
                .ok()
                .and_then(|n| WorkerCount::try_new(n).ok())
                .ok_or_else(|| ConfigError::Env {
                    var: "HALLEY_WORKERS".into(),
                    reason: format!("invalid worker count {value:?}"),
                })?;
        }
        if let Some(value) = env_var("HALLEY_MAX_CONNECTIONS")? {
            self.max_connections = value
                .parse::<usize>()
                .ok()
                .and_then(|n| MaxConnections::try_new(n).ok())
                .ok_or_else(|| ConfigError::Env {
                    var: "HALLEY_MAX_CONNECTIONS".into(),
                    reason: format!("invalid connection limit {value:?}"),
                })?;
        }
        if let Some(value) = env_var("HALLEY_MIME_TYPES")? {
            self.mime_types = PathBuf::from(value);
        }
        Ok(())
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_water_parts.as_usize() >= self.high_water_parts.as_usize() {
            return Err(ConfigError::Validation {
                field: "low_water_parts".into(),
                reason: "must be below high_water_parts".into(),
            });
        }
        if self.low_water_bytes.as_usize() >= self.high_water_bytes.as_usize() {
            return Err(ConfigError::Validation {
                field: "low_water_bytes".into(),
                reason: "must be below high_water_bytes".into(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::Env {
            var: name.to_string(),
            reason: "not valid unicode".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn watermark_inversion_is_rejected() {
        let mut config = ServerConfig::default();
        config.low_water_parts = LowWaterParts::try_new(100).unwrap();
        config.high_water_parts = HighWaterParts::try_new(50).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_with_module_chain() {
        let text = r#"
port = 9090
queue_capacity = 2048

[[modules]]
kind = "content"
body = "hi"
route = { match = "exact", path = "/hello" }

[[modules]]
kind = "static_files"
root = "/srv/www"
route = { match = "prefix", pattern = "/static/" }
"#;
        let config: ServerConfig = toml::from_str(text).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.queue_capacity.as_usize(), 2048);
        assert_eq!(config.modules.len(), 2);
        match &config.modules[0] {
            ModuleSpec::Content { body, route, .. } => {
                assert_eq!(body, "hi");
                assert!(matches!(route, RouteSpec::Exact { path } if path == "/hello"));
            }
            other => panic!("unexpected module: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ServerConfig, _> = toml::from_str("bogus_field = 1");
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ServerConfig::default();
        std::env::set_var("HALLEY_WORKERS", "7");
        std::env::set_var("HALLEY_MIME_TYPES", "/tmp/mime.types");
        config.apply_env().unwrap();
        std::env::remove_var("HALLEY_WORKERS");
        std::env::remove_var("HALLEY_MIME_TYPES");
        assert_eq!(config.handler_workers.as_usize(), 7);
        assert_eq!(config.mime_types, PathBuf::from("/tmp/mime.types"));
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut config = ServerConfig::default();
        std::env::set_var("HALLEY_MAX_CONNECTIONS", "not-a-number");
        let result = config.apply_env();
        std::env::remove_var("HALLEY_MAX_CONNECTIONS");
        assert!(result.is_err());
    }
}
