//! Configuration management for the relata server.
//!
//! Configuration merges three sources, later ones winning:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (`RELATA_` prefix, `__` nesting separator)
//!
//! `ServerConfig::verify` rejects configurations that cannot work at
//! runtime (TLS without key material, an HTTP timeout shorter than the
//! ListObjects deadline, unknown log settings) so startup fails fast.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Network settings
    #[serde(default)]
    pub server: ServerSettings,

    /// HTTP gateway settings
    #[serde(default)]
    pub http: HttpSettings,

    /// Engine and write limits
    #[serde(default)]
    pub limits: LimitSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HttpSettings {
    /// Upstream request timeout in seconds.
    ///
    /// Must be at least `limits.list_objects_deadline_secs`, otherwise the
    /// gateway would cut ListObjects calls short.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// TLS termination settings.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: default_upstream_timeout(),
            tls: None,
        }
    }
}

fn default_upstream_timeout() -> u64 {
    5
}

/// TLS settings for the HTTP gateway.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Engine and write limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LimitSettings {
    /// Maximum tuples per Write batch.
    #[serde(default = "default_max_tuples_per_write")]
    pub max_tuples_per_write: usize,

    /// Maximum type definitions per authorization model.
    #[serde(default = "default_max_types_per_model")]
    pub max_types_per_authorization_model: usize,

    /// Maximum rewrite-graph traversal depth.
    #[serde(default = "default_resolve_node_limit")]
    pub resolve_node_limit: u32,

    /// Maximum objects a ListObjects call returns.
    #[serde(default = "default_list_objects_max_results")]
    pub list_objects_max_results: u32,

    /// ListObjects deadline in seconds; elapsed time returns a partial
    /// result.
    #[serde(default = "default_list_objects_deadline")]
    pub list_objects_deadline_secs: u64,

    /// Change log horizon offset in seconds; changes newer than this are
    /// withheld from ReadChanges.
    #[serde(default)]
    pub changelog_horizon_offset_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_tuples_per_write: default_max_tuples_per_write(),
            max_types_per_authorization_model: default_max_types_per_model(),
            resolve_node_limit: default_resolve_node_limit(),
            list_objects_max_results: default_list_objects_max_results(),
            list_objects_deadline_secs: default_list_objects_deadline(),
            changelog_horizon_offset_secs: 0,
        }
    }
}

impl LimitSettings {
    /// The ListObjects deadline as a `Duration`.
    pub fn list_objects_deadline(&self) -> Duration {
        Duration::from_secs(self.list_objects_deadline_secs)
    }

    /// The change log horizon offset as a `Duration`.
    pub fn changelog_horizon_offset(&self) -> Duration {
        Duration::from_secs(self.changelog_horizon_offset_secs)
    }
}

fn default_max_tuples_per_write() -> usize {
    100
}

fn default_max_types_per_model() -> usize {
    100
}

fn default_resolve_node_limit() -> u32 {
    25
}

fn default_list_objects_max_results() -> u32 {
    1000
}

fn default_list_objects_deadline() -> u64 {
    3
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Error type for configuration loading and verification.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable
    /// overrides (`RELATA_SERVER__PORT=9090` overrides `server.port`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("RELATA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.verify()?;

        Ok(server_config)
    }

    /// Load configuration from defaults and environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(
                Environment::with_prefix("RELATA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.verify()?;

        Ok(server_config)
    }

    /// Verify the configuration is runnable.
    pub fn verify(&self) -> Result<(), ConfigLoadError> {
        if self.server.port == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "server.port must be greater than 0".to_string(),
            });
        }

        if let Some(tls) = &self.http.tls {
            if tls.enabled {
                let cert_missing = tls.cert_path.as_deref().map_or(true, str::is_empty);
                let key_missing = tls.key_path.as_deref().map_or(true, str::is_empty);
                if cert_missing || key_missing {
                    return Err(ConfigLoadError::Invalid {
                        message: "'http.tls.cert' and 'http.tls.key' configs must be set"
                            .to_string(),
                    });
                }
            }
        }

        if self.http.upstream_timeout_secs < self.limits.list_objects_deadline_secs {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "config 'http.upstreamTimeout' ({}s) cannot be lower than 'listObjectsDeadline' config ({}s)",
                    self.http.upstream_timeout_secs, self.limits.list_objects_deadline_secs
                ),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.format must be one of: {:?}, got: {}",
                    valid_formats, self.logging.format
                ),
            });
        }

        Ok(())
    }
}
