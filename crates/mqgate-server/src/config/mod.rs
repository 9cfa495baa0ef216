//! Broker configuration and limits.
//!
//! Supports configuration from:
//! - TOML file (default: `mqgate.toml`)
//! - Environment variables with `MQGATE__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `MQGATE__SERVER__BIND=0.0.0.0:1884`
//! - `MQGATE__LIMITS__MAX_PACKET_SIZE=2097152`
//! - `MQGATE__MQTT__MAX_QOS=1`
//!
//! In-file substitution examples:
//! ```toml
//! [server]
//! bind = "${MQTT_HOST:-0.0.0.0}:${MQTT_PORT:-1883}"
//! ```

mod limits;
mod log;
mod mqtt;
mod server;

use std::path::Path;
use std::sync::OnceLock;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub use limits::{
    LimitsConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_TOPIC_LENGTH,
    DEFAULT_MAX_TOPIC_LEVELS,
};
pub use log::LogConfig;
pub use mqtt::MqttConfig;
pub use server::{ServerConfig, DEFAULT_BIND};

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "mqgate.toml";

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is a valid regex")
    })
}

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Listener configuration.
    pub server: ServerConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// MQTT feature configuration.
    pub mqtt: MqttConfig,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error: defaults and environment apply.
    /// Environment overrides use the `MQGATE__` prefix with double
    /// underscores for nesting, e.g. `MQGATE__SERVER__BIND=0.0.0.0:1884`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", DEFAULT_BIND)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("limits.max_topic_length", DEFAULT_MAX_TOPIC_LENGTH as i64)?
            .set_default("limits.max_topic_levels", DEFAULT_MAX_TOPIC_LEVELS as i64)?
            .set_default("limits.max_connections", DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default("mqtt.max_qos", 2)?;

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate().map_err(ConfigError::Validation)?;
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.mqtt.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}
