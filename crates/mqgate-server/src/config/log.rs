//! Logging configuration.

use serde::Deserialize;

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter passed to env_logger. Either a bare level
    /// (`debug`) or a full directive list (`info,mqgate_server=trace`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Reject bare words that are not log levels; directive lists are left
    /// to env_logger.
    pub fn validate(&self) -> Result<(), String> {
        let level = self.level.trim();
        if level.is_empty() {
            return Err("log level must not be empty".into());
        }
        let is_directive = level.contains(['=', ',']);
        if !is_directive && !LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "unknown log level '{}', expected one of {}",
                level,
                LEVELS.join(", ")
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(s: &str) -> LogConfig {
        LogConfig {
            level: s.to_string(),
        }
    }

    #[test]
    fn test_levels() {
        assert!(LogConfig::default().validate().is_ok());
        assert!(level("DEBUG").validate().is_ok());
        assert!(level("info,mqgate_server=trace").validate().is_ok());
        assert!(level("verbose").validate().is_err());
        assert!(level("  ").validate().is_err());
    }
}
