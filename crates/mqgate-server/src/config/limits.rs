//! Limits configuration.

use mqgate_core::frame::MAX_FRAME_SIZE;
use serde::Deserialize;

/// Default maximum packet size (1MB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Default maximum topic length in bytes.
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 4096;

/// Default maximum topic levels (depth).
pub const DEFAULT_MAX_TOPIC_LEVELS: usize = 32;

/// Default maximum connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100_000;

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum MQTT packet size in bytes, fixed header included.
    /// Larger frames close the connection before their body is read.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Maximum topic filter length in bytes (0 = no limit).
    #[serde(default = "default_max_topic_length")]
    pub max_topic_length: usize,

    /// Maximum topic levels (segments separated by '/', 0 = no limit).
    #[serde(default = "default_max_topic_levels")]
    pub max_topic_levels: usize,

    /// Maximum concurrent connections (0 = no limit).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}
fn default_max_topic_length() -> usize {
    DEFAULT_MAX_TOPIC_LENGTH
}
fn default_max_topic_levels() -> usize {
    DEFAULT_MAX_TOPIC_LEVELS
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_topic_length: DEFAULT_MAX_TOPIC_LENGTH,
            max_topic_levels: DEFAULT_MAX_TOPIC_LEVELS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl LimitsConfig {
    /// Validate the limits configuration.
    pub fn validate(&self) -> Result<(), String> {
        // Smallest useful frame is a 2-byte PINGREQ.
        if self.max_packet_size < 2 {
            return Err("max_packet_size must be at least 2".into());
        }
        if self.max_packet_size > MAX_FRAME_SIZE {
            return Err(format!("max_packet_size must not exceed {}", MAX_FRAME_SIZE));
        }
        if self.max_topic_length > u16::MAX as usize {
            return Err(format!("max_topic_length must not exceed {}", u16::MAX));
        }
        Ok(())
    }
}
