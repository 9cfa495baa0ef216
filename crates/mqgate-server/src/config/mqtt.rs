//! MQTT feature configuration.

use serde::Deserialize;

/// MQTT feature configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS granted to subscriptions (0, 1, or 2).
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
}

fn default_max_qos() -> u8 {
    2
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
        }
    }
}

impl MqttConfig {
    /// Validate the MQTT configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_qos > 2 {
            return Err("max_qos must be 0, 1, or 2".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MqttConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_max_qos() {
        let config = MqttConfig { max_qos: 3 };
        assert!(config.validate().is_err());
    }
}
