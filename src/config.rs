//! Bridge configuration file.

use crate::bus::BusConfig;
use crate::protocol::{DeviceInitRequest, MAX_EVENT_SIZE};
use crate::publisher::DEFAULT_EVENT_TOPIC;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LISTEN_PORT: u16 = 8090;
/// Smallest payload limit that still fits an event with one reading.
pub const MIN_PAYLOAD_BYTES: usize = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    /// Bring the bus up at startup when set.
    pub bus: Option<BusConfig>,
    pub tick_interval_ms: u64,
    pub event_topic: String,
    pub max_payload_bytes: usize,
    pub listen_port: u16,
    /// Devices initialized right after the bus comes up.
    pub devices: Vec<DeviceInitRequest>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bus: None,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            event_topic: DEFAULT_EVENT_TOPIC.into(),
            max_payload_bytes: MAX_EVENT_SIZE,
            listen_port: DEFAULT_LISTEN_PORT,
            devices: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be nonzero".into()));
        }
        if !(MIN_PAYLOAD_BYTES..=MAX_EVENT_SIZE).contains(&self.max_payload_bytes) {
            return Err(ConfigError::Invalid(format!(
                "max_payload_bytes must be between {MIN_PAYLOAD_BYTES} and {MAX_EVENT_SIZE}"
            )));
        }
        if self.event_topic.is_empty() {
            return Err(ConfigError::Invalid("event_topic is empty".into()));
        }
        for (i, device) in self.devices.iter().enumerate() {
            if self.devices[..i].iter().any(|other| other.address == device.address) {
                return Err(ConfigError::Invalid(format!(
                    "device address 0x{:02X} listed more than once",
                    device.address
                )));
            }
        }
        Ok(())
    }
}
