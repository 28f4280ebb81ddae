use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::coordinator::CoordinatorSettings;
use crate::error::ConfigError;
use crate::models::{DeviceAddress, DeviceDescriptor};
use crate::session::SessionTimeouts;

pub const CONFIG_ENV: &str = "FEEDERLINK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "feederlink.yaml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FeederConfig {
    pub poll_interval_secs: u64,
    pub device_poll_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_concurrent_polls: usize,
    pub feed_reset_ms: u64,
    pub health_interval_secs: u64,
    /// Distributeurs simulés en mémoire à la place du BLE
    pub simulate: bool,
    pub mqtt: Option<MqttConf>,
    pub devices: Vec<DeviceConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceConf {
    pub mac: String,
    pub name: String,
    #[serde(default)]
    pub mqtt_topic: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: default_mqtt_port(),
            user: None,
            password: None,
            client_id: None,
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            device_poll_timeout_ms: 20_000,
            connect_timeout_ms: 8_000,
            read_timeout_ms: 4_000,
            write_timeout_ms: 4_000,
            disconnect_timeout_ms: 2_000,
            shutdown_timeout_ms: 10_000,
            max_concurrent_polls: 4,
            feed_reset_ms: 2_000,
            health_interval_secs: 30,
            simulate: false,
            mqtt: None,
            devices: Vec::new(),
        }
    }
}

impl FeederConfig {
    pub fn parse(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(txt)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("device_poll_timeout_ms", self.device_poll_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("feed_reset_ms", self.feed_reset_ms),
            ("health_interval_secs", self.health_interval_secs),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid {
                field: *field,
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_concurrent_polls == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_polls",
                reason: "must be at least 1".into(),
            });
        }
        self.descriptors().map(|_| ())
    }

    /// Descripteurs validés : adresses canoniques, sans doublon
    pub fn descriptors(&self) -> Result<Vec<DeviceDescriptor>, ConfigError> {
        let mut seen = HashSet::new();
        self.devices
            .iter()
            .map(|d| {
                let address: DeviceAddress = d.mac.parse()?;
                if !seen.insert(address) {
                    return Err(ConfigError::DuplicateDevice(address));
                }
                Ok(DeviceDescriptor::new(address, d.name.clone(), d.mqtt_topic.clone()))
            })
            .collect()
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
            disconnect: Duration::from_millis(self.disconnect_timeout_ms),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            device_poll_timeout: Duration::from_millis(self.device_poll_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            max_concurrent_polls: self.max_concurrent_polls,
            timeouts: self.session_timeouts(),
        }
    }

    pub fn feed_reset(&self) -> Duration {
        Duration::from_millis(self.feed_reset_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

pub async fn load_from(path: impl AsRef<Path>) -> Result<FeederConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(FeederConfig::default());
    }
    let txt = tokio::fs::read_to_string(path).await?;
    let config = FeederConfig::parse(&txt)?;
    info!(path = %path.display(), devices = config.devices.len(), "config loaded");
    Ok(config)
}

/// Chemin depuis `FEEDERLINK_CONFIG`, sinon `feederlink.yaml`
pub async fn load_config() -> Result<FeederConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_from(path).await
}
