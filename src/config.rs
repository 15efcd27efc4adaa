// Configuration module for the iTag BLE addon

use serde::{Deserialize, Serialize};

use crate::ble::DeviceAddress;
use crate::error::{Error, Result};

const DEFAULT_CONFIG_PATH: &str = "/config/options.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    pub devices: Vec<DeviceConfig>,
    #[serde(default = "default_battery_poll_interval")]
    pub battery_poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Adapter name such as "hci0"; the default adapter when absent.
    #[serde(default)]
    pub adapter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub mac: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl DeviceConfig {
    pub fn address(&self) -> Result<DeviceAddress> {
        self.mac.parse()
    }
}

fn default_port() -> u16 {
    1883
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_battery_poll_interval() -> u64 {
    60
}

/// Load the addon options file (overridable via `ITAG_CONFIG`), layered
/// with `ITAG_*` environment overrides.
pub fn load_config() -> Result<Config> {
    let path = std::env::var("ITAG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config: Config = config::Config::builder()
        .add_source(config::File::new(&path, config::FileFormat::Json))
        .add_source(config::Environment::with_prefix("ITAG").separator("__"))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(Error::Config)?;

    // Fail setup on a malformed address rather than at first use.
    for device in &config.devices {
        device.address()?;
    }
    Ok(config)
}
