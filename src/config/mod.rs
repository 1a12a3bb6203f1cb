// config/mod.rs
use serde::Deserialize;
use config::Config;
use std::{path::PathBuf, time::Duration};

use crate::devices::DEFAULT_BRIGHTNESS_DEBOUNCE;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub metrics: MetricsSettings,
    pub proxy: ProxySettings,
    pub storage: StorageSettings,
    pub controller: ControllerSettings,
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    pub address: String,
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ProxySettings {
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageSettings {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ControllerSettings {
    pub brightness_debounce_ms: u64,
}

impl ProxySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ControllerSettings {
    pub fn brightness_debounce(&self) -> Duration {
        Duration::from_millis(self.brightness_debounce_ms)
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::from_file("config/config")
    }

    /// `path` is optional; every key has a default and `APP__SECTION__KEY`
    /// environment variables (e.g. `APP__PROXY__TIMEOUT_MS`) override both.
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .set_default("server.address", "0.0.0.0:3000")?
            .set_default("server.static_dir", "static")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.port", 9000)?
            .set_default("proxy.timeout_ms", 5000)?
            .set_default("storage.path", "data/devices.json")?
            .set_default(
                "controller.brightness_debounce_ms",
                DEFAULT_BRIGHTNESS_DEBOUNCE.as_millis() as u64,
            )?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}
