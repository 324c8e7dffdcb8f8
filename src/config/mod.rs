//! Configuration module
//!
//! Handles loading and saving buslink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::BusSettings;
use crate::protocol::{Address, AddressError, DEFAULT_BUS_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid address in config: {0}")]
    Address(#[from] AddressError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Bus connection settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Catalog service settings
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bus port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Receive loop poll interval in ms
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_BUS_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    250
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fixed client address (generated per run if not set)
    pub address: Option<String>,
    /// Seconds to wait for a reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Catalog service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Address the catalog service registers under
    #[serde(default = "default_service_address")]
    pub service_address: String,
    /// JSON file holding the product list
    pub data_file: Option<PathBuf>,
}

fn default_service_address() -> String {
    "prodc".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            service_address: default_service_address(),
            data_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("buslink/config.toml")),
            Some(PathBuf::from("./buslink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Connection settings for the bus
    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            host: self.bus.host.clone(),
            port: self.bus.port,
            connect_timeout_ms: self.bus.connect_timeout_ms,
            poll_interval_ms: self.bus.poll_interval_ms,
            ..Default::default()
        }
    }

    /// The client address, generating one if not set
    pub fn client_address(&self) -> ConfigResult<Address> {
        match &self.client.address {
            Some(name) => Ok(Address::padded(name)?),
            None => Ok(Address::generate()),
        }
    }

    pub fn service_address(&self) -> ConfigResult<Address> {
        Ok(Address::padded(&self.catalog.service_address)?)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        client: ClientConfig {
            address: Some("cli01".to_string()),
            ..Default::default()
        },
        catalog: CatalogConfig {
            data_file: Some(PathBuf::from("products.json")),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
