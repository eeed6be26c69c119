//! Command line and configuration file handling
//!
//! Produces the immutable [`BridgeConfig`] bundle handed to the bridge at
//! startup. Values are layered: command line over configuration file over
//! built-in defaults.
//!
//! ```toml
//! aliases_file = "remote.csv"
//!
//! [broker]
//! host = "broker.local"
//! port = 1883
//! username = "ir"
//! password = "secret"
//! topic = "nec/tx"
//!
//! [device]
//! vendor = "Arduino"
//! baud_rate = 115200
//!
//! [aliases]
//! power = "E0E040BF"
//! ```

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, Level};

use crate::codes::{AliasError, AliasTable};
use crate::device::channel::{SerialSettings, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};
use crate::device::locator::DEFAULT_VENDOR_MARKER;
use crate::mqtt::config::{Credentials, MqttConfig, DEFAULT_CLIENT_ID};

const CONFIG_DIR: &str = "mqtt2nec";
const CONFIG_FILE: &str = "config.toml";

/// Receive NEC IR remote commands over MQTT and send them to an Arduino
#[derive(Parser, Debug)]
#[command(name = "mqtt2nec", version, about)]
pub struct Cli {
    /// Broker hostname
    pub hostname: Option<String>,

    /// Broker port (default: 1883)
    #[arg(long)]
    pub port: Option<u16>,

    /// Broker username
    #[arg(long, short = 'u')]
    pub username: Option<String>,

    /// Broker password
    #[arg(long, short = 'p')]
    pub password: Option<String>,

    /// Broker topic to subscribe to (default: nec/tx)
    #[arg(long, short = 't')]
    pub topic: Option<String>,

    /// Alias file, `name,hex` records or a `.toml` table
    #[arg(long, short = 'a')]
    pub aliases: Option<PathBuf>,

    /// Configuration file (default: <config dir>/mqtt2nec/config.toml if present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Serial port to use instead of searching for the device
    #[arg(long)]
    pub device: Option<String>,

    /// Manufacturer marker used to find the device (default: Arduino)
    #[arg(long)]
    pub vendor: Option<String>,

    /// Serial baud rate (default: 115200)
    #[arg(long)]
    pub baud_rate: Option<u32>,

    /// Serial write timeout in milliseconds (default: 1000)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// MQTT client identifier (default: mqtt2nec)
    #[arg(long)]
    pub client_id: Option<String>,

    /// MQTT keep-alive interval in seconds (default: 60)
    #[arg(long)]
    pub keep_alive: Option<u64>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("No broker hostname given on the command line or in the config file")]
    MissingHostname,

    #[error(transparent)]
    Alias(#[from] AliasError),
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub device: DeviceSection,
    pub aliases_file: Option<PathBuf>,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: Option<u64>,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    pub port: Option<String>,
    pub vendor: Option<String>,
    pub baud_rate: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Fixed port; discovery runs when absent
    pub port: Option<String>,
    pub vendor: String,
    pub serial: SerialSettings,
}

/// Everything the bridge needs, fixed before the session starts
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub aliases: AliasTable,
}

impl FileConfig {
    pub async fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl BridgeConfig {
    /// Reads the configuration file (if any), loads aliases and applies the command line
    pub async fn load(cli: Cli) -> Result<Self, ConfigError> {
        let config_path = match cli.config.clone() {
            Some(path) => Some(path),
            None => existing_default_config().await,
        };

        let (file, base_dir) = match config_path {
            Some(path) => {
                info!("Reading configuration from {}", path.display());
                let file = FileConfig::read(&path).await?;
                (file, path.parent().map(Path::to_path_buf))
            }
            None => {
                debug!("No configuration file, using command line and defaults");
                (FileConfig::default(), None)
            }
        };

        let alias_file = match (&cli.aliases, &file.aliases_file) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(path)) => Some(match &base_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            }),
            (None, None) => None,
        };

        let mut aliases = AliasTable::from_map(file.aliases.clone())?;
        if let Some(path) = alias_file {
            aliases = aliases.merge(AliasTable::load(&path).await?)?;
        }

        Self::merge(cli, file, aliases)
    }

    /// Layers command line values over file values over defaults
    pub fn merge(cli: Cli, file: FileConfig, aliases: AliasTable) -> Result<Self, ConfigError> {
        let broker = file.broker;
        let host = cli
            .hostname
            .or(broker.host)
            .ok_or(ConfigError::MissingHostname)?;

        let mut mqtt = MqttConfig::new(host);
        if let Some(port) = cli.port.or(broker.port) {
            mqtt.port = port;
        }
        if let Some(topic) = cli.topic.or(broker.topic) {
            mqtt.topic = topic;
        }
        mqtt.client_id = cli
            .client_id
            .or(broker.client_id)
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        if let Some(secs) = cli.keep_alive.or(broker.keep_alive_secs) {
            mqtt.keep_alive = Duration::from_secs(secs);
        }

        let username = cli.username.or(broker.username);
        let password = cli.password.or(broker.password);
        if username.is_some() || password.is_some() {
            mqtt.credentials = Some(Credentials {
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
            });
        }

        let device = DeviceConfig {
            port: cli.device.or(file.device.port),
            vendor: cli
                .vendor
                .or(file.device.vendor)
                .unwrap_or_else(|| DEFAULT_VENDOR_MARKER.to_string()),
            serial: SerialSettings {
                baud_rate: cli
                    .baud_rate
                    .or(file.device.baud_rate)
                    .unwrap_or(DEFAULT_BAUD_RATE),
                timeout: Duration::from_millis(
                    cli.timeout_ms
                        .or(file.device.timeout_ms)
                        .unwrap_or(DEFAULT_TIMEOUT_MS),
                ),
            },
        };

        Ok(Self {
            mqtt,
            device,
            aliases,
        })
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

async fn existing_default_config() -> Option<PathBuf> {
    let path = default_config_path()?;
    let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
    exists.then_some(path)
}
