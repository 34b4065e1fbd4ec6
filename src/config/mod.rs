use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::metering_mercury::structs::{ReadMode, DEFAULT_PASSWORD};

fn gateway_timeout_default() -> u64 { return 5000 }
fn gateway_polldelay_default() -> u64 { return 200 }
fn gateway_max_errors_default() -> u32 { return 10 }
fn gateway_tick_default() -> u64 { return 1000 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Milliseconds to wait for a reply
    #[serde(default="gateway_timeout_default")]
    pub timeout: u64,
    /// Milliseconds between a reply and the next request
    #[serde(default="gateway_polldelay_default")]
    pub polldelay: u64,
    /// Consecutive timeouts of one meter that stop the agent
    #[serde(default="gateway_max_errors_default")]
    pub max_errors: u32,
    /// Milliseconds between two supervisory checks
    #[serde(default="gateway_tick_default")]
    pub tick: u64,
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "mercury2mqtt".to_string() }
fn mqtt_topic_default() -> String { return "mercury".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_topic_default")]
    pub topic: String,
}

/// Password of a node, either the raw bytes or a 6 character string
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PasswordConfig {
    Bytes(Vec<u8>),
    Text(String),
    /* numbers, out of range bytes, ... the default password is used instead */
    Other(serde_yml::Value),
}

impl PasswordConfig {
    pub fn to_bytes(&self) -> Option<[u8; 6]> {
        let bytes: &[u8] = match self {
            PasswordConfig::Bytes(b) => b,
            PasswordConfig::Text(t) => t.as_bytes(),
            PasswordConfig::Other(_) => return None,
        };
        bytes.try_into().ok()
    }
}

/// Address of a node, YAML may carry it as number or string
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum AddressConfig {
    Number(u64),
    Text(String),
}

impl AddressConfig {
    /// Valid bus addresses are 1..=255, 0 is the broadcast address
    pub fn to_address(&self) -> Option<u8> {
        let n = match self {
            AddressConfig::Number(n) => *n,
            AddressConfig::Text(t) => t.trim().parse::<u64>().ok()?,
        };
        match u8::try_from(n) {
            Ok(0) | Err(_) => None,
            Ok(a) => Some(a),
        }
    }
}

/* r: 1 and r: true both mean enabled */
fn flag_from_any<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

fn device_polltimefctr_default() -> u32 { return 1 }

/// One element of the flat device description, either a meter node or one of its channels
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
pub struct DeviceItem {
    #[serde(rename="_id")]
    pub id: String,
    #[serde(default)]
    pub foldertype: Option<String>,
    #[serde(default, deserialize_with="flag_from_any")]
    pub folder: bool,
    #[serde(default)]
    pub parent: Option<String>,
    /// Channel key for channels, display name for nodes
    #[serde(default)]
    pub chan: String,
    #[serde(default)]
    pub addr: Option<AddressConfig>,
    #[serde(default)]
    pub handkti: Option<f64>,
    #[serde(default)]
    pub handktu: Option<f64>,
    #[serde(default)]
    pub ks: Option<f64>,
    #[serde(default)]
    pub constant: Option<f64>,
    #[serde(default)]
    pub password: Option<PasswordConfig>,
    #[serde(default)]
    pub readmode: ReadMode,
    #[serde(default, deserialize_with="flag_from_any")]
    pub r: bool,
    #[serde(default="device_polltimefctr_default")]
    pub polltimefctr: u32,
    #[serde(default)]
    pub order: i64,
}

impl DeviceItem {
    pub fn is_node(&self) -> bool {
        self.foldertype.as_deref() == Some("node")
    }

    pub fn is_channel(&self) -> bool {
        !self.folder && !self.is_node()
    }

    pub fn password_bytes(&self) -> [u8; 6] {
        match &self.password {
            None => DEFAULT_PASSWORD,
            Some(p) => p.to_bytes().unwrap_or_else(|| {
                warn!("{}: password must have 6 bytes, using the default one", self.chan);
                DEFAULT_PASSWORD
            }),
        }
    }
}

fn watch_interval_default() -> u64 { return 5 }
fn devices_default() -> Vec<DeviceItem> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub mqtt: MqttConfig,
    /// Seconds between two checks of the config file
    #[serde(default="watch_interval_default")]
    pub watch_interval: u64,
    #[serde(default="devices_default")]
    pub devices: Vec<DeviceItem>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to find the config on config/mercury.yaml or mercury.yaml")]
    NotFound,
    #[error("unable to read config file {path:?}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("unable to parse config file {path:?}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_yml::Error },
    #[error("config base {0} not known")]
    UnknownBase(String),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConfigChange {
    pub base: String, /* gateway, mqtt or devices */
}

#[derive(Clone)]
pub struct Callbacks {
    sender: tokio::sync::broadcast::Sender<ConfigChange>,
}

pub enum ConfigBases {
    Gateway(GatewayConfig),
    Mqtt(MqttConfig),
    Devices(Vec<DeviceItem>),
}

pub struct ConfigHolder {
    pub config: Config,
    pub callbacks: Callbacks,
    pub path: PathBuf,
    /* file contents the current config was parsed from */
    raw: String,
}

pub fn parse_config(path: &Path, contents: &str) -> Result<Config, ConfigError> {
    serde_yml::from_str(contents).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

impl ConfigHolder {
    /// Load the given file, or config/mercury.yaml and mercury.yaml in that order
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => ["config/mercury.yaml", "mercury.yaml"]
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or(ConfigError::NotFound)?,
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let config = parse_config(&path, &contents)?;
        info!("Config loaded from {:?} with {} device entries", path, config.devices.len());

        let (s, _) = tokio::sync::broadcast::channel(16);
        Ok(ConfigHolder {
            config,
            callbacks: Callbacks { sender: s },
            path,
            raw: contents,
        })
    }

    pub fn get_change_receiver(&self) -> tokio::sync::broadcast::Receiver<ConfigChange> {
        return self.callbacks.sender.subscribe();
    }

    /// Take over new file contents, returns true if they changed the config
    pub fn apply_contents(&mut self, contents: String) -> Result<bool, ConfigError> {
        if contents == self.raw {
            return Ok(false);
        }

        let config = parse_config(&self.path, &contents)?;
        self.raw = contents;
        if config == self.config {
            debug!("Config file rewritten without changes");
            return Ok(false);
        }

        let mut changed = Vec::new();
        if config.gateway != self.config.gateway { changed.push("gateway"); }
        if config.mqtt != self.config.mqtt { changed.push("mqtt"); }
        if config.devices != self.config.devices { changed.push("devices"); }
        self.config = config;

        for base in changed {
            let _ = self.callbacks.sender.send(ConfigChange { base: base.to_string() });
        }
        Ok(true)
    }

    pub fn get_copy(&self, base: &str) -> Result<ConfigBases, ConfigError> {
        match base {
            "gateway" => Ok(ConfigBases::Gateway(self.config.gateway.clone())),
            "mqtt" => Ok(ConfigBases::Mqtt(self.config.mqtt.clone())),
            "devices" => Ok(ConfigBases::Devices(self.config.devices.clone())),
            _ => Err(ConfigError::UnknownBase(base.to_string())),
        }
    }

    pub fn get_complete_config(&self) -> Config {
        return self.config.clone();
    }
}

/// Re-read the config file every `interval` and publish changes
pub async fn watch_config(holder: Arc<RwLock<ConfigHolder>>, interval: Duration) {
    let path = holder.read().await.path.clone();
    info!("Watching {:?} for changes every {:?}", path, interval);

    loop {
        tokio::time::sleep(interval).await;

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Unable to read config file {:?}: {e}", path);
                continue;
            }
        };

        match holder.write().await.apply_contents(contents) {
            Ok(true) => info!("Config file {:?} changed", path),
            Ok(false) => {},
            Err(e) => error!("Ignoring config change: {e}"),
        }
    }
}
