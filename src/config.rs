//! Application configuration stored as TOML.
//!
//! The file lives at `~/.config/mqttify/config.toml` unless a path is given on
//! the command line. A missing file is created with defaults on first start so
//! the operator has something to edit.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mqtt::config::{ConnectRequest, Credentials, TlsConfig};

const CONFIG_DIR: &str = ".config/mqttify";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub tls: TlsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            client_id: "mqttify".to_string(),
            keep_alive_secs: 60,
            tls: TlsConfig::Native,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// File holding the username on its first and the password on its second line
    pub credentials_file: PathBuf,
    /// Receives "online" after connecting and "offline" as last will
    pub status_topic: Option<String>,
    /// Subscribed right after the first successful connect
    pub subscribe_topic: Option<String>,
    pub publish_topic: Option<String>,
    pub broker: BrokerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials_file: PathBuf::from("passwd.txt"),
            status_topic: Some("mqttify/client-connection-status".to_string()),
            subscribe_topic: None,
            publish_topic: None,
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Loads the config at `path`, writing the defaults there first if it does not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            Self::load(path).await
        } else {
            info!("Creating default configuration at {}", path.display());
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Builds the connect request, reading the CA bundle if the TLS mode names one.
    pub async fn connect_request(&self, credentials: Credentials) -> Result<ConnectRequest> {
        ConnectRequest::new(
            self.broker.host.clone(),
            self.broker.port,
            credentials,
            self.broker.tls.clone(),
        )
        .with_client_id(self.broker.client_id.clone())
        .with_keep_alive(Duration::from_secs(self.broker.keep_alive_secs))
        .with_status_topic(self.status_topic.clone())
        .load_ca_bundle()
        .await
        .map_err(|e| eyre!("Failed to read CA bundle for {}: {}", self.broker.tls, e))
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
