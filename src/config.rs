//! Relay configuration.
//!
//! Everything the relay needs from its deployment is collected in [`RelayConfig`] and passed
//! in at construction. The file format is TOML; every field has a default so a partial file
//! (or none at all) still yields a working setup.
//!
//! ```toml
//! [broker]
//! endpoint = "wss://broker.example.com:8884/mqtt"
//! username = "board"
//! password = "secret"
//!
//! [devices]
//! watch = ["1", "5"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::DeviceId;
use crate::error::RelayError;

const CONFIG_DIR: &str = "eraser-relay";
const CONFIG_FILE: &str = "relay.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub commands: CommandConfig,
    pub devices: DeviceConfig,
    pub http_bridge: HttpBridgeConfig,
}

/// Broker endpoint and connection policy
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// `mqtt://`, `mqtts://`, `ws://` or `wss://` URL of the broker
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prefix of the randomized client id, one id per connection
    pub client_id_prefix: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    pub keepalive_seconds: u64,
    /// Capacity of the outgoing request queue of the MQTT client
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "mqtt://localhost:1883".to_string(),
            username: None,
            password: None,
            client_id_prefix: "eraser_relay_".to_string(),
            reconnect_interval_ms: 5000,
            keepalive_seconds: 60,
            request_capacity: 64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    /// How long a command waits for its response
    pub timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Devices the daemon watches on startup
    pub watch: Vec<String>,
    /// Mark a device offline when it has not reported a status for this long.
    /// Disabled when unset.
    pub status_stale_after_secs: Option<u64>,
    /// Number of log lines kept per device
    pub log_history: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            watch: Vec::new(),
            status_stale_after_secs: None,
            log_history: 50,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HttpBridgeConfig {
    /// Control endpoint used when a call does not name one
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for HttpBridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://raspberrypi.local:5000".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    /// `<config dir>/eraser-relay/relay.toml`, falling back to the working directory
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self, RelayError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RelayError::ConfigIo {
                path: path.to_path_buf(),
                source,
            })?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded relay config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), RelayError> {
        let io_err = |source| RelayError::ConfigIo {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_err)?;
        Ok(())
    }

    /// Writes a default config to `path` unless a file already exists there
    pub async fn ensure_default(path: &Path) -> Result<(), RelayError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| RelayError::ConfigIo {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            info!("Creating default configuration at {}", path.display());
            RelayConfig::default().save(path).await?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        self.broker.endpoint()?;
        if self.broker.client_id_prefix.starts_with(char::is_whitespace) {
            return Err(RelayError::Config(
                "broker.client_id_prefix must not start with whitespace".to_string(),
            ));
        }
        if self.broker.request_capacity == 0 {
            return Err(RelayError::Config(
                "broker.request_capacity must be at least 1".to_string(),
            ));
        }
        if self.commands.timeout_ms == 0 {
            return Err(RelayError::Config(
                "commands.timeout_ms must be greater than zero".to_string(),
            ));
        }
        for id in &self.devices.watch {
            id.parse::<DeviceId>()?;
        }
        if self.devices.status_stale_after_secs == Some(0) {
            return Err(RelayError::Config(
                "devices.status_stale_after_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.commands.timeout_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.devices.status_stale_after_secs.map(Duration::from_secs)
    }
}

/// Transport flavour selected by the endpoint scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub kind: EndpointKind,
    pub host: String,
    pub port: u16,
    /// Full URL, required as broker address by the websocket transports
    pub url: String,
}

impl BrokerConfig {
    pub fn endpoint(&self) -> Result<BrokerEndpoint, RelayError> {
        let url = Url::parse(self.endpoint.trim())
            .map_err(|e| RelayError::Config(format!("invalid broker endpoint: {e}")))?;
        let (kind, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (EndpointKind::Tcp, 1883),
            "mqtts" | "ssl" => (EndpointKind::Tls, 8883),
            "ws" => (EndpointKind::Ws, 80),
            "wss" => (EndpointKind::Wss, 443),
            other => {
                return Err(RelayError::Config(format!(
                    "unsupported broker scheme '{other}'"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RelayError::Config("broker endpoint has no host".to_string()))?
            .to_string();
        Ok(BrokerEndpoint {
            kind,
            host,
            port: url.port().unwrap_or(default_port),
            url: url.to_string(),
        })
    }

    /// Client id for one connection: the configured prefix plus 8 random hex digits
    pub fn client_id(&self) -> String {
        format!("{}{:08x}", self.client_id_prefix, rand::random::<u32>())
    }

    pub fn mqtt_options(&self, client_id: &str) -> Result<MqttOptions, RelayError> {
        let endpoint = self.endpoint()?;
        let broker_addr = match endpoint.kind {
            EndpointKind::Tcp | EndpointKind::Tls => endpoint.host.clone(),
            EndpointKind::Ws | EndpointKind::Wss => endpoint.url.clone(),
        };

        let mut options = MqttOptions::new(client_id, broker_addr, endpoint.port);
        options.set_keep_alive(Duration::from_secs(self.keepalive_seconds));
        match endpoint.kind {
            EndpointKind::Tcp => {}
            EndpointKind::Tls => {
                options.set_transport(Transport::tls_with_default_config());
            }
            EndpointKind::Ws => {
                options.set_transport(Transport::Ws);
            }
            EndpointKind::Wss => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }

        match (&self.username, &self.password) {
            (Some(user), password) => {
                options.set_credentials(user.clone(), password.clone().unwrap_or_default());
            }
            (None, Some(_)) => {
                warn!("Broker password configured without username, ignoring credentials");
            }
            (None, None) => {}
        }

        debug!(
            "Prepared MQTT options for {}:{} ({:?}) as {}",
            endpoint.host, endpoint.port, endpoint.kind, client_id
        );
        Ok(options)
    }
}
