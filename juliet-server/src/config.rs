//! Server configuration.
//!
//! Settings are layered: built-in defaults, then an optional YAML file
//! (`--config` or `JULIET_CONFIG`), then `JULIET_*` environment variables.

use crate::channel::is_valid_channel_name;
use crate::handler::is_valid_nickname;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Longest server name a client will accept.
pub const MAX_SERVER_NAME: usize = 63;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub server: ServerIdentity,
    pub radio: RadioConfig,
    /// Relay bot settings, used by client mode only.
    pub client: ClientConfig,
}

impl Config {
    /// Reads the file named by `JULIET_CONFIG` when set, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("JULIET_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parses a YAML file. Missing sections and fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Overlays the `JULIET_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.server.apply_env_overrides();
        self.radio.apply_env_overrides();
        self.client.apply_env_overrides();
    }

    /// Writes the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks settings that would otherwise fail at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive".into()));
        }
        if self.server.name.is_empty() || self.server.name.contains(' ') {
            return Err(ConfigError::Invalid(format!(
                "invalid server name '{}'",
                self.server.name
            )));
        }
        self.radio.validate()
    }
}

/// Parsed value of environment variable `name`, if set and well formed.
fn env_value<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Non-empty value of environment variable `name`. An empty value maps to
/// `Some(None)` so it can clear an optional setting.
fn env_optional(name: &str) -> Option<Option<String>> {
    std::env::var(name).ok().map(|v| Some(v).filter(|v| !v.is_empty()))
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_addr: SocketAddr,
    /// Seconds of silence before a client is probed; twice this evicts it.
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 6667)),
            idle_timeout_secs: 120,
            max_connections: 256,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_value("JULIET_BIND") {
            self.bind_addr = addr;
        }
        if let Some(secs) = env_value("JULIET_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(max) = env_value("JULIET_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// How the server presents itself to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerIdentity {
    /// Name used as the prefix of every server reply.
    pub name: String,
    /// Message of the day. Multiple lines are sent as separate 372 replies.
    pub motd: Option<String>,
    /// Connection password. Clients must send a matching PASS when set.
    pub password: Option<String>,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            motd: None,
            password: None,
        }
    }
}

impl ServerIdentity {
    fn apply_env_overrides(&mut self) {
        if let Some(Some(name)) = env_optional("JULIET_SERVER_NAME") {
            self.name = truncate_name(&name);
        }
        if let Some(motd) = env_optional("JULIET_MOTD") {
            self.motd = motd;
        }
        if let Some(password) = env_optional("JULIET_PASSWORD") {
            self.password = password;
        }
    }
}

fn truncate_name(name: &str) -> String {
    name.trim().chars().take(MAX_SERVER_NAME).collect()
}

/// Host name of this machine, falling back to `localhost`.
fn default_server_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| truncate_name(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Radio link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Start the radio bridge.
    pub enabled: bool,
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Use an in-memory echo device instead of a serial port.
    pub loopback: bool,
    /// Upper bound on a single device read in milliseconds.
    pub read_timeout_ms: u64,
    /// Minimum spacing between transmissions in milliseconds.
    pub transmit_interval_ms: u64,
    /// Bytes kept while waiting for a frame to complete.
    pub max_buffer_bytes: usize,
    /// Drop frames whose checksum does not match.
    pub verify_checksum: bool,
    /// Channel that receives radio traffic not addressed to a channel.
    pub relay_channel: String,
    /// Sender id stamped on uplinked frames in place of the nickname.
    pub callsign: Option<String>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: None,
            baud_rate: 9600,
            loopback: false,
            read_timeout_ms: 100,
            transmit_interval_ms: 1000,
            max_buffer_bytes: juliet_protocol::DEFAULT_MAX_BUFFER,
            verify_checksum: true,
            relay_channel: "#radio".to_string(),
            callsign: None,
        }
    }
}

impl RadioConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("JULIET_RADIO_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(port) = env_optional("JULIET_RADIO_PORT") {
            self.port = port;
        }
        if let Some(baud) = env_value("JULIET_RADIO_BAUD") {
            self.baud_rate = baud;
        }
        if let Some(loopback) = env_flag("JULIET_RADIO_LOOPBACK") {
            self.loopback = loopback;
        }
        if let Some(Some(channel)) = env_optional("JULIET_RELAY_CHANNEL") {
            self.relay_channel = channel;
        }
        if let Some(callsign) = env_optional("JULIET_CALLSIGN") {
            self.callsign = callsign;
        }
    }

    /// Checked only when the radio is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.port.is_none() && !self.loopback {
            return Err(ConfigError::Invalid("radio enabled but port not set".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("radio baud_rate must be positive".into()));
        }
        if !is_valid_channel_name(&self.relay_channel) {
            return Err(ConfigError::Invalid(format!(
                "invalid relay channel '{}'",
                self.relay_channel
            )));
        }

        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn transmit_interval(&self) -> Duration {
        Duration::from_millis(self.transmit_interval_ms)
    }
}

/// A channel the relay bot joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientChannel {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// Relay bot connection to an existing chat server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub nickname: String,
    /// Real name sent with USER.
    pub fullname: String,
    /// Sent as PASS before registering when set.
    pub password: Option<String>,
    pub channels: Vec<ClientChannel>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6667,
            nickname: "juliet".to_string(),
            fullname: "Juliet Radio Bot".to_string(),
            password: None,
            channels: vec![ClientChannel {
                name: "#radio".to_string(),
                key: None,
            }],
        }
    }
}

impl ClientConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(Some(host)) = env_optional("JULIET_CLIENT_HOST") {
            self.host = host;
        }
        if let Some(port) = env_value("JULIET_CLIENT_PORT") {
            self.port = port;
        }
        if let Some(Some(nickname)) = env_optional("JULIET_CLIENT_NICK") {
            self.nickname = nickname;
        }
        if let Some(password) = env_optional("JULIET_CLIENT_PASSWORD") {
            self.password = password;
        }
    }

    /// Checked only when running in client mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("client host not set".into()));
        }
        if !is_valid_nickname(&self.nickname) {
            return Err(ConfigError::Invalid(format!(
                "invalid client nickname '{}'",
                self.nickname
            )));
        }
        if let Some(bad) = self
            .channels
            .iter()
            .find(|channel| !is_valid_channel_name(&channel.name))
        {
            return Err(ConfigError::Invalid(format!(
                "invalid client channel '{}'",
                bad.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write config file '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
