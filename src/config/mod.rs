//! Configuration management

use crate::client::{ReactorOptions, UnknownStreamPolicy, DEFAULT_CHUNK_SIZE};
use crate::tunnel::{ReclaimPolicy, MAX_PACKET_DATA};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File looked up in the working directory
pub const LOCAL_CONFIG: &str = "config.toml";

/// File looked up in the home directory
pub const HOME_CONFIG: &str = ".usocks.toml";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        if let Some(client) = &config.client {
            client.validate()?;
        }
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Locate the configuration file
///
/// An explicit path wins; otherwise `./config.toml`, then `~/.usocks.toml`.
pub fn find_config(explicit: Option<&Path>, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.is_file() {
        return Some(local);
    }

    home.map(|home| home.join(HOME_CONFIG))
        .filter(|path| path.is_file())
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local listen address
    #[serde(default = "default_address")]
    pub address: String,
    /// Local listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pre-shared key
    pub key: String,
    /// Maximum bytes read from a local socket at once, up to one packet
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Handling of packets for unknown streams
    #[serde(default)]
    pub unknown_streams: UnknownStreamPolicy,
    /// Seconds a FIN'd stream id stays reserved without the peer's close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fin_timeout_secs: Option<u64>,
    /// Backend transport
    pub backend: BackendConfig,
}

fn default_address() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            key: String::new(),
            chunk_size: default_chunk_size(),
            unknown_streams: UnknownStreamPolicy::default(),
            fin_timeout_secs: None,
            backend: BackendConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reject values the client cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.key.is_empty() {
            return Err(crate::Error::Config("Missing key in [client]".into()));
        }
        if self.chunk_size == 0 {
            return Err(crate::Error::Config("chunk_size must be positive".into()));
        }
        if self.chunk_size > MAX_PACKET_DATA {
            return Err(crate::Error::Config(format!(
                "chunk_size must be at most {}",
                MAX_PACKET_DATA
            )));
        }
        Ok(())
    }

    /// Stream id reclamation after our FIN
    pub fn reclaim_policy(&self) -> ReclaimPolicy {
        ReclaimPolicy::from_timeout(self.fin_timeout_secs)
    }

    /// Reactor tunables from this configuration
    pub fn reactor_options(&self) -> ReactorOptions {
        ReactorOptions {
            chunk_size: self.chunk_size,
            unknown_streams: self.unknown_streams,
            reclaim: self.reclaim_policy(),
        }
    }
}

/// Backend transport selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Plain TCP connection to the server
    Tcp {
        server: String,
        port: u16,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Tcp {
            server: "localhost".to_string(),
            port: 8001,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: Some(ClientConfig {
            key: "change me".to_string(),
            ..ClientConfig::default()
        }),
        logging: LoggingConfig::default(),
    }
}
