//! Configuration module
//!
//! Handles loading and saving CalcNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{self, DropProbability, RetryPolicy};
use crate::protocol::{DEFAULT_CLIENT_PORT, DEFAULT_HOST, DEFAULT_SERVER_PORT};

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

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Client retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Server loss simulation settings
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Batch client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host the server binds to and the client talks to
    #[serde(default = "default_host")]
    pub host: String,
    /// Local host the UDP client binds to
    #[serde(default = "default_host")]
    pub bind_host: String,
    /// Server port
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Local port for the UDP client
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// Receive buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// TCP connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_client_port() -> u16 {
    DEFAULT_CLIENT_PORT
}

fn default_buffer_size() -> usize {
    1024
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            bind_host: default_host(),
            server_port: default_server_port(),
            client_port: default_client_port(),
            buffer_size: default_buffer_size(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Deadline for the first attempt in ms
    #[serde(default = "default_initial_timeout")]
    pub initial_timeout_ms: u64,
    /// Largest deadline that may be armed, in ms
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,
}

fn default_initial_timeout() -> u64 {
    network::retry::INITIAL_TIMEOUT.as_millis() as u64
}

fn default_max_timeout() -> u64 {
    network::retry::DEFAULT_MAX_TIMEOUT.as_millis() as u64
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: default_initial_timeout(),
            max_timeout_ms: default_max_timeout(),
        }
    }
}

/// Loss simulator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Drop probability used when none is given on the command line
    pub drop_probability: Option<f64>,
    /// RNG seed for reproducible runs (OS entropy if not set)
    pub seed: Option<u64>,
}

/// Batch client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Pause between expressions in ms
    #[serde(default = "default_line_delay")]
    pub line_delay_ms: u64,
}

fn default_line_delay() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            line_delay_ms: default_line_delay(),
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
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("calcnet/config.toml")),
            Some(PathBuf::from("./calcnet.toml")),
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

    /// Check values that serde alone can't
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry_policy()?;
        self.drop_probability()?;
        if self.network.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        RetryPolicy::new(
            Duration::from_millis(self.retry.initial_timeout_ms),
            Duration::from_millis(self.retry.max_timeout_ms),
        )
        .ok_or_else(|| ConfigError::Invalid("initial_timeout_ms must be positive".to_string()))
    }

    /// Configured drop probability, if any
    pub fn drop_probability(&self) -> ConfigResult<Option<DropProbability>> {
        self.simulator
            .drop_probability
            .map(DropProbability::new)
            .transpose()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn line_delay(&self) -> Duration {
        Duration::from_millis(self.client.line_delay_ms)
    }

    /// Settings handed to the network layer
    pub fn network_config(&self) -> network::NetworkConfig {
        network::NetworkConfig {
            host: self.network.host.clone(),
            bind_host: self.network.bind_host.clone(),
            server_port: self.network.server_port,
            client_port: self.network.client_port,
            buffer_size: self.network.buffer_size,
            connect_timeout_ms: self.network.connect_timeout_ms,
        }
    }
}

/// Sample configuration with every section filled in
pub fn sample_config() -> Config {
    Config {
        simulator: SimulatorConfig {
            drop_probability: Some(DropProbability::default().value()),
            seed: Some(42),
        },
        ..Default::default()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    Ok(toml::to_string_pretty(&sample_config())?)
}
