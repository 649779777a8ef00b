//! Configuration module for the timed-relay client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::relay::{DEFAULT_BUFFER_SIZE, DEFAULT_TICK};
use crate::runtime::Backend;
use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay client
#[derive(Parser, Debug)]
#[command(name = "timed-relay")]
#[command(author = "timed-relay authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Connect to a TCP endpoint with an optional timeout and relay stdin to it",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server host name or address
    pub host: Option<String>,

    /// Server port
    pub port: Option<u16>,

    /// Connect timeout in seconds (negative = no timeout)
    #[arg(short, long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,

    /// Address family to connect with
    #[arg(long, value_enum)]
    pub family: Option<Family>,

    /// Readiness backend
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Relay liveness tick in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Socket read chunk size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Address family filter applied to resolved endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl Family {
    /// Whether `addr` belongs to this family.
    pub fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectConfig {
    /// Host to connect to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to
    pub port: Option<u16>,
    /// Connect timeout in seconds (negative = no timeout)
    pub timeout: Option<i64>,
    /// Address family filter
    #[serde(default)]
    pub family: Family,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            timeout: None,
            family: Family::Any,
        }
    }
}

/// Relay-related configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Readiness backend
    #[serde(default)]
    pub backend: Backend,
    /// Liveness tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Socket read chunk size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            tick_ms: default_tick_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK.as_millis() as u64
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// `None` blocks with the platform's connect semantics.
    pub timeout: Option<Duration>,
    pub family: Family,
    pub backend: Backend,
    pub tick: Duration,
    pub buffer_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.connect.port)
            .ok_or(ConfigError::MissingPort)?;

        let tick_ms = cli.tick_ms.unwrap_or(toml_config.relay.tick_ms);
        if tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be greater than zero"));
        }

        let buffer_size = cli.buffer_size.unwrap_or(toml_config.relay.buffer_size);
        if buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than zero"));
        }

        // Negative seconds is the "no timeout" convention.
        let timeout = cli
            .timeout
            .or(toml_config.connect.timeout)
            .and_then(|secs| u64::try_from(secs).ok())
            .map(Duration::from_secs);

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.connect.host),
            port,
            timeout,
            family: cli.family.unwrap_or(toml_config.connect.family),
            backend: cli.backend.unwrap_or(toml_config.relay.backend),
            tick: Duration::from_millis(tick_ms),
            buffer_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingPort => {
                write!(f, "No port given on the command line or in [connect]")
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
