//! Configuration module for chat-hub.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE;

/// Command-line arguments for the chat hub
#[derive(Parser, Debug)]
#[command(name = "chat-hub")]
#[command(author = "chat-hub authors")]
#[command(version = "0.1.0")]
#[command(about = "A broadcast chat server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on, or to connect to in client mode (e.g., 127.0.0.1:9900)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog for pending connections
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Largest accepted frame payload in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Join the hub as a chat client with this name instead of serving
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Readiness events collected per poll round
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Largest declared frame length accepted from a client
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Pending output per client before it is dropped as unresponsive
    #[serde(default = "default_max_write_backlog")]
    pub max_write_backlog: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_write_backlog: default_max_write_backlog(),
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

fn default_listen() -> String {
    "127.0.0.1:9900".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_write_backlog() -> usize {
    4 * 1024 * 1024 // 4 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub event_capacity: usize,
    pub max_frame_size: usize,
    pub max_write_backlog: usize,
    /// Client mode when set.
    pub name: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9900)),
            backlog: default_backlog(),
            event_capacity: default_event_capacity(),
            max_frame_size: default_max_frame_size(),
            max_write_backlog: default_max_write_backlog(),
            name: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);

        Ok(Config {
            listen: resolve_listen(&listen)?,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            event_capacity: toml_config.server.event_capacity.max(1),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.limits.max_frame_size),
            max_write_backlog: toml_config.limits.max_write_backlog,
            name: cli.name,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Resolve `host:port`, accepting host names such as `localhost`.
fn resolve_listen(listen: &str) -> Result<SocketAddr, ConfigError> {
    listen
        .to_socket_addrs()
        .map_err(|_| ConfigError::InvalidListen(listen.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::InvalidListen(listen.to_string()))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
}
