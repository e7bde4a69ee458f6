//! Configuration module for muxbench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which side of the exchange this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Server,
    Client,
}

/// Which transport to exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportType {
    /// Many calls interleaved over one TCP connection.
    Mux,
    /// HTTP/1.1, one in-flight request per TCP connection.
    Http,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "muxbench")]
#[command(author = "muxbench authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Compare one multiplexed connection against connection-per-request HTTP/1.1",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server or client
    #[arg(short, long, value_enum)]
    pub role: Role,

    /// Transport to serve or benchmark
    #[arg(short, long, value_enum)]
    pub transport: TransportType,

    /// Address to listen on (server) or connect to (client)
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Number of concurrent calls the client issues
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Artificial work the server performs per call, in milliseconds
    #[arg(short, long)]
    pub delay_ms: Option<u64>,

    /// Disable HTTP connection pooling (every call dials its own connection)
    #[arg(long)]
    pub no_pool: bool,

    /// HTTP server handles one connection at a time
    #[arg(long)]
    pub serial: bool,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the multiplexed server
    #[serde(default = "default_listen_mux")]
    pub listen_mux: String,
    /// Listen address for the HTTP server
    #[serde(default = "default_listen_http")]
    pub listen_http: String,
    /// Artificial work per call in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Handle HTTP connections one at a time
    #[serde(default)]
    pub serial: bool,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_mux: default_listen_mux(),
            listen_http: default_listen_http(),
            delay_ms: default_delay_ms(),
            serial: false,
            workers: None,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Server address for the multiplexed client
    #[serde(default = "default_connect_mux")]
    pub connect_mux: String,
    /// Server address for the HTTP client
    #[serde(default = "default_connect_http")]
    pub connect_http: String,
    /// Concurrent calls per run
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Reuse idle HTTP connections
    #[serde(default = "default_pool")]
    pub pool: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_mux: default_connect_mux(),
            connect_http: default_connect_http(),
            concurrency: default_concurrency(),
            pool: default_pool(),
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

fn default_listen_mux() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_listen_http() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_connect_mux() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_connect_http() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_delay_ms() -> u64 {
    2000
}

fn default_concurrency() -> usize {
    5
}

fn default_pool() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub transport: TransportType,
    pub listen_mux: String,
    pub listen_http: String,
    pub connect_mux: String,
    pub connect_http: String,
    pub concurrency: usize,
    pub delay: Duration,
    pub pool: bool,
    pub serial: bool,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut config = Config {
            role: cli.role,
            transport: cli.transport,
            listen_mux: toml_config.server.listen_mux,
            listen_http: toml_config.server.listen_http,
            connect_mux: toml_config.client.connect_mux,
            connect_http: toml_config.client.connect_http,
            concurrency: cli.concurrency.unwrap_or(toml_config.client.concurrency),
            delay: Duration::from_millis(cli.delay_ms.unwrap_or(toml_config.server.delay_ms)),
            pool: !cli.no_pool && toml_config.client.pool,
            serial: cli.serial || toml_config.server.serial,
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        // --addr applies to whichever address this role/transport uses
        if let Some(addr) = cli.addr {
            *config.addr_mut() = addr;
        }

        if config.concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if config.workers == Some(0) {
            return Err(ConfigError::InvalidValue(
                "workers must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Address to listen on or connect to, per role and transport.
    pub fn addr(&self) -> &str {
        match (self.role, self.transport) {
            (Role::Server, TransportType::Mux) => &self.listen_mux,
            (Role::Server, TransportType::Http) => &self.listen_http,
            (Role::Client, TransportType::Mux) => &self.connect_mux,
            (Role::Client, TransportType::Http) => &self.connect_http,
        }
    }

    fn addr_mut(&mut self) -> &mut String {
        match (self.role, self.transport) {
            (Role::Server, TransportType::Mux) => &mut self.listen_mux,
            (Role::Server, TransportType::Http) => &mut self.listen_http,
            (Role::Client, TransportType::Mux) => &mut self.connect_mux,
            (Role::Client, TransportType::Http) => &mut self.connect_http,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}
