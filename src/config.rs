//! Configuration for the RPC server.
//!
//! [`ServerConfig`] is the immutable per-server configuration handed to
//! [`Server::new`](crate::Server::new). The binary builds it, together with the
//! process-level settings in [`Config`], from command-line arguments and an
//! optional TOML file. CLI arguments take precedence over config file values.

use crate::framing::Framing;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default idle timeout before a silent connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound for a single framed message.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Immutable per-server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Close a connection after this long without inbound bytes.
    pub idle_timeout: Duration,
    /// Framing applied to both directions.
    pub framing: Framing,
    /// Frames larger than this are rejected as invalid requests.
    pub max_frame_size: usize,
    /// Answer requests still pending after this long with an internal error.
    /// `None` leaves them outstanding until the dispatch function responds.
    pub request_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            framing: Framing::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            request_timeout: None,
        }
    }
}

/// Command-line arguments for the RPC server
#[derive(Parser, Debug)]
#[command(name = "framed-rpc")]
#[command(author = "framed-rpc authors")]
#[command(version = "0.1.0")]
#[command(about = "A framed JSON-RPC server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Idle timeout in milliseconds
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Framing strategy (newline, length-prefixed)
    #[arg(short, long)]
    pub framing: Option<Framing>,

    /// Maximum frame size in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Per-request timeout in milliseconds (0 = none)
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// 0 disables the per-request timeout
    #[serde(default)]
    pub request_timeout_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            framing: Framing::default(),
            max_frame_size: default_max_frame_size(),
            request_timeout_ms: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_millis() as u64
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub log_level: String,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_sources(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let connection = toml_config.connection;
        let idle_timeout_ms = cli.idle_timeout_ms.unwrap_or(connection.idle_timeout_ms);
        let request_timeout_ms = cli
            .request_timeout_ms
            .unwrap_or(connection.request_timeout_ms);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            server: ServerConfig {
                idle_timeout: Duration::from_millis(idle_timeout_ms),
                framing: cli.framing.unwrap_or(connection.framing),
                max_frame_size: cli.max_frame_size.unwrap_or(connection.max_frame_size),
                request_timeout: (request_timeout_ms > 0)
                    .then(|| Duration::from_millis(request_timeout_ms)),
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
