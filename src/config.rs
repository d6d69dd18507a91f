//! Configuration for the framepipe server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. Beyond the fixed
//! fields, a free-form `[params]` table offers typed key lookup for
//! application code, with named accessors for the session-timing knobs.

use crate::codec::DEFAULT_MAX_FRAME_LEN;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "framepipe")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed command framing TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
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
    pub codec: CodecConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub params: toml::Table,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Per-worker connection limit
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Framing-related configuration
#[derive(Debug, Deserialize)]
pub struct CodecConfig {
    /// Ceiling for the frame length field
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Size of the per-worker read scratch buffer
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            read_buffer: default_read_buffer(),
        }
    }
}

/// Session-timing parameters, all in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_tick")]
    pub tick_ms: u64,
    #[serde(default = "default_session_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_session_empty_timeout")]
    pub empty_timeout_ms: u64,
    #[serde(default = "default_session_invalidate")]
    pub invalidate_ms: u64,
    #[serde(default = "default_session_next_day_invalidate")]
    pub next_day_invalidate_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_session_tick(),
            timeout_ms: default_session_timeout(),
            empty_timeout_ms: default_session_empty_timeout(),
            invalidate_ms: default_session_invalidate(),
            next_day_invalidate_ms: default_session_next_day_invalidate(),
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
    "127.0.0.1:9000".to_string()
}

fn default_max_connections() -> usize {
    10_240
}

fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

fn default_read_buffer() -> usize {
    16 * 1024
}

fn default_session_tick() -> u64 {
    20_000
}

fn default_session_timeout() -> u64 {
    180_000
}

fn default_session_empty_timeout() -> u64 {
    40_000
}

fn default_session_invalidate() -> u64 {
    86_400_000
}

fn default_session_next_day_invalidate() -> u64 {
    1_800_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub max_frame_len: u32,
    pub read_buffer: usize,
    pub log_level: String,
    session: SessionConfig,
    params: toml::Table,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            max_frame_len: toml_config.codec.max_frame_len,
            read_buffer: toml_config.codec.read_buffer,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            session: toml_config.session,
            params: toml_config.params,
        }
    }

    /// Raw value of a `[params]` entry.
    pub fn param(&self, key: &str) -> Option<&toml::Value> {
        self.params.get(key)
    }

    /// A `[params]` entry as a string, if it is one.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key)?.as_str()
    }

    /// A `[params]` entry as an integer, if it is one.
    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.param(key)?.as_integer()
    }

    /// A `[params]` entry as a bool, if it is one.
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.param(key)?.as_bool()
    }

    pub fn session_tick_ms(&self) -> u64 {
        self.session.tick_ms
    }

    pub fn session_timeout_ms(&self) -> u64 {
        self.session.timeout_ms
    }

    pub fn session_empty_timeout_ms(&self) -> u64 {
        self.session.empty_timeout_ms
    }

    pub fn session_invalidate_ms(&self) -> u64 {
        self.session.invalidate_ms
    }

    pub fn session_next_day_invalidate_ms(&self) -> u64 {
        self.session.next_day_invalidate_ms
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
