// Configuration File Support
//
// This module provides configuration file parsing for taskgate.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/taskgate/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::{LogFormat, LogLevel};
use crate::queue::RetryPolicy;
use crate::rate_limit::RateLimitConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Per-identity admission limits
    pub limiter: RateLimitConfig,

    /// Backoff for tasks rejected again on a drain pass
    pub retry: RetryPolicy,

    /// Drain loop configuration
    pub drain: DrainConfig,

    /// Task body configuration
    pub executor: ExecutorConfig,

    /// Window store and queue backend
    pub store: StoreConfig,

    /// HTTP server configuration
    pub server: ServerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (plain, json)
    pub format: String,

    /// Log file path; logs go to stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
            file: None,
        }
    }
}

/// Drain loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrainConfig {
    /// Whether `serve` also runs the drain loop in-process
    pub enabled: bool,

    /// Longest sleep between passes in milliseconds
    pub poll_interval_ms: u64,

    /// How long a claimed task stays hidden before it is redelivered
    pub visibility_timeout_secs: u64,

    /// How often expired rate limit windows are purged
    pub sweep_interval_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            visibility_timeout_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl DrainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Task body configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Append-only completion log
    pub log_path: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("task.log"),
        }
    }
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; state dies with the process
    Memory,
    /// One SQLite file shared by every process pointed at it
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend (memory, sqlite)
    pub backend: String,

    /// Database file for the sqlite backend
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// Environment overrides are applied and the result validated whether or
    /// not the file exists.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/taskgate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "taskgate", "taskgate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            // Fallback if XDG dirs cannot be determined
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("taskgate").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - TASKGATE_LOG_LEVEL
    /// - TASKGATE_LOG_FORMAT
    /// - TASKGATE_CAPACITY
    /// - TASKGATE_WINDOW_SECS
    /// - TASKGATE_STORE_BACKEND
    /// - TASKGATE_STORE_PATH
    /// - TASKGATE_TASK_LOG
    /// - TASKGATE_PORT
    pub fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("TASKGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TASKGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Limiter overrides
        if let Ok(capacity) = std::env::var("TASKGATE_CAPACITY") {
            if let Ok(capacity) = capacity.parse::<u32>() {
                if capacity > 0 {
                    self.limiter.capacity = capacity;
                }
            }
        }
        if let Ok(window) = std::env::var("TASKGATE_WINDOW_SECS") {
            if let Ok(window) = window.parse::<u64>() {
                if window > 0 {
                    self.limiter.window_secs = window;
                }
            }
        }

        // Store overrides
        if let Ok(backend) = std::env::var("TASKGATE_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Ok(path) = std::env::var("TASKGATE_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }

        // Executor overrides
        if let Ok(path) = std::env::var("TASKGATE_TASK_LOG") {
            self.executor.log_path = PathBuf::from(path);
        }

        // Server overrides
        if let Ok(port) = std::env::var("TASKGATE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging
        self.log_level()?;
        self.log_format()?;

        // Validate limiter
        if self.limiter.capacity == 0 {
            anyhow::bail!("Limiter capacity must be > 0");
        }
        if self.limiter.window_secs == 0 {
            anyhow::bail!("Limiter window must be > 0 seconds");
        }

        // Validate retry policy
        if self.retry.initial_delay_ms == 0 {
            anyhow::bail!("Retry initial delay must be > 0 ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("Retry jitter must be between 0.0 and 1.0, got {}", self.retry.jitter);
        }

        // Validate drain loop
        if self.drain.poll_interval_ms == 0 {
            anyhow::bail!("Drain poll interval must be > 0 ms");
        }
        if self.drain.visibility_timeout_secs == 0 {
            anyhow::bail!("Drain visibility timeout must be > 0 seconds");
        }

        // Validate store
        if self.store_backend()? == StoreBackend::Sqlite && self.store.path.is_none() {
            anyhow::bail!("Store backend 'sqlite' requires store.path");
        }

        Ok(())
    }

    /// Parsed log level
    pub fn log_level(&self) -> Result<LogLevel> {
        self.logging.level.parse().map_err(|e: String| {
            anyhow::anyhow!("{}. Must be one of: trace, debug, info, warn, error", e)
        })
    }

    /// Parsed log format
    pub fn log_format(&self) -> Result<LogFormat> {
        self.logging
            .format
            .parse()
            .map_err(|e: String| anyhow::anyhow!("{}. Must be one of: plain, json", e))
    }

    /// Parsed store backend
    pub fn store_backend(&self) -> Result<StoreBackend> {
        self.store
            .backend
            .parse()
            .map_err(|e: String| anyhow::anyhow!("{}. Must be one of: memory, sqlite", e))
    }
}
