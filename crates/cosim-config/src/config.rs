//! Configuration structs with defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Directory used when none is given on the command line: `<config_dir>/cosim`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cosim")
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Client-side settings (host blocks, gateway).
    pub client: ClientConfig,
    /// Server-side settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Client connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Bound on one poll for a reply, in milliseconds. Must exceed 1000.
    pub poll_timeout_ms: u64,
    /// Attempts per request before the connection is declared lost.
    pub retry_budget: u32,
    /// Largest accepted frame, in bytes. At least 8.
    pub max_frame_size: u32,
}

/// Server listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_host: String,
    /// Port to bind.
    pub port: u16,
    /// Bound on one wait for a request, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Consecutive idle waits before the server gives up.
    pub retry_budget: u32,
    /// Largest accepted frame, in bytes. At least 8.
    pub max_frame_size: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `"info"` or `"info,cosim_net=debug"`.
    pub level: String,
    /// Also write a JSON log file in debug builds.
    pub json_file: bool,
}

const DEFAULT_PORT: u16 = 5555;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 2500;
const DEFAULT_RETRY_BUDGET: u32 = 3;
const DEFAULT_MAX_FRAME_SIZE: u32 = 1_048_576;
const MIN_CLIENT_POLL_TIMEOUT_MS: u64 = 1000;
/// Smallest frame that can hold a message header (type and shape words).
const MIN_FRAME_SIZE: u32 = 8;

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
        }
    }
}

impl ClientConfig {
    /// `host:port` of the server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl ServerConfig {
    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid {
                field: "server.bind_host",
                reason: format!("{}: {e}", self.bind_host),
            })
    }

    /// Poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

// --- Validation ---

impl Config {
    /// Check value ranges that the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.poll_timeout_ms <= MIN_CLIENT_POLL_TIMEOUT_MS {
            return Err(ConfigError::Invalid {
                field: "client.poll_timeout_ms",
                reason: format!(
                    "{} ms must exceed {MIN_CLIENT_POLL_TIMEOUT_MS} ms",
                    self.client.poll_timeout_ms
                ),
            });
        }
        if self.server.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "server.poll_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        for (field, budget) in [
            ("client.retry_budget", self.client.retry_budget),
            ("server.retry_budget", self.server.retry_budget),
        ] {
            if budget == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        for (field, size) in [
            ("client.max_frame_size", self.client.max_frame_size),
            ("server.max_frame_size", self.server.max_frame_size),
        ] {
            if size < MIN_FRAME_SIZE {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{size} bytes cannot hold a {MIN_FRAME_SIZE}-byte header"),
                });
            }
        }
        self.server.bind_addr()?;
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = read_config(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        let path = config_dir.join(CONFIG_FILE);
        std::fs::write(&path, serialized).map_err(|source| ConfigError::Write { path, source })
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = read_config(&config_dir.join(CONFIG_FILE))?;
        if &new_config == self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(new_config))
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
