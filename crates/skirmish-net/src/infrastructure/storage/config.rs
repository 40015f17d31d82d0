//! TOML-based configuration persistence for the `skirmish` binary.
//!
//! Reads and writes [`AppConfig`] at the platform-appropriate location:
//! - Windows:  `%APPDATA%\Skirmish\config.toml`
//! - Linux:    `~/.config/skirmish/config.toml`
//! - macOS:    `~/Library/Application Support/Skirmish/config.toml`
//!
//! or at an explicit path given on the command line.
//!
//! ```toml
//! [player]
//! name = "red-baron"
//! is_ai = true
//!
//! [network]
//! server_address = "192.168.1.20"
//! port = 27960
//!
//! [sync]
//! broadcast_interval_ms = 50
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]`, so a missing file, a
//! missing section, or a file written by an older version all load with the
//! defaults filled in.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::coordinator::SyncConfig;
use crate::infrastructure::peer_host::HostConfig;
use crate::infrastructure::transport::udp::UdpConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An address field does not hold an IP address.
    #[error("invalid address {value:?} in [network] {field}")]
    InvalidAddress { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    /// Name shown in chat.
    #[serde(default = "default_player_name")]
    pub name: String,
    /// Client only: fly an AI plane once the session is ready.
    #[serde(default = "default_true")]
    pub is_ai: bool,
}

/// Addresses and host limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Client only: server IP address to connect to.
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Server listen port; the port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Server only: peers beyond this are rejected.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Longest the I/O thread blocks in one poll.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

/// Sync timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    #[serde(default = "default_game_state_interval_ms")]
    pub game_state_interval_ms: u64,
    #[serde(default = "default_max_deferred_age_ms")]
    pub max_deferred_age_ms: u64,
    #[serde(default = "default_clock_refresh_secs")]
    pub clock_refresh_secs: u64,
    #[serde(default = "default_future_tolerance_ms")]
    pub future_tolerance_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    /// `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_player_name() -> String {
    "pilot".to_string()
}
fn default_true() -> bool {
    true
}
fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    27960
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_max_peers() -> usize {
    16
}
fn default_poll_timeout_ms() -> u64 {
    5
}
fn default_broadcast_interval_ms() -> u64 {
    50
}
fn default_game_state_interval_ms() -> u64 {
    1000
}
fn default_max_deferred_age_ms() -> u64 {
    400
}
fn default_clock_refresh_secs() -> u64 {
    15
}
fn default_future_tolerance_ms() -> u64 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: default_player_name(),
            is_ai: default_true(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            port: default_port(),
            bind_address: default_bind_address(),
            max_peers: default_max_peers(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: default_broadcast_interval_ms(),
            game_state_interval_ms: default_game_state_interval_ms(),
            max_deferred_age_ms: default_max_deferred_age_ms(),
            clock_refresh_secs: default_clock_refresh_secs(),
            future_tolerance_ms: default_future_tolerance_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Coordinator settings.  The clock-sync responder allowance follows the
    /// broadcast interval: that is how stale the server's stamps can be.
    pub fn sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        let broadcast_interval = Duration::from_millis(self.sync.broadcast_interval_ms);
        let mut clock = defaults.clock.clone();
        clock.refresh_interval = self.sync.clock_refresh_secs as f64;
        clock.responder_allowance = broadcast_interval.as_secs_f64();
        SyncConfig {
            player_name: self.player.name.clone(),
            broadcast_interval,
            game_state_interval: Duration::from_millis(self.sync.game_state_interval_ms),
            max_deferred_age: Duration::from_millis(self.sync.max_deferred_age_ms),
            future_tolerance: Duration::from_millis(self.sync.future_tolerance_ms),
            clock,
            ..defaults
        }
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            poll_timeout: Duration::from_millis(self.network.poll_timeout_ms),
            max_peers: self.network.max_peers,
            ..HostConfig::default()
        }
    }

    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            max_peers: self.network.max_peers,
            ..UdpConfig::default()
        }
    }

    /// Where a server listens.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if `bind_address` is not an IP.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = parse_ip("bind_address", &self.network.bind_address)?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Where a client binds (any port) and where it connects.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if either address is not an IP.
    pub fn client_addrs(&self) -> Result<(SocketAddr, SocketAddr), ConfigError> {
        let bind = parse_ip("bind_address", &self.network.bind_address)?;
        let server = parse_ip("server_address", &self.network.server_address)?;
        Ok((
            SocketAddr::new(bind, 0),
            SocketAddr::new(server, self.network.port),
        ))
    }
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the default location.  See [`load_config_from`].
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to the default location.
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    save_config_to(&config_file_path()?, config)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory, including the `Skirmish` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Skirmish"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("skirmish"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Skirmish")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
