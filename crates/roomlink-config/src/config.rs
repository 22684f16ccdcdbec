//! Configuration structs with defaults and RON persistence.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted config inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server and session settings.
    pub network: NetworkConfig,
    /// Defaults for state-sync components.
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Server connection and session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Room server host name or address.
    pub server_address: String,
    /// Room server port (stream and datagrams).
    pub server_port: u16,
    /// Application name sent at login.
    pub app_name: String,
    /// Application version, used when `only_connect_to_same_version` is set.
    pub app_version: String,
    /// Log in as soon as the connection opens.
    pub auto_login: bool,
    /// Only meet clients running the same version.
    pub only_connect_to_same_version: bool,
    /// Time between connection liveness checks.
    pub reconnect_interval_ms: u64,
    /// Capacity of the pending-message inbox.
    pub inbox_capacity: usize,
    /// Resend interval of the datagram hello.
    pub udp_hello_interval_ms: u64,
    /// Give up on a connection attempt after this long.
    pub connect_timeout_ms: u64,
    /// Keep-alive payload interval; 0 disables keep-alives.
    pub keepalive_interval_ms: u64,
}

/// Defaults for state-sync components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Sends per second while owned.
    pub default_rate_hz: f32,
    /// Skip sends whose bytes did not change.
    pub hybrid_on_change: bool,
    /// With `hybrid_on_change`, resend unchanged state after this many seconds.
    pub idle_resend_secs: f32,
}

/// Diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// `tracing` filter used when `RUST_LOG` is unset, e.g. `"debug"` or
    /// `"info,roomlink_net=trace"`.
    pub log_level: String,
}

// ---- Defaults ----

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 5000,
            app_name: "roomlink".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            auto_login: true,
            only_connect_to_same_version: false,
            reconnect_interval_ms: 2000,
            inbox_capacity: 1000,
            udp_hello_interval_ms: 100,
            connect_timeout_ms: 5000,
            keepalive_interval_ms: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_rate_hz: 30.0,
            hybrid_on_change: true,
            idle_resend_secs: 2.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// ---- Durations ----

impl NetworkConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn udp_hello_interval(&self) -> Duration {
        Duration::from_millis(self.udp_hello_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when keep-alives are disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

impl SyncConfig {
    /// Idle resend interval; negative or non-finite values count as zero.
    pub fn idle_resend(&self) -> Duration {
        Duration::try_from_secs_f32(self.idle_resend_secs).unwrap_or(Duration::ZERO)
    }
}

// ---- Persistence ----

impl Config {
    /// Per-user config directory for roomlink.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|base| base.join("roomlink"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Read `config.ron` from `config_dir`. A missing file is replaced by
    /// the defaults, which are written back so users have something to edit.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let config = Self::parse(&path, &text)?;
                log::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let config = Self::default();
                config.save(config_dir)?;
                log::info!("Wrote default config to {}", path.display());
                Ok(config)
            }
            Err(e) => Err(ConfigError::read(path)(e)),
        }
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    ///
    /// The file is replaced through a rename so a crash mid-write never
    /// leaves a truncated config behind.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::write(config_dir))?;
        let text = ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::new()
                .depth_limit(2)
                .struct_names(false),
        )?;

        let path = config_dir.join(CONFIG_FILE);
        let staging = path.with_extension("ron.tmp");
        std::fs::write(&staging, text).map_err(ConfigError::write(&staging))?;
        std::fs::rename(&staging, &path).map_err(ConfigError::write(&path))
    }

    /// Re-read `config.ron`; `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&path).map_err(ConfigError::read(&path))?;
        let fresh = Self::parse(&path, &text)?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("{} changed on disk", path.display());
        Ok(Some(fresh))
    }

    fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        ron::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
