//! Configuration for roomlink clients.
//!
//! Settings persist to disk as RON and can be overridden from the command
//! line. A per-device identity lives next to the config file so that login
//! ids stay stable across runs.

mod cli;
mod config;
mod error;
mod identity;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE, Config, DebugConfig, NetworkConfig, SyncConfig};
pub use error::ConfigError;
pub use identity::DeviceIdentity;
