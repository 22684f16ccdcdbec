//! Errors raised while loading or storing client settings.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file exists but is not a valid config.
    #[error("{path:?} is not a valid config: {source}")]
    Parse {
        path: PathBuf,
        source: ron::error::SpannedError,
    },

    #[error("cannot encode config: {0}")]
    Encode(#[from] ron::Error),

    /// The platform has no per-user config directory.
    #[error("no config directory available on this platform")]
    NoConfigDir,

    /// The stored device identity is not a 32-digit hex string.
    #[error("invalid device identity {0:?}")]
    InvalidIdentity(String),
}

impl ConfigError {
    pub(crate) fn read(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Read { path, source }
    }

    pub(crate) fn write(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Write { path, source }
    }
}
