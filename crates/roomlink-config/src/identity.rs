//! Stable per-device identity.
//!
//! A random 128-bit id is generated once and stored as 32 hex digits in
//! the config directory. The login device id is a hash of it and the
//! application name, so different applications on one device get
//! different ids.

use std::hash::{Hash, Hasher};
use std::path::Path;

use rustc_hash::FxHasher;

use crate::error::ConfigError;

/// File name of the stored identity inside the config directory.
const IDENTITY_FILE: &str = "device_id";

/// Random identifier of this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// A fresh random identity.
    pub fn generate() -> Self {
        Self {
            id: format!("{:032x}", rand::random::<u128>()),
        }
    }

    /// Parse a stored identity.
    pub fn parse(id: &str) -> Result<Self, ConfigError> {
        let id = id.trim();
        if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidIdentity(id.to_string()));
        }
        Ok(Self {
            id: id.to_ascii_lowercase(),
        })
    }

    /// Load the identity stored in `config_dir`, creating one if absent or
    /// unreadable as an identity.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(IDENTITY_FILE);
        if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(ConfigError::read(&path))?;
            match Self::parse(&contents) {
                Ok(identity) => return Ok(identity),
                Err(e) => log::warn!("Replacing device identity at {}: {e}", path.display()),
            }
        }
        let identity = Self::generate();
        std::fs::create_dir_all(config_dir).map_err(ConfigError::write(config_dir))?;
        std::fs::write(&path, &identity.id).map_err(ConfigError::write(&path))?;
        log::info!("Created device identity at {}", path.display());
        Ok(identity)
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Device id to log in with for `app_name`.
    pub fn login_hash(&self, app_name: &str) -> String {
        let mut hasher = FxHasher::default();
        self.id.hash(&mut hasher);
        app_name.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_persists() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceIdentity::load_or_create(dir.path()).unwrap();
        let second = DeviceIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_identity_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), "garbage").unwrap();
        let identity = DeviceIdentity::load_or_create(dir.path()).unwrap();
        let stored = std::fs::read_to_string(dir.path().join(IDENTITY_FILE)).unwrap();
        assert_eq!(identity.as_str(), stored);
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(DeviceIdentity::parse("abc").is_err());
        assert!(DeviceIdentity::parse(&"z".repeat(32)).is_err());
        let parsed = DeviceIdentity::parse(&"AB".repeat(16)).unwrap();
        assert_eq!(parsed.as_str(), "ab".repeat(16));
    }

    #[test]
    fn test_login_hash_is_stable_and_per_app() {
        let identity = DeviceIdentity::parse(&"0f".repeat(16)).unwrap();
        assert_eq!(identity.login_hash("arena"), identity.login_hash("arena"));
        assert_ne!(identity.login_hash("arena"), identity.login_hash("lobby"));
        assert_eq!(identity.login_hash("arena").len(), 16);
    }
}
