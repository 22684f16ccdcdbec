//! Prefab factories supplied by the host.
//!
//! Remote instantiate messages name a prefab kind; the registry turns the
//! kind into a fresh [`NetworkObject`] with its components in slot order.

use rustc_hash::FxHashMap;

use crate::object::NetworkObject;

type Factory = Box<dyn Fn() -> NetworkObject>;

/// Map of prefab kind to object factory.
#[derive(Default)]
pub struct PrefabRegistry {
    factories: FxHashMap<String, Factory>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: impl Fn() -> NetworkObject + 'static) {
        let kind = kind.into();
        if self.factories.insert(kind.clone(), Box::new(factory)).is_some() {
            tracing::debug!("Replaced prefab factory for {kind}");
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Build a fresh object of `kind`, tagged with the kind.
    pub fn build(&self, kind: &str) -> Option<NetworkObject> {
        let factory = self.factories.get(kind)?;
        let mut object = factory();
        object.prefab_kind = kind.to_string();
        Some(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tags_kind() {
        let mut prefabs = PrefabRegistry::new();
        prefabs.register("crate", NetworkObject::new);
        let obj = prefabs.build("crate").unwrap();
        assert_eq!(obj.prefab_kind(), "crate");
        assert!(prefabs.build("barrel").is_none());
        assert!(prefabs.contains("crate"));
    }
}
