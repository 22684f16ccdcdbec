//! The local table of networked objects.
//!
//! Live objects are keyed by network id. Scene objects start dormant: they
//! exist locally but are not registered until a master is designated for
//! the room, at which point the master's id becomes their owner.

use std::collections::BTreeMap;

use roomlink_net::UserId;

use crate::error::SessionError;
use crate::object::{MAX_COMPONENTS, NetworkObject};

/// Network id of the scene object in `slot`.
pub fn scene_object_id(slot: u32) -> String {
    format!("-1-{slot}")
}

/// Live and dormant networked objects plus the id allocator.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<String, NetworkObject>,
    dormant: BTreeMap<String, NetworkObject>,
    deleted_scene_objects: Vec<String>,
    next_index: u64,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for an object spawned by `local_user`: `<user>-<n>`.
    pub fn allocate_id(&mut self, local_user: UserId) -> String {
        let id = format!("{local_user}-{}", self.next_index);
        self.next_index += 1;
        id
    }

    /// Add a dormant scene object for `slot`.
    pub fn register_scene_object(
        &mut self,
        slot: u32,
        mut object: NetworkObject,
    ) -> Result<String, SessionError> {
        let id = scene_object_id(slot);
        if self.dormant.contains_key(&id) || self.objects.contains_key(&id) {
            return Err(SessionError::DuplicateId(id));
        }
        check_component_count(&object)?;
        object.network_id = id.clone();
        object.prefab_kind.clear();
        object.is_scene_object = true;
        object.owner = None;
        self.dormant.insert(id.clone(), object);
        Ok(id)
    }

    /// Register a live object under its `network_id`.
    pub fn insert(&mut self, object: NetworkObject) -> Result<(), SessionError> {
        if self.objects.contains_key(&object.network_id) {
            return Err(SessionError::DuplicateId(object.network_id));
        }
        check_component_count(&object)?;
        self.objects.insert(object.network_id.clone(), object);
        Ok(())
    }

    /// Move every dormant scene object into the live table, owned by
    /// `owner`. Returns the ids that were registered.
    pub fn bootstrap_scene_objects(&mut self, owner: UserId) -> Vec<String> {
        let mut registered = Vec::new();
        for (id, mut object) in std::mem::take(&mut self.dormant) {
            if self.objects.contains_key(&id) {
                tracing::error!("Scene object {id} is already registered, skipping bootstrap");
                continue;
            }
            object.owner = Some(owner);
            self.objects.insert(id.clone(), object);
            registered.push(id);
        }
        registered
    }

    pub fn get(&self, network_id: &str) -> Option<&NetworkObject> {
        self.objects.get(network_id)
    }

    pub fn get_mut(&mut self, network_id: &str) -> Option<&mut NetworkObject> {
        self.objects.get_mut(network_id)
    }

    pub fn contains(&self, network_id: &str) -> bool {
        self.objects.contains_key(network_id)
    }

    /// Live objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkObject> {
        self.objects.values()
    }

    /// Ids of live objects, in id order.
    pub fn ids(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of scene objects waiting for a master.
    pub fn dormant_len(&self) -> usize {
        self.dormant.len()
    }

    /// Ids of live objects owned by `user`.
    pub fn owned_by(&self, user: UserId) -> Vec<String> {
        self.objects
            .values()
            .filter(|o| o.owner == Some(user))
            .map(|o| o.network_id.clone())
            .collect()
    }

    /// Ids of live objects without an owner.
    pub fn orphans(&self) -> Vec<String> {
        self.objects
            .values()
            .filter(|o| o.owner.is_none())
            .map(|o| o.network_id.clone())
            .collect()
    }

    /// Remove an object. Destroyed scene objects are remembered so late
    /// joiners can be told about them. Unknown ids are a no-op.
    pub fn remove(&mut self, network_id: &str) -> Option<NetworkObject> {
        let object = match self.objects.remove(network_id) {
            Some(object) => object,
            None => self.dormant.remove(network_id)?,
        };
        if object.is_scene_object && !self.deleted_scene_objects.iter().any(|id| id == network_id) {
            self.deleted_scene_objects.push(network_id.to_string());
        }
        Some(object)
    }

    /// Scene objects destroyed so far, in destruction order.
    pub fn deleted_scene_objects(&self) -> &[String] {
        &self.deleted_scene_objects
    }

    /// Leave-room reset: scene objects go back to dormant with no owner,
    /// spawned objects are removed and returned.
    pub fn teardown(&mut self) -> Vec<NetworkObject> {
        let mut spawned = Vec::new();
        for (id, mut object) in std::mem::take(&mut self.objects) {
            if object.is_scene_object {
                object.owner = None;
                self.dormant.insert(id, object);
            } else {
                spawned.push(object);
            }
        }
        spawned
    }
}

fn check_component_count(object: &NetworkObject) -> Result<(), SessionError> {
    if object.components.len() > MAX_COMPONENTS {
        return Err(SessionError::TooManyComponents(object.components.len()));
    }
    Ok(())
}
