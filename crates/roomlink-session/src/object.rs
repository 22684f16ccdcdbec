//! Networked objects and their component arenas.
//!
//! A [`NetworkObject`] owns its components in a plain `Vec`; a component's
//! index in that vector is its slot, fixed when the object is built. The
//! wire prefix for each slot (`[tag][id][slot byte]`) is built the first
//! time the slot sends and reused for the object's lifetime.

use std::any::Any;
use std::time::Instant;

use roomlink_net::{Reader, Transform, UserId, WireError, Writer};

use crate::component::{ComponentContext, NetworkComponent, Outgoing};
use crate::payload::{MAX_SLOT, write_sync_header};

/// Largest number of components one object may carry.
pub const MAX_COMPONENTS: usize = MAX_SLOT as usize + 1;

/// Cached wire prefixes for one component slot.
#[derive(Debug, Clone)]
pub(crate) struct SyncHeaders {
    pub(crate) sync: Vec<u8>,
    pub(crate) rpc: Vec<u8>,
}

impl SyncHeaders {
    fn build(network_id: &str, slot: u8) -> Self {
        let mut w = Writer::with_capacity(network_id.len() + 3);
        write_sync_header(&mut w, network_id, slot, false);
        let sync = w.as_slice().to_vec();
        w.reset();
        write_sync_header(&mut w, network_id, slot, true);
        Self {
            sync,
            rpc: w.into_vec(),
        }
    }
}

/// A replicated object: identity, ownership and an ordered component list.
///
/// Hosts build objects through prefab factories (spawned objects) or hand
/// them to [`Session::register_scene_object`](crate::Session::register_scene_object)
/// (scene objects). The session fills in the id and owner.
pub struct NetworkObject {
    pub(crate) network_id: String,
    pub(crate) prefab_kind: String,
    pub(crate) owner: Option<UserId>,
    pub(crate) is_scene_object: bool,
    pub(crate) ownership_locked: bool,
    pub(crate) transform: Option<Transform>,
    pub(crate) components: Vec<Box<dyn NetworkComponent>>,
    pub(crate) headers: Vec<Option<SyncHeaders>>,
}

impl Default for NetworkObject {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkObject")
            .field("network_id", &self.network_id)
            .field("prefab_kind", &self.prefab_kind)
            .field("owner", &self.owner)
            .field("is_scene_object", &self.is_scene_object)
            .field("ownership_locked", &self.ownership_locked)
            .field("components", &self.components.len())
            .finish()
    }
}

impl NetworkObject {
    /// An empty, unregistered object.
    pub fn new() -> Self {
        Self {
            network_id: String::new(),
            prefab_kind: String::new(),
            owner: None,
            is_scene_object: false,
            ownership_locked: false,
            transform: None,
            components: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Append a component; its slot is the number of components before it.
    pub fn with_component(mut self, component: impl NetworkComponent) -> Self {
        self.components.push(Box::new(component));
        self
    }

    /// Forbid ownership transfer. A locked object is destroyed when its
    /// owner leaves.
    pub fn locked(mut self) -> Self {
        self.ownership_locked = true;
        self
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Prefab kind; empty for scene objects.
    pub fn prefab_kind(&self) -> &str {
        &self.prefab_kind
    }

    pub fn owner(&self) -> Option<UserId> {
        self.owner
    }

    pub fn is_scene_object(&self) -> bool {
        self.is_scene_object
    }

    pub fn is_ownership_locked(&self) -> bool {
        self.ownership_locked
    }

    /// Spawn pose, when the object was instantiated with one.
    pub fn transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Downcast the component at `slot`.
    pub fn component<T: NetworkComponent>(&self, slot: u8) -> Option<&T> {
        let component: &dyn Any = &**self.components.get(slot as usize)?;
        component.downcast_ref::<T>()
    }

    /// Mutable downcast of the component at `slot`.
    pub fn component_mut<T: NetworkComponent>(&mut self, slot: u8) -> Option<&mut T> {
        let component: &mut dyn Any = &mut **self.components.get_mut(slot as usize)?;
        component.downcast_mut::<T>()
    }

    /// Slot of the first component of type `T`.
    pub fn slot_of<T: NetworkComponent>(&self) -> Option<u8> {
        self.components
            .iter()
            .position(|c| {
                let component: &dyn Any = &**c;
                component.is::<T>()
            })
            .and_then(|i| u8::try_from(i).ok())
    }

    /// Wire prefix for `slot`, built on first use.
    pub(crate) fn headers(&mut self, slot: u8) -> &SyncHeaders {
        let index = slot as usize;
        if self.headers.len() <= index {
            self.headers.resize(index + 1, None);
        }
        let network_id = &self.network_id;
        self.headers[index].get_or_insert_with(|| SyncHeaders::build(network_id, slot))
    }

    /// Run `f` against the component at `slot` with a context for this
    /// object. Returns `None` when the slot is empty.
    pub(crate) fn visit_component<R>(
        &mut self,
        slot: u8,
        local_user: Option<UserId>,
        now: Instant,
        outbox: &mut Vec<Outgoing>,
        f: impl FnOnce(&mut dyn NetworkComponent, &mut ComponentContext<'_>) -> R,
    ) -> Option<R> {
        let Self {
            network_id,
            owner,
            components,
            ..
        } = self;
        let component = components.get_mut(slot as usize)?;
        let mut ctx = ComponentContext {
            network_id: network_id.as_str(),
            slot,
            owner: *owner,
            local_user,
            now,
            outbox,
        };
        Some(f(&mut **component, &mut ctx))
    }

    /// Pack every component's state: per slot an `i32` length and the
    /// bytes, zero length for stateless components.
    ///
    /// Returns whether any component wrote state.
    pub fn pack_state(&self, w: &mut Writer) -> bool {
        let mut any = false;
        for component in &self.components {
            let len_pos = w.reserve(4);
            let start = w.len();
            any |= component.pack_state(w);
            w.patch_i32(len_pos, (w.len() - start) as i32);
        }
        any
    }

    /// Packed state, or `None` when no component carries state.
    pub fn packed_state(&self) -> Option<Vec<u8>> {
        let mut w = Writer::new();
        self.pack_state(&mut w).then(|| w.into_vec())
    }

    /// Apply bytes written by [`NetworkObject::pack_state`].
    pub fn unpack_state(&mut self, state: &[u8]) -> Result<(), WireError> {
        let mut r = Reader::new(state);
        for component in &mut self.components {
            if r.remaining() == 0 {
                break;
            }
            let len = r.read_len()?;
            let bytes = r.read_bytes(len)?;
            if len > 0 {
                component.unpack_state(&mut Reader::new(bytes))?;
            }
        }
        Ok(())
    }
}
