//! The interface between networked objects and host-side components.
//!
//! A component never sees sockets or framing. It receives payloads through
//! [`NetworkComponent::receive_bytes`] and queues outgoing payloads on the
//! [`ComponentContext`] it is handed; the session flushes the queue right
//! after the callback returns.

use std::any::Any;
use std::time::Instant;

use roomlink_net::{Reader, UserId, WireError, Writer};

use crate::rpc::RpcDispatch;

/// A syncable part of a networked object.
///
/// Components are addressed on the wire by their slot: their index in the
/// owning object's component list. Every client must build the same object
/// with components in the same order.
pub trait NetworkComponent: Any {
    /// A plain sync payload arrived from the object's owner.
    fn receive_bytes(&mut self, reader: &mut Reader<'_>, ctx: &mut ComponentContext<'_>);

    /// Called once per session tick.
    fn tick(&mut self, _ctx: &mut ComponentContext<'_>) {}

    /// The object's owner changed; the new owner is `ctx.owner()`.
    fn on_ownership_changed(&mut self, _ctx: &mut ComponentContext<'_>) {}

    /// Append this component's full state to `w`.
    ///
    /// Returns `false` (writing nothing) for stateless components.
    fn pack_state(&self, _w: &mut Writer) -> bool {
        false
    }

    /// Overwrite this component's state from bytes written by
    /// [`NetworkComponent::pack_state`].
    fn unpack_state(&mut self, _reader: &mut Reader<'_>) -> Result<(), WireError> {
        Ok(())
    }

    /// The component's RPC table, if it accepts remote calls.
    fn rpc(&mut self) -> Option<&mut dyn RpcDispatch> {
        None
    }
}

/// A payload queued by a component callback.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outgoing {
    Bytes {
        network_id: String,
        slot: u8,
        group: Option<String>,
        payload: Vec<u8>,
        reliable: bool,
    },
    Rpc {
        network_id: String,
        slot: u8,
        group: Option<String>,
        method: String,
        run_locally: bool,
        data: Vec<u8>,
    },
    TakeOwnership {
        network_id: String,
    },
}

/// What a component may see and do during a callback.
pub struct ComponentContext<'a> {
    pub(crate) network_id: &'a str,
    pub(crate) slot: u8,
    pub(crate) owner: Option<UserId>,
    pub(crate) local_user: Option<UserId>,
    pub(crate) now: Instant,
    pub(crate) outbox: &'a mut Vec<Outgoing>,
}

impl<'a> ComponentContext<'a> {
    /// Id of the object this component belongs to.
    pub fn network_id(&self) -> &str {
        self.network_id
    }

    /// This component's slot in its object.
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Current owner of the object.
    pub fn owner(&self) -> Option<UserId> {
        self.owner
    }

    /// The local player's user id, once logged in.
    pub fn local_user(&self) -> Option<UserId> {
        self.local_user
    }

    /// Whether the local player owns the object.
    pub fn is_owned_by_local_player(&self) -> bool {
        self.owner.is_some() && self.owner == self.local_user
    }

    /// Time of the current tick.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Send a sync payload to the other room members.
    ///
    /// Dropped (and logged) at flush time unless the local player owns the
    /// object.
    pub fn send_bytes(&mut self, payload: Vec<u8>, reliable: bool) {
        self.outbox.push(Outgoing::Bytes {
            network_id: self.network_id.to_string(),
            slot: self.slot,
            group: None,
            payload,
            reliable,
        });
    }

    /// Send a sync payload to the members of `group`.
    pub fn send_bytes_to_group(&mut self, group: &str, payload: Vec<u8>, reliable: bool) {
        self.outbox.push(Outgoing::Bytes {
            network_id: self.network_id.to_string(),
            slot: self.slot,
            group: Some(group.to_string()),
            payload,
            reliable,
        });
    }

    /// Call `method` on this component on every other client, and also
    /// locally when `run_locally` is set.
    pub fn send_rpc(&mut self, method: &str, run_locally: bool, data: Vec<u8>) {
        self.outbox.push(Outgoing::Rpc {
            network_id: self.network_id.to_string(),
            slot: self.slot,
            group: None,
            method: method.to_string(),
            run_locally,
            data,
        });
    }

    /// Like [`ComponentContext::send_rpc`], addressed to a group.
    pub fn send_rpc_to_group(&mut self, group: &str, method: &str, run_locally: bool, data: Vec<u8>) {
        self.outbox.push(Outgoing::Rpc {
            network_id: self.network_id.to_string(),
            slot: self.slot,
            group: Some(group.to_string()),
            method: method.to_string(),
            run_locally,
            data,
        });
    }

    /// Take ownership of the object. Applied when the callback returns.
    pub fn take_ownership(&mut self) {
        self.outbox.push(Outgoing::TakeOwnership {
            network_id: self.network_id.to_string(),
        });
    }
}
