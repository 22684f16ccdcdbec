//! Client-side room sessions: roster and master election, the networked
//! object registry, ownership, and per-component sync and RPC dispatch.
//!
//! A [`Session`] owns a [`Transport`](roomlink_net::Transport) and applies
//! everything it receives on the host's thread in [`Session::tick`].

pub mod component;
pub mod error;
pub mod events;
pub mod object;
pub mod payload;
pub mod player;
pub mod prefab;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod state_sync;

#[cfg(test)]
mod testing;

pub use component::{ComponentContext, NetworkComponent};
pub use error::{RpcError, SessionError};
pub use events::{EVENT_BACKLOG, EventBus, SessionEvent, SubscriptionId};
pub use object::{MAX_COMPONENTS, NetworkObject};
pub use payload::{AppMessage, MAX_SLOT, PayloadError};
pub use player::{Player, Roster};
pub use prefab::PrefabRegistry;
pub use registry::{ObjectRegistry, scene_object_id};
pub use rpc::{MAX_RPC_METHODS, RpcDispatch, RpcHandler, RpcTable, RpcTarget};
pub use session::{Session, SessionConfig};
pub use state_sync::{PackState, RateLimiter, StateSync, SyncSettings};
