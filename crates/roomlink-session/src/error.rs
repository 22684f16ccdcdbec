//! Error types for session operations.

use roomlink_net::{ProtocolError, WireError};

/// Errors from RPC table construction and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// No method with this name is registered for the component type.
    #[error("unknown RPC method `{0}`")]
    UnknownMethod(String),

    /// A received method index is past the end of the table.
    #[error("RPC index {index} out of range for table of {len} methods")]
    IndexOutOfRange {
        /// Received index.
        index: u8,
        /// Number of methods in the local table.
        len: usize,
    },

    /// The component type declares more methods than one byte can address.
    #[error("{0} RPC methods exceed the one-byte index limit")]
    TooManyMethods(usize),

    /// Two methods share a name.
    #[error("duplicate RPC method `{0}`")]
    DuplicateMethod(&'static str),

    /// The RPC body could not be decoded.
    #[error("malformed RPC body: {0}")]
    Malformed(#[from] WireError),
}

/// Errors returned by [`Session`](crate::Session) operations.
///
/// Every failing operation also logs its error, so callers that ignore the
/// result still leave a trace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The operation needs the local player to be in a room.
    #[error("not in a room")]
    NotInRoom,

    /// The operation needs a server-assigned user id.
    #[error("not logged in")]
    NotLoggedIn,

    /// No object with this id is registered.
    #[error("unknown network object `{0}`")]
    UnknownObject(String),

    /// The object has no component at this slot.
    #[error("network object `{network_id}` has no component in slot {slot}")]
    UnknownComponent {
        /// Object id.
        network_id: String,
        /// Requested slot.
        slot: u8,
    },

    /// No prefab factory is registered for this kind.
    #[error("unknown prefab kind `{0}`")]
    UnknownPrefab(String),

    /// An object with this id already exists.
    #[error("network object `{0}` is already registered")]
    DuplicateId(String),

    /// Ownership of the object cannot change hands.
    #[error("ownership of `{0}` is locked")]
    OwnershipLocked(String),

    /// Only the owner may send plain sync payloads for this object.
    #[error("local player does not own `{0}`")]
    NotOwner(String),

    /// The component does not expose an RPC table.
    #[error("component {slot} of `{network_id}` does not accept RPCs")]
    NotRpcCapable {
        /// Object id.
        network_id: String,
        /// Component slot.
        slot: u8,
    },

    /// An object carries more components than the wire slot byte can address.
    #[error("{0} components exceed the slot limit")]
    TooManyComponents(usize),

    /// Room names must be non-empty.
    #[error("room name must not be empty")]
    EmptyRoomName,

    /// The reliable stream rejected the message.
    #[error("send failed, connection lost")]
    SendFailed,

    /// RPC lookup or dispatch failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A record could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
