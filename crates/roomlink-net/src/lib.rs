//! Networking for room sessions: wire codec, room-server protocol, stream
//! framing, the bounded inbox, and the TCP/UDP transport with its offline
//! loopback.

pub mod codec;
pub mod datagram;
pub mod framing;
pub mod inbox;
pub mod loopback;
pub mod platform;
pub mod protocol;
pub mod reconnection;
pub mod transport;

pub use codec::{Quat, Reader, Transform, Vec3, WireError, Writer};
pub use framing::{FrameError, Record, RecordDecoder, read_records};
pub use inbox::{DEFAULT_INBOX_CAPACITY, Inbox, InboxSender};
pub use loopback::{Loopback, OFFLINE_USER_ID};
pub use platform::{KeepaliveProbe, SocketConfig};
pub use protocol::{
    ClientCommand, ListedRoom, ProtocolError, RoomMember, SendKind, ServerEvent, UserId, encode_send,
    encode_send_group,
};
pub use reconnection::LivenessCheck;
pub use transport::{
    ConnectionState, ConnectionStateWatch, NetClient, Transport, TransportConfig, TransportError,
};
