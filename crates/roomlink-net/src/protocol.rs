//! Room-server stream protocol: typed records in both directions.
//!
//! Every record starts with a one-byte type tag followed by type-specific
//! fields. Integers on this layer are big-endian; short names (room, group,
//! device, app) carry a one-byte length prefix.
//!
//! ```text
//! server -> client                       client -> server
//! 0 LoggedIn      id                     0 Login        u8 device, u8 app
//! 1 RoomList      len, "name:count,.."   1 GetRooms
//! 2 PlayerJoined  id, u8 room            2 JoinRoom     u8 room ("" leaves)
//! 3 DataMessage   sender, len, bytes     3/4/7/8 Send*  len, bytes
//! 4 MasterChanged id                     5 SendGroup    len, bytes, u8 group
//! 5 YouJoined     n, n x id, u8 room     6 SetGroup     u8 group, len, ids
//! 6 PlayerLeft    id, u8 room            9 GetRoomData  u8 room
//! 7 YouLeft       u8 room
//! 8 RoomData      u8 room, n, n x (id, u8 name)
//! ```

use crate::codec::{Reader, WireError, Writer};

/// Server-assigned user identifier.
pub type UserId = i32;

/// Errors produced while encoding or decoding protocol records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The leading type tag is not part of the protocol.
    #[error("unknown record type {0}")]
    UnknownType(u8),

    /// A field could not be read.
    #[error("malformed record: {0}")]
    Wire(#[from] WireError),

    /// A short name exceeded the one-byte length prefix.
    #[error("name of {0} bytes does not fit a one-byte length prefix")]
    NameTooLong(usize),

    /// A length-prefixed body exceeded the configured limit.
    #[error("record body of {size} bytes exceeds maximum {max}")]
    BodyTooLarge {
        /// Declared body size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The record is synthetic and has no wire form.
    #[error("{0} has no wire encoding")]
    NotOnWire(&'static str),
}

/// Largest body a single record may declare. Default frames above this are
/// treated as corrupt streams rather than buffered.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Short-string helpers
// ---------------------------------------------------------------------------

fn write_short_str(w: &mut Writer, s: &str) -> Result<(), ProtocolError> {
    let len = u8::try_from(s.len()).map_err(|_| ProtocolError::NameTooLong(s.len()))?;
    w.write_u8(len);
    w.write_bytes(s.as_bytes());
    Ok(())
}

fn read_short_str(r: &mut Reader<'_>) -> Result<String, ProtocolError> {
    let len = r.read_u8()? as usize;
    let bytes = r.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Wire(WireError::InvalidUtf8))
}

fn read_body<'a>(r: &mut Reader<'a>, len: usize) -> Result<&'a [u8], ProtocolError> {
    if len > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge {
            size: len,
            max: MAX_BODY_SIZE,
        });
    }
    Ok(r.read_bytes(len)?)
}

fn write_body(w: &mut Writer, body: &[u8]) {
    w.write_i32_be(body.len() as i32);
    w.write_bytes(body);
}

/// Write a room broadcast record without building a [`ClientCommand`].
pub fn encode_send(w: &mut Writer, kind: SendKind, payload: &[u8]) {
    w.write_u8(kind.tag());
    write_body(w, payload);
}

/// Write a group send record without building a [`ClientCommand`].
pub fn encode_send_group(w: &mut Writer, group: &str, payload: &[u8]) -> Result<(), ProtocolError> {
    w.write_u8(ClientCommand::SEND_GROUP);
    write_body(w, payload);
    write_short_str(w, group)
}

/// Run `decode` against `buf`, mapping a short buffer to `Ok(None)`.
///
/// On success returns the record and the number of bytes it occupied.
fn decode_complete<T>(
    buf: &[u8],
    decode: impl FnOnce(&mut Reader<'_>) -> Result<T, ProtocolError>,
) -> Result<Option<(T, usize)>, ProtocolError> {
    let mut r = Reader::new(buf);
    match decode(&mut r) {
        Ok(v) => Ok(Some((v, r.position()))),
        Err(ProtocolError::Wire(WireError::Truncated { .. })) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// One entry of a room listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRoom {
    pub name: String,
    pub player_count: u32,
}

/// One member of a room as reported by room data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    pub user_id: UserId,
    pub name: String,
}

/// Typed server-to-client event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Synthetic: the reliable stream opened (or offline mode took over).
    /// Enqueued by the transport, never sent by a server.
    Connected,
    /// The server assigned this client a user id.
    LoggedIn { user_id: UserId },
    /// Rooms currently open on the server.
    RoomList { rooms: Vec<ListedRoom> },
    /// Members of one room.
    RoomData {
        room: String,
        members: Vec<RoomMember>,
    },
    /// Another player entered the local player's room.
    PlayerJoined { user_id: UserId, room: String },
    /// Application payload relayed from `sender`.
    DataMessage { sender: UserId, payload: Vec<u8> },
    /// The server designated a room master.
    MasterChanged { master_id: UserId },
    /// The local player entered `room`; `player_ids` is the full membership.
    YouJoined {
        player_ids: Vec<UserId>,
        room: String,
    },
    /// Another player left the local player's room.
    PlayerLeft { user_id: UserId, room: String },
    /// The local player left `room`.
    YouLeft { room: String },
}

impl ServerEvent {
    pub const LOGGED_IN: u8 = 0;
    pub const ROOM_LIST: u8 = 1;
    pub const PLAYER_JOINED: u8 = 2;
    pub const DATA_MESSAGE: u8 = 3;
    pub const MASTER_CHANGED: u8 = 4;
    pub const YOU_JOINED: u8 = 5;
    pub const PLAYER_LEFT: u8 = 6;
    pub const YOU_LEFT: u8 = 7;
    pub const ROOM_DATA: u8 = 8;

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected => "Connected",
            ServerEvent::LoggedIn { .. } => "LoggedIn",
            ServerEvent::RoomList { .. } => "RoomList",
            ServerEvent::RoomData { .. } => "RoomData",
            ServerEvent::PlayerJoined { .. } => "PlayerJoined",
            ServerEvent::DataMessage { .. } => "DataMessage",
            ServerEvent::MasterChanged { .. } => "MasterChanged",
            ServerEvent::YouJoined { .. } => "YouJoined",
            ServerEvent::PlayerLeft { .. } => "PlayerLeft",
            ServerEvent::YouLeft { .. } => "YouLeft",
        }
    }

    /// Append the wire form of this event to `w`.
    pub fn encode(&self, w: &mut Writer) -> Result<(), ProtocolError> {
        match self {
            ServerEvent::Connected => return Err(ProtocolError::NotOnWire("Connected")),
            ServerEvent::LoggedIn { user_id } => {
                w.write_u8(Self::LOGGED_IN);
                w.write_i32_be(*user_id);
            }
            ServerEvent::RoomList { rooms } => {
                let csv = rooms
                    .iter()
                    .map(|r| format!("{}:{}", r.name, r.player_count))
                    .collect::<Vec<_>>()
                    .join(",");
                w.write_u8(Self::ROOM_LIST);
                write_body(w, csv.as_bytes());
            }
            ServerEvent::RoomData { room, members } => {
                w.write_u8(Self::ROOM_DATA);
                write_short_str(w, room)?;
                w.write_i32_be(members.len() as i32);
                for m in members {
                    w.write_i32_be(m.user_id);
                    write_short_str(w, &m.name)?;
                }
            }
            ServerEvent::PlayerJoined { user_id, room } => {
                w.write_u8(Self::PLAYER_JOINED);
                w.write_i32_be(*user_id);
                write_short_str(w, room)?;
            }
            ServerEvent::DataMessage { sender, payload } => {
                w.write_u8(Self::DATA_MESSAGE);
                w.write_i32_be(*sender);
                write_body(w, payload);
            }
            ServerEvent::MasterChanged { master_id } => {
                w.write_u8(Self::MASTER_CHANGED);
                w.write_i32_be(*master_id);
            }
            ServerEvent::YouJoined { player_ids, room } => {
                w.write_u8(Self::YOU_JOINED);
                w.write_i32_be(player_ids.len() as i32);
                for id in player_ids {
                    w.write_i32_be(*id);
                }
                write_short_str(w, room)?;
            }
            ServerEvent::PlayerLeft { user_id, room } => {
                w.write_u8(Self::PLAYER_LEFT);
                w.write_i32_be(*user_id);
                write_short_str(w, room)?;
            }
            ServerEvent::YouLeft { room } => {
                w.write_u8(Self::YOU_LEFT);
                write_short_str(w, room)?;
            }
        }
        Ok(())
    }

    /// Decode one event from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a record, so a
    /// stream reader can wait for more bytes.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        decode_complete(buf, Self::read)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let tag = r.read_u8()?;
        let event = match tag {
            Self::LOGGED_IN => ServerEvent::LoggedIn {
                user_id: r.read_i32_be()?,
            },
            Self::ROOM_LIST => {
                let len = r.read_len_be()?;
                let body = read_body(r, len)?;
                let csv = std::str::from_utf8(body).map_err(|_| WireError::InvalidUtf8)?;
                ServerEvent::RoomList {
                    rooms: parse_room_list(csv),
                }
            }
            Self::PLAYER_JOINED => ServerEvent::PlayerJoined {
                user_id: r.read_i32_be()?,
                room: read_short_str(r)?,
            },
            Self::DATA_MESSAGE => {
                let sender = r.read_i32_be()?;
                let len = r.read_len_be()?;
                ServerEvent::DataMessage {
                    sender,
                    payload: read_body(r, len)?.to_vec(),
                }
            }
            Self::MASTER_CHANGED => ServerEvent::MasterChanged {
                master_id: r.read_i32_be()?,
            },
            Self::YOU_JOINED => {
                let n = r.read_len_be()?;
                // Ids are four bytes each; check before allocating.
                if n.saturating_mul(4) > r.remaining() {
                    return Err(WireError::Truncated {
                        needed: n.saturating_mul(4),
                        remaining: r.remaining(),
                    }
                    .into());
                }
                let mut player_ids = Vec::with_capacity(n);
                for _ in 0..n {
                    player_ids.push(r.read_i32_be()?);
                }
                ServerEvent::YouJoined {
                    player_ids,
                    room: read_short_str(r)?,
                }
            }
            Self::PLAYER_LEFT => ServerEvent::PlayerLeft {
                user_id: r.read_i32_be()?,
                room: read_short_str(r)?,
            },
            Self::YOU_LEFT => ServerEvent::YouLeft {
                room: read_short_str(r)?,
            },
            Self::ROOM_DATA => {
                let room = read_short_str(r)?;
                let n = r.read_len_be()?;
                let mut members = Vec::new();
                for _ in 0..n {
                    members.push(RoomMember {
                        user_id: r.read_i32_be()?,
                        name: read_short_str(r)?,
                    });
                }
                ServerEvent::RoomData { room, members }
            }
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(event)
    }
}

/// Parse a `name:count,name:count` room listing.
///
/// Entries without a parsable count are reported with a count of zero.
pub fn parse_room_list(csv: &str) -> Vec<ListedRoom> {
    csv.split(',')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.rsplit_once(':') {
            Some((name, count)) => ListedRoom {
                name: name.to_string(),
                player_count: count.trim().parse().unwrap_or(0),
            },
            None => ListedRoom {
                name: entry.to_string(),
                player_count: 0,
            },
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Audience and ordering class of a room broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendKind {
    /// Everyone in the room except the sender.
    Others,
    /// Everyone in the room including the sender.
    All,
    /// Everyone except the sender, in server arrival order.
    OthersOrdered,
    /// Everyone including the sender, in server arrival order.
    AllOrdered,
}

impl SendKind {
    /// Pick the send kind for an audience and ordering requirement.
    pub fn from_flags(include_self: bool, ordered: bool) -> Self {
        match (include_self, ordered) {
            (true, true) => SendKind::AllOrdered,
            (true, false) => SendKind::All,
            (false, true) => SendKind::OthersOrdered,
            (false, false) => SendKind::Others,
        }
    }

    /// The wire type byte.
    pub fn tag(self) -> u8 {
        match self {
            SendKind::Others => ClientCommand::SEND_OTHERS,
            SendKind::All => ClientCommand::SEND_ALL,
            SendKind::OthersOrdered => ClientCommand::SEND_OTHERS_ORDERED,
            SendKind::AllOrdered => ClientCommand::SEND_ALL_ORDERED,
        }
    }

    /// Whether the sender receives its own message back.
    pub fn includes_self(self) -> bool {
        matches!(self, SendKind::All | SendKind::AllOrdered)
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            ClientCommand::SEND_OTHERS => Some(SendKind::Others),
            ClientCommand::SEND_ALL => Some(SendKind::All),
            ClientCommand::SEND_OTHERS_ORDERED => Some(SendKind::OthersOrdered),
            ClientCommand::SEND_ALL_ORDERED => Some(SendKind::AllOrdered),
            _ => None,
        }
    }
}

/// Typed client-to-server command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Identify this device and application.
    Login { device_id: String, app_id: String },
    /// Ask for the open rooms.
    GetRooms,
    /// Ask for the members of `room`.
    GetRoomData { room: String },
    /// Enter `room`; the empty name leaves the current room.
    JoinRoom { room: String },
    /// Broadcast `payload` to the room.
    Send { kind: SendKind, payload: Vec<u8> },
    /// Send `payload` to the members of a named group.
    SendGroup { group: String, payload: Vec<u8> },
    /// Define a named group; an empty member list removes it.
    SetGroup {
        group: String,
        members: Vec<UserId>,
    },
}

impl ClientCommand {
    pub const LOGIN: u8 = 0;
    pub const GET_ROOMS: u8 = 1;
    pub const JOIN_ROOM: u8 = 2;
    pub const SEND_OTHERS: u8 = 3;
    pub const SEND_ALL: u8 = 4;
    pub const SEND_GROUP: u8 = 5;
    pub const SET_GROUP: u8 = 6;
    pub const SEND_OTHERS_ORDERED: u8 = 7;
    pub const SEND_ALL_ORDERED: u8 = 8;
    pub const GET_ROOM_DATA: u8 = 9;

    /// Append the wire form of this command to `w`.
    pub fn encode(&self, w: &mut Writer) -> Result<(), ProtocolError> {
        match self {
            ClientCommand::Login { device_id, app_id } => {
                w.write_u8(Self::LOGIN);
                write_short_str(w, device_id)?;
                write_short_str(w, app_id)?;
            }
            ClientCommand::GetRooms => w.write_u8(Self::GET_ROOMS),
            ClientCommand::GetRoomData { room } => {
                w.write_u8(Self::GET_ROOM_DATA);
                write_short_str(w, room)?;
            }
            ClientCommand::JoinRoom { room } => {
                w.write_u8(Self::JOIN_ROOM);
                write_short_str(w, room)?;
            }
            ClientCommand::Send { kind, payload } => encode_send(w, *kind, payload),
            ClientCommand::SendGroup { group, payload } => encode_send_group(w, group, payload)?,
            ClientCommand::SetGroup { group, members } => {
                w.write_u8(Self::SET_GROUP);
                write_short_str(w, group)?;
                w.write_i32_be((members.len() * 4) as i32);
                for id in members {
                    w.write_i32_be(*id);
                }
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::new();
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }

    /// Decode one command from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a record.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        decode_complete(buf, Self::read)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let tag = r.read_u8()?;
        if let Some(kind) = SendKind::from_tag(tag) {
            let len = r.read_len_be()?;
            return Ok(ClientCommand::Send {
                kind,
                payload: read_body(r, len)?.to_vec(),
            });
        }
        let cmd = match tag {
            Self::LOGIN => ClientCommand::Login {
                device_id: read_short_str(r)?,
                app_id: read_short_str(r)?,
            },
            Self::GET_ROOMS => ClientCommand::GetRooms,
            Self::GET_ROOM_DATA => ClientCommand::GetRoomData {
                room: read_short_str(r)?,
            },
            Self::JOIN_ROOM => ClientCommand::JoinRoom {
                room: read_short_str(r)?,
            },
            Self::SEND_GROUP => {
                let len = r.read_len_be()?;
                let payload = read_body(r, len)?.to_vec();
                ClientCommand::SendGroup {
                    payload,
                    group: read_short_str(r)?,
                }
            }
            Self::SET_GROUP => {
                let group = read_short_str(r)?;
                let bytes = r.read_len_be()?;
                let body = read_body(r, bytes)?;
                let members = body
                    .chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                ClientCommand::SetGroup { group, members }
            }
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(cmd)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
