//! Offline pseudo-server.
//!
//! When no server can be reached the transport feeds every outbound record
//! to a [`Loopback`], which answers the way a room server would for a room
//! holding only the local player (user id 0). The answers are encoded to
//! wire bytes so they pass through the same decoder as real server traffic.

use crate::codec::Writer;
use crate::protocol::{ClientCommand, ProtocolError, ServerEvent, UserId};

/// User id the loopback assigns to the local player.
pub const OFFLINE_USER_ID: UserId = 0;

/// Room name reported by offline room-data queries.
pub const OFFLINE_ROOM_DATA_NAME: &str = "OFFLINE";

/// Local stand-in for the room server.
#[derive(Debug, Default)]
pub struct Loopback {
    room: String,
}

impl Loopback {
    /// Create a loopback with no room joined.
    pub fn new() -> Self {
        Self::default()
    }

    /// Room the local player is in, empty when none.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Events a server would send in response to `cmd`.
    pub fn respond(&mut self, cmd: &ClientCommand) -> Vec<ServerEvent> {
        match cmd {
            ClientCommand::Login { .. } => vec![ServerEvent::LoggedIn {
                user_id: OFFLINE_USER_ID,
            }],
            ClientCommand::GetRooms => vec![ServerEvent::RoomList { rooms: Vec::new() }],
            ClientCommand::GetRoomData { .. } => vec![ServerEvent::RoomData {
                room: OFFLINE_ROOM_DATA_NAME.to_string(),
                members: Vec::new(),
            }],
            ClientCommand::JoinRoom { room } if room.is_empty() => {
                let left = std::mem::take(&mut self.room);
                vec![ServerEvent::YouLeft { room: left }]
            }
            ClientCommand::JoinRoom { room } => {
                self.room = room.clone();
                vec![
                    ServerEvent::YouJoined {
                        player_ids: vec![OFFLINE_USER_ID],
                        room: room.clone(),
                    },
                    ServerEvent::MasterChanged {
                        master_id: OFFLINE_USER_ID,
                    },
                ]
            }
            ClientCommand::Send { kind, payload } if kind.includes_self() && !self.room.is_empty() => {
                vec![ServerEvent::DataMessage {
                    sender: OFFLINE_USER_ID,
                    payload: payload.clone(),
                }]
            }
            ClientCommand::Send { .. } | ClientCommand::SendGroup { .. } | ClientCommand::SetGroup { .. } => {
                Vec::new()
            }
        }
    }

    /// Decode every complete record in `outbound` and write the responses
    /// as server wire bytes into `w`.
    pub fn handle_bytes(&mut self, outbound: &[u8], w: &mut Writer) -> Result<(), ProtocolError> {
        let mut rest = outbound;
        while !rest.is_empty() {
            let Some((cmd, used)) = ClientCommand::decode(rest)? else {
                return Err(ProtocolError::Wire(crate::codec::WireError::Truncated {
                    needed: rest.len() + 1,
                    remaining: rest.len(),
                }));
            };
            for ev in self.respond(&cmd) {
                ev.encode(w)?;
            }
            rest = &rest[used..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::RecordDecoder;
    use crate::protocol::SendKind;

    fn round_trip(lb: &mut Loopback, cmd: ClientCommand) -> Vec<ServerEvent> {
        let mut w = Writer::new();
        lb.handle_bytes(&cmd.to_bytes().unwrap(), &mut w).unwrap();
        let mut dec = RecordDecoder::<ServerEvent>::new();
        dec.push(w.as_slice());
        let mut out = Vec::new();
        while let Some(ev) = dec.next_record().unwrap() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_login_assigns_zero() {
        let mut lb = Loopback::new();
        let out = round_trip(
            &mut lb,
            ClientCommand::Login {
                device_id: "d".into(),
                app_id: "a".into(),
            },
        );
        assert_eq!(out, vec![ServerEvent::LoggedIn { user_id: 0 }]);
    }

    #[test]
    fn test_join_then_leave() {
        let mut lb = Loopback::new();
        let out = round_trip(&mut lb, ClientCommand::JoinRoom { room: "solo".into() });
        assert_eq!(
            out,
            vec![
                ServerEvent::YouJoined {
                    player_ids: vec![0],
                    room: "solo".into()
                },
                ServerEvent::MasterChanged { master_id: 0 },
            ]
        );
        assert_eq!(lb.room(), "solo");

        let out = round_trip(
            &mut lb,
            ClientCommand::JoinRoom {
                room: String::new(),
            },
        );
        assert_eq!(out, vec![ServerEvent::YouLeft { room: "solo".into() }]);
        assert_eq!(lb.room(), "");
    }

    #[test]
    fn test_queries_answer_empty() {
        let mut lb = Loopback::new();
        assert_eq!(
            round_trip(&mut lb, ClientCommand::GetRooms),
            vec![ServerEvent::RoomList { rooms: vec![] }]
        );
        assert_eq!(
            round_trip(&mut lb, ClientCommand::GetRoomData { room: "x".into() }),
            vec![ServerEvent::RoomData {
                room: "OFFLINE".into(),
                members: vec![]
            }]
        );
    }

    #[test]
    fn test_self_inclusive_sends_echo_in_room() {
        let mut lb = Loopback::new();
        let send = |kind| ClientCommand::Send {
            kind,
            payload: vec![1, 2],
        };
        // Not in a room yet.
        assert!(round_trip(&mut lb, send(SendKind::AllOrdered)).is_empty());

        round_trip(&mut lb, ClientCommand::JoinRoom { room: "r".into() });
        assert_eq!(
            round_trip(&mut lb, send(SendKind::AllOrdered)),
            vec![ServerEvent::DataMessage {
                sender: 0,
                payload: vec![1, 2]
            }]
        );
        assert!(round_trip(&mut lb, send(SendKind::OthersOrdered)).is_empty());
    }

    #[test]
    fn test_truncated_outbound_is_error() {
        let mut lb = Loopback::new();
        let mut w = Writer::new();
        assert!(lb.handle_bytes(&[2, 5, b'a'], &mut w).is_err());
    }
}
