//! In-memory room server for driving several sessions in one test.
//!
//! [`MemoryRelay`] applies the server's routing rules synchronously: every
//! command is handled the moment a client sends it, so the relay order of
//! competing messages is exactly the order of the `send` calls.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use roomlink_net::{
    ClientCommand, ConnectionState, ListedRoom, Reader, RecordDecoder, RoomMember, SendKind,
    ServerEvent, Transport, UserId,
};

#[derive(Default)]
struct Client {
    user_id: Option<UserId>,
    room: Option<String>,
    inbox: VecDeque<ServerEvent>,
    state: Option<ConnectionState>,
    was_connected: bool,
    datagrams: bool,
    sent_datagrams: usize,
}

#[derive(Default)]
struct RelayState {
    next_user: UserId,
    clients: Vec<Client>,
    rooms: BTreeMap<String, Vec<usize>>,
    masters: BTreeMap<String, usize>,
    groups: BTreeMap<(usize, String), Vec<UserId>>,
}

impl RelayState {
    fn push(&mut self, client: usize, event: ServerEvent) {
        if self.clients[client].state == Some(ConnectionState::Connected) {
            self.clients[client].inbox.push_back(event);
        }
    }

    fn user(&self, client: usize) -> UserId {
        self.clients[client].user_id.unwrap_or(-1)
    }

    fn by_user(&self, user_id: UserId) -> Option<usize> {
        self.clients.iter().position(|c| c.user_id == Some(user_id))
    }

    fn handle(&mut self, client: usize, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Login { .. } => {
                let user_id = match self.clients[client].user_id {
                    Some(id) => id,
                    None => {
                        self.next_user += 1;
                        self.next_user
                    }
                };
                self.clients[client].user_id = Some(user_id);
                self.push(client, ServerEvent::LoggedIn { user_id });
            }
            ClientCommand::GetRooms => {
                let rooms = self
                    .rooms
                    .iter()
                    .map(|(name, members)| ListedRoom {
                        name: name.clone(),
                        player_count: members.len() as u32,
                    })
                    .collect();
                self.push(client, ServerEvent::RoomList { rooms });
            }
            ClientCommand::GetRoomData { room } => {
                let members = self
                    .rooms
                    .get(&room)
                    .map(|m| {
                        m.iter()
                            .map(|&c| RoomMember {
                                user_id: self.user(c),
                                name: format!("user{}", self.user(c)),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.push(client, ServerEvent::RoomData { room, members });
            }
            ClientCommand::JoinRoom { room } => {
                self.leave(client);
                if !room.is_empty() {
                    self.join(client, room);
                }
            }
            ClientCommand::Send { kind, payload } => self.relay(client, kind, payload),
            ClientCommand::SendGroup { group, payload } => self.relay_group(client, &group, payload),
            ClientCommand::SetGroup { group, members } => {
                if members.is_empty() {
                    self.groups.remove(&(client, group));
                } else {
                    self.groups.insert((client, group), members);
                }
            }
        }
    }

    fn join(&mut self, client: usize, room: String) {
        let members = self.rooms.entry(room.clone()).or_default();
        members.push(client);
        let members = members.clone();
        self.clients[client].room = Some(room.clone());
        let master = *self.masters.entry(room.clone()).or_insert(client);

        let player_ids = members.iter().map(|&c| self.user(c)).collect();
        self.push(
            client,
            ServerEvent::YouJoined {
                player_ids,
                room: room.clone(),
            },
        );
        let master_id = self.user(master);
        self.push(client, ServerEvent::MasterChanged { master_id });
        let user_id = self.user(client);
        for &other in members.iter().filter(|&&c| c != client) {
            self.push(
                other,
                ServerEvent::PlayerJoined {
                    user_id,
                    room: room.clone(),
                },
            );
        }
    }

    fn leave(&mut self, client: usize) {
        let Some(room) = self.clients[client].room.take() else {
            return;
        };
        let user_id = self.user(client);
        let remaining = {
            let members = self.rooms.entry(room.clone()).or_default();
            members.retain(|&c| c != client);
            members.clone()
        };
        self.groups.retain(|(owner, _), _| *owner != client);
        self.push(client, ServerEvent::YouLeft { room: room.clone() });
        for &other in &remaining {
            self.push(
                other,
                ServerEvent::PlayerLeft {
                    user_id,
                    room: room.clone(),
                },
            );
        }
        if remaining.is_empty() {
            self.rooms.remove(&room);
            self.masters.remove(&room);
        } else if self.masters.get(&room) == Some(&client) {
            let successor = remaining[0];
            self.masters.insert(room, successor);
            let master_id = self.user(successor);
            for &other in &remaining {
                self.push(other, ServerEvent::MasterChanged { master_id });
            }
        }
    }

    fn relay(&mut self, client: usize, kind: SendKind, payload: Vec<u8>) {
        let Some(room) = self.clients[client].room.clone() else {
            return;
        };
        let sender = self.user(client);
        let members = self.rooms.get(&room).cloned().unwrap_or_default();
        for other in members {
            if other != client || kind.includes_self() {
                self.push(
                    other,
                    ServerEvent::DataMessage {
                        sender,
                        payload: payload.clone(),
                    },
                );
            }
        }
    }

    fn relay_group(&mut self, client: usize, group: &str, payload: Vec<u8>) {
        let Some(members) = self.groups.get(&(client, group.to_string())).cloned() else {
            return;
        };
        let sender = self.user(client);
        let room = self.clients[client].room.clone();
        for user_id in members {
            let Some(other) = self.by_user(user_id) else {
                continue;
            };
            if self.clients[other].room == room {
                self.push(
                    other,
                    ServerEvent::DataMessage {
                        sender,
                        payload: payload.clone(),
                    },
                );
            }
        }
    }
}

/// Shared in-memory server.
#[derive(Clone, Default)]
pub(crate) struct MemoryRelay {
    state: Rc<RefCell<RelayState>>,
}

impl MemoryRelay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A transport for a new client of this relay.
    pub(crate) fn client(&self) -> MemoryTransport {
        let mut state = self.state.borrow_mut();
        state.clients.push(Client::default());
        MemoryTransport {
            relay: Rc::clone(&self.state),
            index: state.clients.len() - 1,
            decoder: RecordDecoder::new(),
        }
    }

    /// Drop a client's connection server-side, as a network failure would.
    pub(crate) fn kick(&self, user_id: UserId) {
        let mut state = self.state.borrow_mut();
        if let Some(client) = state.by_user(user_id) {
            state.leave(client);
            let c = &mut state.clients[client];
            c.state = Some(ConnectionState::Disconnected);
            c.inbox.clear();
            c.datagrams = false;
        }
    }

    /// Deliver an arbitrary event to a client.
    pub(crate) fn inject(&self, user_id: UserId, event: ServerEvent) {
        let mut state = self.state.borrow_mut();
        if let Some(client) = state.by_user(user_id) {
            state.push(client, event);
        }
    }

    /// Whether any client has undelivered events.
    pub(crate) fn pending(&self) -> bool {
        self.state.borrow().clients.iter().any(|c| !c.inbox.is_empty())
    }

    /// User ids in `room`, in join order.
    pub(crate) fn members(&self, room: &str) -> Vec<UserId> {
        let state = self.state.borrow();
        state
            .rooms
            .get(room)
            .map(|m| m.iter().map(|&c| state.user(c)).collect())
            .unwrap_or_default()
    }

    /// Datagrams a user has sent.
    pub(crate) fn datagrams_from(&self, user_id: UserId) -> usize {
        let state = self.state.borrow();
        state
            .by_user(user_id)
            .map_or(0, |c| state.clients[c].sent_datagrams)
    }
}

/// One client's end of a [`MemoryRelay`].
pub(crate) struct MemoryTransport {
    relay: Rc<RefCell<RelayState>>,
    index: usize,
    decoder: RecordDecoder<ClientCommand>,
}

impl Transport for MemoryTransport {
    fn connect(&mut self) {
        let mut state = self.relay.borrow_mut();
        let client = &mut state.clients[self.index];
        if client.state == Some(ConnectionState::Connected) {
            return;
        }
        client.state = Some(ConnectionState::Connected);
        client.was_connected = true;
        client.inbox.push_back(ServerEvent::Connected);
    }

    fn disconnect(&mut self) {
        let mut state = self.relay.borrow_mut();
        state.leave(self.index);
        let client = &mut state.clients[self.index];
        client.state = Some(ConnectionState::Disconnected);
        client.was_connected = false;
        client.inbox.clear();
        client.datagrams = false;
    }

    fn state(&self) -> ConnectionState {
        self.relay.borrow().clients[self.index]
            .state
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn was_connected(&self) -> bool {
        self.relay.borrow().clients[self.index].was_connected
    }

    fn send_reliable(&mut self, bytes: &[u8]) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        self.decoder.push(bytes);
        loop {
            match self.decoder.next_record() {
                Ok(Some(cmd)) => self.relay.borrow_mut().handle(self.index, cmd),
                Ok(None) => return true,
                Err(e) => panic!("client sent a malformed record: {e}"),
            }
        }
    }

    fn send_unreliable(&mut self, datagram: &[u8]) -> bool {
        let mut state = self.relay.borrow_mut();
        if !state.clients[self.index].datagrams {
            return true;
        }
        state.clients[self.index].sent_datagrams += 1;
        let mut r = Reader::new(datagram);
        let tag = r.read_u8().expect("datagram tag");
        let _sender = r.read_i32_be().expect("datagram sender");
        if tag == ClientCommand::SEND_GROUP {
            let len = r.read_u8().expect("group length") as usize;
            let group = String::from_utf8(r.read_bytes(len).expect("group").to_vec()).expect("utf8");
            state.relay_group(self.index, &group, r.read_rest().to_vec());
        } else {
            let kind = match tag {
                ClientCommand::SEND_ALL => SendKind::All,
                ClientCommand::SEND_OTHERS_ORDERED => SendKind::OthersOrdered,
                ClientCommand::SEND_ALL_ORDERED => SendKind::AllOrdered,
                _ => SendKind::Others,
            };
            state.relay(self.index, kind, r.read_rest().to_vec());
        }
        true
    }

    fn start_datagrams(&mut self, _user_id: UserId) {
        self.relay.borrow_mut().clients[self.index].datagrams = true;
    }

    fn drain(&mut self, out: &mut Vec<ServerEvent>) {
        out.extend(self.relay.borrow_mut().clients[self.index].inbox.drain(..));
    }
}
