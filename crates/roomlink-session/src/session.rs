//! The session apply loop.
//!
//! [`Session`] is the one place room, ownership and object state change.
//! The transport fills an inbox from its I/O tasks; [`Session::tick`]
//! drains it on the host's thread, applies each event in arrival order,
//! watches the connection, and then lets components run and send.
//!
//! Ownership races are resolved by the server's relay order: a take is
//! applied locally at once and broadcast ordered to the whole room,
//! sender included, so every client replays the same sequence of takes
//! and ends on the same owner.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use roomlink_net::datagram::{encode_datagram, encode_group_datagram};
use roomlink_net::{
    ClientCommand, ConnectionState, LivenessCheck, ListedRoom, Reader, RoomMember, SendKind,
    ServerEvent, Transform, Transport, UserId, Writer, encode_send, encode_send_group,
};

use crate::component::{ComponentContext, NetworkComponent, Outgoing};
use crate::error::{RpcError, SessionError};
use crate::events::{EventBus, SessionEvent, SubscriptionId, guarded};
use crate::object::NetworkObject;
use crate::payload::{AppMessage, write_blob};
use crate::player::Roster;
use crate::prefab::PrefabRegistry;
use crate::registry::ObjectRegistry;
use crate::rpc::{decode_rpc_body, encode_rpc_body};

/// Rounds of component sends flushed per call before the rest is dropped.
const MAX_FLUSH_ROUNDS: usize = 8;

/// Identity and timing for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub app_name: String,
    pub app_version: String,
    /// Stable per-device login id.
    pub device_id: String,
    /// Log in as soon as the connection opens.
    pub auto_login: bool,
    /// Only meet clients running the same `app_version`.
    pub only_same_version: bool,
    /// Time between liveness checks.
    pub reconnect_interval: Duration,
    /// Interval for keep-alive payloads; `None` disables them.
    pub keepalive_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_name: "roomlink".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_id: String::new(),
            auto_login: true,
            only_same_version: false,
            reconnect_interval: roomlink_net::reconnection::DEFAULT_CHECK_INTERVAL,
            keepalive_interval: None,
        }
    }
}

impl SessionConfig {
    /// Application id sent at login. Versioned ids keep different builds
    /// apart on the server.
    pub fn app_id(&self) -> String {
        if self.only_same_version {
            format!("{}_{}", self.app_name, self.app_version)
        } else {
            self.app_name.clone()
        }
    }
}

/// Where a payload goes.
#[derive(Debug, Clone, Copy)]
enum Route<'a> {
    Room(SendKind),
    Group(&'a str),
}

/// One client's view of the room server.
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    roster: Roster,
    registry: ObjectRegistry,
    prefabs: PrefabRegistry,
    events: EventBus,
    groups: BTreeMap<String, Vec<UserId>>,
    liveness: LivenessCheck,
    inbound: Vec<ServerEvent>,
    outbox: Vec<Outgoing>,
    payload: Writer,
    frame: Writer,
    connected: bool,
    last_keepalive: Option<Instant>,
    now: Instant,
}

impl<T: Transport> Session<T> {
    /// Wrap `transport`. Call [`Session::connect`] to start.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            liveness: LivenessCheck::new(config.reconnect_interval),
            config,
            roster: Roster::new(),
            registry: ObjectRegistry::new(),
            prefabs: PrefabRegistry::new(),
            events: EventBus::new(),
            groups: BTreeMap::new(),
            inbound: Vec::new(),
            outbox: Vec::new(),
            payload: Writer::new(),
            frame: Writer::new(),
            connected: false,
            last_keepalive: None,
            now: Instant::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.roster.local_id()
    }

    pub fn is_logged_in(&self) -> bool {
        self.roster.local_id().is_some()
    }

    pub fn room(&self) -> Option<&str> {
        self.roster.room()
    }

    pub fn in_room(&self) -> bool {
        self.roster.in_room()
    }

    pub fn is_master(&self) -> bool {
        self.roster.is_local_master()
    }

    pub fn object(&self, network_id: &str) -> Option<&NetworkObject> {
        self.registry.get(network_id)
    }

    pub fn object_mut(&mut self, network_id: &str) -> Option<&mut NetworkObject> {
        self.registry.get_mut(network_id)
    }

    /// Downcast a component of a live object.
    pub fn component<C: NetworkComponent>(&self, network_id: &str, slot: u8) -> Option<&C> {
        self.registry.get(network_id)?.component(slot)
    }

    pub fn component_mut<C: NetworkComponent>(
        &mut self,
        network_id: &str,
        slot: u8,
    ) -> Option<&mut C> {
        self.registry.get_mut(network_id)?.component_mut(slot)
    }

    /// Whether the local player owns `network_id`.
    pub fn is_owned_by_local_player(&self, network_id: &str) -> bool {
        let local = self.roster.local_id();
        local.is_some() && self.registry.get(network_id).is_some_and(|o| o.owner == local)
    }

    // -----------------------------------------------------------------------
    // Host wiring
    // -----------------------------------------------------------------------

    /// Register the factory used to build `kind` for local and remote spawns.
    pub fn register_prefab(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> NetworkObject + 'static,
    ) {
        self.prefabs.register(kind, factory);
    }

    /// Register the scene object for `slot`. It becomes live, owned by the
    /// master, once a master is known.
    pub fn register_scene_object(
        &mut self,
        slot: u32,
        object: NetworkObject,
    ) -> Result<String, SessionError> {
        let id = self
            .registry
            .register_scene_object(slot, object)
            .inspect_err(|e| tracing::error!("Scene object registration failed: {e}"))?;
        if self.roster.in_room() {
            if let Some(master) = self.roster.master() {
                self.bootstrap_scene_objects(master);
            }
        }
        Ok(id)
    }

    /// Subscribe to session notifications.
    pub fn subscribe(
        &mut self,
        label: impl Into<String>,
        callback: impl FnMut(&SessionEvent) + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(label, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Take every notification emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain()
    }

    // -----------------------------------------------------------------------
    // Connection and room control
    // -----------------------------------------------------------------------

    /// Start connecting. Progress arrives as events on later ticks.
    pub fn connect(&mut self) {
        self.transport.connect();
    }

    /// Close the connection and reset to room-less state. No reconnect is
    /// attempted afterwards.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.connection_lost();
    }

    /// Log in with the configured device and application ids.
    pub fn login(&mut self) -> Result<(), SessionError> {
        let cmd = ClientCommand::Login {
            device_id: self.config.device_id.clone(),
            app_id: self.config.app_id(),
        };
        tracing::info!("Logging in as app {}", self.config.app_id());
        self.send_command(&cmd)
            .inspect_err(|e| tracing::error!("Login failed: {e}"))
    }

    /// Ask for the open rooms; answered by [`SessionEvent::RoomList`].
    pub fn get_rooms(&mut self) -> Result<(), SessionError> {
        self.send_command(&ClientCommand::GetRooms)
            .inspect_err(|e| tracing::error!("Room list request failed: {e}"))
    }

    /// Ask for the members of `room`; answered by [`SessionEvent::RoomData`].
    pub fn get_room_data(&mut self, room: &str) -> Result<(), SessionError> {
        let result = if room.is_empty() {
            Err(SessionError::EmptyRoomName)
        } else {
            self.send_command(&ClientCommand::GetRoomData {
                room: room.to_string(),
            })
        };
        result.inspect_err(|e| tracing::error!("Room data request failed: {e}"))
    }

    /// Enter `room`. Completion is reported by [`SessionEvent::JoinedRoom`].
    pub fn join_room(&mut self, room: &str) -> Result<(), SessionError> {
        let result = if room.is_empty() {
            Err(SessionError::EmptyRoomName)
        } else if !self.is_logged_in() {
            Err(SessionError::NotLoggedIn)
        } else {
            tracing::info!("Joining room {room}");
            self.send_command(&ClientCommand::JoinRoom {
                room: room.to_string(),
            })
        };
        result.inspect_err(|e| tracing::error!("Join failed: {e}"))
    }

    /// Leave the current room. Completion is reported by
    /// [`SessionEvent::LeftRoom`].
    pub fn leave_room(&mut self) -> Result<(), SessionError> {
        let result = if self.roster.in_room() {
            self.send_command(&ClientCommand::JoinRoom {
                room: String::new(),
            })
        } else {
            Err(SessionError::NotInRoom)
        };
        result.inspect_err(|e| tracing::error!("Leave failed: {e}"))
    }

    /// Define a named group of players for group sends. An empty list
    /// removes the group.
    pub fn set_group(&mut self, name: &str, members: &[UserId]) -> Result<(), SessionError> {
        if members.is_empty() {
            self.groups.remove(name);
        } else {
            self.groups.insert(name.to_string(), members.to_vec());
        }
        self.send_command(&ClientCommand::SetGroup {
            group: name.to_string(),
            members: members.to_vec(),
        })
        .inspect_err(|e| tracing::error!("Setting group {name} failed: {e}"))
    }

    /// Groups defined since joining, by name.
    pub fn groups(&self) -> &BTreeMap<String, Vec<UserId>> {
        &self.groups
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Spawn a `kind` object owned by the local player, optionally at a pose,
    /// and announce it to the room. Returns the new network id.
    pub fn instantiate(
        &mut self,
        kind: &str,
        transform: Option<Transform>,
    ) -> Result<String, SessionError> {
        self.spawn_local(kind, transform, None)
            .inspect_err(|e| tracing::error!("Instantiating {kind} failed: {e}"))
    }

    /// Spawn a `kind` object with packed initial state (see
    /// [`NetworkObject::pack_state`]) and announce it to the room.
    pub fn instantiate_with_state(
        &mut self,
        kind: &str,
        state: &[u8],
    ) -> Result<String, SessionError> {
        self.spawn_local(kind, None, Some(state))
            .inspect_err(|e| tracing::error!("Instantiating {kind} failed: {e}"))
    }

    /// Destroy an object here, then tell the room. Unknown ids are a no-op.
    pub fn destroy(&mut self, network_id: &str) -> Result<(), SessionError> {
        if !self.destroy_local(network_id) {
            return Ok(());
        }
        self.send_app(
            &AppMessage::Destroy {
                network_id: network_id.to_string(),
            },
            Route::Room(SendKind::OthersOrdered),
            true,
        )
        .inspect_err(|e| tracing::error!("Destroy of {network_id} not sent: {e}"))
    }

    /// Take ownership of an object. Applied locally at once; the ordered
    /// broadcast settles concurrent takes.
    pub fn take_ownership(&mut self, network_id: &str) -> Result<(), SessionError> {
        self.try_take_ownership(network_id)
            .inspect_err(|e| tracing::error!("Taking ownership of {network_id} failed: {e}"))
    }

    fn try_take_ownership(&mut self, network_id: &str) -> Result<(), SessionError> {
        let local = self.require_room()?;
        let object = self
            .registry
            .get(network_id)
            .ok_or_else(|| SessionError::UnknownObject(network_id.to_string()))?;
        if object.ownership_locked {
            return Err(SessionError::OwnershipLocked(network_id.to_string()));
        }
        self.claim(network_id, local)
    }

    /// Broadcast every component's packed state; receivers overwrite theirs.
    pub fn force_state(&mut self, network_id: &str) -> Result<(), SessionError> {
        self.try_force_state(network_id)
            .inspect_err(|e| tracing::error!("Force state of {network_id} failed: {e}"))
    }

    fn try_force_state(&mut self, network_id: &str) -> Result<(), SessionError> {
        let local = self.require_room()?;
        let object = self
            .registry
            .get(network_id)
            .ok_or_else(|| SessionError::UnknownObject(network_id.to_string()))?;
        if object.owner != Some(local) {
            return Err(SessionError::NotOwner(network_id.to_string()));
        }
        let msg = AppMessage::ForceState {
            network_id: network_id.to_string(),
            state: object.packed_state().unwrap_or_default(),
        };
        self.send_app(&msg, Route::Room(SendKind::Others), true)
    }

    // -----------------------------------------------------------------------
    // Component traffic
    // -----------------------------------------------------------------------

    /// Send a sync payload for one component to the rest of the room.
    /// Only the owner may send.
    pub fn send_bytes(
        &mut self,
        network_id: &str,
        slot: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        let result = self.send_component_bytes(network_id, slot, None, payload, reliable);
        self.flush_outbox();
        result.inspect_err(|e| tracing::error!("send_bytes on {network_id}/{slot} failed: {e}"))
    }

    /// Like [`Session::send_bytes`], addressed to a group.
    pub fn send_bytes_to_group(
        &mut self,
        network_id: &str,
        slot: u8,
        group: &str,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        let result = self.send_component_bytes(network_id, slot, Some(group), payload, reliable);
        self.flush_outbox();
        result.inspect_err(|e| {
            tracing::error!("send_bytes_to_group on {network_id}/{slot} failed: {e}")
        })
    }

    /// Call `method` on a component on every other client; with
    /// `run_locally` it also runs here, before the send.
    pub fn send_rpc(
        &mut self,
        network_id: &str,
        slot: u8,
        method: &str,
        run_locally: bool,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let result = self.send_component_rpc(network_id, slot, None, method, run_locally, data);
        self.flush_outbox();
        result.inspect_err(|e| tracing::error!("RPC {method} on {network_id}/{slot} failed: {e}"))
    }

    /// Like [`Session::send_rpc`], addressed to a group.
    pub fn send_rpc_to_group(
        &mut self,
        network_id: &str,
        slot: u8,
        group: &str,
        method: &str,
        run_locally: bool,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let result =
            self.send_component_rpc(network_id, slot, Some(group), method, run_locally, data);
        self.flush_outbox();
        result.inspect_err(|e| tracing::error!("RPC {method} on {network_id}/{slot} failed: {e}"))
    }

    /// Send host-defined bytes to the room.
    pub fn send_custom(
        &mut self,
        payload: &[u8],
        include_self: bool,
        reliable: bool,
        ordered: bool,
    ) -> Result<(), SessionError> {
        let msg = AppMessage::Custom {
            payload: payload.to_vec(),
        };
        let kind = SendKind::from_flags(include_self, ordered);
        self.require_room()
            .and_then(|_| self.send_app(&msg, Route::Room(kind), reliable))
            .inspect_err(|e| tracing::error!("Custom send failed: {e}"))
    }

    /// Send host-defined bytes to a group.
    pub fn send_custom_to_group(
        &mut self,
        group: &str,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        let msg = AppMessage::Custom {
            payload: payload.to_vec(),
        };
        self.require_room()
            .and_then(|_| self.send_app(&msg, Route::Group(group), reliable))
            .inspect_err(|e| tracing::error!("Custom send to {group} failed: {e}"))
    }

    // -----------------------------------------------------------------------
    // Apply loop
    // -----------------------------------------------------------------------

    /// Run one apply step at time `now`.
    pub fn tick(&mut self, now: Instant) {
        self.now = now;

        let mut inbound = std::mem::take(&mut self.inbound);
        self.transport.drain(&mut inbound);
        for event in inbound.drain(..) {
            self.apply(event);
        }
        self.inbound = inbound;

        self.watch_connection(now);
        self.tick_components();
        self.send_keepalive(now);
    }

    fn watch_connection(&mut self, now: Instant) {
        let state = self.transport.state();
        if self.connected && state == ConnectionState::Disconnected {
            self.connection_lost();
        }
        if self
            .liveness
            .should_reconnect(now, state, self.transport.was_connected())
        {
            tracing::info!(
                "Connection lost, reconnecting (attempt {})",
                self.liveness.attempts()
            );
            self.transport.connect();
        }
    }

    fn tick_components(&mut self) {
        let local = self.roster.local_id();
        let now = self.now;
        for id in self.registry.ids() {
            let Some(object) = self.registry.get_mut(&id) else {
                continue;
            };
            for slot in 0..object.components.len() as u8 {
                object.visit_component(slot, local, now, &mut self.outbox, |c, ctx| {
                    guarded(format_args!("tick of {id}/{slot}"), || c.tick(ctx))
                });
            }
        }
        self.flush_outbox();
    }

    fn send_keepalive(&mut self, now: Instant) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        if !self.connected || !self.roster.in_room() {
            return;
        }
        if self
            .last_keepalive
            .is_some_and(|at| now.saturating_duration_since(at) < interval)
        {
            return;
        }
        self.last_keepalive = Some(now);
        if let Err(e) = self.send_app(&AppMessage::KeepAlive, Route::Room(SendKind::Others), true) {
            tracing::warn!("Keep-alive not sent: {e}");
        }
    }

    fn apply(&mut self, event: ServerEvent) {
        tracing::trace!("Applying {}", event.kind());
        match event {
            ServerEvent::Connected => self.on_connected(),
            ServerEvent::LoggedIn { user_id } => self.on_logged_in(user_id),
            ServerEvent::RoomList { rooms } => self.on_room_list(rooms),
            ServerEvent::RoomData { room, members } => self.on_room_data(room, members),
            ServerEvent::YouJoined { player_ids, room } => self.on_you_joined(&player_ids, room),
            ServerEvent::PlayerJoined { user_id, room } => self.on_player_joined(user_id, &room),
            ServerEvent::DataMessage { sender, payload } => self.on_data(sender, &payload),
            ServerEvent::MasterChanged { master_id } => self.on_master_changed(master_id),
            ServerEvent::PlayerLeft { user_id, room } => self.on_player_left(user_id, &room),
            ServerEvent::YouLeft { room } => self.on_you_left(&room),
        }
        self.flush_outbox();
    }

    // -----------------------------------------------------------------------
    // Server events
    // -----------------------------------------------------------------------

    fn on_connected(&mut self) {
        self.connected = true;
        tracing::info!("Connected ({:?})", self.transport.state());
        self.events.emit(SessionEvent::Connected);
        if self.config.auto_login {
            // Errors are logged by login().
            let _ = self.login();
        }
    }

    fn on_logged_in(&mut self, user_id: UserId) {
        if self.roster.local_id() == Some(user_id) {
            tracing::error!("Received a second login confirmation for user {user_id}");
        }
        tracing::info!("Logged in as user {user_id}");
        self.roster.set_local_id(user_id);
        self.transport.start_datagrams(user_id);
        self.events.emit(SessionEvent::LoggedIn { user_id });
    }

    fn on_room_list(&mut self, rooms: Vec<ListedRoom>) {
        self.events.emit(SessionEvent::RoomList { rooms });
    }

    fn on_room_data(&mut self, room: String, members: Vec<RoomMember>) {
        self.events.emit(SessionEvent::RoomData { room, members });
    }

    fn on_you_joined(&mut self, player_ids: &[UserId], room: String) {
        if self.roster.in_room() {
            tracing::warn!("Joined {room} without leaving {:?} first", self.roster.room());
            self.teardown_room(false);
        }
        tracing::info!("Joined room {room} with {} player(s)", player_ids.len());
        self.roster.rebuild(&room, player_ids);
        self.events.emit(SessionEvent::JoinedRoom { room });

        let local = self.roster.local_id();
        let others: Vec<UserId> = self
            .roster
            .players()
            .map(|p| p.user_id)
            .filter(|&id| Some(id) != local)
            .collect();
        for user_id in others {
            self.events.emit(SessionEvent::PlayerJoined {
                user_id,
                already_in_room: true,
            });
        }
    }

    fn on_player_joined(&mut self, user_id: UserId, room: &str) {
        if self.roster.room() != Some(room) {
            tracing::warn!("Player {user_id} joined {room}, which is not our room");
            return;
        }
        if !self.roster.add(user_id) {
            tracing::debug!("Player {user_id} is already in the roster");
            return;
        }
        tracing::info!("Player {user_id} joined {room}");
        self.events.emit(SessionEvent::PlayerJoined {
            user_id,
            already_in_room: false,
        });
        self.catch_up_late_joiner();
    }

    /// Re-announce what a newcomer cannot know: objects we spawned, scene
    /// objects we took over, and (as master) destroyed scene objects.
    fn catch_up_late_joiner(&mut self) {
        let Some(local) = self.roster.local_id() else {
            return;
        };
        let is_master = self.roster.is_local_master();
        let mut messages = Vec::new();
        for object in self.registry.iter().filter(|o| o.owner == Some(local)) {
            let network_id = object.network_id.clone();
            if object.is_scene_object {
                if !is_master {
                    messages.push(AppMessage::TakeOwnership { network_id });
                }
                continue;
            }
            if object.prefab_kind.is_empty() {
                continue;
            }
            let kind = object.prefab_kind.clone();
            messages.push(if let Some(transform) = object.transform {
                AppMessage::InstantiateWithTransform {
                    network_id,
                    kind,
                    transform,
                }
            } else if let Some(state) = object.packed_state() {
                AppMessage::InstantiateWithState {
                    network_id,
                    kind,
                    state,
                }
            } else {
                AppMessage::Instantiate { network_id, kind }
            });
        }
        let deleted = self.registry.deleted_scene_objects();
        if is_master && !deleted.is_empty() {
            messages.push(AppMessage::DeleteSceneObjects {
                network_ids: deleted.to_vec(),
            });
        }
        for msg in &messages {
            if let Err(e) = self.send_app(msg, Route::Room(SendKind::OthersOrdered), true) {
                tracing::error!("Catch-up {} not sent: {e}", msg.kind());
                return;
            }
        }
    }

    fn on_master_changed(&mut self, master_id: UserId) {
        if !self.roster.in_room() {
            tracing::warn!("Master change to {master_id} outside a room");
            return;
        }
        let first = self.roster.master().is_none();
        let mut master = master_id;
        if !self.roster.contains(master_id) {
            match self.roster.highest_id() {
                Some(fallback) if first => {
                    tracing::error!(
                        "Master {master_id} is not in the room, falling back to {fallback}"
                    );
                    master = fallback;
                }
                _ => {
                    tracing::error!("Master {master_id} is not in the room, ignoring");
                    return;
                }
            }
        }
        tracing::info!("Player {master} is master");
        self.roster.set_master(master);
        self.events.emit(SessionEvent::MasterChanged { master_id: master });

        if first {
            self.bootstrap_scene_objects(master);
        }
        for network_id in self.registry.orphans() {
            self.set_owner(&network_id, Some(master));
        }
    }

    fn bootstrap_scene_objects(&mut self, master: UserId) {
        for network_id in self.registry.bootstrap_scene_objects(master) {
            self.notify_ownership(&network_id);
        }
    }

    fn on_player_left(&mut self, user_id: UserId, room: &str) {
        if !self.roster.contains(user_id) {
            tracing::warn!("Unknown player {user_id} left {room}");
            return;
        }
        tracing::info!("Player {user_id} left {room}");
        let was_master = self.roster.master() == Some(user_id);
        let local_master = self.roster.is_local_master();
        let local = self.roster.local_id();

        for network_id in self.registry.owned_by(user_id) {
            let locked = self
                .registry
                .get(&network_id)
                .is_some_and(|o| o.ownership_locked);
            if locked {
                self.destroy_local(&network_id);
            } else if let (true, Some(local)) = (local_master, local) {
                if let Err(e) = self.claim(&network_id, local) {
                    tracing::error!("Could not claim {network_id} from {user_id}: {e}");
                }
            } else if was_master {
                self.set_owner(&network_id, None);
            }
        }
        self.roster.remove(user_id);
        self.events.emit(SessionEvent::PlayerLeft { user_id });
    }

    fn on_you_left(&mut self, room: &str) {
        tracing::info!("Left room {room}");
        self.teardown_room(true);
    }

    fn on_data(&mut self, sender: UserId, payload: &[u8]) {
        let msg = match AppMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping payload from {sender}: {e}");
                return;
            }
        };
        if !self.roster.contains(sender) && !matches!(msg, AppMessage::Custom { .. }) {
            tracing::warn!("Dropping {} from unknown sender {sender}", msg.kind());
            return;
        }
        tracing::trace!("{} from {sender}", msg.kind());
        match msg {
            AppMessage::ObjectSync {
                network_id,
                slot,
                is_rpc,
                data,
            } => self.deliver_sync(sender, &network_id, slot, is_rpc, &data),
            AppMessage::TakeOwnership { network_id } => {
                if !self.registry.contains(&network_id) {
                    tracing::debug!("Ownership of unknown object {network_id} taken by {sender}");
                    return;
                }
                self.set_owner(&network_id, Some(sender));
            }
            AppMessage::Instantiate { network_id, kind } => {
                self.spawn_remote(sender, network_id, &kind, None, None)
            }
            AppMessage::InstantiateWithTransform {
                network_id,
                kind,
                transform,
            } => self.spawn_remote(sender, network_id, &kind, Some(transform), None),
            AppMessage::InstantiateWithState {
                network_id,
                kind,
                state,
            } => self.spawn_remote(sender, network_id, &kind, None, Some(&state)),
            AppMessage::Destroy { network_id } => {
                self.destroy_local(&network_id);
            }
            AppMessage::DeleteSceneObjects { network_ids } => {
                for network_id in network_ids {
                    self.destroy_local(&network_id);
                }
            }
            AppMessage::ForceState { network_id, state } => {
                let Some(object) = self.registry.get_mut(&network_id) else {
                    return;
                };
                if object.owner != Some(sender) {
                    tracing::warn!("Ignoring forced state for {network_id} from non-owner {sender}");
                    return;
                }
                if let Err(e) = object.unpack_state(&state) {
                    tracing::error!("Forced state for {network_id} is malformed: {e}");
                }
            }
            AppMessage::KeepAlive => {}
            AppMessage::Custom { payload } => {
                self.events.emit(SessionEvent::CustomMessage { sender, payload });
            }
        }
    }

    fn deliver_sync(&mut self, sender: UserId, network_id: &str, slot: u8, is_rpc: bool, data: &[u8]) {
        let local = self.roster.local_id();
        let now = self.now;
        let Some(object) = self.registry.get_mut(network_id) else {
            tracing::debug!("Sync for unknown object {network_id} from {sender}");
            return;
        };
        if !is_rpc && object.owner != Some(sender) {
            tracing::trace!("Ignoring sync for {network_id} from non-owner {sender}");
            return;
        }

        let delivered = if is_rpc {
            let (index, args) = match decode_rpc_body(data) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("Malformed RPC for {network_id}/{slot} from {sender}: {e}");
                    return;
                }
            };
            object
                .visit_component(slot, local, now, &mut self.outbox, |c, ctx| {
                    guarded(format_args!("RPC {index} on {network_id}/{slot}"), || {
                        invoke_rpc(c, ctx, index, args)
                    })
                })
                .map(|outcome| {
                    if let Some(Err(e)) = outcome {
                        tracing::error!("RPC from {sender} failed: {e}");
                    }
                })
        } else {
            object.visit_component(slot, local, now, &mut self.outbox, |c, ctx| {
                let mut reader = Reader::new(data);
                guarded(format_args!("receive on {network_id}/{slot}"), || {
                    c.receive_bytes(&mut reader, ctx)
                });
            })
        };
        if delivered.is_none() {
            tracing::error!("Sync for {network_id} addresses missing slot {slot}");
        }
    }

    // -----------------------------------------------------------------------
    // Object bookkeeping
    // -----------------------------------------------------------------------

    fn spawn_local(
        &mut self,
        kind: &str,
        transform: Option<Transform>,
        state: Option<&[u8]>,
    ) -> Result<String, SessionError> {
        let local = self.require_room()?;
        let mut object = self
            .prefabs
            .build(kind)
            .ok_or_else(|| SessionError::UnknownPrefab(kind.to_string()))?;
        let network_id = self.registry.allocate_id(local);
        object.network_id = network_id.clone();
        object.owner = Some(local);
        object.transform = transform;
        if let Some(state) = state {
            if let Err(e) = object.unpack_state(state) {
                tracing::warn!("Initial state for {network_id} is malformed: {e}");
            }
        }
        self.registry.insert(object)?;
        self.events.emit(SessionEvent::ObjectSpawned {
            network_id: network_id.clone(),
        });
        self.notify_ownership(&network_id);

        let kind = kind.to_string();
        let msg = match (transform, state) {
            (Some(transform), _) => AppMessage::InstantiateWithTransform {
                network_id: network_id.clone(),
                kind,
                transform,
            },
            (None, Some(state)) => AppMessage::InstantiateWithState {
                network_id: network_id.clone(),
                kind,
                state: state.to_vec(),
            },
            (None, None) => AppMessage::Instantiate {
                network_id: network_id.clone(),
                kind,
            },
        };
        self.send_app(&msg, Route::Room(SendKind::OthersOrdered), true)?;
        self.flush_outbox();
        Ok(network_id)
    }

    fn spawn_remote(
        &mut self,
        sender: UserId,
        network_id: String,
        kind: &str,
        transform: Option<Transform>,
        state: Option<&[u8]>,
    ) {
        if self.registry.contains(&network_id) {
            tracing::debug!("Already have {network_id}, ignoring instantiate from {sender}");
            return;
        }
        let Some(mut object) = self.prefabs.build(kind) else {
            tracing::error!("{}", SessionError::UnknownPrefab(kind.to_string()));
            return;
        };
        object.network_id = network_id.clone();
        object.owner = Some(sender);
        object.transform = transform;
        if let Some(state) = state {
            if let Err(e) = object.unpack_state(state) {
                tracing::warn!("Initial state for {network_id} is malformed: {e}");
            }
        }
        if let Err(e) = self.registry.insert(object) {
            tracing::error!("Remote instantiate rejected: {e}");
            return;
        }
        self.events.emit(SessionEvent::ObjectSpawned {
            network_id: network_id.clone(),
        });
        self.notify_ownership(&network_id);
    }

    /// Remove an object locally. Returns whether it existed.
    fn destroy_local(&mut self, network_id: &str) -> bool {
        if self.registry.remove(network_id).is_none() {
            return false;
        }
        tracing::debug!("Destroyed {network_id}");
        self.events.emit(SessionEvent::ObjectDestroyed {
            network_id: network_id.to_string(),
        });
        true
    }

    /// Apply ownership locally and broadcast it ordered to the whole room.
    fn claim(&mut self, network_id: &str, local: UserId) -> Result<(), SessionError> {
        self.set_owner(network_id, Some(local));
        self.send_app(
            &AppMessage::TakeOwnership {
                network_id: network_id.to_string(),
            },
            Route::Room(SendKind::AllOrdered),
            true,
        )?;
        self.flush_outbox();
        Ok(())
    }

    /// Set an owner, notifying only on change.
    fn set_owner(&mut self, network_id: &str, owner: Option<UserId>) -> bool {
        let Some(object) = self.registry.get_mut(network_id) else {
            return false;
        };
        if object.owner == owner {
            return false;
        }
        object.owner = owner;
        self.notify_ownership(network_id);
        true
    }

    fn notify_ownership(&mut self, network_id: &str) {
        let local = self.roster.local_id();
        let now = self.now;
        let Some(object) = self.registry.get_mut(network_id) else {
            return;
        };
        let owner = object.owner;
        for slot in 0..object.components.len() as u8 {
            object.visit_component(slot, local, now, &mut self.outbox, |c, ctx| {
                guarded(format_args!("ownership change of {network_id}/{slot}"), || {
                    c.on_ownership_changed(ctx)
                })
            });
        }
        self.events.emit(SessionEvent::OwnershipChanged {
            network_id: network_id.to_string(),
            owner,
        });
    }

    /// Leave-room reset: spawned objects go, scene objects park, groups and
    /// roster clear. The local id survives.
    fn teardown_room(&mut self, clear_server_groups: bool) {
        let room = self.roster.room().map(str::to_string);
        for object in self.registry.teardown() {
            self.events.emit(SessionEvent::ObjectDestroyed {
                network_id: object.network_id,
            });
        }
        let groups = std::mem::take(&mut self.groups);
        if clear_server_groups {
            for group in groups.into_keys() {
                let cmd = ClientCommand::SetGroup {
                    group,
                    members: Vec::new(),
                };
                if let Err(e) = self.send_command(&cmd) {
                    tracing::warn!("Could not clear group: {e}");
                    break;
                }
            }
        }
        self.roster.clear_room();
        self.outbox.clear();
        self.last_keepalive = None;
        if let Some(room) = room {
            self.events.emit(SessionEvent::LeftRoom { room });
        }
    }

    /// Transport gone: reset to room-less, logged-out state.
    fn connection_lost(&mut self) {
        let was_connected = std::mem::take(&mut self.connected);
        self.teardown_room(false);
        self.roster.reset();
        if was_connected {
            tracing::warn!("Disconnected from server");
            self.events.emit(SessionEvent::Disconnected);
        }
    }

    fn require_room(&self) -> Result<UserId, SessionError> {
        if !self.roster.in_room() {
            return Err(SessionError::NotInRoom);
        }
        self.roster.local_id().ok_or(SessionError::NotLoggedIn)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    fn send_component_bytes(
        &mut self,
        network_id: &str,
        slot: u8,
        group: Option<&str>,
        payload: &[u8],
        reliable: bool,
    ) -> Result<(), SessionError> {
        let local = self.require_room()?;
        let object = self
            .registry
            .get_mut(network_id)
            .ok_or_else(|| SessionError::UnknownObject(network_id.to_string()))?;
        if object.owner != Some(local) {
            return Err(SessionError::NotOwner(network_id.to_string()));
        }
        if slot as usize >= object.components.len() {
            return Err(SessionError::UnknownComponent {
                network_id: network_id.to_string(),
                slot,
            });
        }
        self.payload.reset();
        self.payload.write_bytes(&object.headers(slot).sync);
        write_blob(&mut self.payload, payload);
        let route = group.map_or(Route::Room(SendKind::Others), Route::Group);
        self.flush_payload(route, reliable)
    }

    fn send_component_rpc(
        &mut self,
        network_id: &str,
        slot: u8,
        group: Option<&str>,
        method: &str,
        run_locally: bool,
        data: &[u8],
    ) -> Result<(), SessionError> {
        let local = self.require_room()?;
        let now = self.now;
        let object = self
            .registry
            .get_mut(network_id)
            .ok_or_else(|| SessionError::UnknownObject(network_id.to_string()))?;
        let component = object.components.get_mut(slot as usize).ok_or_else(|| {
            SessionError::UnknownComponent {
                network_id: network_id.to_string(),
                slot,
            }
        })?;
        let index = component
            .rpc()
            .ok_or_else(|| SessionError::NotRpcCapable {
                network_id: network_id.to_string(),
                slot,
            })?
            .rpc_index(method)
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))?;

        if run_locally {
            object.visit_component(slot, Some(local), now, &mut self.outbox, |c, ctx| {
                guarded(format_args!("local RPC {method} on {network_id}/{slot}"), || {
                    invoke_rpc(c, ctx, index, data)
                })
            });
        }

        self.payload.reset();
        self.payload.write_bytes(&object.headers(slot).rpc);
        let len_pos = self.payload.reserve(4);
        let start = self.payload.len();
        encode_rpc_body(&mut self.payload, index, data);
        let body_len = (self.payload.len() - start) as i32;
        self.payload.patch_i32(len_pos, body_len);
        let route = group.map_or(Route::Room(SendKind::Others), Route::Group);
        self.flush_payload(route, true)
    }

    /// Send everything components queued, including sends queued by
    /// callbacks that ran during the flush.
    fn flush_outbox(&mut self) {
        for _ in 0..MAX_FLUSH_ROUNDS {
            if self.outbox.is_empty() {
                return;
            }
            for item in std::mem::take(&mut self.outbox) {
                let result = match &item {
                    Outgoing::Bytes {
                        network_id,
                        slot,
                        group,
                        payload,
                        reliable,
                    } => self.send_component_bytes(
                        network_id,
                        *slot,
                        group.as_deref(),
                        payload,
                        *reliable,
                    ),
                    Outgoing::Rpc {
                        network_id,
                        slot,
                        group,
                        method,
                        run_locally,
                        data,
                    } => self.send_component_rpc(
                        network_id,
                        *slot,
                        group.as_deref(),
                        method,
                        *run_locally,
                        data,
                    ),
                    Outgoing::TakeOwnership { network_id } => self.try_take_ownership(network_id),
                };
                if let Err(e) = result {
                    tracing::error!("Dropped component send: {e}");
                }
            }
        }
        if !self.outbox.is_empty() {
            tracing::warn!(
                "Dropping {} component sends still queued after {MAX_FLUSH_ROUNDS} rounds",
                self.outbox.len()
            );
            self.outbox.clear();
        }
    }

    fn send_app(
        &mut self,
        msg: &AppMessage,
        route: Route<'_>,
        reliable: bool,
    ) -> Result<(), SessionError> {
        self.payload.reset();
        msg.encode(&mut self.payload);
        self.flush_payload(route, reliable)
    }

    /// Frame the contents of `self.payload` and hand it to the transport.
    fn flush_payload(&mut self, route: Route<'_>, reliable: bool) -> Result<(), SessionError> {
        self.frame.reset();
        let payload = self.payload.as_slice();
        if reliable {
            match route {
                Route::Room(kind) => encode_send(&mut self.frame, kind, payload),
                Route::Group(group) => encode_send_group(&mut self.frame, group, payload)?,
            }
            return self.send_frame();
        }
        let user_id = self.roster.local_id().ok_or(SessionError::NotLoggedIn)?;
        match route {
            Route::Room(kind) => encode_datagram(&mut self.frame, kind, user_id, payload),
            Route::Group(group) => encode_group_datagram(&mut self.frame, user_id, group, payload)?,
        }
        self.transport.send_unreliable(self.frame.as_slice());
        Ok(())
    }

    fn send_command(&mut self, cmd: &ClientCommand) -> Result<(), SessionError> {
        self.frame.reset();
        cmd.encode(&mut self.frame)?;
        self.send_frame()
    }

    fn send_frame(&mut self) -> Result<(), SessionError> {
        if self.transport.send_reliable(self.frame.as_slice()) {
            return Ok(());
        }
        if self.connected && self.transport.state() == ConnectionState::Disconnected {
            self.connection_lost();
        }
        Err(SessionError::SendFailed)
    }
}

fn invoke_rpc(
    component: &mut dyn NetworkComponent,
    ctx: &mut ComponentContext<'_>,
    index: u8,
    data: &[u8],
) -> Result<(), SessionError> {
    let Some(dispatch) = component.rpc() else {
        return Err(SessionError::NotRpcCapable {
            network_id: ctx.network_id().to_string(),
            slot: ctx.slot(),
        });
    };
    dispatch.invoke_rpc(index, ctx, data)?;
    Ok(())
}

#[cfg(test)]
#[path = "scenario_tests.rs"]
mod tests;
