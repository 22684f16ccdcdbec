//! Room membership and master designation.
//!
//! The roster is rebuilt from every `YouJoined` snapshot and patched by
//! incremental join/leave events. Exactly one player carries the master
//! flag once the server has designated one.

use std::collections::BTreeMap;

use roomlink_net::UserId;

/// One member of the current room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub user_id: UserId,
    pub room: String,
    pub is_local: bool,
    pub is_master: bool,
}

/// The local player's view of its room.
#[derive(Debug, Default)]
pub struct Roster {
    local_id: Option<UserId>,
    room: Option<String>,
    players: BTreeMap<UserId, Player>,
    master: Option<UserId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-assigned id of the local player.
    pub fn local_id(&self) -> Option<UserId> {
        self.local_id
    }

    pub(crate) fn set_local_id(&mut self, user_id: UserId) {
        self.local_id = Some(user_id);
    }

    /// Current room, if any.
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn in_room(&self) -> bool {
        self.room.is_some()
    }

    pub fn master(&self) -> Option<UserId> {
        self.master
    }

    pub fn is_local_master(&self) -> bool {
        self.master.is_some() && self.master == self.local_id
    }

    pub fn player(&self, user_id: UserId) -> Option<&Player> {
        self.players.get(&user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.players.contains_key(&user_id)
    }

    /// Players ordered by user id.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Highest user id in the room.
    pub fn highest_id(&self) -> Option<UserId> {
        self.players.keys().next_back().copied()
    }

    /// Replace the roster with a complete membership snapshot.
    pub(crate) fn rebuild(&mut self, room: &str, player_ids: &[UserId]) {
        self.players.clear();
        self.master = None;
        self.room = Some(room.to_string());
        for &user_id in player_ids {
            self.add(user_id);
        }
        if let Some(local) = self.local_id {
            if !self.players.contains_key(&local) {
                tracing::warn!("Room snapshot for {room} does not list the local player {local}");
                self.add(local);
            }
        }
    }

    /// Add a player to the current room. Returns `false` if already present.
    pub(crate) fn add(&mut self, user_id: UserId) -> bool {
        if self.players.contains_key(&user_id) {
            return false;
        }
        let room = self.room.clone().unwrap_or_default();
        self.players.insert(
            user_id,
            Player {
                user_id,
                room,
                is_local: Some(user_id) == self.local_id,
                is_master: Some(user_id) == self.master,
            },
        );
        true
    }

    /// Remove a player. The master id is left as is until the server
    /// designates a successor.
    pub(crate) fn remove(&mut self, user_id: UserId) -> Option<Player> {
        self.players.remove(&user_id)
    }

    /// Designate `user_id` as master, clearing the previous master's flag.
    pub(crate) fn set_master(&mut self, user_id: UserId) {
        if let Some(previous) = self.master.and_then(|id| self.players.get_mut(&id)) {
            previous.is_master = false;
        }
        self.master = Some(user_id);
        if let Some(player) = self.players.get_mut(&user_id) {
            player.is_master = true;
        }
    }

    /// Forget the room, its players and its master. The local id survives.
    pub(crate) fn clear_room(&mut self) {
        self.room = None;
        self.players.clear();
        self.master = None;
    }

    /// Forget everything, including the local id.
    pub(crate) fn reset(&mut self) {
        self.clear_room();
        self.local_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_in_room(local: UserId, ids: &[UserId]) -> Roster {
        let mut roster = Roster::new();
        roster.set_local_id(local);
        roster.rebuild("X", ids);
        roster
    }

    #[test]
    fn test_rebuild_replaces_membership() {
        let mut roster = roster_in_room(1, &[1, 2, 3]);
        roster.set_master(2);
        roster.rebuild("X", &[1, 4]);
        let ids: Vec<_> = roster.players().map(|p| p.user_id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(roster.master(), None);
        assert!(roster.player(1).unwrap().is_local);
        assert!(!roster.player(4).unwrap().is_local);
        assert_eq!(roster.player(4).unwrap().room, "X");
    }

    #[test]
    fn test_snapshot_missing_local_player_adds_it() {
        let roster = roster_in_room(9, &[1, 2]);
        assert!(roster.contains(9));
        assert_eq!(roster.len(), 3);
    }

    #[test]
    fn test_single_master_flag() {
        let mut roster = roster_in_room(1, &[1, 2, 3]);
        roster.set_master(1);
        roster.set_master(3);
        let masters: Vec<_> = roster.players().filter(|p| p.is_master).map(|p| p.user_id).collect();
        assert_eq!(masters, vec![3]);
        assert!(!roster.is_local_master());
    }

    #[test]
    fn test_remove_keeps_master_id() {
        let mut roster = roster_in_room(1, &[1, 2]);
        roster.set_master(2);
        assert!(roster.remove(2).unwrap().is_master);
        assert_eq!(roster.master(), Some(2));
        assert_eq!(roster.highest_id(), Some(1));
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut roster = roster_in_room(1, &[1]);
        assert!(roster.add(2));
        assert!(!roster.add(2));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_clear_room_keeps_local_id() {
        let mut roster = roster_in_room(5, &[5, 6]);
        roster.set_master(5);
        assert!(roster.is_local_master());
        roster.clear_room();
        assert!(!roster.in_room());
        assert!(roster.is_empty());
        assert_eq!(roster.local_id(), Some(5));
        roster.reset();
        assert_eq!(roster.local_id(), None);
    }
}
