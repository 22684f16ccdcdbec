//! Session notifications and their subscribers.
//!
//! Every notification goes to each subscriber in registration order and is
//! also kept in a bounded backlog for hosts that prefer polling. A
//! subscriber that panics is logged and skipped; the rest still run.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use roomlink_net::{ListedRoom, RoomMember, UserId};

/// Most notifications kept for [`EventBus::drain`].
pub const EVENT_BACKLOG: usize = 1024;

/// Something the host may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The reliable stream opened, or offline mode took over.
    Connected,
    /// The connection was lost and local room state was torn down.
    Disconnected,
    /// The server assigned the local user id.
    LoggedIn { user_id: UserId },
    /// Answer to [`Session::get_rooms`](crate::Session::get_rooms).
    RoomList { rooms: Vec<ListedRoom> },
    /// Answer to [`Session::get_room_data`](crate::Session::get_room_data).
    RoomData {
        room: String,
        members: Vec<RoomMember>,
    },
    /// The local player entered a room.
    JoinedRoom { room: String },
    /// The local player left a room.
    LeftRoom { room: String },
    /// A player is in the room. `already_in_room` is set for players listed
    /// in the join snapshot rather than arriving later.
    PlayerJoined {
        user_id: UserId,
        already_in_room: bool,
    },
    PlayerLeft { user_id: UserId },
    MasterChanged { master_id: UserId },
    ObjectSpawned { network_id: String },
    ObjectDestroyed { network_id: String },
    OwnershipChanged {
        network_id: String,
        owner: Option<UserId>,
    },
    /// A host-defined payload arrived.
    CustomMessage { sender: UserId, payload: Vec<u8> },
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    label: String,
    callback: Box<dyn FnMut(&SessionEvent)>,
}

/// Fan-out of session notifications.
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    backlog: VecDeque<SessionEvent>,
    next_id: u64,
    overflowed: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            backlog: VecDeque::new(),
            next_id: 0,
            overflowed: false,
        }
    }

    /// Register a callback. `label` names it in panic reports.
    pub fn subscribe(
        &mut self,
        label: impl Into<String>,
        callback: impl FnMut(&SessionEvent) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            label: label.into(),
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver `event` to every subscriber and the backlog.
    pub fn emit(&mut self, event: SessionEvent) {
        tracing::trace!("Session event {event:?}");
        for subscriber in &mut self.subscribers {
            let callback = &mut subscriber.callback;
            guarded(&subscriber.label, || callback(&event));
        }
        if self.backlog.len() == EVENT_BACKLOG {
            if !self.overflowed {
                tracing::warn!("Session event backlog full, dropping oldest events");
                self.overflowed = true;
            }
            self.backlog.pop_front();
        }
        self.backlog.push_back(event);
    }

    /// Take every backlogged notification, oldest first.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        self.overflowed = false;
        self.backlog.drain(..).collect()
    }
}

/// Run `f`, logging and swallowing a panic. Returns `None` if it panicked.
pub(crate) fn guarded<R>(label: impl std::fmt::Display, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::error!("{label} panicked: {}", panic_message(payload.as_ref()));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        bus.subscribe("bad", |_| panic!("boom"));
        let sink = Rc::clone(&seen);
        bus.subscribe("good", move |e| sink.borrow_mut().push(e.clone()));

        bus.emit(SessionEvent::Connected);
        bus.emit(SessionEvent::PlayerLeft { user_id: 3 });
        assert_eq!(
            *seen.borrow(),
            vec![SessionEvent::Connected, SessionEvent::PlayerLeft { user_id: 3 }]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        let id = bus.subscribe("counter", move |_| *c.borrow_mut() += 1);
        bus.emit(SessionEvent::Connected);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(SessionEvent::Connected);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut bus = EventBus::new();
        for user_id in 0..(EVENT_BACKLOG as i32 + 3) {
            bus.emit(SessionEvent::PlayerLeft { user_id });
        }
        let events = bus.drain();
        assert_eq!(events.len(), EVENT_BACKLOG);
        assert_eq!(events[0], SessionEvent::PlayerLeft { user_id: 3 });
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_guarded_reports_panic() {
        assert_eq!(guarded("ok", || 5), Some(5));
        assert_eq!(guarded("bad", || -> i32 { panic!("nope") }), None);
    }
}
