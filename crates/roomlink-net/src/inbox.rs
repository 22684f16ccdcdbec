//! Bounded hand-off of decoded server events to the apply loop.
//!
//! Network tasks push through an [`InboxSender`]; the host's tick drains the
//! [`Inbox`] once per frame. When the inbox is full, new arrivals are dropped
//! instead of blocking the network task, so a suspended host cannot make the
//! queue grow without bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::protocol::ServerEvent;

/// Default inbox capacity.
pub const DEFAULT_INBOX_CAPACITY: usize = 1000;

/// Producer half, cloned into every network task.
#[derive(Clone)]
pub struct InboxSender {
    tx: mpsc::Sender<ServerEvent>,
    dropped: Arc<AtomicU64>,
}

impl InboxSender {
    /// Enqueue an event. Returns `false` if it was dropped because the
    /// inbox is full or the consumer is gone.
    pub fn push(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Inbox full, dropping {} (dropped {total} so far)",
                    event.kind()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer half, owned by the apply loop.
pub struct Inbox {
    rx: mpsc::Receiver<ServerEvent>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl Inbox {
    /// Create an inbox holding at most `capacity` events.
    pub fn new(capacity: usize) -> (InboxSender, Inbox) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            InboxSender {
                tx,
                dropped: Arc::clone(&dropped),
            },
            Inbox {
                rx,
                capacity,
                dropped,
            },
        )
    }

    /// Move every queued event into `out`, oldest first.
    ///
    /// At most `capacity` events are taken per call so that producers
    /// pushing during the drain cannot stall the tick.
    pub fn drain_into(&mut self, out: &mut Vec<ServerEvent>) -> usize {
        let mut taken = 0;
        while taken < self.capacity {
            match self.rx.try_recv() {
                Ok(event) => {
                    out.push(event);
                    taken += 1;
                }
                Err(_) => break,
            }
        }
        taken
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events dropped because the inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
