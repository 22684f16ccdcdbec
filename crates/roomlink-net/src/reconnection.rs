//! Periodic liveness check driving reconnection.
//!
//! The apply loop asks [`LivenessCheck::should_reconnect`] every tick. At
//! most once per interval it looks at the transport: a session that had
//! connected before and is now disconnected is due for a fresh `connect`.
//! Sessions that never connected (or fell back to offline mode) are left
//! alone.

use std::time::{Duration, Instant};

use crate::transport::ConnectionState;

/// Default time between liveness checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Fixed-interval reconnect trigger.
#[derive(Debug, Clone)]
pub struct LivenessCheck {
    interval: Duration,
    last_check: Option<Instant>,
    attempts: u32,
}

impl Default for LivenessCheck {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl LivenessCheck {
    /// Create a check that runs at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_check: None,
            attempts: 0,
        }
    }

    /// Whether a reconnect attempt should be made now.
    ///
    /// The first call always performs a check; later calls only do so once
    /// `interval` has elapsed since the previous check.
    pub fn should_reconnect(
        &mut self,
        now: Instant,
        state: ConnectionState,
        was_connected: bool,
    ) -> bool {
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_check = Some(now);

        match state {
            ConnectionState::Disconnected if was_connected => {
                self.attempts += 1;
                true
            }
            ConnectionState::Connected => {
                self.attempts = 0;
                false
            }
            _ => false,
        }
    }

    /// Reconnect attempts since the last observed healthy connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured check interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
