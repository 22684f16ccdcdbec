//! Rate-limited state replication for owned objects.
//!
//! [`StateSync`] wraps any [`PackState`] value as a [`NetworkComponent`].
//! While the local player owns the object it packs the value at a fixed
//! rate and sends it over the unreliable channel; remote copies unpack what
//! they receive. With on-change compression, unchanged bytes are only
//! resent once per idle interval.

use std::time::{Duration, Instant};

use roomlink_net::{Reader, WireError, Writer};

use crate::component::{ComponentContext, NetworkComponent};

/// A value that can be written to and read from the wire.
pub trait PackState: 'static {
    fn pack(&self, w: &mut Writer);
    fn unpack(&mut self, r: &mut Reader<'_>) -> Result<(), WireError>;
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Fixed-rate trigger using next-send-time bookkeeping on a monotonic clock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    next: Option<Instant>,
}

impl RateLimiter {
    /// A limiter firing `rate_hz` times per second. Zero or negative rates
    /// fire on every call.
    pub fn new(rate_hz: f32) -> Self {
        let interval = if rate_hz > 0.0 {
            Duration::from_nanos((1e9 / f64::from(rate_hz)).round() as u64)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a send is due at `now`. Advances the schedule when it is.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now < next => false,
            Some(next) => {
                let following = next + self.interval;
                // Fell behind (long frame or suspension): restart from now.
                self.next = Some(if following <= now {
                    now + self.interval
                } else {
                    following
                });
                true
            }
            None => {
                self.next = Some(now + self.interval);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StateSync
// ---------------------------------------------------------------------------

/// Tuning for [`StateSync`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Sends per second while owned.
    pub rate_hz: f32,
    /// Skip sends whose bytes match the previous send.
    pub hybrid_on_change: bool,
    /// With `hybrid_on_change`, resend unchanged bytes after this long.
    pub idle_resend: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            rate_hz: 30.0,
            hybrid_on_change: true,
            idle_resend: Duration::from_secs(2),
        }
    }
}

/// Component replicating a [`PackState`] value from owner to everyone else.
pub struct StateSync<S: PackState> {
    state: S,
    settings: SyncSettings,
    limiter: RateLimiter,
    scratch: Writer,
    last_sent: Vec<u8>,
    last_sent_at: Option<Instant>,
    force: bool,
    received: u64,
}

impl<S: PackState> StateSync<S> {
    pub fn new(state: S) -> Self {
        Self::with_settings(state, SyncSettings::default())
    }

    pub fn with_settings(state: S, settings: SyncSettings) -> Self {
        Self {
            limiter: RateLimiter::new(settings.rate_hz),
            state,
            settings,
            scratch: Writer::new(),
            last_sent: Vec::new(),
            last_sent_at: None,
            force: false,
            received: 0,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Send on the next tick regardless of rate or change detection.
    pub fn force_sync(&mut self) {
        self.force = true;
    }

    /// Updates applied from remote owners.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn unchanged_and_fresh(&self, now: Instant) -> bool {
        self.settings.hybrid_on_change
            && self.scratch.as_slice() == self.last_sent.as_slice()
            && self
                .last_sent_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.settings.idle_resend)
    }
}

impl<S: PackState> NetworkComponent for StateSync<S> {
    fn receive_bytes(&mut self, reader: &mut Reader<'_>, ctx: &mut ComponentContext<'_>) {
        match self.state.unpack(reader) {
            Ok(()) => self.received += 1,
            Err(e) => tracing::warn!(
                "Dropping malformed state update for {} slot {}: {e}",
                ctx.network_id(),
                ctx.slot()
            ),
        }
    }

    fn tick(&mut self, ctx: &mut ComponentContext<'_>) {
        if !ctx.is_owned_by_local_player() {
            return;
        }
        let now = ctx.now();
        let forced = std::mem::take(&mut self.force);
        if !forced && !self.limiter.ready(now) {
            return;
        }
        self.scratch.reset();
        self.state.pack(&mut self.scratch);
        if !forced && self.unchanged_and_fresh(now) {
            return;
        }
        self.last_sent.clear();
        self.last_sent.extend_from_slice(self.scratch.as_slice());
        self.last_sent_at = Some(now);
        ctx.send_bytes(self.last_sent.clone(), false);
    }

    fn on_ownership_changed(&mut self, _ctx: &mut ComponentContext<'_>) {
        self.last_sent.clear();
        self.last_sent_at = None;
    }

    fn pack_state(&self, w: &mut Writer) -> bool {
        self.state.pack(w);
        true
    }

    fn unpack_state(&mut self, reader: &mut Reader<'_>) -> Result<(), WireError> {
        self.state.unpack(reader)
    }
}
