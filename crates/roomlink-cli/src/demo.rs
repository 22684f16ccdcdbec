//! The demo object: a beacon circling the origin, replicated with
//! [`StateSync`] by whoever owns it.

use std::time::{Duration, Instant};

use roomlink_net::{Reader, Transport, Vec3, WireError, Writer};
use roomlink_session::{NetworkObject, PackState, Session, StateSync, SyncSettings};

/// Prefab kind of the beacon.
pub const BEACON: &str = "beacon";

/// Seconds per lap.
const LAP_SECS: f32 = 4.0;
const RADIUS: f32 = 5.0;

/// Retry a join that got no answer after this long.
const JOIN_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Beacon {
    pub position: Vec3,
    pub laps: u32,
    phase: f32,
}

impl Beacon {
    /// Move along the circle by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        self.phase += dt / LAP_SECS;
        if self.phase >= 1.0 {
            self.laps += self.phase as u32;
            self.phase = self.phase.fract();
        }
        let angle = self.phase * std::f32::consts::TAU;
        self.position = Vec3::new(RADIUS * angle.cos(), 0.0, RADIUS * angle.sin());
    }
}

impl PackState for Beacon {
    fn pack(&self, w: &mut Writer) {
        w.write_vec3(self.position);
        w.write_u32(self.laps);
    }

    fn unpack(&mut self, r: &mut Reader<'_>) -> Result<(), WireError> {
        self.position = r.read_vec3()?;
        self.laps = r.read_u32()?;
        Ok(())
    }
}

/// Drives a session through join, spawn and beacon updates.
pub struct Demo {
    room: String,
    beacon: Option<String>,
    join_sent: Option<Instant>,
    last_frame: Option<Instant>,
}

impl Demo {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            beacon: None,
            join_sent: None,
            last_frame: None,
        }
    }

    /// Register the beacon prefab on `session`.
    pub fn register<T: Transport>(session: &mut Session<T>, settings: SyncSettings) {
        session.register_prefab(BEACON, move || {
            NetworkObject::new()
                .with_component(StateSync::with_settings(Beacon::default(), settings.clone()))
        });
    }

    /// Run one frame: apply the session, then join, spawn or move.
    pub fn frame<T: Transport>(&mut self, session: &mut Session<T>, now: Instant) {
        session.tick(now);
        let dt = self
            .last_frame
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f32());
        self.last_frame = Some(now);

        if !session.in_room() {
            self.beacon = None;
            let due = self
                .join_sent
                .is_none_or(|sent| now.saturating_duration_since(sent) >= JOIN_RETRY);
            if session.is_logged_in() && due && session.join_room(&self.room).is_ok() {
                self.join_sent = Some(now);
            }
            return;
        }
        self.join_sent = None;

        let beacon = match &self.beacon {
            Some(id) if session.object(id).is_some() => id.clone(),
            _ => match session.instantiate(BEACON, None) {
                Ok(id) => {
                    tracing::info!("Spawned beacon {id}");
                    self.beacon = Some(id.clone());
                    id
                }
                Err(_) => return,
            },
        };
        if session.is_owned_by_local_player(&beacon)
            && let Some(sync) = session.component_mut::<StateSync<Beacon>>(&beacon, 0)
        {
            sync.state_mut().advance(dt);
        }
    }

    /// Leave the room if in one.
    pub fn finish<T: Transport>(&mut self, session: &mut Session<T>) {
        if session.in_room() {
            let _ = session.leave_room();
        }
        self.beacon = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_circles() {
        let mut beacon = Beacon::default();
        beacon.advance(LAP_SECS / 4.0);
        assert!(beacon.position.x.abs() < 1e-4);
        assert!((beacon.position.z - RADIUS).abs() < 1e-4);
        assert_eq!(beacon.laps, 0);

        beacon.advance(LAP_SECS * 1.75);
        assert_eq!(beacon.laps, 2);
    }

    #[test]
    fn test_beacon_state_layout() {
        let mut beacon = Beacon::default();
        beacon.advance(1.0);
        beacon.laps = 3;
        let mut w = Writer::new();
        beacon.pack(&mut w);
        assert_eq!(w.len(), 16);

        let mut copy = Beacon::default();
        copy.unpack(&mut Reader::new(w.as_slice())).unwrap();
        assert_eq!(copy.position, beacon.position);
        assert_eq!(copy.laps, 3);
        assert!(Beacon::default().unpack(&mut Reader::new(&[0; 8])).is_err());
    }
}
