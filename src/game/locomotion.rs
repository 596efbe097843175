//! Locomotion
//!
//! Per-entity movement state advanced once per fixed update, and the
//! compact state update sent to sessions watching a moving entity.
//!
//! Update layout (after the archive header):
//!
//! ```text
//! [entity id: varint]
//! [flags: varint]                bit 0  full orientation
//!                                bit 1  move speed present
//!                                bit 2  destination present
//!                                bit 3  moving
//!                                bit 11 prototype id present
//! [prototype id: varint]?        bit 11
//! [position: 3 x fixed(3)]
//! [yaw: fixed(6)] or [yaw, pitch, roll: fixed(6)]   bit 0
//! [move speed: fixed(3)]?        bit 1
//! [destination: 3 x fixed(3)]?   bit 2
//! ```

use std::time::Duration;

use crate::archive::{Archive, ArchiveError, Transfer, POSITION_PRECISION};
use crate::core::ids::{EntityId, PrototypeId};
use crate::core::vec3::{Orientation, Vector3};

/// Locomotion update flag bits.
pub mod loc_flags {
    /// Orientation carries pitch and roll as well as yaw.
    pub const FULL_ORIENTATION: u32 = 1 << 0;
    /// Move speed follows.
    pub const HAS_MOVE_SPEED: u32 = 1 << 1;
    /// Destination follows.
    pub const HAS_DESTINATION: u32 = 1 << 2;
    /// Entity is moving.
    pub const IS_MOVING: u32 = 1 << 3;
    /// Prototype id follows.
    pub const HAS_PROTOTYPE: u32 = 1 << 11;

    /// Every bit a reader understands.
    pub const KNOWN: u32 = FULL_ORIENTATION | HAS_MOVE_SPEED | HAS_DESTINATION | IS_MOVING | HAS_PROTOTYPE;
}

/// Arrival tolerance for destination moves.
const ARRIVAL_EPSILON: f32 = 0.01;

/// Movement state of a locomoting entity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Locomotor {
    velocity: Vector3,
    destination: Option<Vector3>,
    move_speed: f32,
}

impl Locomotor {
    /// Idle locomotor with a base speed.
    pub fn new(move_speed: f32) -> Self {
        Self { velocity: Vector3::ZERO, destination: None, move_speed }
    }

    /// Base speed in units per second.
    pub fn move_speed(&self) -> f32 {
        self.move_speed
    }

    /// Change the base speed.
    pub fn set_move_speed(&mut self, speed: f32) {
        self.move_speed = speed.max(0.0);
    }

    /// Current velocity.
    pub fn velocity(&self) -> Vector3 {
        self.velocity
    }

    /// Current destination.
    pub fn destination(&self) -> Option<Vector3> {
        self.destination
    }

    /// True if the next step will move the entity.
    pub fn is_moving(&self) -> bool {
        self.destination.is_some() || self.velocity != Vector3::ZERO
    }

    /// Move along `direction` at base speed until stopped.
    pub fn set_heading(&mut self, direction: Vector3) {
        self.destination = None;
        self.velocity = direction.normalize_or_zero() * self.move_speed;
    }

    /// Walk toward a point and stop on arrival.
    pub fn move_to(&mut self, destination: Vector3) {
        self.destination = Some(destination);
        self.velocity = Vector3::ZERO;
    }

    /// Stop moving.
    pub fn stop(&mut self) {
        self.destination = None;
        self.velocity = Vector3::ZERO;
    }

    /// Advance from `position` by `dt`. Returns the new position if it changed.
    pub fn step(&mut self, position: Vector3, dt: Duration) -> Option<Vector3> {
        let seconds = dt.as_secs_f32();

        if let Some(destination) = self.destination {
            let to_target = destination - position;
            let distance = to_target.length();
            let reach = self.move_speed * seconds;
            if distance <= ARRIVAL_EPSILON || distance <= reach {
                self.destination = None;
                return (distance > 0.0).then_some(destination);
            }
            return Some(position + to_target * (reach / distance));
        }

        if self.velocity == Vector3::ZERO {
            return None;
        }
        Some(position + self.velocity * seconds)
    }
}

impl Transfer for Locomotor {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer_vector3(&mut self.velocity, POSITION_PRECISION)?;
        archive.transfer_float(&mut self.move_speed, POSITION_PRECISION)?;
        let mut destination = self.destination;
        let mut present = destination.is_some();
        archive.transfer(&mut present)?;
        if present {
            let mut point = destination.unwrap_or_default();
            archive.transfer_vector3(&mut point, POSITION_PRECISION)?;
            destination = Some(point);
        } else {
            destination = None;
        }
        self.destination = destination;
        Ok(())
    }
}

/// Movement snapshot replicated to sessions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocomotionStateUpdate {
    /// Moving entity.
    pub entity_id: EntityId,
    /// Prototype, sent only when valid.
    pub prototype_id: PrototypeId,
    /// Position.
    pub position: Vector3,
    /// Orientation; reduced to yaw when pitch and roll are zero.
    pub orientation: Orientation,
    /// Move speed, sent only when non-zero.
    pub move_speed: f32,
    /// Destination, if walking to a point.
    pub destination: Option<Vector3>,
    /// Whether the entity is moving.
    pub moving: bool,
}

impl LocomotionStateUpdate {
    /// Flag word describing which optional fields are present.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if !self.orientation.is_yaw_only() {
            flags |= loc_flags::FULL_ORIENTATION;
        }
        if self.move_speed != 0.0 {
            flags |= loc_flags::HAS_MOVE_SPEED;
        }
        if self.destination.is_some() {
            flags |= loc_flags::HAS_DESTINATION;
        }
        if self.moving {
            flags |= loc_flags::IS_MOVING;
        }
        if self.prototype_id.is_valid() {
            flags |= loc_flags::HAS_PROTOTYPE;
        }
        flags
    }
}

impl Transfer for LocomotionStateUpdate {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer(&mut self.entity_id)?;

        let mut flags = if archive.is_packing() { self.flags() } else { 0 };
        archive.transfer_flags(&mut flags, loc_flags::KNOWN, "locomotion")?;

        if flags & loc_flags::HAS_PROTOTYPE != 0 {
            archive.transfer(&mut self.prototype_id)?;
        } else {
            self.prototype_id = PrototypeId::INVALID;
        }

        archive.transfer_vector3(&mut self.position, POSITION_PRECISION)?;
        archive.transfer_orientation(&mut self.orientation, flags & loc_flags::FULL_ORIENTATION != 0)?;

        if flags & loc_flags::HAS_MOVE_SPEED != 0 {
            archive.transfer_float(&mut self.move_speed, POSITION_PRECISION)?;
        } else {
            self.move_speed = 0.0;
        }

        if flags & loc_flags::HAS_DESTINATION != 0 {
            let mut point = self.destination.unwrap_or_default();
            archive.transfer_vector3(&mut point, POSITION_PRECISION)?;
            self.destination = Some(point);
        } else {
            self.destination = None;
        }

        self.moving = flags & loc_flags::IS_MOVING != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::AoiChannels;

    fn round_trip(update: &LocomotionStateUpdate) -> (LocomotionStateUpdate, usize) {
        let mut archive = Archive::new_replication(AoiChannels::PROXIMITY);
        let mut copy = update.clone();
        archive.transfer(&mut copy).unwrap();
        let bytes = archive.into_bytes().unwrap();
        let len = bytes.len();

        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = LocomotionStateUpdate::default();
        archive.transfer(&mut decoded).unwrap();
        archive.finish().unwrap();
        (decoded, len)
    }

    #[test]
    fn test_step_toward_destination() {
        let mut loco = Locomotor::new(10.0);
        loco.move_to(Vector3::new(1.0, 0.0, 0.0));
        let dt = Duration::from_millis(50);

        let p = loco.step(Vector3::ZERO, dt).unwrap();
        assert!((p.x - 0.5).abs() < 1e-5);
        let p = loco.step(p, dt).unwrap();
        assert_eq!(p, Vector3::new(1.0, 0.0, 0.0));
        assert!(!loco.is_moving());
        assert_eq!(loco.step(p, dt), None);
    }

    #[test]
    fn test_heading_moves_until_stopped() {
        let mut loco = Locomotor::new(4.0);
        loco.set_heading(Vector3::new(0.0, 2.0, 0.0));
        let p = loco.step(Vector3::ZERO, Duration::from_millis(500)).unwrap();
        assert!((p.y - 2.0).abs() < 1e-5);
        loco.stop();
        assert_eq!(loco.step(p, Duration::from_millis(500)), None);
    }

    #[test]
    fn test_minimal_update_omits_optional_fields() {
        let update = LocomotionStateUpdate {
            entity_id: EntityId(5),
            position: Vector3::new(10.0, 20.0, 0.0),
            orientation: Orientation::from_yaw(1.5),
            ..Default::default()
        };
        assert_eq!(update.flags(), 0);
        let (decoded, minimal_len) = round_trip(&update);
        assert_eq!(decoded, update);

        let full = LocomotionStateUpdate {
            prototype_id: PrototypeId(2),
            orientation: Orientation::new(1.5, 0.5, 0.25),
            move_speed: 8.0,
            destination: Some(Vector3::new(40.0, 20.0, 0.0)),
            moving: true,
            ..update.clone()
        };
        let (decoded, full_len) = round_trip(&full);
        assert_eq!(decoded, full);
        assert!(full_len > minimal_len);
    }

    #[test]
    fn test_unknown_flag_bits_rejected() {
        let mut archive = Archive::new_replication(AoiChannels::PROXIMITY);
        let mut id = EntityId(1);
        archive.transfer(&mut id).unwrap();
        let mut flags = 1u32 << 15;
        archive.transfer(&mut flags).unwrap();
        let bytes = archive.into_bytes().unwrap();

        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = LocomotionStateUpdate::default();
        assert!(matches!(archive.transfer(&mut decoded), Err(ArchiveError::UnexpectedFlags { .. })));
    }

    #[test]
    fn test_locomotor_migration_state() {
        let mut loco = Locomotor::new(6.0);
        loco.move_to(Vector3::new(3.0, 4.0, 0.0));
        let mut archive = Archive::new_migration();
        archive.transfer(&mut loco.clone()).unwrap();
        let bytes = archive.into_bytes().unwrap();

        let mut archive = Archive::unpack(bytes).unwrap();
        let mut decoded = Locomotor::default();
        archive.transfer(&mut decoded).unwrap();
        assert_eq!(decoded, loco);
    }
}
