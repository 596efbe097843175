//! 3D Vector and Orientation
//!
//! World-space position and rotation types used by placement,
//! locomotion and the replication codec.

use std::fmt;
use std::ops::{Add, Sub, Mul, Neg};
use serde::{Serialize, Deserialize};

/// 3D vector (world units).
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component (height)
    pub z: f32,
}

impl Vector3 {
    /// Zero vector
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    /// Create a new vector.
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared length.
    #[inline]
    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Length (magnitude).
    #[inline]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Squared distance to another point, ignoring height.
    ///
    /// Interest and cell math is done on the ground plane.
    #[inline]
    pub fn distance_squared_2d(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Unit vector in the same direction, or zero.
    pub fn normalize_or_zero(self) -> Self {
        let len = self.length();
        if len <= f32::EPSILON {
            Self::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    /// Clamp each component into [min, max].
    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self {
            x: self.x.max(min.x).min(max.x),
            y: self.y.max(min.y).min(max.y),
            z: self.z.max(min.z).min(max.z),
        }
    }

    /// Check if all components are finite.
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vector3 {
    type Output = Self;
    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vector3 {
    type Output = Self;
    #[inline]
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f32> for Vector3 {
    type Output = Self;
    #[inline]
    fn mul(self, scalar: f32) -> Self {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Neg for Vector3 {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Debug for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Rotation as yaw / pitch / roll in radians.
///
/// Most entities only ever turn around the vertical axis, which is
/// why the locomotion archive can send yaw alone.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    /// Rotation around the vertical axis
    pub yaw: f32,
    /// Rotation around the lateral axis
    pub pitch: f32,
    /// Rotation around the forward axis
    pub roll: f32,
}

impl Orientation {
    /// No rotation
    pub const ZERO: Self = Self { yaw: 0.0, pitch: 0.0, roll: 0.0 };

    /// Create a new orientation.
    #[inline]
    pub const fn new(yaw: f32, pitch: f32, roll: f32) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Orientation with only a yaw component.
    #[inline]
    pub const fn from_yaw(yaw: f32) -> Self {
        Self { yaw, pitch: 0.0, roll: 0.0 }
    }

    /// True if pitch and roll are both zero.
    #[inline]
    pub fn is_yaw_only(self) -> bool {
        self.pitch == 0.0 && self.roll == 0.0
    }

    /// Yaw that faces along a direction on the ground plane.
    pub fn facing(direction: Vector3) -> Self {
        Self::from_yaw(direction.y.atan2(direction.x))
    }
}

impl fmt::Debug for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3}, {:.3}, {:.3}]", self.yaw, self.pitch, self.roll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_ops() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(0.5, 0.5, 0.5);
        assert_eq!(a + b, Vector3::new(1.5, 2.5, 3.5));
        assert_eq!(a - b, Vector3::new(0.5, 1.5, 2.5));
        assert_eq!(a * 2.0, Vector3::new(2.0, 4.0, 6.0));
        assert_eq!(-a, Vector3::new(-1.0, -2.0, -3.0));
    }

    #[test]
    fn test_distance_ignores_height() {
        let a = Vector3::new(0.0, 0.0, 100.0);
        let b = Vector3::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance_squared_2d(b), 25.0);
    }

    #[test]
    fn test_normalize() {
        let v = Vector3::new(3.0, 0.0, 4.0).normalize_or_zero();
        assert!((v.length() - 1.0).abs() < 1e-6);
        assert_eq!(Vector3::ZERO.normalize_or_zero(), Vector3::ZERO);
    }

    #[test]
    fn test_clamp() {
        let v = Vector3::new(-10.0, 5.0, 50.0);
        let clamped = v.clamp(Vector3::new(0.0, 0.0, 0.0), Vector3::new(8.0, 8.0, 8.0));
        assert_eq!(clamped, Vector3::new(0.0, 5.0, 8.0));
    }

    #[test]
    fn test_yaw_only() {
        assert!(Orientation::from_yaw(1.0).is_yaw_only());
        assert!(!Orientation::new(1.0, 0.5, 0.0).is_yaw_only());
    }
}
