//! AOI Channel Policy
//!
//! Bitmask of visibility channels. Every replicated field declares the
//! channels that may observe it; every (entity, session) pair carries
//! the channels it currently holds. A field crosses the wire when the
//! two masks intersect.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use serde::{Serialize, Deserialize};

/// Visibility channel bitmask.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct AoiChannels(pub u32);

impl AoiChannels {
    /// No channels.
    pub const NONE: Self = Self(0);

    /// Entity is spatially near the session's reference position.
    pub const PROXIMITY: Self = Self(1 << 0);

    /// Entity belongs to a member of the session's party.
    pub const PARTY: Self = Self(1 << 1);

    /// Entity is owned by the session's player.
    pub const OWNER: Self = Self(1 << 2);

    /// Every defined channel.
    pub const ALL: Self = Self(Self::PROXIMITY.0 | Self::PARTY.0 | Self::OWNER.0);

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping undefined ones.
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// True if no channel is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every channel in `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if at least one channel is shared.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Set or clear channels.
    #[inline]
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for AoiChannels {
    type Output = Self;
    #[inline]
    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOrAssign for AoiChannels {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitAnd for AoiChannels {
    type Output = Self;
    #[inline]
    fn bitand(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl Not for AoiChannels {
    type Output = Self;
    #[inline]
    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for AoiChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = [
            (Self::PROXIMITY, "PROXIMITY"),
            (Self::PARTY, "PARTY"),
            (Self::OWNER, "OWNER"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
