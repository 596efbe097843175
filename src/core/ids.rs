//! Identifiers
//!
//! Strongly typed ids for everything the simulation hands around.
//! All ids implement Ord so they can key BTreeMaps (sorted iteration).

use std::fmt;
use serde::{Serialize, Deserialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl $name {
            /// Invalid / unset id.
            pub const INVALID: Self = Self(0);

            /// Get the raw value.
            #[inline]
            pub const fn raw(self) -> $inner {
                self.0
            }

            /// Check if the id is set.
            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(0x{:X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:X}", self.0)
            }
        }
    };
}

define_id!(
    /// Server-unique entity identifier.
    EntityId(u64)
);

define_id!(
    /// Opaque static type key resolved through the prototype table.
    PrototypeId(u64)
);

define_id!(
    /// Region identifier, unique within a game instance.
    RegionId(u64)
);

define_id!(
    /// Cell identifier, unique within its region.
    CellId(u32)
);

define_id!(
    /// Remote session (connection) identifier, assigned by the transport.
    SessionId(u64)
);

define_id!(
    /// Game instance identifier.
    GameId(u64)
);

define_id!(
    /// Persistent account identifier.
    AccountId(u64)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_ids() {
        assert!(!EntityId::INVALID.is_valid());
        assert!(EntityId(5).is_valid());
        assert_eq!(CellId(7).raw(), 7);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", RegionId(0xAB)), "RegionId(0xAB)");
        assert_eq!(format!("{}", EntityId(255)), "0xFF");
    }
}
