//! Protocol Messages
//!
//! Envelopes exchanged with the transport. Entity state inside an envelope
//! is an opaque archive produced by the replication codec; the envelopes
//! themselves are bincode.

use serde::{Serialize, Deserialize};

use crate::core::ids::{CellId, EntityId, RegionId};
use crate::core::vec3::{Orientation, Vector3};
use crate::game::region::Bounds;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Client finished loading a cell.
    CellLoaded {
        /// Loaded cell.
        cell: CellId,
    },

    /// Move the client's avatar toward a point.
    MoveAvatar {
        /// Destination.
        destination: Vector3,
    },

    /// Relocate the client's avatar, possibly into another region.
    RequestTeleport {
        /// Target region.
        region: RegionId,
        /// Target position.
        position: Vector3,
    },
}

impl ClientMessage {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameMessage {
    /// Client's view moved to another region; drop everything from the old one.
    RegionChange {
        /// New region.
        region: RegionId,
        /// Region bounds.
        bounds: Bounds,
    },

    /// Start loading a cell.
    CellLoad {
        /// Region of the cell.
        region: RegionId,
        /// Cell.
        cell: CellId,
    },

    /// Cell left the client's view.
    CellUnload {
        /// Region of the cell.
        region: RegionId,
        /// Cell.
        cell: CellId,
    },

    /// Entity entered the client's interest. Archive policy = held channels.
    EntityCreate {
        /// Entity.
        entity: EntityId,
        /// Replication archive of the entity.
        archive: Vec<u8>,
    },

    /// Entity left the client's interest.
    EntityDestroy {
        /// Entity.
        entity: EntityId,
    },

    /// Held channels changed; archive is re-encoded under the new policy.
    InterestChannelsChanged {
        /// Entity.
        entity: EntityId,
        /// Replication archive of the entity.
        archive: Vec<u8>,
    },

    /// One property changed.
    PropertyUpdate {
        /// Entity.
        entity: EntityId,
        /// Replication archive holding the property.
        archive: Vec<u8>,
    },

    /// Movement snapshot.
    LocomotionStateUpdate {
        /// Replication archive holding the update.
        archive: Vec<u8>,
    },

    /// Pending relocation finished; all tracked cells are loaded.
    TeleportFinished {
        /// Avatar.
        entity: EntityId,
        /// Final position.
        position: Vector3,
        /// Final orientation.
        orientation: Orientation,
    },

    /// Server is closing the session.
    Disconnect {
        /// Human readable reason.
        reason: String,
    },
}

impl GameMessage {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegionChange { .. } => "RegionChange",
            Self::CellLoad { .. } => "CellLoad",
            Self::CellUnload { .. } => "CellUnload",
            Self::EntityCreate { .. } => "EntityCreate",
            Self::EntityDestroy { .. } => "EntityDestroy",
            Self::InterestChannelsChanged { .. } => "InterestChannelsChanged",
            Self::PropertyUpdate { .. } => "PropertyUpdate",
            Self::LocomotionStateUpdate { .. } => "LocomotionStateUpdate",
            Self::TeleportFinished { .. } => "TeleportFinished",
            Self::Disconnect { .. } => "Disconnect",
        }
    }
}
