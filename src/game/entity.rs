//! Entities
//!
//! A simulated object: identity, prototype, property bag, and a set of
//! optional capabilities chosen by its kind.
//!
//! ```text
//! ┌──────────┬───────────┬───────────┬───────────┐
//! │ Kind     │ Placeable │ Locomotes │ Inventory │
//! ├──────────┼───────────┼───────────┼───────────┤
//! │ Player   │           │           │     x     │
//! │ Avatar   │     x     │     x     │     x     │
//! │ Agent    │     x     │     x     │           │
//! │ Item     │     x     │           │           │
//! │ Prop     │     x     │           │           │
//! │ Generic  │     x     │           │           │
//! └──────────┴───────────┴───────────┴───────────┘
//! ```
//!
//! An entity is either placed in the world or held in a container,
//! never both.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::archive::{Archive, ArchiveError, Transfer, POSITION_PRECISION};
use crate::core::ids::{CellId, EntityId, PrototypeId, RegionId};
use crate::core::vec3::{Orientation, Vector3};
use crate::game::locomotion::{LocomotionStateUpdate, Locomotor};
use crate::game::properties::{PropertyCollection, PropertyId, PropertyValue};
use crate::game::prototype::PrototypeTable;

/// Closed set of entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    /// Account-bound player entity.
    Player = 0,
    /// Controllable character.
    Avatar = 1,
    /// Non-player character.
    Agent = 2,
    /// Inventory item.
    Item = 3,
    /// Static world object.
    Prop = 4,
    /// Anything else.
    Generic = 5,
}

impl EntityKind {
    /// Decode a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Player),
            1 => Some(Self::Avatar),
            2 => Some(Self::Agent),
            3 => Some(Self::Item),
            4 => Some(Self::Prop),
            5 => Some(Self::Generic),
            _ => None,
        }
    }

    /// Can enter the world.
    pub fn is_placeable(self) -> bool {
        !matches!(self, Self::Player)
    }

    /// Has a locomotor.
    pub fn locomotes(self) -> bool {
        matches!(self, Self::Avatar | Self::Agent)
    }

    /// Can hold other entities.
    pub fn holds_inventory(self) -> bool {
        matches!(self, Self::Player | Self::Avatar)
    }
}

/// Placement in the world.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionLocation {
    /// Region.
    pub region: RegionId,
    /// Cell within the region.
    pub cell: CellId,
    /// Position.
    pub position: Vector3,
    /// Orientation.
    pub orientation: Orientation,
}

impl Transfer for RegionLocation {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer(&mut self.region)?;
        archive.transfer(&mut self.cell)?;
        archive.transfer_vector3(&mut self.position, POSITION_PRECISION)?;
        archive.transfer_orientation(&mut self.orientation, true)
    }
}

/// Slot in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventoryLocation {
    /// Containing entity.
    pub container: EntityId,
    /// Slot index.
    pub slot: u32,
}

impl Transfer for InventoryLocation {
    fn transfer(&mut self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.transfer(&mut self.container)?;
        archive.transfer(&mut self.slot)
    }
}

/// Slot to entity map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    slots: BTreeMap<u32, EntityId>,
}

impl Inventory {
    /// Entity in a slot.
    pub fn get(&self, slot: u32) -> Option<EntityId> {
        self.slots.get(&slot).copied()
    }

    /// True if the slot is occupied.
    pub fn is_occupied(&self, slot: u32) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Lowest free slot.
    pub fn first_free_slot(&self) -> u32 {
        (0..).find(|slot| !self.slots.contains_key(slot)).unwrap_or(u32::MAX)
    }

    /// Contained entities in slot order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.slots.values().copied()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn insert(&mut self, slot: u32, id: EntityId) {
        self.slots.insert(slot, id);
    }

    pub(crate) fn remove(&mut self, slot: u32) -> Option<EntityId> {
        self.slots.remove(&slot)
    }
}

/// A simulated object.
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) id: EntityId,
    pub(crate) prototype: PrototypeId,
    pub(crate) kind: EntityKind,
    pub(crate) properties: PropertyCollection,
    pub(crate) owner: EntityId,
    pub(crate) location: Option<RegionLocation>,
    pub(crate) container: Option<InventoryLocation>,
    pub(crate) locomotor: Option<Locomotor>,
    pub(crate) inventory: Option<Inventory>,
    pub(crate) hidden: bool,
}

impl Entity {
    /// Bare entity of a kind. Capabilities are attached by the factory.
    pub fn new(id: EntityId, prototype: PrototypeId, kind: EntityKind) -> Self {
        Self {
            id,
            prototype,
            kind,
            properties: PropertyCollection::new(),
            owner: EntityId::INVALID,
            location: None,
            container: None,
            locomotor: None,
            inventory: None,
            hidden: false,
        }
    }

    /// Attach a locomotor.
    pub fn with_locomotor(mut self, locomotor: Locomotor) -> Self {
        self.locomotor = Some(locomotor);
        self
    }

    /// Attach an empty inventory.
    pub fn with_inventory(mut self) -> Self {
        self.inventory = Some(Inventory::default());
        self
    }

    /// Entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Prototype id.
    pub fn prototype(&self) -> PrototypeId {
        self.prototype
    }

    /// Kind.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Property bag.
    pub fn properties(&self) -> &PropertyCollection {
        &self.properties
    }

    /// Value of a property.
    pub fn property(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.properties.get(id)
    }

    /// Owning player, or invalid.
    pub fn owner(&self) -> EntityId {
        self.owner
    }

    /// World placement.
    pub fn location(&self) -> Option<&RegionLocation> {
        self.location.as_ref()
    }

    /// True if placed in the world.
    pub fn is_in_world(&self) -> bool {
        self.location.is_some()
    }

    /// Container slot.
    pub fn container(&self) -> Option<InventoryLocation> {
        self.container
    }

    /// Locomotor capability.
    pub fn locomotor(&self) -> Option<&Locomotor> {
        self.locomotor.as_ref()
    }

    /// Inventory capability.
    pub fn inventory(&self) -> Option<&Inventory> {
        self.inventory.as_ref()
    }

    /// Hidden from proximity observers.
    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Movement snapshot of a placed entity.
    pub fn locomotion_state(&self) -> Option<LocomotionStateUpdate> {
        let location = self.location?;
        let locomotor = self.locomotor.unwrap_or_default();
        Some(LocomotionStateUpdate {
            entity_id: self.id,
            prototype_id: self.prototype,
            position: location.position,
            orientation: location.orientation,
            move_speed: locomotor.move_speed(),
            destination: locomotor.destination(),
            moving: locomotor.is_moving(),
        })
    }

    /// Archive this entity.
    ///
    /// Persistent archives skip transient state (placement, locomotion,
    /// visibility). Replication archives filter properties by policy.
    pub fn transfer(&mut self, archive: &mut Archive, table: &PrototypeTable) -> Result<(), ArchiveError> {
        archive.transfer(&mut self.id)?;
        archive.transfer(&mut self.prototype)?;

        let mut kind = self.kind as u8;
        archive.transfer(&mut kind)?;
        self.kind = EntityKind::from_u8(kind)
            .ok_or(ArchiveError::ValueOutOfRange { value: kind as u64, target: "entity kind" })?;

        archive.transfer(&mut self.owner)?;
        self.properties.transfer(archive, table)?;
        archive.transfer_optional(&mut self.container)?;

        if archive.is_transient() {
            archive.transfer_optional(&mut self.location)?;
        }

        if archive.is_migration() {
            archive.transfer(&mut self.hidden)?;
            archive.transfer_optional(&mut self.locomotor)?;
        }

        Ok(())
    }
}
