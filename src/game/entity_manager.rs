//! Entity Manager
//!
//! Owns every live entity of a game instance.
//!
//! ```text
//!   create_entity ──► pending_create ─┐
//!                                     ├─► process_deferred_lists() ──► live set
//!   destroy_entity ─► pending_destroy ┘       (once per fixed update,
//!                                              after locomotion)
//! ```
//!
//! Creation and destruction never touch the live set directly, so code
//! iterating entities during an update cannot observe a half-applied
//! change. Everything the replication layer needs to know about an update
//! (created, destroyed, moved, dirty properties) is collected here and
//! drained by the game after each fixed update.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, warn};

use crate::archive::{Archive, ArchiveError, ArchivePurpose, AoiChannels};
use crate::core::ids::{EntityId, PrototypeId, RegionId};
use crate::core::vec3::{Orientation, Vector3};
use crate::game::entity::{Entity, EntityKind, InventoryLocation, RegionLocation};
use crate::game::factory::EntityFactory;
use crate::game::properties::{PropertyId, PropertyValue};
use crate::game::prototype::PrototypeTable;
use crate::game::region::RegionManager;

/// Container chains deeper than this are treated as corrupt.
const MAX_CONTAINER_DEPTH: usize = 16;

/// Where a new entity goes once it is created.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Placement {
    /// Nowhere (players, stored items waiting for a container).
    #[default]
    None,
    /// Placed in a region.
    World {
        /// Region.
        region: RegionId,
        /// Position, clamped to the region bounds.
        position: Vector3,
        /// Orientation.
        orientation: Orientation,
    },
    /// Held in a container.
    Inventory {
        /// Container.
        container: EntityId,
        /// Slot, or the first free one.
        slot: Option<u32>,
    },
}

/// Parameters for a new entity.
#[derive(Debug, Clone, Default)]
pub struct EntitySettings {
    /// Prototype to construct.
    pub prototype: PrototypeId,
    /// Owning player.
    pub owner: EntityId,
    /// Initial placement.
    pub placement: Placement,
    /// Property overrides applied after prototype defaults.
    pub properties: Vec<(PropertyId, PropertyValue)>,
    /// Start hidden from proximity observers.
    pub hidden: bool,
}

/// Changes applied by one [`EntityManager::process_deferred_lists`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeferredReport {
    /// Entities that entered the live set.
    pub created: Vec<EntityId>,
    /// Entities that left it, including cascaded container contents.
    pub destroyed: Vec<EntityId>,
}

/// Live entity set plus deferred mutation lists.
#[derive(Debug)]
pub struct EntityManager {
    factory: EntityFactory,
    entities: BTreeMap<EntityId, Entity>,
    next_id: u64,
    pending_create: Vec<(Entity, Placement)>,
    pending_destroy: Vec<EntityId>,
    created: Vec<EntityId>,
    destroyed: Vec<EntityId>,
    dirty: BTreeSet<(EntityId, PropertyId)>,
    moved: BTreeSet<EntityId>,
    reconsider: BTreeSet<EntityId>,
}

impl EntityManager {
    /// Empty manager using `factory` for construction.
    pub fn new(factory: EntityFactory) -> Self {
        Self {
            factory,
            entities: BTreeMap::new(),
            next_id: 1,
            pending_create: Vec::new(),
            pending_destroy: Vec::new(),
            created: Vec::new(),
            destroyed: Vec::new(),
            dirty: BTreeSet::new(),
            moved: BTreeSet::new(),
            reconsider: BTreeSet::new(),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Live entity.
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// True if the entity is live.
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Live entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True if no entity is live.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of queued creations.
    pub fn pending_create_count(&self) -> usize {
        self.pending_create.len()
    }

    /// Player that owns an entity: the root of its container chain if that
    /// is a player, otherwise the root's owner.
    pub fn owning_player(&self, id: EntityId) -> EntityId {
        let Some(root) = self.container_root(id) else { return EntityId::INVALID };
        if root.kind == EntityKind::Player {
            root.id
        } else {
            root.owner
        }
    }

    fn container_root(&self, id: EntityId) -> Option<&Entity> {
        let mut current = self.entities.get(&id)?;
        for _ in 0..MAX_CONTAINER_DEPTH {
            match current.container {
                Some(location) => match self.entities.get(&location.container) {
                    Some(parent) => current = parent,
                    None => return Some(current),
                },
                None => return Some(current),
            }
        }
        warn!("container_root(): container chain of {} is too deep", id);
        None
    }

    // =========================================================================
    // CREATION / DESTRUCTION
    // =========================================================================

    /// Queue a new entity. It becomes live at the next deferred flush.
    pub fn create_entity(&mut self, settings: EntitySettings, table: &PrototypeTable) -> Option<EntityId> {
        let id = self.allocate_id();
        let mut entity = self.factory.construct(id, settings.prototype, table)?;

        for (property, value) in settings.properties {
            match table.property(property) {
                Some(info) if info.value_type == value.value_type() => {
                    entity.properties.set(property, value);
                }
                _ => warn!("create_entity(): ignoring invalid override for property {:?}", property),
            }
        }
        entity.owner = settings.owner;
        entity.hidden = settings.hidden;

        self.pending_create.push((entity, settings.placement));
        Some(id)
    }

    /// Queue an already-built entity, keeping its id when it is free.
    pub fn queue_entity(&mut self, mut entity: Entity, placement: Placement) -> EntityId {
        let id = entity.id;
        let taken = !id.is_valid()
            || self.entities.contains_key(&id)
            || self.pending_create.iter().any(|(e, _)| e.id == id);
        if taken {
            let fresh = self.allocate_id();
            if id.is_valid() {
                debug!("queue_entity(): id {} in use, assigned {}", id, fresh);
            }
            entity.id = fresh;
        } else {
            self.next_id = self.next_id.max(id.0 + 1);
        }

        let id = entity.id;
        entity.location = None;
        entity.container = None;
        if let Some(inventory) = entity.inventory.as_mut() {
            *inventory = Default::default();
        }
        self.pending_create.push((entity, placement));
        id
    }

    /// Queue an entity for destruction. Returns false for an unknown id.
    pub fn destroy_entity(&mut self, id: EntityId) -> bool {
        let known = self.entities.contains_key(&id) || self.pending_create.iter().any(|(e, _)| e.id == id);
        if !known {
            return false;
        }
        if !self.pending_destroy.contains(&id) {
            self.pending_destroy.push(id);
        }
        true
    }

    /// Apply queued creations, then queued destructions.
    pub fn process_deferred_lists(&mut self, regions: &mut RegionManager) -> DeferredReport {
        let mut report = DeferredReport::default();

        for (entity, placement) in std::mem::take(&mut self.pending_create) {
            let id = entity.id;
            self.entities.insert(id, entity);
            match placement {
                Placement::None => {}
                Placement::World { region, position, orientation } => {
                    if !self.enter_world(id, region, position, orientation, regions) {
                        warn!("process_deferred_lists(): {} could not enter region {}", id, region);
                    }
                }
                Placement::Inventory { container, slot } => {
                    if !self.add_to_inventory(id, container, slot, regions) {
                        warn!("process_deferred_lists(): {} could not enter container {}", id, container);
                    }
                }
            }
            report.created.push(id);
        }

        for id in std::mem::take(&mut self.pending_destroy) {
            self.destroy_now(id, regions, &mut report.destroyed, 0);
        }

        self.created.extend_from_slice(&report.created);
        self.destroyed.extend_from_slice(&report.destroyed);
        report
    }

    fn destroy_now(&mut self, id: EntityId, regions: &mut RegionManager, destroyed: &mut Vec<EntityId>, depth: usize) {
        if depth > MAX_CONTAINER_DEPTH {
            warn!("destroy_now(): container chain of {} is too deep", id);
            return;
        }
        let contents: Vec<EntityId> = match self.entities.get(&id) {
            Some(entity) => entity.inventory.iter().flat_map(|inv| inv.entities()).collect(),
            None => return,
        };
        for child in contents {
            self.destroy_now(child, regions, destroyed, depth + 1);
        }

        self.exit_world(id, regions);
        self.remove_from_inventory(id);
        self.entities.remove(&id);
        self.dirty.retain(|(entity, _)| *entity != id);
        self.moved.remove(&id);
        self.reconsider.remove(&id);
        destroyed.push(id);
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    // =========================================================================
    // PLACEMENT
    // =========================================================================

    /// Place an entity in a region. Fails if it is already placed, held
    /// in a container, not placeable, or the region is missing.
    pub fn enter_world(
        &mut self,
        id: EntityId,
        region_id: RegionId,
        position: Vector3,
        orientation: Orientation,
        regions: &mut RegionManager,
    ) -> bool {
        if !position.is_finite() {
            warn!("enter_world(): non-finite position for {}", id);
            return false;
        }
        let Some(entity) = self.entities.get_mut(&id) else {
            warn!("enter_world(): unknown entity {}", id);
            return false;
        };
        if !entity.kind.is_placeable() || entity.location.is_some() || entity.container.is_some() {
            warn!("enter_world(): {} cannot be placed", id);
            return false;
        }
        let Some(region) = regions.get_mut(region_id) else {
            warn!("enter_world(): unknown region {}", region_id);
            return false;
        };

        let position = region.bounds().clamp(position);
        let Some(cell) = region.cell_at(position) else { return false };
        if let Some(cell) = region.cell_mut(cell) {
            cell.insert_entity(id);
        }
        entity.location = Some(RegionLocation { region: region_id, cell, position, orientation });
        self.moved.insert(id);
        self.reconsider.insert(id);
        true
    }

    /// Remove an entity from the world. Returns false if it was not placed.
    pub fn exit_world(&mut self, id: EntityId, regions: &mut RegionManager) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else { return false };
        let Some(location) = entity.location.take() else { return false };
        if let Some(locomotor) = entity.locomotor.as_mut() {
            locomotor.stop();
        }
        if let Some(cell) = regions.get_mut(location.region).and_then(|r| r.cell_mut(location.cell)) {
            cell.remove_entity(id);
        }
        self.moved.remove(&id);
        self.reconsider.insert(id);
        true
    }

    /// Take every entity placed in a region out of the world.
    pub fn exit_world_all_in_region(&mut self, region: RegionId, regions: &mut RegionManager) -> usize {
        let placed: Vec<EntityId> = match regions.get(region) {
            Some(r) => r.entities().collect(),
            None => return 0,
        };
        placed.into_iter().filter(|id| self.exit_world(*id, regions)).count()
    }

    /// Move a placed entity within its region.
    pub fn move_to(
        &mut self,
        id: EntityId,
        position: Vector3,
        orientation: Orientation,
        regions: &mut RegionManager,
    ) -> bool {
        let Some(location) = self.entities.get(&id).and_then(|e| e.location) else {
            warn!("move_to(): {} is not in the world", id);
            return false;
        };
        self.relocate(id, location, position, orientation, regions)
    }

    fn relocate(
        &mut self,
        id: EntityId,
        mut location: RegionLocation,
        position: Vector3,
        orientation: Orientation,
        regions: &mut RegionManager,
    ) -> bool {
        if !position.is_finite() {
            warn!("relocate(): non-finite position for {}", id);
            return false;
        }
        let Some(region) = regions.get_mut(location.region) else { return false };
        let position = region.bounds().clamp(position);
        let Some(cell) = region.cell_at(position) else { return false };

        if cell != location.cell {
            if let Some(old) = region.cell_mut(location.cell) {
                old.remove_entity(id);
            }
            if let Some(new) = region.cell_mut(cell) {
                new.insert_entity(id);
            }
        }

        location.cell = cell;
        location.position = position;
        location.orientation = orientation;
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.location = Some(location);
        }
        self.moved.insert(id);
        self.reconsider.insert(id);
        true
    }

    // =========================================================================
    // INVENTORY
    // =========================================================================

    /// Put `item` into `container`. The item leaves the world and its previous
    /// container first. Fails if the slot is taken or the container cannot hold items.
    pub fn add_to_inventory(
        &mut self,
        item: EntityId,
        container: EntityId,
        slot: Option<u32>,
        regions: &mut RegionManager,
    ) -> bool {
        if item == container || !self.entities.contains_key(&item) {
            warn!("add_to_inventory(): invalid item {}", item);
            return false;
        }
        if self.is_contained_in(container, item) {
            warn!("add_to_inventory(): {} would contain itself", item);
            return false;
        }
        let slot = match self.entities.get(&container).and_then(|c| c.inventory.as_ref()) {
            Some(inventory) => {
                let slot = slot.unwrap_or_else(|| inventory.first_free_slot());
                if inventory.is_occupied(slot) {
                    warn!("add_to_inventory(): slot {} of {} is occupied", slot, container);
                    return false;
                }
                slot
            }
            None => {
                warn!("add_to_inventory(): {} has no inventory", container);
                return false;
            }
        };

        self.exit_world(item, regions);
        self.remove_from_inventory(item);

        if let Some(inventory) = self.entities.get_mut(&container).and_then(|c| c.inventory.as_mut()) {
            inventory.insert(slot, item);
        }
        if let Some(entity) = self.entities.get_mut(&item) {
            entity.container = Some(InventoryLocation { container, slot });
        }
        self.reconsider.insert(item);
        true
    }

    /// Take an item out of its container. Returns false if it was not contained.
    pub fn remove_from_inventory(&mut self, item: EntityId) -> bool {
        let Some(location) = self.entities.get_mut(&item).and_then(|e| e.container.take()) else {
            return false;
        };
        if let Some(inventory) = self.entities.get_mut(&location.container).and_then(|c| c.inventory.as_mut()) {
            inventory.remove(location.slot);
        }
        self.reconsider.insert(item);
        true
    }

    fn is_contained_in(&self, id: EntityId, ancestor: EntityId) -> bool {
        let mut current = id;
        for _ in 0..MAX_CONTAINER_DEPTH {
            match self.entities.get(&current).and_then(|e| e.container) {
                Some(location) if location.container == ancestor => return true,
                Some(location) => current = location.container,
                None => return false,
            }
        }
        true
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Set a property. Live entities record the change for replication.
    pub fn set_property(&mut self, id: EntityId, property: PropertyId, value: PropertyValue, table: &PrototypeTable) -> bool {
        match table.property(property) {
            Some(info) if info.value_type == value.value_type() => {}
            _ => {
                warn!("set_property(): invalid value for property {:?}", property);
                return false;
            }
        }
        let Some(entity) = self.entities.get_mut(&id) else {
            warn!("set_property(): unknown entity {}", id);
            return false;
        };
        if entity.properties.set(property, value) {
            self.dirty.insert((id, property));
        }
        true
    }

    /// Hide or reveal an entity to proximity observers.
    pub fn set_hidden(&mut self, id: EntityId, hidden: bool) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else { return false };
        if entity.hidden != hidden {
            entity.hidden = hidden;
            self.reconsider.insert(id);
        }
        true
    }

    /// Set the owning player.
    pub fn set_owner(&mut self, id: EntityId, owner: EntityId) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else { return false };
        entity.owner = owner;
        self.reconsider.insert(id);
        true
    }

    /// Walk toward a point.
    pub fn set_destination(&mut self, id: EntityId, destination: Vector3) -> bool {
        if !destination.is_finite() {
            warn!("set_destination(): non-finite destination for {}", id);
            return false;
        }
        match self.entities.get_mut(&id).and_then(|e| e.locomotor.as_mut()) {
            Some(locomotor) => {
                locomotor.move_to(destination);
                true
            }
            None => false,
        }
    }

    /// Move along a direction until stopped.
    pub fn set_heading(&mut self, id: EntityId, direction: Vector3) -> bool {
        if !direction.is_finite() {
            warn!("set_heading(): non-finite direction for {}", id);
            return false;
        }
        match self.entities.get_mut(&id).and_then(|e| e.locomotor.as_mut()) {
            Some(locomotor) => {
                locomotor.set_heading(direction);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // SIMULATION
    // =========================================================================

    /// Advance every placed locomotor by one quantum, then resolve physics:
    /// positions are clamped to the region bounds and cells re-derived.
    pub fn locomote(&mut self, dt: Duration, regions: &mut RegionManager) -> usize {
        let mut steps = Vec::new();
        for entity in self.entities.values_mut() {
            let (Some(location), Some(locomotor)) = (entity.location, entity.locomotor.as_mut()) else {
                continue;
            };
            if let Some(target) = locomotor.step(location.position, dt) {
                let heading = target - location.position;
                let orientation = if heading.distance_squared_2d(Vector3::ZERO) > 0.0 {
                    Orientation::facing(heading)
                } else {
                    location.orientation
                };
                steps.push((entity.id, location, target, orientation));
            }
        }

        let count = steps.len();
        for (id, location, target, orientation) in steps {
            let clamped = regions.get(location.region).map(|r| r.bounds().clamp(target)).unwrap_or(target);
            if clamped != target {
                if let Some(locomotor) = self.entities.get_mut(&id).and_then(|e| e.locomotor.as_mut()) {
                    locomotor.stop();
                }
            }
            self.relocate(id, location, clamped, orientation, regions);
        }
        count
    }

    // =========================================================================
    // CHANGE TRACKING
    // =========================================================================

    /// Drain entities created since the last call.
    pub fn take_created(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.created)
    }

    /// Drain entities destroyed since the last call.
    pub fn take_destroyed(&mut self) -> Vec<EntityId> {
        std::mem::take(&mut self.destroyed)
    }

    /// Drain changed (entity, property) pairs.
    pub fn take_dirty(&mut self) -> BTreeSet<(EntityId, PropertyId)> {
        std::mem::take(&mut self.dirty)
    }

    /// Drain entities whose position changed.
    pub fn take_moved(&mut self) -> BTreeSet<EntityId> {
        std::mem::take(&mut self.moved)
    }

    /// Drain entities whose visibility inputs changed.
    pub fn take_reconsider(&mut self) -> BTreeSet<EntityId> {
        std::mem::take(&mut self.reconsider)
    }

    // =========================================================================
    // ARCHIVING
    // =========================================================================

    /// Full-state archive for one session.
    pub fn pack_for_replication(&self, id: EntityId, channels: AoiChannels, table: &PrototypeTable) -> Result<Vec<u8>, ArchiveError> {
        self.pack(id, Archive::new_replication(channels), table)
    }

    /// Durable snapshot.
    pub fn pack_persistent(&self, id: EntityId, table: &PrototypeTable) -> Result<Vec<u8>, ArchiveError> {
        self.pack(id, Archive::new_persistent(), table)
    }

    /// Live hand-off snapshot, including placement and locomotion.
    pub fn pack_for_migration(&self, id: EntityId, table: &PrototypeTable) -> Result<Vec<u8>, ArchiveError> {
        self.pack(id, Archive::new_migration(), table)
    }

    fn pack(&self, id: EntityId, mut archive: Archive, table: &PrototypeTable) -> Result<Vec<u8>, ArchiveError> {
        let mut entity = match self.entities.get(&id) {
            Some(entity) => entity.clone(),
            None => self
                .pending_create
                .iter()
                .find(|(e, _)| e.id == id)
                .map(|(e, _)| e.clone())
                .ok_or(ArchiveError::UnknownEntity(id.0))?,
        };
        entity.transfer(&mut archive, table)?;
        archive.into_bytes()
    }

    /// Rebuild an entity from a persistent archive and queue it.
    pub fn unpack_persistent(&mut self, bytes: Vec<u8>, placement: Placement, table: &PrototypeTable) -> Result<EntityId, ArchiveError> {
        let decoded = decode_entity(bytes, ArchivePurpose::Persistent, table)?;
        let entity = self.rebuild(decoded, table)?;
        Ok(self.queue_entity(entity, placement))
    }

    /// Rebuild a migrated entity and queue it at its carried placement.
    pub fn unpack_from_migration(&mut self, bytes: Vec<u8>, table: &PrototypeTable) -> Result<EntityId, ArchiveError> {
        let decoded = decode_entity(bytes, ArchivePurpose::Migration, table)?;
        let placement = match (decoded.location, decoded.container) {
            (Some(location), _) => Placement::World {
                region: location.region,
                position: location.position,
                orientation: location.orientation,
            },
            (None, Some(container)) => Placement::Inventory {
                container: container.container,
                slot: Some(container.slot),
            },
            (None, None) => Placement::None,
        };
        let entity = self.rebuild(decoded, table)?;
        Ok(self.queue_entity(entity, placement))
    }

    fn rebuild(&self, decoded: Entity, table: &PrototypeTable) -> Result<Entity, ArchiveError> {
        let mut entity = self
            .factory
            .construct(decoded.id, decoded.prototype, table)
            .ok_or(ArchiveError::ValueOutOfRange { value: decoded.prototype.0, target: "prototype" })?;
        entity.properties = decoded.properties;
        entity.owner = decoded.owner;
        entity.hidden = decoded.hidden;
        if decoded.locomotor.is_some() && entity.locomotor.is_some() {
            entity.locomotor = decoded.locomotor;
        }
        Ok(entity)
    }
}

fn decode_entity(bytes: Vec<u8>, purpose: ArchivePurpose, table: &PrototypeTable) -> Result<Entity, ArchiveError> {
    let mut archive = Archive::unpack_expecting(purpose, AoiChannels::ALL, bytes)?;
    let mut entity = Entity::new(EntityId::INVALID, PrototypeId::INVALID, EntityKind::Generic);
    entity.transfer(&mut archive, table)?;
    archive.finish()?;
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::CellId;
    use crate::game::prototype::{props, protos};
    use crate::game::region::Bounds;

    struct Fixture {
        table: PrototypeTable,
        regions: RegionManager,
        entities: EntityManager,
        region: RegionId,
    }

    fn fixture() -> Fixture {
        let mut regions = RegionManager::new();
        let region = regions.create_region(Bounds::new(Vector3::ZERO, Vector3::new(100.0, 100.0, 10.0)), 25.0);
        Fixture {
            table: PrototypeTable::builtin(),
            regions,
            entities: EntityManager::new(EntityFactory::new()),
            region,
        }
    }

    fn placed(region: RegionId, x: f32, y: f32) -> Placement {
        Placement::World { region, position: Vector3::new(x, y, 0.0), orientation: Orientation::ZERO }
    }

    fn spawn(f: &mut Fixture, prototype: PrototypeId, placement: Placement) -> EntityId {
        let id = f
            .entities
            .create_entity(EntitySettings { prototype, placement, ..Default::default() }, &f.table)
            .unwrap();
        f.entities.process_deferred_lists(&mut f.regions);
        id
    }

    #[test]
    fn test_creation_is_deferred() {
        let mut f = fixture();
        let region = f.region;
        let settings = EntitySettings { prototype: protos::AGENT, placement: placed(region, 10.0, 10.0), ..Default::default() };
        let id = f.entities.create_entity(settings, &f.table).unwrap();
        assert!(f.entities.get(id).is_none());
        assert_eq!(f.entities.pending_create_count(), 1);

        let report = f.entities.process_deferred_lists(&mut f.regions);
        assert_eq!(report.created, vec![id]);
        let location = f.entities.get(id).and_then(|e| e.location().copied()).unwrap();
        assert_eq!(location.cell, CellId(1));
        assert!(f.regions.get(f.region).unwrap().cell(CellId(1)).unwrap().entities().contains(&id));
    }

    #[test]
    fn test_destroy_is_deferred_and_cascades() {
        let mut f = fixture();
        let region = f.region;
        let avatar = spawn(&mut f, protos::AVATAR, placed(region, 10.0, 10.0));
        let item = spawn(&mut f, protos::ITEM, Placement::Inventory { container: avatar, slot: None });
        assert_eq!(f.entities.get(item).and_then(|e| e.container()).map(|c| c.container), Some(avatar));

        assert!(f.entities.destroy_entity(avatar));
        assert!(f.entities.destroy_entity(avatar));
        assert!(f.entities.contains(avatar));

        let report = f.entities.process_deferred_lists(&mut f.regions);
        assert_eq!(report.destroyed, vec![item, avatar]);
        assert!(f.entities.is_empty());
        assert_eq!(f.regions.get(f.region).unwrap().entities().count(), 0);
        assert!(!f.entities.destroy_entity(avatar));
    }

    #[test]
    fn test_inventory_ownership_is_exclusive() {
        let mut f = fixture();
        let region = f.region;
        let first = spawn(&mut f, protos::AVATAR, placed(region, 10.0, 10.0));
        let second = spawn(&mut f, protos::AVATAR, placed(region, 20.0, 10.0));
        let item = spawn(&mut f, protos::ITEM, placed(region, 5.0, 5.0));

        assert!(f.entities.add_to_inventory(item, first, Some(3), &mut f.regions));
        assert!(!f.entities.get(item).unwrap().is_in_world());
        assert!(f.entities.add_to_inventory(item, second, None, &mut f.regions));
        assert!(f.entities.get(first).unwrap().inventory().unwrap().is_empty());
        assert_eq!(f.entities.get(second).unwrap().inventory().unwrap().get(0), Some(item));

        assert!(!f.entities.enter_world(item, f.region, Vector3::ZERO, Orientation::ZERO, &mut f.regions));
        assert!(!f.entities.add_to_inventory(second, item, None, &mut f.regions));
    }

    #[test]
    fn test_container_cannot_hold_itself() {
        let mut f = fixture();
        let outer = spawn(&mut f, protos::AVATAR, Placement::None);
        let inner = spawn(&mut f, protos::AVATAR, Placement::Inventory { container: outer, slot: None });
        assert!(!f.entities.add_to_inventory(outer, inner, None, &mut f.regions));
    }

    #[test]
    fn test_owning_player_follows_container_chain() {
        let mut f = fixture();
        let region = f.region;
        let player = spawn(&mut f, protos::PLAYER, Placement::None);
        let settings = EntitySettings {
            prototype: protos::AVATAR,
            owner: player,
            placement: placed(region, 10.0, 10.0),
            ..Default::default()
        };
        let avatar = f.entities.create_entity(settings, &f.table).unwrap();
        f.entities.process_deferred_lists(&mut f.regions);
        let item = spawn(&mut f, protos::ITEM, Placement::Inventory { container: avatar, slot: None });
        let stash = spawn(&mut f, protos::ITEM, Placement::Inventory { container: player, slot: None });

        assert_eq!(f.entities.owning_player(player), player);
        assert_eq!(f.entities.owning_player(avatar), player);
        assert_eq!(f.entities.owning_player(item), player);
        assert_eq!(f.entities.owning_player(stash), player);
    }

    #[test]
    fn test_locomote_clamps_to_bounds() {
        let mut f = fixture();
        let region = f.region;
        let agent = spawn(&mut f, protos::AGENT, placed(region, 95.0, 50.0));
        f.entities.take_moved();
        assert!(f.entities.set_heading(agent, Vector3::new(1.0, 0.0, 0.0)));

        for _ in 0..40 {
            f.entities.locomote(Duration::from_millis(50), &mut f.regions);
        }
        let entity = f.entities.get(agent).unwrap();
        assert_eq!(entity.location().unwrap().position.x, 100.0);
        assert!(!entity.locomotor().unwrap().is_moving());
        assert!(f.entities.take_moved().contains(&agent));
    }

    #[test]
    fn test_locomote_updates_cell() {
        let mut f = fixture();
        let region = f.region;
        let agent = spawn(&mut f, protos::AGENT, placed(region, 20.0, 10.0));
        f.entities.set_destination(agent, Vector3::new(30.0, 10.0, 0.0));
        for _ in 0..60 {
            f.entities.locomote(Duration::from_millis(50), &mut f.regions);
        }
        let location = *f.entities.get(agent).unwrap().location().unwrap();
        assert_eq!(location.position, Vector3::new(30.0, 10.0, 0.0));
        assert_eq!(location.cell, CellId(2));
        let region = f.regions.get(f.region).unwrap();
        assert!(!region.cell(CellId(1)).unwrap().entities().contains(&agent));
        assert!(region.cell(CellId(2)).unwrap().entities().contains(&agent));
    }

    #[test]
    fn test_non_finite_vectors_rejected() {
        let mut f = fixture();
        let region = f.region;
        let agent = spawn(&mut f, protos::AGENT, placed(region, 50.0, 50.0));
        let nan = Vector3::new(f32::NAN, 0.0, 0.0);

        assert!(!f.entities.set_destination(agent, nan));
        assert!(!f.entities.set_heading(agent, Vector3::new(0.0, f32::INFINITY, 0.0)));
        assert!(!f.entities.move_to(agent, nan, Orientation::ZERO, &mut f.regions));
        for _ in 0..5 {
            f.entities.locomote(Duration::from_millis(50), &mut f.regions);
        }
        assert_eq!(f.entities.get(agent).unwrap().location().unwrap().position, Vector3::new(50.0, 50.0, 0.0));

        assert!(f.entities.exit_world(agent, &mut f.regions));
        assert!(!f.entities.enter_world(agent, region, nan, Orientation::ZERO, &mut f.regions));
        assert!(!f.entities.get(agent).unwrap().is_in_world());
    }

    #[test]
    fn test_set_property_tracks_dirty() {
        let mut f = fixture();
        let agent = spawn(&mut f, protos::AGENT, Placement::None);
        assert!(f.entities.set_property(agent, props::HEALTH, PropertyValue::Int(50), &f.table));
        assert!(f.entities.set_property(agent, props::HEALTH, PropertyValue::Int(50), &f.table));
        assert!(!f.entities.set_property(agent, props::HEALTH, PropertyValue::Bool(true), &f.table));
        assert_eq!(f.entities.take_dirty().into_iter().collect::<Vec<_>>(), vec![(agent, props::HEALTH)]);
        assert!(f.entities.take_dirty().is_empty());
    }

    #[test]
    fn test_migration_round_trip() {
        let mut source = fixture();
        let region = source.region;
        let avatar = spawn(&mut source, protos::AVATAR, placed(region, 40.0, 60.0));
        source.entities.set_property(avatar, props::EXPERIENCE, PropertyValue::Int(77), &source.table);
        source.entities.set_destination(avatar, Vector3::new(45.0, 60.0, 0.0));
        let bytes = source.entities.pack_for_migration(avatar, &source.table).unwrap();

        let mut target = fixture();
        spawn(&mut target, protos::PROP, Placement::None);
        let arrived = target.entities.unpack_from_migration(bytes, &target.table).unwrap();
        target.entities.process_deferred_lists(&mut target.regions);

        let entity = target.entities.get(arrived).unwrap();
        assert_eq!(entity.kind(), EntityKind::Avatar);
        assert_eq!(entity.property(props::EXPERIENCE), Some(&PropertyValue::Int(77)));
        assert_eq!(entity.location().unwrap().position, Vector3::new(40.0, 60.0, 0.0));
        assert_eq!(entity.locomotor().unwrap().destination(), Some(Vector3::new(45.0, 60.0, 0.0)));
    }

    #[test]
    fn test_persistent_restore_needs_placement() {
        let mut f = fixture();
        let region = f.region;
        let avatar = spawn(&mut f, protos::AVATAR, placed(region, 40.0, 60.0));
        let bytes = f.entities.pack_persistent(avatar, &f.table).unwrap();

        let mut other = fixture();
        let restored = other.entities.unpack_persistent(bytes, Placement::None, &other.table).unwrap();
        other.entities.process_deferred_lists(&mut other.regions);
        let entity = other.entities.get(restored).unwrap();
        assert!(!entity.is_in_world());
        assert!(entity.locomotor().is_some());
    }

    #[test]
    fn test_exit_world_all_in_region() {
        let mut f = fixture();
        let region = f.region;
        spawn(&mut f, protos::AGENT, placed(region, 10.0, 10.0));
        spawn(&mut f, protos::PROP, placed(region, 80.0, 80.0));
        assert_eq!(f.entities.exit_world_all_in_region(f.region, &mut f.regions), 2);
        assert!(f.regions.destroy_region(f.region));
    }
}
