//! Area of Interest
//!
//! Per-session visibility. For every entity the session may know about,
//! the AOI holds the set of channels it is currently visible through:
//!
//! ```text
//!   OWNER      owned by the session's player (directly or via containers)
//!   PARTY      owned by a party member, not inside a container
//!   PROXIMITY  placed in the session's region, within radius, not hidden
//! ```
//!
//! Transitions drive replication traffic:
//!
//! ```text
//!   none ──► some      EntityCreate (archive under the new channels)
//!   some ──► none      EntityDestroy
//!   some ──► other     InterestChannelsChanged (re-encoded archive)
//! ```
//!
//! The AOI also tracks which cells around the reference position the
//! client must load. A pending relocation finishes only once every
//! tracked cell is acknowledged.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace, warn};

use crate::archive::{AoiChannels, ArchiveError};
use crate::core::ids::{CellId, EntityId, RegionId, SessionId};
use crate::core::vec3::Vector3;
use crate::game::entity::Entity;
use crate::game::entity_manager::EntityManager;
use crate::game::prototype::PrototypeTable;
use crate::game::region::RegionManager;
use crate::network::protocol::GameMessage;

/// Result of re-evaluating one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestTransition {
    /// Nothing changed.
    Unchanged,
    /// Entity became visible.
    Gained(AoiChannels),
    /// Entity is no longer visible.
    Lost,
    /// Still visible, through a different set of channels.
    Changed {
        /// Channels before.
        from: AoiChannels,
        /// Channels after.
        to: AoiChannels,
    },
}

/// Visibility state of one session.
#[derive(Debug)]
pub struct AreaOfInterest {
    session: SessionId,
    player: EntityId,
    region: Option<RegionId>,
    reference_position: Option<Vector3>,
    proximity_radius: f32,
    tracked_cells: BTreeMap<CellId, bool>,
    interests: BTreeMap<EntityId, AoiChannels>,
    party_members: BTreeSet<EntityId>,
    messages: Vec<GameMessage>,
}

impl AreaOfInterest {
    /// Empty AOI for a session.
    pub fn new(session: SessionId, proximity_radius: f32) -> Self {
        Self {
            session,
            player: EntityId::INVALID,
            region: None,
            reference_position: None,
            proximity_radius: proximity_radius.max(0.0),
            tracked_cells: BTreeMap::new(),
            interests: BTreeMap::new(),
            party_members: BTreeSet::new(),
            messages: Vec::new(),
        }
    }

    /// Session this AOI belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Player entity of the session.
    pub fn player(&self) -> EntityId {
        self.player
    }

    /// Bind the session's player entity.
    pub fn set_player(&mut self, player: EntityId) {
        self.player = player;
    }

    /// Region the session is viewing.
    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    /// Current reference position.
    pub fn reference_position(&self) -> Option<Vector3> {
        self.reference_position
    }

    /// Proximity radius.
    pub fn proximity_radius(&self) -> f32 {
        self.proximity_radius
    }

    /// Replace the party member set (player entity ids).
    pub fn set_party_members(&mut self, members: impl IntoIterator<Item = EntityId>) {
        self.party_members = members.into_iter().filter(|m| *m != self.player).collect();
    }

    /// Move the session's view to another region.
    ///
    /// Tracked cells are dropped; the client is told to switch regions and
    /// proximity interest is rebuilt on the next reference position update.
    pub fn set_region(&mut self, region: Option<RegionId>, regions: &RegionManager) {
        if self.region == region {
            return;
        }
        self.region = region;
        self.reference_position = None;
        self.tracked_cells.clear();
        if let Some(r) = region.and_then(|id| regions.get(id)) {
            self.messages.push(GameMessage::RegionChange { region: r.id(), bounds: r.bounds() });
        }
        debug!("AOI {}: region set to {:?}", self.session, region);
    }

    // =========================================================================
    // INTEREST
    // =========================================================================

    /// Move the reference position and re-evaluate proximity.
    ///
    /// Returns the number of entities whose interest changed. An unchanged
    /// position is a no-op.
    pub fn update_reference_position(
        &mut self,
        position: Vector3,
        entities: &EntityManager,
        regions: &RegionManager,
        table: &PrototypeTable,
    ) -> Result<usize, ArchiveError> {
        if self.reference_position == Some(position) {
            return Ok(0);
        }
        self.reference_position = Some(position);

        let Some(region) = self.region.and_then(|id| regions.get(id)) else {
            warn!("update_reference_position(): AOI {} has no valid region", self.session);
            return Ok(0);
        };

        let wanted: BTreeSet<CellId> = region.cells_in_radius(position, self.proximity_radius).into_iter().collect();
        let dropped: Vec<CellId> = self.tracked_cells.keys().filter(|c| !wanted.contains(c)).copied().collect();
        for cell in dropped {
            self.tracked_cells.remove(&cell);
            self.messages.push(GameMessage::CellUnload { region: region.id(), cell });
        }
        for cell in &wanted {
            if !self.tracked_cells.contains_key(cell) {
                self.tracked_cells.insert(*cell, false);
                self.messages.push(GameMessage::CellLoad { region: region.id(), cell: *cell });
            }
        }

        let mut candidates: BTreeSet<EntityId> = self.interests.keys().copied().collect();
        for cell in &wanted {
            if let Some(cell) = region.cell(*cell) {
                candidates.extend(cell.entities().iter().copied());
            }
        }

        let mut changed = 0;
        for id in candidates {
            if self.consider_entity(id, entities, table)? != InterestTransition::Unchanged {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Re-evaluate one entity now.
    pub fn consider_entity(
        &mut self,
        id: EntityId,
        entities: &EntityManager,
        table: &PrototypeTable,
    ) -> Result<InterestTransition, ArchiveError> {
        let new = entities
            .get(id)
            .map(|entity| self.compute_channels(entity, entities))
            .unwrap_or(AoiChannels::NONE);
        let old = self.interest_channels(id);

        if new == old {
            return Ok(InterestTransition::Unchanged);
        }

        if new.is_empty() {
            self.interests.remove(&id);
            self.messages.push(GameMessage::EntityDestroy { entity: id });
            trace!("AOI {}: lost {}", self.session, id);
            return Ok(InterestTransition::Lost);
        }

        let archive = entities.pack_for_replication(id, new, table)?;
        self.interests.insert(id, new);

        if old.is_empty() {
            self.messages.push(GameMessage::EntityCreate { entity: id, archive });
            trace!("AOI {}: gained {} via {:?}", self.session, id, new);
            Ok(InterestTransition::Gained(new))
        } else {
            self.messages.push(GameMessage::InterestChannelsChanged { entity: id, archive });
            Ok(InterestTransition::Changed { from: old, to: new })
        }
    }

    /// Re-evaluate every live entity. Used after attach and party changes.
    pub fn consider_all(&mut self, entities: &EntityManager, table: &PrototypeTable) -> Result<usize, ArchiveError> {
        let mut candidates: BTreeSet<EntityId> = self.interests.keys().copied().collect();
        candidates.extend(entities.iter().map(|e| e.id()));
        let mut changed = 0;
        for id in candidates {
            if self.consider_entity(id, entities, table)? != InterestTransition::Unchanged {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Forget a destroyed entity. Returns true if the session knew it.
    pub fn on_entity_destroyed(&mut self, id: EntityId) -> bool {
        if self.interests.remove(&id).is_some() {
            self.messages.push(GameMessage::EntityDestroy { entity: id });
            true
        } else {
            false
        }
    }

    /// Channels the entity is held through (empty if not interested).
    pub fn interest_channels(&self, id: EntityId) -> AoiChannels {
        self.interests.get(&id).copied().unwrap_or(AoiChannels::NONE)
    }

    /// True if the entity is held through any channel in `filter`.
    pub fn interested_in_entity(&self, id: EntityId, filter: AoiChannels) -> bool {
        self.interest_channels(id).intersects(filter)
    }

    /// Entities of interest in id order.
    pub fn interests(&self) -> impl Iterator<Item = (EntityId, AoiChannels)> + '_ {
        self.interests.iter().map(|(id, channels)| (*id, *channels))
    }

    /// Number of entities of interest.
    pub fn interest_count(&self) -> usize {
        self.interests.len()
    }

    fn compute_channels(&self, entity: &Entity, entities: &EntityManager) -> AoiChannels {
        let mut channels = AoiChannels::NONE;
        let owner = entities.owning_player(entity.id());

        if self.player.is_valid() && owner == self.player {
            channels |= AoiChannels::OWNER;
        }
        if owner.is_valid() && self.party_members.contains(&owner) && entity.container().is_none() {
            channels |= AoiChannels::PARTY;
        }
        if let (Some(region), Some(reference), Some(location)) = (self.region, self.reference_position, entity.location()) {
            let radius_sq = self.proximity_radius * self.proximity_radius;
            if location.region == region
                && !entity.is_hidden()
                && location.position.distance_squared_2d(reference) <= radius_sq
            {
                channels |= AoiChannels::PROXIMITY;
            }
        }
        channels
    }

    // =========================================================================
    // CELL LOADING
    // =========================================================================

    /// Client acknowledged loading a cell. Returns true once all tracked cells are loaded.
    pub fn on_cell_acknowledged(&mut self, cell: CellId) -> bool {
        match self.tracked_cells.get_mut(&cell) {
            Some(loaded) => *loaded = true,
            None => warn!("on_cell_acknowledged(): AOI {} does not track cell {}", self.session, cell),
        }
        self.is_load_complete()
    }

    /// Cells the client was told to load.
    pub fn tracked_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.tracked_cells.keys().copied()
    }

    /// Number of cells the client was told to load.
    pub fn tracked_cell_count(&self) -> usize {
        self.tracked_cells.len()
    }

    /// Number of tracked cells acknowledged as loaded.
    pub fn loaded_cell_count(&self) -> usize {
        self.tracked_cells.values().filter(|loaded| **loaded).count()
    }

    /// All tracked cells are loaded.
    pub fn is_load_complete(&self) -> bool {
        self.loaded_cell_count() == self.tracked_cell_count()
    }

    // =========================================================================
    // OUTBOX
    // =========================================================================

    /// Queue a message for the session.
    pub fn queue_message(&mut self, message: GameMessage) {
        self.messages.push(message);
    }

    /// Drain queued messages.
    pub fn take_messages(&mut self) -> Vec<GameMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Number of queued messages.
    pub fn pending_message_count(&self) -> usize {
        self.messages.len()
    }
}
