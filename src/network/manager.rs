//! Player Connection Manager
//!
//! Owns every [`PlayerConnection`] of a game instance. Attaching a session
//! loads its account and entities; detaching saves and removes them. Once
//! per fixed update, [`PlayerConnectionManager::replicate`] turns the entity
//! manager's change lists into per-session traffic:
//!
//! ```text
//!   destroyed      ──► AOI forget            ──► EntityDestroy
//!   created/changed──► AOI consider          ──► EntityCreate / channels changed
//!   avatar moved   ──► AOI reference position ──► cells + proximity
//!   moved          ──► interested sessions   ──► LocomotionStateUpdate
//!   dirty property ──► channels ∩ policy     ──► PropertyUpdate
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::archive::{AoiChannels, Archive, ArchiveError};
use crate::core::ids::{EntityId, PrototypeId, RegionId, SessionId};
use crate::core::vec3::{Orientation, Vector3};
use crate::game::entity::EntityKind;
use crate::game::entity_manager::{EntityManager, EntitySettings, Placement};
use crate::game::properties::{property_policy, PropertyCollection, PropertyId, PropertyValue};
use crate::game::prototype::{props, PrototypeTable};
use crate::game::region::RegionManager;
use crate::network::connection::PlayerConnection;
use crate::network::protocol::{ClientMessage, GameMessage};
use crate::persistence::{new_account_id, Account, PlayerStore, StoredEntity};

/// Per-instance connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// AOI proximity radius.
    pub proximity_radius: f32,
    /// Prototype of new player entities.
    pub player_prototype: PrototypeId,
    /// Prototype of new avatars.
    pub avatar_prototype: PrototypeId,
    /// Region avatars enter on attach.
    pub start_region: RegionId,
    /// Where in the start region they appear.
    pub spawn_position: Vector3,
}

/// Connections of one game instance.
pub struct PlayerConnectionManager {
    connections: BTreeMap<SessionId, PlayerConnection>,
    store: Arc<dyn PlayerStore>,
    settings: ConnectionSettings,
}

impl PlayerConnectionManager {
    /// Empty manager.
    pub fn new(store: Arc<dyn PlayerStore>, settings: ConnectionSettings) -> Self {
        Self { connections: BTreeMap::new(), store, settings }
    }

    /// Connection of a session.
    pub fn get(&self, session: SessionId) -> Option<&PlayerConnection> {
        self.connections.get(&session)
    }

    /// Mutable connection of a session.
    pub fn get_mut(&mut self, session: SessionId) -> Option<&mut PlayerConnection> {
        self.connections.get_mut(&session)
    }

    /// Connections in session order.
    pub fn iter(&self) -> impl Iterator<Item = &PlayerConnection> {
        self.connections.values()
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True if nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    // =========================================================================
    // ATTACH / DETACH
    // =========================================================================

    /// Attach a session: load or create its account and queue its entities.
    ///
    /// The AOI is bound on the first fixed update after the avatar is live.
    pub fn attach(
        &mut self,
        session: SessionId,
        account_key: &str,
        egress: mpsc::Sender<Vec<u8>>,
        entities: &mut EntityManager,
        table: &PrototypeTable,
    ) -> bool {
        if self.connections.contains_key(&session) {
            warn!("attach(): session {} is already attached", session);
            return false;
        }
        if self.connections.values().any(|c| c.account().key == account_key) {
            warn!("attach(): account {} is already in use", account_key);
            return false;
        }

        let mut account = match self.store.try_query_account_by_key(account_key) {
            Some(account) => account,
            None => {
                let account = Account::new(new_account_id(), account_key);
                if !self.store.insert_account(&account) {
                    warn!("attach(): failed to create account {}", account_key);
                    return false;
                }
                info!("Created account {} for {}", account.id, account_key);
                account
            }
        };
        if !self.store.load_player_data(&mut account) {
            warn!("attach(): failed to load player data for {}, starting fresh", account.id);
            account.entities.clear();
        }

        let (player, avatar, built) = self.restore_entities(&account, entities, table);
        if !player.is_valid() || !avatar.is_valid() {
            warn!("attach(): could not build entities for {}", account_key);
            for id in built {
                entities.destroy_entity(id);
            }
            return false;
        }

        let mut connection = PlayerConnection::new(session, account, egress, self.settings.proximity_radius);
        connection.bind_entities(player, avatar);
        self.connections.insert(session, connection);
        info!("Session {} attached ({}), player {} avatar {}", session, account_key, player, avatar);
        true
    }

    /// Returns the player, the avatar and every entity queued on the way.
    fn restore_entities(
        &self,
        account: &Account,
        entities: &mut EntityManager,
        table: &PrototypeTable,
    ) -> (EntityId, EntityId, Vec<EntityId>) {
        let start = self.start_placement();
        let mut built = Vec::new();
        let mut restored: BTreeMap<u64, EntityId> = BTreeMap::new();
        let mut player = EntityId::INVALID;
        let mut avatar = EntityId::INVALID;

        for stored in &account.entities {
            let kind = table.prototype(stored.prototype).map(|p| p.kind);
            let placement = match stored.container_guid {
                Some(guid) => match restored.get(&guid) {
                    Some(container) => Placement::Inventory { container: *container, slot: Some(stored.slot) },
                    None => {
                        warn!("restore_entities(): missing container {} for row {}", guid, stored.db_guid);
                        continue;
                    }
                },
                None if kind == Some(EntityKind::Avatar) && !avatar.is_valid() => start,
                None => Placement::None,
            };

            match entities.unpack_persistent(stored.archive.clone(), placement, table) {
                Ok(id) => {
                    built.push(id);
                    restored.insert(stored.db_guid, id);
                    match kind {
                        Some(EntityKind::Player) if !player.is_valid() => player = id,
                        Some(EntityKind::Avatar) if !avatar.is_valid() && stored.container_guid.is_none() => avatar = id,
                        _ => {}
                    }
                }
                Err(e) => warn!(
                    "restore_entities(): row {} failed to decode: {} ({})",
                    stored.db_guid,
                    e,
                    hex::encode(&stored.archive)
                ),
            }
        }

        if !player.is_valid() {
            let settings = EntitySettings {
                prototype: self.settings.player_prototype,
                properties: vec![(props::PLAYER_NAME, PropertyValue::String(account.key.clone()))],
                ..Default::default()
            };
            player = entities.create_entity(settings, table).unwrap_or(EntityId::INVALID);
            built.push(player);
        }
        if !avatar.is_valid() && player.is_valid() {
            let settings = EntitySettings {
                prototype: self.settings.avatar_prototype,
                owner: player,
                placement: start,
                ..Default::default()
            };
            avatar = entities.create_entity(settings, table).unwrap_or(EntityId::INVALID);
            built.push(avatar);
        }
        built.retain(|id| id.is_valid());
        (player, avatar, built)
    }

    fn start_placement(&self) -> Placement {
        Placement::World {
            region: self.settings.start_region,
            position: self.settings.spawn_position,
            orientation: Orientation::ZERO,
        }
    }

    /// Detach a session: save its entities, then destroy them.
    pub fn detach(&mut self, session: SessionId, entities: &mut EntityManager, table: &PrototypeTable) -> bool {
        let Some(mut connection) = self.connections.remove(&session) else {
            warn!("detach(): unknown session {}", session);
            return false;
        };
        if entities.contains(connection.player()) {
            self.save_connection(&mut connection, entities, table);
            for root in owned_roots(entities, connection.player()) {
                entities.destroy_entity(root);
            }
        } else {
            // Still queued: nothing changed since load, so drop without saving
            debug!("Session {} detached before its entities went live", session);
            entities.destroy_entity(connection.player());
            entities.destroy_entity(connection.avatar());
        }
        info!("Session {} detached", session);
        true
    }

    /// Save every session, tell it why, flush, and drop all connections.
    pub fn disconnect_all(&mut self, reason: &str, entities: &mut EntityManager, table: &PrototypeTable) -> usize {
        let sessions: Vec<SessionId> = self.connections.keys().copied().collect();
        for session in &sessions {
            if let Some(connection) = self.connections.get_mut(session) {
                connection.post_message(GameMessage::Disconnect { reason: reason.to_string() });
                connection.flush();
            }
            self.detach(*session, entities, table);
        }
        sessions.len()
    }

    /// Serialize a session's entities and store them.
    pub fn save_connection(&self, connection: &mut PlayerConnection, entities: &EntityManager, table: &PrototypeTable) -> bool {
        let mut rows = Vec::new();
        for id in player_entities(entities, connection.player()) {
            let Some(entity) = entities.get(id) else { continue };
            match entities.pack_persistent(id, table) {
                Ok(archive) => rows.push(StoredEntity {
                    db_guid: id.raw(),
                    container_guid: entity.container().map(|c| c.container.raw()),
                    slot: entity.container().map(|c| c.slot).unwrap_or(0),
                    prototype: entity.prototype(),
                    archive,
                }),
                Err(e) => warn!("save_connection(): failed to archive {}: {}", id, e),
            }
        }

        let account = connection.account_mut();
        account.entities = rows;
        if self.store.save_player_data(account) {
            debug!("Saved {} entities for account {}", account.entities.len(), account.id);
            true
        } else {
            error!("Failed to save player data for account {}", account.id);
            false
        }
    }

    /// Group sessions into one party. Each member sees the others' top-level
    /// entities through the party channel; sessions not listed keep their own.
    /// An empty or single-member list dissolves the party of those sessions.
    pub fn set_party(
        &mut self,
        members: &[SessionId],
        entities: &EntityManager,
        table: &PrototypeTable,
    ) -> Result<usize, ArchiveError> {
        let players: Vec<EntityId> = members
            .iter()
            .filter_map(|s| self.connections.get(s))
            .map(|c| c.player())
            .collect();
        let mut changed = 0;
        for session in members {
            let Some(connection) = self.connections.get_mut(session) else {
                warn!("set_party(): unknown session {}", session);
                continue;
            };
            connection.aoi_mut().set_party_members(players.iter().copied());
            changed += connection.aoi_mut().consider_all(entities, table)?;
        }
        Ok(changed)
    }

    /// Connections whose egress queue closed since the last call.
    pub fn take_closed_sessions(&self) -> Vec<SessionId> {
        self.connections.values().filter(|c| c.is_closed()).map(|c| c.session()).collect()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Apply one raw client payload. Malformed input is logged and dropped.
    pub fn handle_message(
        &mut self,
        session: SessionId,
        payload: &[u8],
        entities: &mut EntityManager,
        regions: &mut RegionManager,
    ) {
        let message = match ClientMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message from session {}: {} ({})", session, e, hex::encode(payload));
                return;
            }
        };
        let Some(connection) = self.connections.get_mut(&session) else {
            warn!("handle_message(): unknown session {}", session);
            return;
        };

        match message {
            ClientMessage::CellLoaded { cell } => {
                connection.aoi_mut().on_cell_acknowledged(cell);
            }
            ClientMessage::MoveAvatar { destination } if !destination.is_finite() => {
                warn!("Session {} sent a non-finite destination {:?}", session, destination);
            }
            ClientMessage::RequestTeleport { position, .. } if !position.is_finite() => {
                warn!("Session {} sent a non-finite teleport target {:?}", session, position);
            }
            ClientMessage::MoveAvatar { destination } => {
                if !entities.set_destination(connection.avatar(), destination) {
                    warn!("Session {} cannot move avatar {}", session, connection.avatar());
                }
            }
            ClientMessage::RequestTeleport { region, position } => {
                teleport(connection, region, position, entities, regions);
            }
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Queue a message for one session.
    pub fn send_message(&mut self, session: SessionId, message: GameMessage) -> bool {
        match self.connections.get_mut(&session) {
            Some(connection) => {
                connection.post_message(message);
                true
            }
            None => {
                warn!("send_message(): unknown session {}", session);
                false
            }
        }
    }

    /// Queue a message for every session.
    pub fn broadcast_message(&mut self, message: GameMessage) {
        for connection in self.connections.values_mut() {
            connection.post_message(message.clone());
        }
    }

    /// Hand every queued message to the transport.
    pub fn send_all_pending_messages(&mut self) -> usize {
        self.connections.values_mut().map(|c| c.flush().sent).sum()
    }

    /// Turn this update's entity changes into per-session traffic.
    pub fn replicate(
        &mut self,
        entities: &mut EntityManager,
        regions: &RegionManager,
        table: &PrototypeTable,
    ) -> Result<(), ArchiveError> {
        let created = entities.take_created();
        let destroyed = entities.take_destroyed();
        let dirty = entities.take_dirty();
        let moved = entities.take_moved();
        let mut reconsider = entities.take_reconsider();
        reconsider.extend(created);

        for connection in self.connections.values_mut() {
            let known: BTreeMap<EntityId, AoiChannels> = connection.aoi().interests().collect();
            for id in &destroyed {
                connection.aoi_mut().on_entity_destroyed(*id);
            }

            let bound = connection.aoi().region().is_some();
            if let Some(location) = entities.get(connection.avatar()).and_then(|e| e.location().copied()) {
                if !bound && entities.get(connection.avatar()).map(|e| e.owner()) != Some(connection.player()) {
                    entities.set_owner(connection.avatar(), connection.player());
                }
                if connection.aoi().region() != Some(location.region) {
                    connection.aoi_mut().set_region(Some(location.region), regions);
                }
                connection.aoi_mut().update_reference_position(location.position, entities, regions, table)?;
                if !bound {
                    connection.aoi_mut().consider_all(entities, table)?;
                }
            }

            for id in reconsider.iter().chain(moved.iter()) {
                connection.aoi_mut().consider_entity(*id, entities, table)?;
            }

            // Creates and channel changes already carry current state
            let fresh: BTreeSet<EntityId> = connection
                .aoi()
                .interests()
                .filter(|(id, channels)| known.get(id) != Some(channels))
                .map(|(id, _)| id)
                .collect();
            connection.collect_aoi_messages();

            for id in &moved {
                if fresh.contains(id) {
                    continue;
                }
                let channels = connection.aoi().interest_channels(*id);
                if channels.is_empty() {
                    continue;
                }
                if let Some(mut update) = entities.get(*id).and_then(|e| e.locomotion_state()) {
                    let mut archive = Archive::new_replication(channels);
                    archive.transfer(&mut update)?;
                    connection.post_message(GameMessage::LocomotionStateUpdate { archive: archive.into_bytes()? });
                }
            }

            for (id, property) in &dirty {
                if fresh.contains(id) {
                    continue;
                }
                let channels = connection.aoi().interest_channels(*id);
                if !channels.intersects(property_policy(table, *property)) {
                    continue;
                }
                if let Some(archive) = property_update(entities, *id, *property, channels, table)? {
                    connection.post_message(GameMessage::PropertyUpdate { entity: *id, archive });
                }
            }

            if let Some(done) = connection.try_finish_teleport() {
                let orientation = entities
                    .get(connection.avatar())
                    .and_then(|e| e.location())
                    .map(|l| l.orientation)
                    .unwrap_or_default();
                connection.post_message(GameMessage::TeleportFinished {
                    entity: connection.avatar(),
                    position: done.position,
                    orientation,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PlayerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerConnectionManager")
            .field("connections", &self.connections.len())
            .field("settings", &self.settings)
            .finish()
    }
}

fn teleport(
    connection: &mut PlayerConnection,
    region: RegionId,
    position: Vector3,
    entities: &mut EntityManager,
    regions: &mut RegionManager,
) {
    let avatar = connection.avatar();
    let Some(location) = entities.get(avatar).and_then(|e| e.location().copied()) else {
        warn!("teleport(): avatar {} of session {} is not in the world", avatar, connection.session());
        return;
    };
    if regions.get(region).is_none() {
        warn!("teleport(): unknown region {}", region);
        return;
    }

    let moved = if location.region == region {
        entities.move_to(avatar, position, location.orientation, regions)
    } else {
        entities.exit_world(avatar, regions)
            && entities.enter_world(avatar, region, position, location.orientation, regions)
    };
    if !moved {
        warn!("teleport(): avatar {} could not move to {}", avatar, region);
        return;
    }

    let arrived = entities.get(avatar).and_then(|e| e.location()).map(|l| l.position).unwrap_or(position);
    connection.aoi_mut().set_region(Some(region), regions);
    connection.begin_teleport(region, arrived);
}

fn property_update(
    entities: &EntityManager,
    id: EntityId,
    property: PropertyId,
    channels: AoiChannels,
    table: &PrototypeTable,
) -> Result<Option<Vec<u8>>, ArchiveError> {
    let Some(mut value) = entities.get(id).and_then(|e| e.property(property)).cloned() else {
        return Ok(None);
    };
    let mut archive = Archive::new_replication(channels);
    let mut property = property;
    PropertyCollection::transfer_one(&mut archive, table, &mut property, &mut value)?;
    archive.into_bytes().map(Some)
}

/// Player, then owned top-level entities, each followed by its contents
/// (containers before contents).
fn player_entities(entities: &EntityManager, player: EntityId) -> Vec<EntityId> {
    let mut out = Vec::new();
    for root in owned_roots(entities, player) {
        collect_contents(entities, root, &mut out);
    }
    out
}

fn owned_roots(entities: &EntityManager, player: EntityId) -> Vec<EntityId> {
    if !entities.contains(player) {
        return Vec::new();
    }
    let mut roots = vec![player];
    roots.extend(
        entities
            .iter()
            .filter(|e| e.id() != player && e.owner() == player && e.container().is_none())
            .map(|e| e.id()),
    );
    roots
}

fn collect_contents(entities: &EntityManager, id: EntityId, out: &mut Vec<EntityId>) {
    if out.contains(&id) {
        return;
    }
    out.push(id);
    let contents: Vec<EntityId> = entities
        .get(id)
        .and_then(|e| e.inventory())
        .map(|inventory| inventory.entities().collect())
        .unwrap_or_default();
    for child in contents {
        collect_contents(entities, child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::CellId;
    use crate::game::factory::EntityFactory;
    use crate::game::prototype::protos;
    use crate::game::region::Bounds;
    use crate::persistence::InMemoryStore;

    struct Fixture {
        table: PrototypeTable,
        regions: RegionManager,
        entities: EntityManager,
        store: Arc<InMemoryStore>,
        manager: PlayerConnectionManager,
        region: RegionId,
    }

    fn fixture() -> Fixture {
        let mut regions = RegionManager::new();
        let region = regions.create_region(Bounds::new(Vector3::ZERO, Vector3::new(200.0, 200.0, 10.0)), 25.0);
        let store = Arc::new(InMemoryStore::new());
        let settings = ConnectionSettings {
            proximity_radius: 40.0,
            player_prototype: protos::PLAYER,
            avatar_prototype: protos::AVATAR,
            start_region: region,
            spawn_position: Vector3::ZERO,
        };
        Fixture {
            table: PrototypeTable::builtin(),
            regions,
            entities: EntityManager::new(EntityFactory::new()),
            manager: PlayerConnectionManager::new(store.clone(), settings),
            store,
            region,
        }
    }

    impl Fixture {
        fn attach(&mut self, session: u64, key: &str) -> mpsc::Receiver<Vec<u8>> {
            let (tx, rx) = mpsc::channel(256);
            assert!(self.manager.attach(SessionId(session), key, tx, &mut self.entities, &self.table));
            rx
        }

        fn update(&mut self) {
            self.entities.locomote(std::time::Duration::from_millis(50), &mut self.regions);
            self.entities.process_deferred_lists(&mut self.regions);
            self.manager.replicate(&mut self.entities, &self.regions, &self.table).unwrap();
            self.manager.send_all_pending_messages();
        }

        fn avatar(&self, session: u64) -> EntityId {
            self.manager.get(SessionId(session)).unwrap().avatar()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<GameMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(GameMessage::from_bytes(&bytes).unwrap());
        }
        out
    }

    #[test]
    fn test_attach_creates_and_binds() {
        let mut f = fixture();
        let mut rx = f.attach(1, "alice");
        assert!(f.store.try_query_account_by_key("alice").is_some());
        f.update();

        let avatar = f.avatar(1);
        let conn = f.manager.get(SessionId(1)).unwrap();
        assert_eq!(conn.aoi().region(), Some(f.region));
        assert!(conn.aoi().interested_in_entity(avatar, AoiChannels::OWNER));
        assert!(conn.aoi().interested_in_entity(conn.player(), AoiChannels::OWNER));

        let messages = drain(&mut rx);
        assert!(matches!(messages.first(), Some(GameMessage::RegionChange { .. })));
        assert!(messages.iter().any(|m| m.name() == "CellLoad"));
        let created = messages
            .iter()
            .position(|m| matches!(m, GameMessage::EntityCreate { entity, .. } if *entity == avatar))
            .unwrap();
        let first_update = messages
            .iter()
            .position(|m| matches!(m.name(), "LocomotionStateUpdate" | "PropertyUpdate"))
            .unwrap_or(usize::MAX);
        assert!(created < first_update);
    }

    #[test]
    fn test_updates_follow_creates_in_same_update() {
        let mut f = fixture();
        let mut rx = f.attach(1, "alice");
        f.update();
        drain(&mut rx);

        let placement = Placement::World { region: f.region, position: Vector3::new(10.0, 0.0, 0.0), orientation: Orientation::ZERO };
        let agent = f.entities.create_entity(EntitySettings { prototype: protos::AGENT, placement, ..Default::default() }, &f.table).unwrap();
        f.entities.process_deferred_lists(&mut f.regions);
        f.entities.set_property(agent, props::HEALTH, PropertyValue::Int(5), &f.table);
        f.entities.set_destination(agent, Vector3::new(20.0, 0.0, 0.0));
        f.update();

        let messages = drain(&mut rx);
        assert_eq!(messages.iter().filter(|m| matches!(m, GameMessage::EntityCreate { entity, .. } if *entity == agent)).count(), 1);
        assert!(!messages.iter().any(|m| m.name() == "PropertyUpdate"));
        assert!(!messages.iter().any(|m| m.name() == "LocomotionStateUpdate"));

        f.update();
        assert!(drain(&mut rx).iter().any(|m| m.name() == "LocomotionStateUpdate"));
    }

    #[test]
    fn test_agent_walks_in_and_out_of_proximity() {
        let mut f = fixture();
        let mut rx = f.attach(1, "alice");
        f.update();

        let placement = Placement::World { region: f.region, position: Vector3::new(60.0, 0.0, 0.0), orientation: Orientation::ZERO };
        let agent = f.entities.create_entity(EntitySettings { prototype: protos::AGENT, placement, ..Default::default() }, &f.table).unwrap();
        f.update();
        drain(&mut rx);
        assert!(!f.manager.get(SessionId(1)).unwrap().aoi().interested_in_entity(agent, AoiChannels::ALL));

        let mut walk = |f: &mut Fixture, x: f32| {
            f.entities.set_destination(agent, Vector3::new(x, 0.0, 0.0));
            let mut messages = Vec::new();
            for _ in 0..600 {
                f.update();
                messages.extend(drain(&mut rx));
                if !f.entities.get(agent).unwrap().locomotor().unwrap().is_moving() {
                    break;
                }
            }
            messages
        };
        let creates = |messages: &[GameMessage]| {
            messages.iter().filter(|m| matches!(m, GameMessage::EntityCreate { entity, .. } if *entity == agent)).count()
        };
        let destroys = |messages: &[GameMessage]| {
            messages.iter().filter(|m| matches!(m, GameMessage::EntityDestroy { entity } if *entity == agent)).count()
        };

        let inbound = walk(&mut f, 20.0);
        assert_eq!(creates(&inbound), 1);
        assert_eq!(destroys(&inbound), 0);
        assert_eq!(f.manager.get(SessionId(1)).unwrap().aoi().interest_channels(agent), AoiChannels::PROXIMITY);

        let outbound = walk(&mut f, 60.0);
        assert_eq!(creates(&outbound), 0);
        assert_eq!(destroys(&outbound), 1);
        assert!(!f.manager.get(SessionId(1)).unwrap().aoi().interested_in_entity(agent, AoiChannels::ALL));
    }

    #[test]
    fn test_non_finite_client_vectors_ignored() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        f.update();
        let home = Vector3::new(100.0, 100.0, 0.0);
        let request = ClientMessage::RequestTeleport { region: f.region, position: home };
        f.manager.handle_message(SessionId(1), &request.to_bytes().unwrap(), &mut f.entities, &mut f.regions);
        f.update();

        let avatar = f.avatar(1);
        let bad = [
            ClientMessage::MoveAvatar { destination: Vector3::new(f32::NAN, f32::NAN, 0.0) },
            ClientMessage::MoveAvatar { destination: Vector3::new(f32::INFINITY, 0.0, 0.0) },
            ClientMessage::RequestTeleport { region: f.region, position: Vector3::new(f32::NAN, 5.0, 0.0) },
        ];
        for message in bad {
            f.manager.handle_message(SessionId(1), &message.to_bytes().unwrap(), &mut f.entities, &mut f.regions);
            f.update();
            f.update();
            let entity = f.entities.get(avatar).unwrap();
            assert_eq!(entity.location().unwrap().position, home);
            assert!(!entity.locomotor().unwrap().is_moving());
        }
    }

    #[test]
    fn test_overflowing_session_is_closed() {
        let mut f = fixture();
        let (tx, mut rx) = mpsc::channel(1);
        assert!(f.manager.attach(SessionId(1), "alice", tx, &mut f.entities, &f.table));
        f.update();

        assert_eq!(f.manager.take_closed_sessions(), vec![SessionId(1)]);
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(f.manager.detach(SessionId(1), &mut f.entities, &f.table));
        f.update();
        assert!(f.entities.is_empty());
    }

    #[test]
    fn test_party_members_see_each_other() {
        let mut f = fixture();
        let mut rx_a = f.attach(1, "alice");
        let _rx_b = f.attach(2, "bob");
        f.update();
        let far = ClientMessage::RequestTeleport { region: f.region, position: Vector3::new(150.0, 150.0, 0.0) };
        f.manager.handle_message(SessionId(2), &far.to_bytes().unwrap(), &mut f.entities, &mut f.regions);
        f.update();
        drain(&mut rx_a);

        let avatar_b = f.avatar(2);
        assert!(!f.manager.get(SessionId(1)).unwrap().aoi().interested_in_entity(avatar_b, AoiChannels::ALL));

        assert!(f.manager.set_party(&[SessionId(1), SessionId(2)], &f.entities, &f.table).unwrap() > 0);
        f.update();
        assert_eq!(f.manager.get(SessionId(1)).unwrap().aoi().interest_channels(avatar_b), AoiChannels::PARTY);
        assert!(drain(&mut rx_a).iter().any(|m| matches!(m, GameMessage::EntityCreate { entity, .. } if *entity == avatar_b)));

        f.manager.set_party(&[SessionId(1)], &f.entities, &f.table).unwrap();
        f.manager.set_party(&[SessionId(2)], &f.entities, &f.table).unwrap();
        f.update();
        assert!(!f.manager.get(SessionId(1)).unwrap().aoi().interested_in_entity(avatar_b, AoiChannels::ALL));
        assert!(drain(&mut rx_a).iter().any(|m| matches!(m, GameMessage::EntityDestroy { entity } if *entity == avatar_b)));
    }

    #[test]
    fn test_failed_attach_leaves_no_entities() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        f.update();
        let player = f.manager.get(SessionId(1)).unwrap().player();
        f.entities.create_entity(
            EntitySettings { prototype: protos::ITEM, placement: Placement::Inventory { container: player, slot: Some(0) }, ..Default::default() },
            &f.table,
        ).unwrap();
        let avatar = f.avatar(1);
        f.entities.destroy_entity(avatar);
        f.update();
        assert!(f.manager.detach(SessionId(1), &mut f.entities, &f.table));
        f.update();
        let account = f.store.try_query_account_by_key("alice").unwrap();
        assert_eq!(f.store.stored_entities(account.id).len(), 2);

        let settings = ConnectionSettings {
            proximity_radius: 40.0,
            player_prototype: protos::PLAYER,
            avatar_prototype: PrototypeId(999),
            start_region: f.region,
            spawn_position: Vector3::ZERO,
        };
        let mut broken = PlayerConnectionManager::new(f.store.clone(), settings);
        let (tx, _rx) = mpsc::channel(8);
        assert!(!broken.attach(SessionId(2), "alice", tx, &mut f.entities, &f.table));
        f.entities.process_deferred_lists(&mut f.regions);
        assert!(f.entities.is_empty());
        assert_eq!(f.entities.pending_create_count(), 0);
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        let (tx, _rx2) = mpsc::channel(4);
        assert!(!f.manager.attach(SessionId(1), "bob", tx.clone(), &mut f.entities, &f.table));
        assert!(!f.manager.attach(SessionId(2), "alice", tx, &mut f.entities, &f.table));
    }

    #[test]
    fn test_detach_saves_and_restores() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        f.update();
        let avatar = f.avatar(1);
        f.entities.set_property(avatar, props::EXPERIENCE, PropertyValue::Int(1234), &f.table);
        let sword = f.entities.create_entity(
            EntitySettings { prototype: protos::ITEM, placement: Placement::Inventory { container: avatar, slot: Some(3) }, ..Default::default() },
            &f.table,
        ).unwrap();
        f.update();

        assert!(f.manager.detach(SessionId(1), &mut f.entities, &f.table));
        f.update();
        assert!(f.entities.is_empty());
        let account = f.store.try_query_account_by_key("alice").unwrap();
        assert_eq!(f.store.stored_entities(account.id).len(), 3);

        let _rx = f.attach(2, "alice");
        f.update();
        let avatar = f.avatar(2);
        let restored = f.entities.get(avatar).unwrap();
        assert_eq!(restored.property(props::EXPERIENCE), Some(&PropertyValue::Int(1234)));
        assert!(restored.is_in_world());
        let item = restored.inventory().unwrap().get(3).unwrap();
        assert_eq!(f.entities.get(item).unwrap().prototype(), protos::ITEM);
        assert!(!f.entities.contains(sword) || item == sword);
    }

    #[test]
    fn test_failed_save_is_not_fatal() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        f.update();
        f.store.fail_next_saves(3);
        assert!(f.manager.detach(SessionId(1), &mut f.entities, &f.table));
        f.update();
        assert!(f.manager.is_empty());
        assert!(f.entities.is_empty());
    }

    #[test]
    fn test_detach_before_live_keeps_stored_data() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        f.update();
        assert!(f.manager.detach(SessionId(1), &mut f.entities, &f.table));
        f.update();
        let account = f.store.try_query_account_by_key("alice").unwrap();
        let saved = f.store.stored_entities(account.id).len();
        assert!(saved >= 2);

        let _rx = f.attach(2, "alice");
        assert!(f.manager.detach(SessionId(2), &mut f.entities, &f.table));
        f.update();
        assert!(f.entities.is_empty());
        assert_eq!(f.store.stored_entities(account.id).len(), saved);
    }

    #[test]
    fn test_proximity_and_property_updates() {
        let mut f = fixture();
        let mut rx_a = f.attach(1, "alice");
        let mut rx_b = f.attach(2, "bob");
        f.update();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let avatar_a = f.avatar(1);
        let avatar_b = f.avatar(2);
        let conn_b = f.manager.get(SessionId(2)).unwrap();
        assert_eq!(conn_b.aoi().interest_channels(avatar_a), AoiChannels::PROXIMITY);

        f.entities.set_property(avatar_a, props::HEALTH, PropertyValue::Int(10), &f.table);
        f.entities.set_property(avatar_a, props::CREDITS, PropertyValue::Int(99), &f.table);
        f.update();

        let to_b = drain(&mut rx_b);
        let updates: Vec<&GameMessage> = to_b.iter().filter(|m| m.name() == "PropertyUpdate").collect();
        assert_eq!(updates.len(), 1);
        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.iter().filter(|m| m.name() == "PropertyUpdate").count(), 2);

        f.entities.set_destination(avatar_b, Vector3::new(10.0, 0.0, 0.0));
        f.update();
        assert!(drain(&mut rx_a).iter().any(|m| m.name() == "LocomotionStateUpdate"));
    }

    #[test]
    fn test_teleport_finishes_after_cells_load() {
        let mut f = fixture();
        let mut rx = f.attach(1, "alice");
        f.update();
        drain(&mut rx);

        let request = ClientMessage::RequestTeleport { region: f.region, position: Vector3::new(150.0, 150.0, 0.0) };
        f.manager.handle_message(SessionId(1), &request.to_bytes().unwrap(), &mut f.entities, &mut f.regions);
        f.update();

        let cells: Vec<CellId> = drain(&mut rx)
            .iter()
            .filter_map(|m| match m {
                GameMessage::CellLoad { cell, .. } => Some(*cell),
                _ => None,
            })
            .collect();
        assert!(!cells.is_empty());
        assert!(f.manager.get(SessionId(1)).unwrap().pending_teleport().is_some());

        for cell in f.manager.get(SessionId(1)).unwrap().aoi().tracked_cells().collect::<Vec<_>>() {
            let ack = ClientMessage::CellLoaded { cell };
            f.manager.handle_message(SessionId(1), &ack.to_bytes().unwrap(), &mut f.entities, &mut f.regions);
        }
        f.update();
        assert!(drain(&mut rx).iter().any(|m| m.name() == "TeleportFinished"));
        assert!(f.manager.get(SessionId(1)).unwrap().pending_teleport().is_none());
    }

    #[test]
    fn test_malformed_message_dropped() {
        let mut f = fixture();
        let _rx = f.attach(1, "alice");
        f.manager.handle_message(SessionId(1), &[0xFF, 0xFF, 0xFF, 0xFF, 0x01], &mut f.entities, &mut f.regions);
        f.manager.handle_message(SessionId(9), &[], &mut f.entities, &mut f.regions);
        assert_eq!(f.manager.len(), 1);
    }

    #[test]
    fn test_broadcast_and_disconnect_all() {
        let mut f = fixture();
        let mut rx_a = f.attach(1, "alice");
        let mut rx_b = f.attach(2, "bob");
        f.update();
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.manager.broadcast_message(GameMessage::EntityDestroy { entity: EntityId(77) });
        assert!(f.manager.send_message(SessionId(1), GameMessage::EntityDestroy { entity: EntityId(78) }));
        assert!(!f.manager.send_message(SessionId(5), GameMessage::EntityDestroy { entity: EntityId(79) }));
        assert_eq!(f.manager.send_all_pending_messages(), 3);

        assert_eq!(f.manager.disconnect_all("shutting down", &mut f.entities, &f.table), 2);
        assert!(drain(&mut rx_a).iter().any(|m| matches!(m, GameMessage::Disconnect { reason } if reason == "shutting down")));
        assert!(f.manager.is_empty());
    }
}
