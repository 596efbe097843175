//! Player Connection
//!
//! Game-thread state of one session: the account, the entities it
//! controls, its AOI, its outbox and any pending relocation.

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::core::ids::{EntityId, RegionId, SessionId};
use crate::core::vec3::Vector3;
use crate::game::aoi::AreaOfInterest;
use crate::network::protocol::GameMessage;
use crate::persistence::Account;

/// Relocation waiting for the client to load the destination cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTeleport {
    /// Destination region.
    pub region: RegionId,
    /// Destination position.
    pub position: Vector3,
}

/// Result of flushing one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Messages handed to the egress queue.
    pub sent: usize,
    /// Messages dropped because the queue was full or closed.
    pub dropped: usize,
}

/// One connected session.
#[derive(Debug)]
pub struct PlayerConnection {
    session: SessionId,
    account: Account,
    player: EntityId,
    avatar: EntityId,
    aoi: AreaOfInterest,
    egress: mpsc::Sender<Vec<u8>>,
    outbox: Vec<GameMessage>,
    pending_teleport: Option<PendingTeleport>,
    closed: bool,
}

impl PlayerConnection {
    /// New connection with an empty AOI.
    pub fn new(session: SessionId, account: Account, egress: mpsc::Sender<Vec<u8>>, proximity_radius: f32) -> Self {
        Self {
            session,
            account,
            player: EntityId::INVALID,
            avatar: EntityId::INVALID,
            aoi: AreaOfInterest::new(session, proximity_radius),
            egress,
            outbox: Vec::new(),
            pending_teleport: None,
            closed: false,
        }
    }

    /// Session id.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Account.
    pub fn account(&self) -> &Account {
        &self.account
    }

    pub(crate) fn account_mut(&mut self) -> &mut Account {
        &mut self.account
    }

    /// Player entity.
    pub fn player(&self) -> EntityId {
        self.player
    }

    /// Avatar entity.
    pub fn avatar(&self) -> EntityId {
        self.avatar
    }

    pub(crate) fn bind_entities(&mut self, player: EntityId, avatar: EntityId) {
        self.player = player;
        self.avatar = avatar;
        self.aoi.set_player(player);
    }

    /// Area of interest.
    pub fn aoi(&self) -> &AreaOfInterest {
        &self.aoi
    }

    /// Mutable area of interest.
    pub fn aoi_mut(&mut self) -> &mut AreaOfInterest {
        &mut self.aoi
    }

    /// Pending relocation.
    pub fn pending_teleport(&self) -> Option<PendingTeleport> {
        self.pending_teleport
    }

    /// Start a relocation. It finishes once every tracked cell is loaded.
    pub fn begin_teleport(&mut self, region: RegionId, position: Vector3) {
        if let Some(previous) = self.pending_teleport.replace(PendingTeleport { region, position }) {
            warn!("Session {} replaced pending teleport to {}", self.session, previous.region);
        }
    }

    /// Finish the pending relocation if loading is complete.
    pub fn try_finish_teleport(&mut self) -> Option<PendingTeleport> {
        if self.pending_teleport.is_some() && self.aoi.is_load_complete() {
            self.pending_teleport.take()
        } else {
            None
        }
    }

    /// True once the egress queue was found closed or overflowed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue a message.
    pub fn post_message(&mut self, message: GameMessage) {
        self.outbox.push(message);
    }

    /// Messages waiting to be flushed, including ones still on the AOI.
    pub fn pending_message_count(&self) -> usize {
        self.outbox.len() + self.aoi.pending_message_count()
    }

    /// Move AOI output into the outbox, keeping order.
    pub fn collect_aoi_messages(&mut self) {
        let messages = self.aoi.take_messages();
        self.outbox.extend(messages);
    }

    /// Encode and hand every queued message to the egress queue.
    pub fn flush(&mut self) -> FlushOutcome {
        self.collect_aoi_messages();
        let mut outcome = FlushOutcome::default();
        for message in std::mem::take(&mut self.outbox) {
            if self.closed {
                outcome.dropped += 1;
                continue;
            }
            let bytes = match message.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode {} for session {}: {}", message.name(), self.session, e);
                    outcome.dropped += 1;
                    continue;
                }
            };
            match self.egress.try_send(bytes) {
                Ok(()) => outcome.sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // The client would miss state its AOI assumes it has
                    warn!("Egress queue full for session {} at {}, closing", self.session, message.name());
                    self.closed = true;
                    outcome.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Egress queue closed for session {}", self.session);
                    self.closed = true;
                    outcome.dropped += 1;
                }
            }
        }
        if outcome.sent > 0 {
            trace!("Flushed {} message(s) to session {}", outcome.sent, self.session);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{AccountId, CellId};

    fn connection(capacity: usize) -> (PlayerConnection, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (PlayerConnection::new(SessionId(1), Account::new(AccountId(1), "tester"), tx, 30.0), rx)
    }

    #[test]
    fn test_flush_preserves_order() {
        let (mut conn, mut rx) = connection(8);
        conn.aoi_mut().queue_message(GameMessage::EntityDestroy { entity: EntityId(1) });
        conn.post_message(GameMessage::Disconnect { reason: "bye".to_string() });
        assert_eq!(conn.pending_message_count(), 2);

        assert_eq!(conn.flush(), FlushOutcome { sent: 2, dropped: 0 });
        let first = GameMessage::from_bytes(&rx.try_recv().unwrap()).unwrap();
        let second = GameMessage::from_bytes(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first, GameMessage::EntityDestroy { entity: EntityId(1) });
        assert_eq!(second.name(), "Disconnect");
    }

    #[test]
    fn test_full_queue_closes_connection() {
        let (mut conn, mut rx) = connection(1);
        conn.post_message(GameMessage::EntityDestroy { entity: EntityId(1) });
        conn.post_message(GameMessage::EntityDestroy { entity: EntityId(2) });
        conn.post_message(GameMessage::EntityDestroy { entity: EntityId(3) });
        assert_eq!(conn.flush(), FlushOutcome { sent: 1, dropped: 2 });
        assert!(conn.is_closed());

        // Nothing more reaches the client once it has missed a message
        rx.try_recv().unwrap();
        conn.post_message(GameMessage::EntityDestroy { entity: EntityId(4) });
        assert_eq!(conn.flush(), FlushOutcome { sent: 0, dropped: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_marks_connection() {
        let (mut conn, rx) = connection(4);
        drop(rx);
        conn.post_message(GameMessage::EntityDestroy { entity: EntityId(1) });
        conn.flush();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_teleport_waits_for_cells() {
        let (mut conn, _rx) = connection(4);
        conn.begin_teleport(RegionId(1), Vector3::new(5.0, 5.0, 0.0));
        assert!(conn.try_finish_teleport().is_some());

        conn.begin_teleport(RegionId(1), Vector3::new(5.0, 5.0, 0.0));
        let mut regions = crate::game::region::RegionManager::new();
        let region = regions.create_region(
            crate::game::region::Bounds::new(Vector3::ZERO, Vector3::new(100.0, 100.0, 10.0)),
            25.0,
        );
        let entities = crate::game::entity_manager::EntityManager::new(Default::default());
        let table = crate::game::prototype::PrototypeTable::builtin();
        conn.aoi_mut().set_region(Some(region), &regions);
        conn.aoi_mut().update_reference_position(Vector3::new(5.0, 5.0, 0.0), &entities, &regions, &table).unwrap();
        assert!(conn.try_finish_teleport().is_none());

        let cells: Vec<CellId> = regions.get(region).unwrap().cells_in_radius(Vector3::new(5.0, 5.0, 0.0), 30.0);
        for cell in cells {
            conn.aoi_mut().on_cell_acknowledged(cell);
        }
        assert!(conn.try_finish_teleport().is_some());
    }
}
