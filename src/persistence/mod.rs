//! Persistence
//!
//! Contract for the account/player storage backend. The game calls it only
//! when a session attaches or detaches, never from inside a fixed update.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::core::ids::{AccountId, PrototypeId};

pub use memory::InMemoryStore;

/// Attempts made by [`PlayerStore::save_player_data`] before giving up.
pub const SAVE_ATTEMPTS: u32 = 3;

/// One stored entity of a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    /// Identity of the row, stable across saves of the same snapshot.
    pub db_guid: u64,
    /// Container row, if the entity is held in an inventory.
    pub container_guid: Option<u64>,
    /// Slot inside the container.
    pub slot: u32,
    /// Prototype, for backends that index by type.
    pub prototype: PrototypeId,
    /// Persistent archive of the entity.
    pub archive: Vec<u8>,
}

/// A player account and its stored entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account id.
    pub id: AccountId,
    /// Lookup key (login name).
    pub key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful save.
    pub last_saved: Option<DateTime<Utc>>,
    /// Player entity first, then owned entities, containers before contents.
    /// Filled by [`PlayerStore::load_player_data`].
    #[serde(skip)]
    pub entities: Vec<StoredEntity>,
}

impl Account {
    /// New account without stored entities.
    pub fn new(id: AccountId, key: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            created_at: Utc::now(),
            last_saved: None,
            entities: Vec::new(),
        }
    }
}

/// Account and player data backend.
pub trait PlayerStore: Send + Sync {
    /// Prepare the backend.
    fn initialize(&self) -> bool;

    /// Find an account by key.
    fn try_query_account_by_key(&self, key: &str) -> Option<Account>;

    /// Create an account. Fails if the id or key is taken.
    fn insert_account(&self, account: &Account) -> bool;

    /// Update account metadata.
    fn update_account(&self, account: &Account) -> bool;

    /// Fill `account.entities` from storage.
    fn load_player_data(&self, account: &mut Account) -> bool;

    /// One save attempt.
    fn try_save_player_data(&self, account: &Account) -> bool;

    /// Save with bounded retries.
    fn save_player_data(&self, account: &Account) -> bool {
        for attempt in 1..=SAVE_ATTEMPTS {
            if self.try_save_player_data(account) {
                return true;
            }
            warn!("save_player_data(): attempt {}/{} failed for account {}", attempt, SAVE_ATTEMPTS, account.id);
        }
        false
    }
}

/// Fresh account id.
pub fn new_account_id() -> AccountId {
    let (high, low) = uuid::Uuid::new_v4().as_u64_pair();
    match high ^ low {
        0 => AccountId(1),
        id => AccountId(id),
    }
}
