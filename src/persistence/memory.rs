//! In-memory store. Records are kept bincode-encoded, as a real backend
//! would keep them, so encoding problems surface in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::ids::AccountId;
use crate::persistence::{Account, PlayerStore, StoredEntity};

#[derive(Debug, Default)]
struct Tables {
    keys: BTreeMap<String, AccountId>,
    accounts: BTreeMap<AccountId, Vec<u8>>,
    player_data: BTreeMap<AccountId, Vec<u8>>,
}

/// Process-local [`PlayerStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    failing_saves: AtomicU32,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` save attempts fail.
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of accounts.
    pub fn account_count(&self) -> usize {
        self.tables.lock().map(|t| t.accounts.len()).unwrap_or(0)
    }

    /// Stored entities of an account, without touching the account record.
    pub fn stored_entities(&self, id: AccountId) -> Vec<StoredEntity> {
        let Ok(tables) = self.tables.lock() else { return Vec::new() };
        tables
            .player_data
            .get(&id)
            .and_then(|bytes| bincode::deserialize(bytes).ok())
            .unwrap_or_default()
    }

    fn write_account(tables: &mut Tables, account: &Account) -> bool {
        match bincode::serialize(account) {
            Ok(bytes) => {
                tables.keys.insert(account.key.clone(), account.id);
                tables.accounts.insert(account.id, bytes);
                true
            }
            Err(e) => {
                warn!("Failed to encode account {}: {}", account.id, e);
                false
            }
        }
    }
}

impl PlayerStore for InMemoryStore {
    fn initialize(&self) -> bool {
        self.tables.lock().is_ok()
    }

    fn try_query_account_by_key(&self, key: &str) -> Option<Account> {
        let tables = self.tables.lock().ok()?;
        let id = tables.keys.get(key)?;
        let bytes = tables.accounts.get(id)?;
        match bincode::deserialize(bytes) {
            Ok(account) => Some(account),
            Err(e) => {
                warn!("Corrupt account record {} ({}): {}", id, hex::encode(bytes), e);
                None
            }
        }
    }

    fn insert_account(&self, account: &Account) -> bool {
        let Ok(mut tables) = self.tables.lock() else { return false };
        if tables.keys.contains_key(&account.key) || tables.accounts.contains_key(&account.id) {
            warn!("insert_account(): account {} ({}) already exists", account.id, account.key);
            return false;
        }
        Self::write_account(&mut tables, account)
    }

    fn update_account(&self, account: &Account) -> bool {
        let Ok(mut tables) = self.tables.lock() else { return false };
        if !tables.accounts.contains_key(&account.id) {
            warn!("update_account(): unknown account {}", account.id);
            return false;
        }
        Self::write_account(&mut tables, account)
    }

    fn load_player_data(&self, account: &mut Account) -> bool {
        let Ok(tables) = self.tables.lock() else { return false };
        if !tables.accounts.contains_key(&account.id) {
            return false;
        }
        account.entities = match tables.player_data.get(&account.id) {
            Some(bytes) => match bincode::deserialize(bytes) {
                Ok(entities) => entities,
                Err(e) => {
                    warn!("Corrupt player data for account {}: {}", account.id, e);
                    return false;
                }
            },
            None => Vec::new(),
        };
        debug!("Loaded {} entities for account {}", account.entities.len(), account.id);
        true
    }

    fn try_save_player_data(&self, account: &Account) -> bool {
        let failing = self.failing_saves.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_saves.store(failing - 1, Ordering::SeqCst);
            return false;
        }

        let Ok(mut tables) = self.tables.lock() else { return false };
        if !tables.accounts.contains_key(&account.id) {
            return false;
        }
        let bytes = match bincode::serialize(&account.entities) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode player data for account {}: {}", account.id, e);
                return false;
            }
        };
        tables.player_data.insert(account.id, bytes);

        let mut saved = account.clone();
        saved.last_saved = Some(Utc::now());
        Self::write_account(&mut tables, &saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::PrototypeId;
    use crate::persistence::new_account_id;

    fn stored(guid: u64) -> StoredEntity {
        StoredEntity { db_guid: guid, container_guid: None, slot: 0, prototype: PrototypeId(1), archive: vec![2, 0, 1] }
    }

    #[test]
    fn test_account_lifecycle() {
        let store = InMemoryStore::new();
        assert!(store.initialize());
        assert!(store.try_query_account_by_key("alice").is_none());

        let account = Account::new(new_account_id(), "alice");
        assert!(store.insert_account(&account));
        assert!(!store.insert_account(&account));

        let found = store.try_query_account_by_key("alice").unwrap();
        assert_eq!(found.id, account.id);
        assert!(store.update_account(&found));
        assert_eq!(store.account_count(), 1);
    }

    #[test]
    fn test_player_data_round_trip() {
        let store = InMemoryStore::new();
        let mut account = Account::new(new_account_id(), "bob");
        store.insert_account(&account);
        account.entities = vec![stored(1), stored(2)];
        assert!(store.save_player_data(&account));

        let mut loaded = store.try_query_account_by_key("bob").unwrap();
        assert!(loaded.entities.is_empty());
        assert!(loaded.last_saved.is_some());
        assert!(store.load_player_data(&mut loaded));
        assert_eq!(loaded.entities, account.entities);
    }

    #[test]
    fn test_save_retries_are_bounded() {
        let store = InMemoryStore::new();
        let mut account = Account::new(new_account_id(), "carol");
        store.insert_account(&account);
        account.entities = vec![stored(5)];

        store.fail_next_saves(2);
        assert!(store.save_player_data(&account));
        assert_eq!(store.stored_entities(account.id).len(), 1);

        store.fail_next_saves(3);
        account.entities.clear();
        assert!(!store.save_player_data(&account));
        assert_eq!(store.stored_entities(account.id).len(), 1);
    }

    #[test]
    fn test_unknown_account_is_rejected() {
        let store = InMemoryStore::new();
        let mut account = Account::new(new_account_id(), "dave");
        assert!(!store.update_account(&account));
        assert!(!store.load_player_data(&mut account));
        assert!(!store.try_save_player_data(&account));
    }
}
