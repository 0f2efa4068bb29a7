//! In-memory storage for testing and ephemeral clients.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::error::StorageResult;
use crate::store::{Storage, StorageTxn};

/// The material state held by [`MemoryStorage`].
///
/// Cloneable so a transaction can work on a scratch copy and swap it in on
/// commit. [`StorageTxn`] is implemented directly on this type.
#[derive(Debug, Clone, Default)]
struct StoreState {
    next_batch: HashMap<String, String>,
    joined_rooms: HashMap<String, BTreeSet<String>>,
}

impl StorageTxn for StoreState {
    fn set_next_batch(&mut self, next_batch: &str, device_id: &str) -> StorageResult<()> {
        self.next_batch
            .insert(device_id.to_string(), next_batch.to_string());
        Ok(())
    }

    fn next_batch(&mut self, device_id: &str) -> StorageResult<Option<String>> {
        Ok(self.next_batch.get(device_id).cloned())
    }

    fn add_joined_room(&mut self, room_id: &str, user_id: &str) -> StorageResult<()> {
        self.joined_rooms
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());
        Ok(())
    }

    fn remove_joined_room(&mut self, room_id: &str, user_id: &str) -> StorageResult<()> {
        if let Some(rooms) = self.joined_rooms.get_mut(user_id) {
            rooms.remove(room_id);
        }
        Ok(())
    }

    fn joined_rooms(&mut self, user_id: &str) -> StorageResult<BTreeSet<String>> {
        Ok(self.joined_rooms.get(user_id).cloned().unwrap_or_default())
    }
}

/// An in-memory storage backend.
///
/// Suitable for unit tests, integration tests, and clients that do not need
/// to resume sync across restarts.
///
/// # Thread Safety
///
/// Transactions are serialized by an internal mutex, so the storage can be
/// shared between the sync loop and caller tasks.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{MemoryStorage, Storage};
///
/// let storage = MemoryStorage::new();
/// storage.set_next_batch("s1", "DEVICE").unwrap();
/// assert_eq!(storage.next_batch("DEVICE").unwrap().as_deref(), Some("s1"));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<StoreState>,
}

impl MemoryStorage {
    /// Creates a new empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StorageTxn) -> StorageResult<bool>,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock();
        let mut scratch = state.clone();

        match body(&mut scratch) {
            Ok(true) => {
                *state = scratch;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
