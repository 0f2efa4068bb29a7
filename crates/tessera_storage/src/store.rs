//! Storage contract for the Tessera client.

use std::collections::BTreeSet;

use crate::error::StorageResult;

/// Durable storage used by a client to make sync resumable.
///
/// A storage instance holds two key spaces:
///
/// - `(device_id) -> next_batch`: the sync cursor for a device
/// - `(user_id) -> set<room_id>`: the rooms a user has joined
///
/// # Invariants
///
/// - All mutations inside one [`transaction`](Storage::transaction) become
///   visible atomically when the transaction commits
/// - Transactions are serialized per storage instance; no caller observes a
///   half-applied transaction
/// - Adding an already-joined room or removing an absent room is a no-op
///
/// # Implementors
///
/// - [`crate::MemoryStorage`] - For testing
/// - [`crate::SqliteStorage`] - For persistent storage
pub trait Storage: Send + Sync {
    /// Runs `body` as a single transaction.
    ///
    /// The transaction commits if `body` returns `Ok(true)` and rolls back if
    /// it returns `Ok(false)`. An error from `body` rolls back and is
    /// propagated to the caller. Nested transactions are not supported.
    ///
    /// Returns whether the transaction committed.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StorageTxn) -> StorageResult<bool>,
    ) -> StorageResult<bool>;

    /// Stores the sync cursor for the given device.
    fn set_next_batch(&self, next_batch: &str, device_id: &str) -> StorageResult<()> {
        self.transaction(&mut |txn| {
            txn.set_next_batch(next_batch, device_id)?;
            Ok(true)
        })
        .map(|_| ())
    }

    /// Returns the sync cursor for the given device, if one was stored.
    fn next_batch(&self, device_id: &str) -> StorageResult<Option<String>> {
        let mut out = None;
        self.transaction(&mut |txn| {
            out = txn.next_batch(device_id)?;
            Ok(true)
        })?;
        Ok(out)
    }

    /// Adds a room to the joined set of the given user.
    fn add_joined_room(&self, room_id: &str, user_id: &str) -> StorageResult<()> {
        self.transaction(&mut |txn| {
            txn.add_joined_room(room_id, user_id)?;
            Ok(true)
        })
        .map(|_| ())
    }

    /// Removes a room from the joined set of the given user.
    fn remove_joined_room(&self, room_id: &str, user_id: &str) -> StorageResult<()> {
        self.transaction(&mut |txn| {
            txn.remove_joined_room(room_id, user_id)?;
            Ok(true)
        })
        .map(|_| ())
    }

    /// Returns the joined room ids of the given user.
    fn joined_rooms(&self, user_id: &str) -> StorageResult<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        self.transaction(&mut |txn| {
            out = txn.joined_rooms(user_id)?;
            Ok(true)
        })?;
        Ok(out)
    }
}

/// The operations available inside a [`Storage::transaction`] body.
///
/// All writes made through this handle become durable together when the
/// enclosing transaction commits, and are discarded together otherwise.
pub trait StorageTxn {
    /// Stores the sync cursor for the given device.
    fn set_next_batch(&mut self, next_batch: &str, device_id: &str) -> StorageResult<()>;

    /// Returns the sync cursor for the given device, if one was stored.
    fn next_batch(&mut self, device_id: &str) -> StorageResult<Option<String>>;

    /// Adds a room to the joined set of the given user.
    fn add_joined_room(&mut self, room_id: &str, user_id: &str) -> StorageResult<()>;

    /// Removes a room from the joined set of the given user.
    fn remove_joined_room(&mut self, room_id: &str, user_id: &str) -> StorageResult<()>;

    /// Returns the joined room ids of the given user.
    fn joined_rooms(&mut self, user_id: &str) -> StorageResult<BTreeSet<String>>;
}
