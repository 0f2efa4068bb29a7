//! SQLite-backed persistent storage.

use std::collections::BTreeSet;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::StorageResult;
use crate::store::{Storage, StorageTxn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS next_batch (
    device_id  TEXT PRIMARY KEY,
    next_batch TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS joined_rooms (
    user_id TEXT NOT NULL,
    room_id TEXT NOT NULL,
    PRIMARY KEY (user_id, room_id)
);
";

/// A SQLite-backed storage.
///
/// Sync cursors and joined-room sets survive process restarts; a client that
/// reopens the same database resumes sync from the last committed cursor.
///
/// # Thread Safety
///
/// The connection is guarded by a mutex, so transactions from the sync loop
/// and from caller tasks are serialized.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{SqliteStorage, Storage};
///
/// let storage = SqliteStorage::open_in_memory().unwrap();
/// storage.set_next_batch("s1", "DEVICE").unwrap();
/// assert_eq!(storage.next_batch("DEVICE").unwrap().as_deref(), Some("s1"));
/// ```
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Opens (or creates) a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a transient in-memory SQLite database.
    ///
    /// Useful for tests that want real SQL semantics without a file.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// [`StorageTxn`] over a live SQLite transaction.
struct SqliteTxn<'a> {
    tx: &'a Transaction<'a>,
}

impl StorageTxn for SqliteTxn<'_> {
    fn set_next_batch(&mut self, next_batch: &str, device_id: &str) -> StorageResult<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO next_batch (device_id, next_batch) VALUES (?1, ?2)",
            params![device_id, next_batch],
        )?;
        Ok(())
    }

    fn next_batch(&mut self, device_id: &str) -> StorageResult<Option<String>> {
        let row = self
            .tx
            .query_row(
                "SELECT next_batch FROM next_batch WHERE device_id = ?1",
                params![device_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    fn add_joined_room(&mut self, room_id: &str, user_id: &str) -> StorageResult<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO joined_rooms (user_id, room_id) VALUES (?1, ?2)",
            params![user_id, room_id],
        )?;
        Ok(())
    }

    fn remove_joined_room(&mut self, room_id: &str, user_id: &str) -> StorageResult<()> {
        self.tx.execute(
            "DELETE FROM joined_rooms WHERE user_id = ?1 AND room_id = ?2",
            params![user_id, room_id],
        )?;
        Ok(())
    }

    fn joined_rooms(&mut self, user_id: &str) -> StorageResult<BTreeSet<String>> {
        let mut stmt = self
            .tx
            .prepare("SELECT room_id FROM joined_rooms WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;

        let mut rooms = BTreeSet::new();
        for room in rows {
            rooms.insert(room?);
        }
        Ok(rooms)
    }
}

impl Storage for SqliteStorage {
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StorageTxn) -> StorageResult<bool>,
    ) -> StorageResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let outcome = {
            let mut txn = SqliteTxn { tx: &tx };
            body(&mut txn)
        };

        match outcome {
            Ok(true) => {
                tx.commit()?;
                Ok(true)
            }
            Ok(false) => {
                tx.rollback()?;
                Ok(false)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_starts_empty() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(storage.next_batch("D1").unwrap(), None);
        assert!(storage.joined_rooms("@a:example.org").unwrap().is_empty());
    }

    #[test]
    fn cursor_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.set_next_batch("s1", "D1").unwrap();
        storage.set_next_batch("s2", "D1").unwrap();
        assert_eq!(storage.next_batch("D1").unwrap().as_deref(), Some("s2"));
        assert_eq!(storage.next_batch("D2").unwrap(), None);
    }

    #[test]
    fn join_and_leave_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.add_joined_room("!a:example.org", "@a:x").unwrap();
        storage.add_joined_room("!a:example.org", "@a:x").unwrap();
        storage.add_joined_room("!b:example.org", "@a:x").unwrap();

        let rooms = storage.joined_rooms("@a:x").unwrap();
        assert_eq!(rooms.len(), 2);

        storage.remove_joined_room("!a:example.org", "@a:x").unwrap();
        storage.remove_joined_room("!a:example.org", "@a:x").unwrap();
        let rooms = storage.joined_rooms("@a:x").unwrap();
        assert_eq!(rooms.len(), 1);
        assert!(rooms.contains("!b:example.org"));
    }

    #[test]
    fn rollback_discards_writes() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let committed = storage
            .transaction(&mut |txn| {
                txn.set_next_batch("s1", "D1")?;
                txn.add_joined_room("!a:example.org", "@a:x")?;
                Ok(false)
            })
            .unwrap();
        assert!(!committed);

        assert_eq!(storage.next_batch("D1").unwrap(), None);
        assert!(storage.joined_rooms("@a:x").unwrap().is_empty());
    }

    #[test]
    fn error_in_body_rolls_back() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let result = storage.transaction(&mut |txn| {
            txn.set_next_batch("s1", "D1")?;
            Err(crate::StorageError::Corrupted("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(storage.next_batch("D1").unwrap(), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .transaction(&mut |txn| {
                    txn.set_next_batch("s42", "D1")?;
                    txn.add_joined_room("!a:example.org", "@a:x")?;
                    Ok(true)
                })
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.next_batch("D1").unwrap().as_deref(), Some("s42"));
        assert!(storage
            .joined_rooms("@a:x")
            .unwrap()
            .contains("!a:example.org"));
    }
}
