//! # Tessera Storage
//!
//! Storage contract and backends for the Tessera chat client.
//!
//! This crate defines the durable state a client needs to resume
//! synchronization across restarts:
//!
//! - the sync cursor (`next_batch`), keyed by device id
//! - the set of joined rooms, keyed by user id
//!
//! ## Design Principles
//!
//! - All mutations go through a transaction; the transaction is the single
//!   point of mutual exclusion for a storage instance
//! - A transaction commits only when its body asks for it; errors roll back
//! - Backends must be `Send + Sync` so the sync loop and caller tasks can
//!   share one instance
//!
//! ## Available Backends
//!
//! - [`MemoryStorage`] - For testing and ephemeral clients
//! - [`SqliteStorage`] - For persistent storage backed by SQLite
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{MemoryStorage, Storage};
//!
//! let storage = MemoryStorage::new();
//! storage.add_joined_room("!abc:example.org", "@alice:example.org").unwrap();
//! let rooms = storage.joined_rooms("@alice:example.org").unwrap();
//! assert!(rooms.contains("!abc:example.org"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod sqlite;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use store::{Storage, StorageTxn};
