//! Property tests for the storage contract.
//!
//! Both backends must agree with a plain set model for any sequence of
//! join/leave operations, including repeated joins and leaves of rooms that
//! are already in (or absent from) the set.

use std::collections::BTreeSet;

use proptest::prelude::*;
use tessera_storage::{MemoryStorage, SqliteStorage, Storage};

const USER: &str = "@alice:example.org";

#[derive(Debug, Clone)]
enum RoomOp {
    Join(u8),
    Leave(u8),
}

fn room_id(n: u8) -> String {
    format!("!room{n}:example.org")
}

fn op_strategy() -> impl Strategy<Value = RoomOp> {
    prop_oneof![
        (0u8..8).prop_map(RoomOp::Join),
        (0u8..8).prop_map(RoomOp::Leave),
    ]
}

fn apply_ops(storage: &dyn Storage, ops: &[RoomOp]) -> BTreeSet<String> {
    let mut model = BTreeSet::new();
    for op in ops {
        match op {
            RoomOp::Join(n) => {
                storage.add_joined_room(&room_id(*n), USER).unwrap();
                model.insert(room_id(*n));
            }
            RoomOp::Leave(n) => {
                storage.remove_joined_room(&room_id(*n), USER).unwrap();
                model.remove(&room_id(*n));
            }
        }
    }
    model
}

proptest! {
    #[test]
    fn memory_matches_set_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let storage = MemoryStorage::new();
        let model = apply_ops(&storage, &ops);
        prop_assert_eq!(storage.joined_rooms(USER).unwrap(), model);
    }

    #[test]
    fn sqlite_matches_set_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let model = apply_ops(&storage, &ops);
        prop_assert_eq!(storage.joined_rooms(USER).unwrap(), model);
    }
}
