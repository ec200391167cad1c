//! Storage facade (C1): WAL + snapshot file + in-memory Raft log.

mod facade;
mod segment;
mod snapshot_store;
mod wal;

pub use facade::StorageFacade;
pub use snapshot_store::SnapshotStore;
pub use wal::{Wal, WalRecord};
