//! Storage facade (C1): WAL + snapshot file + in-memory Raft log.

use std::path::Path;

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, Storage as RaftStorageTrait};

use crate::error::{OrdererError, Result};

use super::snapshot_store::SnapshotStore;
use super::wal::{Wal, WalRecord};

pub struct StorageFacade {
    wal: Wal,
    snapshot_store: SnapshotStore,
    mem: MemStorage,
    latest_snapshot: Snapshot,
    catch_up_entries: u64,
}

impl StorageFacade {
    /// Replay the WAL into `mem` and load the latest snapshot file, if any.
    /// `fresh` is true iff the WAL directory held no records.
    pub fn create(
        wal_dir: &Path,
        snap_dir: &Path,
        mem: MemStorage,
        catch_up_entries: u64,
    ) -> Result<(Self, bool)> {
        let (wal, records) = Wal::open(wal_dir)?;
        let fresh = records.is_empty();

        let snapshot_store = SnapshotStore::open(snap_dir)?;
        let latest_snapshot = snapshot_store.load()?;

        if latest_snapshot.get_metadata().index > 0 {
            mem.wl()
                .apply_snapshot(latest_snapshot.clone())
                .map_err(|e| OrdererError::Storage(e.to_string()))?;
        }

        for record in records {
            if let Some(hs_bytes) = record.hard_state {
                let hs: HardState = protobuf::Message::parse_from_bytes(&hs_bytes)?;
                mem.wl().set_hardstate(hs);
            }
            if !record.entries.is_empty() {
                let entries: Vec<Entry> = record
                    .entries
                    .iter()
                    .map(|b| protobuf::Message::parse_from_bytes(b))
                    .collect::<std::result::Result<_, _>>()?;
                mem.wl()
                    .append(&entries)
                    .map_err(|e| OrdererError::Storage(e.to_string()))?;
            }
        }

        Ok((
            StorageFacade {
                wal,
                snapshot_store,
                mem,
                latest_snapshot,
                catch_up_entries,
            },
            fresh,
        ))
    }

    /// A clone of the shared in-memory storage handle, for wiring into
    /// `raft::RawNode`. Cheap: `MemStorage` is `Arc`-backed internally.
    pub fn mem_storage(&self) -> MemStorage {
        self.mem.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.latest_snapshot.clone()
    }

    /// Append entries (and optionally a hard-state update) to the WAL,
    /// fsync, then apply the same update to the in-memory log. The WAL
    /// write — and its fsync — happen before `mem` is mutated, so
    /// durability precedes acknowledgement to Raft.
    pub fn save_entries(&mut self, hard_state: Option<HardState>, entries: &[Entry]) -> Result<()> {
        let encoded_entries = entries
            .iter()
            .map(|e| protobuf::Message::write_to_bytes(e).map_err(OrdererError::from))
            .collect::<Result<Vec<_>>>()?;
        let encoded_hs = hard_state
            .as_ref()
            .map(protobuf::Message::write_to_bytes)
            .transpose()?;

        self.wal.append(&WalRecord {
            hard_state: encoded_hs,
            entries: encoded_entries,
        })?;

        if !entries.is_empty() {
            self.mem
                .wl()
                .append(entries)
                .map_err(|e| OrdererError::Storage(e.to_string()))?;
        }
        if let Some(hs) = hard_state {
            self.mem.wl().set_hardstate(hs);
        }
        Ok(())
    }

    /// Apply a snapshot received from the leader (via `Ready::snapshot()`):
    /// persist it to the snapshot file, then apply it to the in-memory log.
    /// Resets the WAL, since everything it held predates the snapshot.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.snapshot_store.save(&snapshot)?;
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(|e| OrdererError::Storage(e.to_string()))?;
        self.wal.reset()?;
        self.latest_snapshot = snapshot;
        Ok(())
    }

    /// Atomically persist a snapshot and compact prior log entries,
    /// retaining at least `catch_up_entries` past the snapshot index so
    /// slow followers can catch up in-band.
    pub fn take_snapshot(&mut self, index: u64, conf_state: ConfState, data: Vec<u8>) -> Result<()> {
        let term = RaftStorageTrait::term(&self.mem, index)
            .map_err(|e| OrdererError::Storage(e.to_string()))?;

        let mut snapshot = Snapshot::default();
        let mut meta = raft::eraftpb::SnapshotMetadata::default();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(conf_state);
        snapshot.set_metadata(meta);
        snapshot.data = data.into();

        self.snapshot_store.save(&snapshot)?;

        let retain_from = index.saturating_sub(self.catch_up_entries).max(1);
        let retained_entries = if retain_from < index {
            RaftStorageTrait::entries(&self.mem, retain_from, index + 1, None, GetEntriesContext::empty(false))
                .map_err(|e| OrdererError::Storage(e.to_string()))?
        } else {
            Vec::new()
        };

        self.mem
            .wl()
            .compact(retain_from)
            .map_err(|e| OrdererError::Storage(e.to_string()))?;

        self.wal.reset()?;
        if !retained_entries.is_empty() {
            let encoded = retained_entries
                .iter()
                .map(|e| protobuf::Message::write_to_bytes(e).map_err(OrdererError::from))
                .collect::<Result<Vec<_>>>()?;
            self.wal.append(&WalRecord {
                hard_state: None,
                entries: encoded,
            })?;
        }

        self.latest_snapshot = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::eraftpb::Entry;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = format!("d{index}").into_bytes().into();
        e
    }

    #[test]
    fn fresh_on_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let (_facade, fresh) = StorageFacade::create(
            &dir.path().join("wal"),
            &dir.path().join("snap"),
            MemStorage::new(),
            500,
        )
        .unwrap();
        assert!(fresh);
    }

    #[test]
    fn restart_replays_entries() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let snap_dir = dir.path().join("snap");

        {
            let (mut facade, fresh) =
                StorageFacade::create(&wal_dir, &snap_dir, MemStorage::new(), 500).unwrap();
            assert!(fresh);
            facade.save_entries(None, &[entry(1, 1), entry(2, 1)]).unwrap();
        }

        let (facade2, fresh2) =
            StorageFacade::create(&wal_dir, &snap_dir, MemStorage::new(), 500).unwrap();
        assert!(!fresh2);
        let entries = RaftStorageTrait::entries(
            &facade2.mem_storage(),
            1,
            3,
            None,
            GetEntriesContext::empty(false),
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn take_snapshot_compacts_and_persists() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let snap_dir = dir.path().join("snap");

        let (mut facade, _) =
            StorageFacade::create(&wal_dir, &snap_dir, MemStorage::new(), 1).unwrap();
        let entries: Vec<Entry> = (1..=10).map(|i| entry(i, 1)).collect();
        facade.save_entries(None, &entries).unwrap();

        facade.take_snapshot(8, ConfState::default(), b"block-8".to_vec()).unwrap();

        assert_eq!(facade.snapshot().get_metadata().index, 8);
        let first = RaftStorageTrait::first_index(&facade.mem_storage()).unwrap();
        assert!(first <= 8 && first >= 7);
    }
}
