//! Single-file snapshot persistence.
//!
//! The latest snapshot is written atomically (temp file + rename, the same
//! pattern the teacher uses for its redb database swaps) so a crash mid-write
//! never leaves a half-written snapshot file behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use raft::eraftpb::Snapshot;

use crate::error::{OrdererError, Result};

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(SnapshotStore {
            path: dir.join("snapshot.bin"),
        })
    }

    /// Latest persisted snapshot, or an empty default if none exists yet.
    pub fn load(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            return Ok(Snapshot::default());
        }
        let data = std::fs::read(&self.path)?;
        if data.len() < 4 {
            return Err(OrdererError::Storage("snapshot file truncated".into()));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(body) != expected {
            return Err(OrdererError::Storage("snapshot CRC mismatch".into()));
        }
        let snapshot: Snapshot = protobuf::Message::parse_from_bytes(body)?;
        Ok(snapshot)
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let body = protobuf::Message::write_to_bytes(snapshot)?;
        let crc = crc32fast::hash(&body);

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(&body)?;
            tmp.write_all(&crc.to_le_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::eraftpb::SnapshotMetadata;
    use tempfile::TempDir;

    #[test]
    fn load_absent_returns_default() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.load().unwrap(), Snapshot::default());
    }

    #[test]
    fn round_trips_a_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let mut snap = Snapshot::default();
        let mut meta = SnapshotMetadata::default();
        meta.index = 42;
        meta.term = 3;
        snap.set_metadata(meta);
        snap.data = b"last-block-bytes".to_vec().into();

        store.save(&snap).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.get_metadata().index, 42);
        assert_eq!(loaded.data.as_ref(), b"last-block-bytes");
    }

    #[test]
    fn rejects_corrupted_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let snap = Snapshot::default();
        store.save(&snap).unwrap();

        let path = dir.path().join("snapshot.bin");
        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 1] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        assert!(store.load().is_err());
    }
}
