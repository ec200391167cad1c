//! Write-ahead log for Raft hard-state and entries.
//!
//! Grounded on the teacher's WAL engine: a `parking_lot`-guarded writer
//! appending CRC-framed records, with crash recovery performed once at
//! open time.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{OrdererError, Result};

use super::segment::{self, WalFile};

/// One WAL record: an optional hard-state update plus zero or more log
/// entries, both still `protobuf`-encoded (the `eraftpb` types do not
/// implement `serde::Serialize`, so we carry them as opaque bytes and only
/// decode them at replay time via `protobuf::Message::parse_from_bytes`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalRecord {
    pub hard_state: Option<Vec<u8>>,
    pub entries: Vec<Vec<u8>>,
}

struct WalInner {
    file: WalFile,
    next_seq: u64,
}

pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open the WAL at `dir/wal.bin`, recovering from any trailing
    /// corruption and replaying valid records in order.
    pub fn open(dir: &Path) -> Result<(Self, Vec<WalRecord>)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("wal.bin");

        let recovery = segment::recover(&path)
            .map_err(|e| OrdererError::Fatal(format!("WAL recovery failed: {e}")))?;
        if recovery.truncated_bytes > 0 {
            tracing::warn!(
                bytes = recovery.truncated_bytes,
                "wal.recovery.truncated_corrupt_tail"
            );
        }

        let raw_records = segment::read_all(&path)
            .map_err(|e| OrdererError::Fatal(format!("WAL replay failed: {e}")))?;
        let mut records = Vec::with_capacity(raw_records.len());
        for raw in &raw_records {
            let record: WalRecord = bincode::deserialize(&raw.payload)?;
            records.push(record);
        }

        let file = WalFile::open(&path)
            .map_err(|e| OrdererError::Fatal(format!("failed to open WAL: {e}")))?;
        let next_seq = recovery.last_seq + 1;

        Ok((
            Wal {
                path,
                inner: Mutex::new(WalInner { file, next_seq }),
            },
            records,
        ))
    }

    /// Append a record and fsync before returning, so durability precedes
    /// acknowledgement to Raft.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner
            .file
            .append(seq, &payload)
            .map_err(|e| OrdererError::Storage(e.to_string()))?;
        inner
            .file
            .sync()
            .map_err(|e| OrdererError::Storage(e.to_string()))?;
        inner.next_seq += 1;
        Ok(())
    }

    /// Reset the WAL to empty. Called after a snapshot makes every prior
    /// record redundant — the snapshot file now owns that history.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        std::fs::remove_file(&self.path).ok();
        inner.file = WalFile::open(&self.path)
            .map_err(|e| OrdererError::Storage(format!("failed to reset WAL: {e}")))?;
        inner.next_seq = 1;
        Ok(())
    }
}
