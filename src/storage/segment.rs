//! On-disk record framing for the WAL file.
//!
//! Record layout: `seq:u64 | payload_len:u32 | payload | crc32:u32`. The
//! file begins with a `MAGIC | VERSION` header. This mirrors the teacher's
//! WAL segment format (CRC-framed records, truncate-on-corruption recovery)
//! collapsed to a single non-rotating file, since a single Raft channel's
//! log does not need the multi-segment/multi-tenant layout the teacher
//! built for its zone storage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"OCWL";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 8;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported version: {0}")]
    BadVersion(u32),
    #[error("CRC mismatch at seq {seq}")]
    CrcMismatch { seq: u64 },
    #[error("truncated record at offset {0}")]
    TruncatedRecord(u64),
}

pub struct Record {
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Record {
    /// Total bytes this record occupies on disk (header fields + payload + crc).
    pub fn wire_size(&self) -> u64 {
        8 + 4 + self.payload.len() as u64 + 4
    }
}

fn compute_crc(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

pub struct WalFile {
    file: File,
}

impl WalFile {
    /// Open (creating if absent) the WAL file, writing the header if new.
    pub fn open(path: &Path) -> Result<Self, SegmentError> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        if !existed || file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.write_all(&VERSION.to_le_bytes())?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            let mut reader = File::open(path)?;
            reader.read_exact(&mut header)?;
            if &header[0..4] != MAGIC {
                return Err(SegmentError::BadMagic);
            }
            let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if version != VERSION {
                return Err(SegmentError::BadVersion(version));
            }
        }

        Ok(WalFile { file })
    }

    pub fn append(&mut self, seq: u64, payload: &[u8]) -> Result<(), SegmentError> {
        let crc = compute_crc(seq, payload);
        self.file.write_all(&seq.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), SegmentError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read every valid record in `path`, in order. Used for WAL replay at
/// startup; assumes `recover` has already truncated any trailing garbage.
pub fn read_all(path: &Path) -> Result<Vec<Record>, SegmentError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(SeekFrom::Start(HEADER_SIZE))?;

    let mut records = Vec::new();
    loop {
        match read_one(&mut reader) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

fn read_one<R: Read>(reader: &mut R) -> Result<Option<Record>, SegmentError> {
    let mut seq_buf = [0u8; 8];
    match reader.read_exact(&mut seq_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let seq = u64::from_le_bytes(seq_buf);

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(|_| SegmentError::TruncatedRecord(seq))?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|_| SegmentError::TruncatedRecord(seq))?;

    let mut crc_buf = [0u8; 4];
    reader
        .read_exact(&mut crc_buf)
        .map_err(|_| SegmentError::TruncatedRecord(seq))?;
    let crc = u32::from_le_bytes(crc_buf);

    if crc != compute_crc(seq, &payload) {
        return Err(SegmentError::CrcMismatch { seq });
    }

    Ok(Some(Record { seq, payload }))
}

/// Crash recovery: validate every record's CRC in order and truncate the
/// file at the first corruption or incomplete record.
pub fn recover(path: &Path) -> Result<RecoveryResult, SegmentError> {
    if !path.exists() {
        return Ok(RecoveryResult::default());
    }

    let mut reader = BufReader::new(File::open(path)?);
    reader.seek(SeekFrom::Start(HEADER_SIZE))?;

    let mut valid_records = 0u64;
    let mut last_seq = 0u64;
    let mut offset = HEADER_SIZE;

    loop {
        match read_one(&mut reader) {
            Ok(Some(record)) => {
                offset += record.wire_size();
                last_seq = record.seq;
                valid_records += 1;
            }
            Ok(None) => break,
            Err(SegmentError::CrcMismatch { .. } | SegmentError::TruncatedRecord(_)) => {
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let file_len = fs::metadata(path)?.len();
    let truncated_bytes = file_len.saturating_sub(offset);
    if truncated_bytes > 0 {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset)?;
        file.sync_all()?;
    }

    Ok(RecoveryResult {
        valid_records,
        truncated_bytes,
        last_seq,
    })
}

#[derive(Debug, Default)]
pub struct RecoveryResult {
    pub valid_records: u64,
    pub truncated_bytes: u64,
    pub last_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.bin");
        {
            let mut w = WalFile::open(&path).unwrap();
            w.append(1, b"a").unwrap();
            w.append(2, b"bb").unwrap();
            w.sync().unwrap();
        }

        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[1].payload, b"bb");
    }

    #[test]
    fn recover_clean_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.bin");
        {
            let mut w = WalFile::open(&path).unwrap();
            for i in 1..=5u64 {
                w.append(i, format!("p{i}").as_bytes()).unwrap();
            }
            w.sync().unwrap();
        }

        let result = recover(&path).unwrap();
        assert_eq!(result.valid_records, 5);
        assert_eq!(result.truncated_bytes, 0);
        assert_eq!(result.last_seq, 5);
    }

    #[test]
    fn recover_truncates_corrupted_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.bin");
        let valid_len;
        {
            let mut w = WalFile::open(&path).unwrap();
            w.append(1, b"good").unwrap();
            w.sync().unwrap();
            valid_len = fs::metadata(&path).unwrap().len();
            w.append(2, b"will-be-corrupt").unwrap();
            w.sync().unwrap();
        }

        // Corrupt the CRC of the last record (final 4 bytes).
        let mut data = fs::read(&path).unwrap();
        let n = data.len();
        data[n - 1] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let result = recover(&path).unwrap();
        assert_eq!(result.valid_records, 1);
        assert!(result.truncated_bytes > 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn recover_empty_directory_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");
        let result = recover(&path).unwrap();
        assert_eq!(result.valid_records, 0);
    }
}
