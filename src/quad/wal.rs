//! Write-ahead log for quad store durability.
//!
//! Every write transaction is appended here before it is applied to
//! the atom store or quad indexes. On crash recovery, [`Wal::replay`]
//! hands each committed entry back to the caller in sequence order so
//! it can be reapplied.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::atom::AtomId;
use crate::quad::types::TransactionId;

/// One logical write operation recorded in the WAL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WalEntry {
    InternAtom {
        id: AtomId,
        bytes: Vec<u8>,
    },
    InsertQuad {
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        valid_from: Option<i64>,
        valid_until: Option<i64>,
    },
    DeleteQuad {
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
    },
    /// Marks that everything before `upto_sequence` has been applied
    /// and flushed to the atom/index files; replay can skip it.
    Checkpoint { upto_sequence: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalRecord {
    sequence: u64,
    tx: TransactionId,
    entry: WalEntry,
    checksum: u32,
}

impl WalRecord {
    fn new(sequence: u64, tx: TransactionId, entry: WalEntry) -> Self {
        let payload = bincode::serialize(&entry).expect("WalEntry always serializes");
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        Self {
            sequence,
            tx,
            entry,
            checksum: hasher.finalize(),
        }
    }

    fn verify(&self) -> bool {
        let payload = bincode::serialize(&self.entry).unwrap_or_default();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        hasher.finalize() == self.checksum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every append. Slowest, strongest durability.
    Always,
    /// Rely on OS page cache flush timing; `fsync` only on `flush()`.
    Batched,
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("WAL record at sequence {0} failed checksum verification")]
    ChecksumMismatch(u64),
}

pub type WalResult<T> = Result<T, WalError>;

/// One open segment file plus sequence-number bookkeeping.
pub struct Wal {
    dir: PathBuf,
    current_file: Option<BufWriter<File>>,
    sequence: u64,
    sync_mode: SyncMode,
}

impl Wal {
    pub fn open(dir: impl AsRef<Path>) -> WalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let sequence = find_latest_sequence(&dir)?;
        info!(sequence, ?dir, "opened write-ahead log");
        Ok(Self {
            dir,
            current_file: None,
            sequence,
            sync_mode: SyncMode::Batched,
        })
    }

    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        self.sync_mode = mode;
    }

    fn ensure_open_file(&mut self) -> WalResult<&mut BufWriter<File>> {
        if self.current_file.is_none() {
            self.open_new_segment()?;
        }
        Ok(self.current_file.as_mut().unwrap())
    }

    fn open_new_segment(&mut self) -> WalResult<()> {
        let path = self.dir.join(format!("wal-{:016x}.log", self.sequence + 1));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        debug!(path = %path.display(), "opened new WAL segment");
        self.current_file = Some(BufWriter::new(file));
        Ok(())
    }

    /// Append one entry for transaction `tx`, returning its sequence
    /// number.
    pub fn append(&mut self, tx: TransactionId, entry: WalEntry) -> WalResult<u64> {
        self.sequence += 1;
        let sequence = self.sequence;
        let record = WalRecord::new(sequence, tx, entry);
        let bytes = bincode::serialize(&record)?;

        let writer = self.ensure_open_file()?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;

        if self.sync_mode == SyncMode::Always {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(sequence)
    }

    pub fn flush(&mut self) -> WalResult<()> {
        if let Some(writer) = self.current_file.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replay every record after `since_sequence`, in order, invoking
    /// `apply` for each. Records that fail checksum verification abort
    /// replay — the log is assumed truncated by a crash mid-write and
    /// everything after the bad record is unrecoverable tail, which is
    /// the expected outcome of a torn write.
    pub fn replay(
        &self,
        since_sequence: u64,
        mut apply: impl FnMut(TransactionId, WalEntry) -> WalResult<()>,
    ) -> WalResult<u64> {
        let mut last_applied = since_sequence;
        for path in get_wal_files(&self.dir)? {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            loop {
                let mut len_buf = [0u8; 4];
                if reader.read_exact(&mut len_buf).is_err() {
                    break;
                }
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                if reader.read_exact(&mut payload).is_err() {
                    warn!(path = %path.display(), "WAL segment ends mid-record, stopping replay");
                    break;
                }
                let record: WalRecord = match bincode::deserialize(&payload) {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(path = %path.display(), "undeserializable WAL record, stopping replay");
                        break;
                    }
                };
                if !record.verify() {
                    return Err(WalError::ChecksumMismatch(record.sequence));
                }
                if record.sequence <= since_sequence {
                    continue;
                }
                if let WalEntry::Checkpoint { .. } = &record.entry {
                    last_applied = record.sequence;
                    continue;
                }
                apply(record.tx, record.entry)?;
                last_applied = record.sequence;
            }
        }
        info!(last_applied, "WAL replay complete");
        Ok(last_applied)
    }

    /// Record a checkpoint marker, then truncate the WAL to the last
    /// safe point by removing every segment file. Callers should have
    /// already flushed the atom store and quad indexes to disk before
    /// calling this, since everything in the removed segments is
    /// assumed durable there already.
    pub fn checkpoint(&mut self) -> WalResult<()> {
        self.append(0, WalEntry::Checkpoint { upto_sequence: self.sequence })?;
        self.flush()?;
        self.current_file = None;
        for path in get_wal_files(&self.dir)? {
            std::fs::remove_file(&path)?;
        }
        info!(sequence = self.sequence, "WAL checkpoint complete, segments truncated");
        Ok(())
    }
}

fn find_latest_sequence(dir: &Path) -> WalResult<u64> {
    let mut max_sequence = 0;
    for path in get_wal_files(dir)? {
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        loop {
            let mut len_buf = [0u8; 4];
            if reader.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }
            if let Ok(record) = bincode::deserialize::<WalRecord>(&payload) {
                max_sequence = max_sequence.max(record.sequence);
            }
        }
    }
    Ok(max_sequence)
}

fn get_wal_files(dir: &Path) -> WalResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("wal-") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();

        wal.append(1, WalEntry::InternAtom { id: 0, bytes: b"<a>".to_vec() })
            .unwrap();
        wal.append(
            1,
            WalEntry::InsertQuad {
                graph: 0,
                subject: 0,
                predicate: 1,
                object: 2,
                valid_from: None,
                valid_until: None,
            },
        )
        .unwrap();
        wal.flush().unwrap();

        let mut applied = Vec::new();
        wal.replay(0, |tx, entry| {
            applied.push((tx, entry));
            Ok(())
        })
        .unwrap();

        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_replay_skips_before_since_sequence() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.append(1, WalEntry::InternAtom { id: 0, bytes: b"<a>".to_vec() }).unwrap();
        let second_seq = wal
            .append(1, WalEntry::InternAtom { id: 1, bytes: b"<b>".to_vec() })
            .unwrap();
        wal.flush().unwrap();

        let mut applied = Vec::new();
        wal.replay(second_seq - 1, |tx, entry| {
            applied.push((tx, entry));
            Ok(())
        })
        .unwrap();
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn test_checkpoint_truncates_segments() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.append(1, WalEntry::InternAtom { id: 0, bytes: b"<a>".to_vec() }).unwrap();
        wal.checkpoint().unwrap();
        assert!(get_wal_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let last_seq;
        {
            let mut wal = Wal::open(dir.path()).unwrap();
            wal.append(1, WalEntry::InternAtom { id: 0, bytes: b"<a>".to_vec() }).unwrap();
            last_seq = wal.append(1, WalEntry::InternAtom { id: 1, bytes: b"<b>".to_vec() }).unwrap();
            wal.flush().unwrap();
        }
        {
            let mut wal = Wal::open(dir.path()).unwrap();
            let next_seq = wal
                .append(2, WalEntry::InternAtom { id: 2, bytes: b"<c>".to_vec() })
                .unwrap();
            assert_eq!(next_seq, last_seq + 1);
        }
    }

    #[test]
    fn test_replay_after_checkpoint_sees_only_new_entries() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(dir.path()).unwrap();
        wal.append(1, WalEntry::InternAtom { id: 0, bytes: b"<a>".to_vec() }).unwrap();
        wal.checkpoint().unwrap();
        wal.append(2, WalEntry::InternAtom { id: 1, bytes: b"<b>".to_vec() }).unwrap();
        wal.flush().unwrap();

        let mut applied = Vec::new();
        wal.replay(0, |tx, entry| {
            applied.push((tx, entry));
            Ok(())
        })
        .unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, 2);
    }
}
