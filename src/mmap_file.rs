//! Shared memory-mapped file primitives: the 1 KiB [`FileHeader`] and
//! the growable [`MappedFile`] wrapper used by the atom store, the
//! quad index page files, and the write-ahead log.
//!
//! Growth uses the borrowed-handle discipline: readers clone the
//! current `Arc<MmapMut>` under a read lock held only long enough to
//! clone it, then work against that snapshot for as long as they need
//! — a concurrent `grow_to` swaps in a new `Arc` without invalidating
//! any snapshot already handed out.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use memmap2::MmapMut;
use parking_lot::RwLock;

pub const HEADER_SIZE: usize = 1024;
const CHECKSUM_COVERED: usize = 8 + 4 + 4 + 8 + 8 + 8;
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub format_version: u32,
    pub write_pos: u64,
    pub next_id: u64,
    pub live_count: u64,
}

impl FileHeader {
    pub fn new(magic: [u8; 8]) -> Self {
        Self {
            magic,
            format_version: FORMAT_VERSION,
            write_pos: HEADER_SIZE as u64,
            next_id: 0,
            live_count: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.write_pos.to_le_bytes());
        buf[24..32].copy_from_slice(&self.next_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.live_count.to_le_bytes());
        let checksum = checksum_of(&buf[0..CHECKSUM_COVERED]);
        buf[40..44].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated);
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let format_version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let write_pos = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let next_id = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let live_count = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let stored_checksum = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        let actual_checksum = checksum_of(&buf[0..CHECKSUM_COVERED]);
        if stored_checksum != actual_checksum {
            return Err(HeaderError::ChecksumMismatch {
                expected: stored_checksum,
                actual: actual_checksum,
            });
        }
        Ok(Self {
            magic,
            format_version,
            write_pos,
            next_id,
            live_count,
        })
    }

    pub fn verify_magic(&self, expected: &[u8; 8]) -> Result<(), HeaderError> {
        if &self.magic != expected {
            return Err(HeaderError::BadMagic(self.magic));
        }
        Ok(())
    }
}

pub fn checksum_of(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header buffer shorter than {HEADER_SIZE} bytes")]
    Truncated,
    #[error("header checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("unexpected magic bytes {0:?}")]
    BadMagic([u8; 8]),
}

/// One memory-mapped, growable file with a 1 KiB [`FileHeader`].
pub struct MappedFile {
    pub file: File,
    mmap: RwLock<Arc<MmapMut>>,
    len: AtomicU64,
}

impl MappedFile {
    pub fn open(path: &Path, magic: [u8; 8], initial_payload_len: u64) -> Result<Self, MappedFileError> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let min_len = HEADER_SIZE as u64 + initial_payload_len;
        if !exists || file.metadata()?.len() < min_len {
            file.set_len(min_len)?;
        }
        let len = file.metadata()?.len();

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if !exists {
            let header = FileHeader::new(magic);
            mmap[0..HEADER_SIZE].copy_from_slice(&header.encode());
            mmap.flush()?;
        } else {
            let header = FileHeader::decode(&mmap[0..HEADER_SIZE])?;
            header.verify_magic(&magic)?;
        }

        Ok(Self {
            file,
            mmap: RwLock::new(Arc::new(mmap)),
            len: AtomicU64::new(len),
        })
    }

    pub fn snapshot(&self) -> Arc<MmapMut> {
        Arc::clone(&self.mmap.read())
    }

    pub fn current_len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Grow the file (and remap) so it is at least `min_len` bytes.
    /// Callers must serialize growth themselves (e.g. via a grow
    /// mutex); concurrent `grow_to` calls on the same file are not
    /// safe.
    pub fn grow_to(&self, min_len: u64) -> Result<(), MappedFileError> {
        if self.current_len() >= min_len {
            return Ok(());
        }
        let new_len = min_len
            .max(self.current_len().saturating_mul(2))
            .max(HEADER_SIZE as u64 + 4096);
        self.file.set_len(new_len)?;
        let new_mmap = unsafe { MmapMut::map_mut(&self.file)? };
        *self.mmap.write() = Arc::new(new_mmap);
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    pub fn read_header(&self) -> Result<FileHeader, MappedFileError> {
        let snap = self.snapshot();
        Ok(FileHeader::decode(&snap[0..HEADER_SIZE])?)
    }

    pub fn write_header(&self, header: &FileHeader) -> Result<(), MappedFileError> {
        let snap = self.snapshot();
        // Safety: header bytes [0, HEADER_SIZE) are the last thing any
        // writer touches per flush, and readers re-decode on demand
        // rather than holding a stale parsed copy.
        unsafe {
            let ptr = snap.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(header.encode().as_ptr(), ptr, HEADER_SIZE);
        }
        Ok(())
    }

    /// Write `bytes` at `offset`. Caller must have grown the file past
    /// `offset + bytes.len()` and must own that byte range exclusively
    /// (no concurrent writer touches overlapping bytes).
    pub fn write_at(&self, offset: u64, bytes: &[u8]) {
        let snap = self.snapshot();
        let start = offset as usize;
        unsafe {
            let ptr = snap.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(start), bytes.len());
        }
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Vec<u8> {
        let snap = self.snapshot();
        let start = offset as usize;
        snap[start..start + len as usize].to_vec()
    }

    /// Raw pointer to the byte at `offset` in the current mapping,
    /// valid only for the lifetime of `snap`. Used by callers (the
    /// atom store's hash table) that need atomic CAS access to a
    /// single aligned word rather than a plain copy.
    pub fn atomic_u64_at(&self, offset: u64) -> (Arc<MmapMut>, *const std::sync::atomic::AtomicU64) {
        let snap = self.snapshot();
        let ptr = snap.as_ptr() as *const u8;
        let atomic_ptr = unsafe { ptr.add(offset as usize) as *const std::sync::atomic::AtomicU64 };
        (snap, atomic_ptr)
    }

    pub fn zero_range(&self, offset: u64, len: u64) {
        let snap = self.snapshot();
        let ptr = snap.as_ptr() as *mut u8;
        unsafe {
            std::ptr::write_bytes(ptr.add(offset as usize), 0, len as usize);
        }
    }

    pub fn flush(&self) -> Result<(), MappedFileError> {
        self.snapshot().flush()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappedFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header error: {0}")]
    Header(#[from] HeaderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut h = FileHeader::new(*b"MRCYTEST");
        h.write_pos = 12345;
        h.next_id = 42;
        h.live_count = 10;
        let encoded = h.encode();
        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let h = FileHeader::new(*b"MRCYTEST");
        let mut encoded = h.encode();
        encoded[16] ^= 0xFF;
        let err = FileHeader::decode(&encoded).unwrap_err();
        assert!(matches!(err, HeaderError::ChecksumMismatch { .. }));
    }
}
