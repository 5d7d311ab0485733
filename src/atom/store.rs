//! The atom store implementation: three memory-mapped files plus a
//! lock-free interning path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::Hasher;

use crate::mmap_file::{FileHeader, MappedFile, MappedFileError, HEADER_SIZE};

/// A dense, stable identifier for one interned RDF term.
///
/// Atom ids are never reused; deleting the last quad referencing an
/// atom does not free its id or its bytes. Compaction of the quad
/// indexes does not touch the atom store.
pub type AtomId = u64;

const DATA_MAGIC: [u8; 8] = *b"MRCYDATA";
const HASH_MAGIC: [u8; 8] = *b"MRCYHASH";
const OFFS_MAGIC: [u8; 8] = *b"MRCYOFFS";

const HASH_SLOT_SIZE: u64 = 8;
const OFFSET_ENTRY_SIZE: u64 = 16; // offset: u64, length: u32, pad: u32
const QUADRATIC_PROBE_LIMIT: u64 = 64;

#[derive(Debug, thiserror::Error)]
pub enum AtomError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mapped file error: {0}")]
    MappedFile(#[from] MappedFileError),
    #[error("hash table exhausted all probe slots for this insert")]
    HashTableFull,
    #[error("atom id {0} does not exist in this store")]
    UnknownAtom(AtomId),
    #[error("atom store directory {0} could not be created")]
    DirectoryCreation(PathBuf),
}

pub type AtomResult<T> = Result<T, AtomError>;

/// Tunables for an [`AtomStore`]. All fields have sane defaults; pass
/// [`AtomStoreOptions::default`] unless a caller has a specific reason
/// to deviate (e.g. tests that want to exercise hash growth on a tiny
/// table).
#[derive(Debug, Clone)]
pub struct AtomStoreOptions {
    /// Initial number of hash table slots. Rounded up to a power of two.
    pub initial_hash_slots: u64,
    /// Load factor (entries / slots) above which the hash table doubles.
    pub max_load_factor: f64,
}

impl Default for AtomStoreOptions {
    fn default() -> Self {
        Self {
            initial_hash_slots: 4096,
            max_load_factor: 0.7,
        }
    }
}

/// Interns RDF term byte forms to dense [`AtomId`]s.
///
/// Cloning an `AtomStore` is not supported; share it behind an `Arc`.
/// Every method takes `&self` — concurrency is internal (lock-free
/// interning plus a short-held growth lock), matching the "many
/// concurrent readers, serialized structural growth" discipline used
/// by the rest of the storage layer.
pub struct AtomStore {
    data: MappedFile,
    offsets: MappedFile,
    hash: MappedFile,
    next_atom_id: AtomicU64,
    data_write_pos: AtomicU64,
    hash_slots: AtomicU64,
    grow_lock: Mutex<()>,
    live_count: AtomicU64,
    options: AtomStoreOptions,
}

impl AtomStore {
    /// Open (creating if absent) the three atom store files under `dir`.
    pub fn open(dir: impl AsRef<Path>, options: AtomStoreOptions) -> AtomResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|_| AtomError::DirectoryCreation(dir.to_path_buf()))?;

        let hash_slots_initial = options.initial_hash_slots.next_power_of_two();

        let data = MappedFile::open(&dir.join("atoms.data"), DATA_MAGIC, 1 << 20)?;
        let offsets = MappedFile::open(
            &dir.join("atoms.offsets"),
            OFFS_MAGIC,
            OFFSET_ENTRY_SIZE * 4096,
        )?;
        let hash = MappedFile::open(
            &dir.join("atoms.hash"),
            HASH_MAGIC,
            HASH_SLOT_SIZE * hash_slots_initial,
        )?;

        let data_header = data.read_header()?;
        let offsets_header = offsets.read_header()?;

        let next_atom_id = offsets_header.next_id;
        let data_write_pos = data_header.write_pos.max(HEADER_SIZE as u64);
        let live_count = offsets_header.live_count;

        let existing_slots = (hash.current_len() - HEADER_SIZE as u64) / HASH_SLOT_SIZE;
        let hash_slots = existing_slots.max(hash_slots_initial).next_power_of_two();
        if hash.current_len() < HEADER_SIZE as u64 + hash_slots * HASH_SLOT_SIZE {
            hash.grow_to(HEADER_SIZE as u64 + hash_slots * HASH_SLOT_SIZE)?;
        }

        Ok(Self {
            data,
            offsets,
            hash,
            next_atom_id: AtomicU64::new(next_atom_id),
            data_write_pos: AtomicU64::new(data_write_pos),
            hash_slots: AtomicU64::new(hash_slots),
            grow_lock: Mutex::new(()),
            live_count: AtomicU64::new(live_count),
            options,
        })
    }

    /// Number of distinct atoms interned so far.
    pub fn len(&self) -> u64 {
        self.next_atom_id.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intern `bytes`, returning the existing [`AtomId`] if already
    /// present, or assigning and returning a new one.
    pub fn intern(&self, bytes: &[u8]) -> AtomResult<AtomId> {
        self.maybe_grow_hash_table()?;

        let hash = hash_bytes(bytes);
        let slots = self.hash_slots.load(Ordering::Acquire);
        let mut reserved: Option<AtomId> = None;

        for probe in 0..slots {
            let slot_index = probe_index(hash, probe, slots);
            let slot_val = self.read_hash_slot(slot_index);

            if slot_val == 0 {
                let candidate = match reserved {
                    Some(id) => id,
                    None => {
                        let id = self.append_new_atom(bytes)?;
                        reserved = Some(id);
                        id
                    }
                };
                match self.cas_hash_slot(slot_index, 0, candidate + 1) {
                    Ok(()) => return Ok(candidate),
                    Err(actual) if actual != 0 => {
                        let existing_id = actual - 1;
                        if self.atom_bytes(existing_id)? == bytes {
                            return Ok(existing_id);
                        }
                        // Lost the race for this slot to an unrelated
                        // atom; keep probing. `reserved` (if any) is
                        // wasted data-log space, reclaimed only by a
                        // future compaction pass.
                        continue;
                    }
                    Err(_) => continue,
                }
            } else {
                let existing_id = slot_val - 1;
                if self.atom_bytes(existing_id)? == bytes {
                    return Ok(existing_id);
                }
            }
        }

        Err(AtomError::HashTableFull)
    }

    /// Look up an atom's id without interning it if absent.
    pub fn lookup(&self, bytes: &[u8]) -> AtomResult<Option<AtomId>> {
        let hash = hash_bytes(bytes);
        let slots = self.hash_slots.load(Ordering::Acquire);

        for probe in 0..slots {
            let slot_index = probe_index(hash, probe, slots);
            let slot_val = self.read_hash_slot(slot_index);
            if slot_val == 0 {
                return Ok(None);
            }
            let existing_id = slot_val - 1;
            if self.atom_bytes(existing_id)? == bytes {
                return Ok(Some(existing_id));
            }
        }
        Ok(None)
    }

    /// Fetch the interned bytes for `id`.
    pub fn atom_bytes(&self, id: AtomId) -> AtomResult<Vec<u8>> {
        if id >= self.next_atom_id.load(Ordering::Acquire) {
            return Err(AtomError::UnknownAtom(id));
        }
        let entry_offset = HEADER_SIZE as u64 + id * OFFSET_ENTRY_SIZE;
        let entry = self.offsets.read_at(entry_offset, OFFSET_ENTRY_SIZE);
        let offset = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let length = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64;
        // Data log stores a 4-byte length prefix ahead of the payload
        // for independent recovery; skip it here since the offsets
        // file is the authoritative source for length.
        Ok(self.data.read_at(offset + 4, length))
    }

    fn append_new_atom(&self, bytes: &[u8]) -> AtomResult<AtomId> {
        let padded_len = bytes.len() as u64 + 4;
        let data_offset = self.reserve_data_range(padded_len)?;
        let mut framed = Vec::with_capacity(padded_len as usize);
        framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        framed.extend_from_slice(bytes);
        self.data.write_at(data_offset, &framed);

        let id = self.next_atom_id.fetch_add(1, Ordering::AcqRel);
        let entry_offset = HEADER_SIZE as u64 + id * OFFSET_ENTRY_SIZE;
        self.offsets
            .grow_to(entry_offset + OFFSET_ENTRY_SIZE + OFFSET_ENTRY_SIZE * 1024)?;

        let mut entry = [0u8; OFFSET_ENTRY_SIZE as usize];
        entry[0..8].copy_from_slice(&data_offset.to_le_bytes());
        entry[8..12].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.offsets.write_at(entry_offset, &entry);

        self.live_count.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    fn reserve_data_range(&self, len: u64) -> AtomResult<u64> {
        loop {
            let current = self.data_write_pos.load(Ordering::Acquire);
            let next = current + len;
            if next > self.data.current_len() {
                self.data.grow_to(next + (1 << 20))?;
            }
            if self
                .data_write_pos
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    fn read_hash_slot(&self, slot_index: u64) -> u64 {
        let offset = HEADER_SIZE as u64 + slot_index * HASH_SLOT_SIZE;
        let bytes = self.hash.read_at(offset, HASH_SLOT_SIZE);
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Compare-and-swap one hash slot. Returns `Ok(())` on success, or
    /// `Err(actual_value)` if the slot no longer held `expected`.
    fn cas_hash_slot(&self, slot_index: u64, expected: u64, new_value: u64) -> Result<(), u64> {
        let offset = HEADER_SIZE as u64 + slot_index * HASH_SLOT_SIZE;
        let (_snap, atomic_ptr) = self.hash.atomic_u64_at(offset);
        // Safety: `_snap` keeps the mapping alive for the duration of
        // this call; the offset is 8-byte aligned because HEADER_SIZE
        // and HASH_SLOT_SIZE are both multiples of 8.
        let atomic = unsafe { &*atomic_ptr };
        atomic
            .compare_exchange(expected, new_value, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    fn maybe_grow_hash_table(&self) -> AtomResult<()> {
        let slots = self.hash_slots.load(Ordering::Acquire);
        let count = self.next_atom_id.load(Ordering::Acquire);
        if (count as f64) <= (slots as f64) * self.options.max_load_factor {
            return Ok(());
        }

        let _guard = self.grow_lock.lock();
        let slots = self.hash_slots.load(Ordering::Acquire);
        let count = self.next_atom_id.load(Ordering::Acquire);
        if (count as f64) <= (slots as f64) * self.options.max_load_factor {
            return Ok(());
        }

        let new_slots = slots.max(self.options.initial_hash_slots) * 2;
        self.hash
            .grow_to(HEADER_SIZE as u64 + new_slots * HASH_SLOT_SIZE)?;
        self.hash
            .zero_range(HEADER_SIZE as u64, new_slots * HASH_SLOT_SIZE);
        self.hash_slots.store(new_slots, Ordering::Release);

        for id in 0..count {
            let bytes = self.atom_bytes(id)?;
            let hash = hash_bytes(&bytes);
            for probe in 0..new_slots {
                let slot_index = probe_index(hash, probe, new_slots);
                if self.cas_hash_slot(slot_index, 0, id + 1).is_ok() {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Flush all three files and persist header metadata. Call after a
    /// batch of inserts; the WAL is the real durability boundary, this
    /// just keeps header bookkeeping honest for a faster reopen.
    pub fn flush(&self) -> AtomResult<()> {
        let data_header = FileHeader {
            magic: DATA_MAGIC,
            format_version: 1,
            write_pos: self.data_write_pos.load(Ordering::Acquire),
            next_id: 0,
            live_count: 0,
        };
        self.data.write_header(&data_header)?;
        self.data.flush()?;

        let offsets_header = FileHeader {
            magic: OFFS_MAGIC,
            format_version: 1,
            write_pos: HEADER_SIZE as u64
                + self.next_atom_id.load(Ordering::Acquire) * OFFSET_ENTRY_SIZE,
            next_id: self.next_atom_id.load(Ordering::Acquire),
            live_count: self.live_count.load(Ordering::Acquire),
        };
        self.offsets.write_header(&offsets_header)?;
        self.offsets.flush()?;

        self.hash.flush()?;
        Ok(())
    }

    /// Flush and fsync; used by [`crate::quad::wal::Wal::checkpoint`].
    pub fn checkpoint(&self) -> AtomResult<()> {
        self.flush()?;
        self.data.file.sync_all()?;
        self.offsets.file.sync_all()?;
        self.hash.file.sync_all()?;
        Ok(())
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

fn probe_index(hash: u64, probe: u64, slots: u64) -> u64 {
    let mask = slots - 1;
    if probe < QUADRATIC_PROBE_LIMIT {
        hash.wrapping_add(probe.wrapping_mul(probe + 1) / 2) & mask
    } else {
        let quadratic_tail = QUADRATIC_PROBE_LIMIT.wrapping_mul(QUADRATIC_PROBE_LIMIT + 1) / 2;
        hash.wrapping_add(quadratic_tail)
            .wrapping_add(probe - QUADRATIC_PROBE_LIMIT)
            & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_intern_dedup() {
        let dir = tempdir().unwrap();
        let store = AtomStore::open(dir.path(), AtomStoreOptions::default()).unwrap();

        let a = store.intern(b"<http://example.org/alice>").unwrap();
        let b = store.intern(b"<http://example.org/alice>").unwrap();
        let c = store.intern(b"<http://example.org/bob>").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.atom_bytes(a).unwrap(), b"<http://example.org/alice>");
    }

    #[test]
    fn test_lookup_without_insert() {
        let dir = tempdir().unwrap();
        let store = AtomStore::open(dir.path(), AtomStoreOptions::default()).unwrap();

        assert_eq!(store.lookup(b"<http://example.org/alice>").unwrap(), None);
        let id = store.intern(b"<http://example.org/alice>").unwrap();
        assert_eq!(
            store.lookup(b"<http://example.org/alice>").unwrap(),
            Some(id)
        );
    }

    #[test]
    fn test_hash_table_growth() {
        let dir = tempdir().unwrap();
        let options = AtomStoreOptions {
            initial_hash_slots: 8,
            max_load_factor: 0.7,
        };
        let store = AtomStore::open(dir.path(), options).unwrap();

        let mut ids = Vec::new();
        for i in 0..200 {
            let term = format!("<http://example.org/n{i}>");
            ids.push(store.intern(term.as_bytes()).unwrap());
        }
        for (i, id) in ids.iter().enumerate() {
            let term = format!("<http://example.org/n{i}>");
            assert_eq!(store.atom_bytes(*id).unwrap(), term.as_bytes());
        }
    }

    #[test]
    fn test_reopen_persists_atoms() {
        let dir = tempdir().unwrap();
        let id;
        {
            let store = AtomStore::open(dir.path(), AtomStoreOptions::default()).unwrap();
            id = store.intern(b"<http://example.org/alice>").unwrap();
            store.checkpoint().unwrap();
        }
        {
            let store = AtomStore::open(dir.path(), AtomStoreOptions::default()).unwrap();
            assert_eq!(store.atom_bytes(id).unwrap(), b"<http://example.org/alice>");
            assert_eq!(
                store.lookup(b"<http://example.org/alice>").unwrap(),
                Some(id)
            );
        }
    }
}
