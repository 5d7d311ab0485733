//! `QuadStore`: the atom store, the three B+Tree quad indexes, and the
//! write-ahead log, composed into one durable, concurrently-readable
//! unit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::atom::{AtomError, AtomId, AtomStore, AtomStoreOptions};
use crate::quad::index::{BPlusTree, IndexError, Key, LeafValue};
use crate::quad::types::{Flags, Quad, QuadPattern, TransactionId, ValidTime, DEFAULT_GRAPH};
use crate::quad::wal::{SyncMode, Wal, WalEntry, WalError};

#[derive(Debug, thiserror::Error)]
pub enum QuadStoreError {
    #[error("atom store error: {0}")]
    Atom(#[from] AtomError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("write-ahead log error: {0}")]
    Wal(#[from] WalError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type QuadStoreResult<T> = Result<T, QuadStoreError>;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub atom: AtomStoreOptions,
    pub sync_mode: SyncMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            atom: AtomStoreOptions::default(),
            sync_mode: SyncMode::Batched,
        }
    }
}

/// The three permutations maintained over every quad. `Gspo` is the
/// default and the only one that can serve default-graph-prefix scans
/// without an extra file, since `DEFAULT_GRAPH == 0` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permutation {
    Gspo,
    Gpos,
    Gosp,
}

impl Permutation {
    fn to_key(self, g: AtomId, s: AtomId, p: AtomId, o: AtomId) -> Key {
        match self {
            Permutation::Gspo => [g, s, p, o],
            Permutation::Gpos => [g, p, o, s],
            Permutation::Gosp => [g, o, s, p],
        }
    }

    fn from_key(self, key: Key) -> (AtomId, AtomId, AtomId, AtomId) {
        match self {
            Permutation::Gspo => (key[0], key[1], key[2], key[3]),
            Permutation::Gpos => (key[0], key[3], key[1], key[2]),
            Permutation::Gosp => (key[0], key[2], key[3], key[1]),
        }
    }

    /// How many leading positions of this permutation's key are bound
    /// by `pattern`. Scans use this to pick the index that turns the
    /// most of the pattern into a contiguous range.
    fn bound_prefix_len(self, pattern: &QuadPattern) -> usize {
        let fields: [Option<AtomId>; 4] = match self {
            Permutation::Gspo => [pattern.graph, pattern.subject, pattern.predicate, pattern.object],
            Permutation::Gpos => [pattern.graph, pattern.predicate, pattern.object, pattern.subject],
            Permutation::Gosp => [pattern.graph, pattern.object, pattern.subject, pattern.predicate],
        };
        fields.iter().take_while(|f| f.is_some()).count()
    }

    fn bounds(self, pattern: &QuadPattern) -> (Key, Key) {
        let fields: [Option<AtomId>; 4] = match self {
            Permutation::Gspo => [pattern.graph, pattern.subject, pattern.predicate, pattern.object],
            Permutation::Gpos => [pattern.graph, pattern.predicate, pattern.object, pattern.subject],
            Permutation::Gosp => [pattern.graph, pattern.object, pattern.subject, pattern.predicate],
        };
        let mut low = [0u64; 4];
        let mut high = [u64::MAX; 4];
        let prefix = fields.iter().take_while(|f| f.is_some()).count();
        for (i, field) in fields.iter().enumerate().take(prefix) {
            low[i] = field.unwrap();
            high[i] = field.unwrap();
        }
        (low, high)
    }
}

/// One insert or delete to apply atomically as part of a transaction.
#[derive(Debug, Clone)]
pub enum QuadOp {
    Insert {
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        valid: ValidTime,
    },
    Delete {
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
    },
}

/// An embeddable RDF quad store over atom ids.
///
/// Many readers may scan concurrently; writers are serialized against
/// each other and against readers by [`QuadStore::lock`], a
/// `parking_lot::RwLock<()>` taken for read during a scan and for
/// write during `apply_transaction`. Visibility is a snapshot taken at
/// read-lock acquisition: a scan never observes a transaction that
/// commits after the scan started, even if that transaction finishes
/// while the scan is still running.
pub struct QuadStore {
    dir: PathBuf,
    atoms: AtomStore,
    gspo: BPlusTree,
    gpos: BPlusTree,
    gosp: BPlusTree,
    wal: RwLock<Wal>,
    lock: RwLock<()>,
    next_tx: AtomicU64,
}

impl QuadStore {
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> QuadStoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let atoms = AtomStore::open(dir.join("atoms"), options.atom)?;
        let gspo = BPlusTree::open(&dir.join("gspo.idx"), *b"MRCYGSPO")?;
        let gpos = BPlusTree::open(&dir.join("gpos.idx"), *b"MRCYGPOS")?;
        let gosp = BPlusTree::open(&dir.join("gosp.idx"), *b"MRCYGOSP")?;

        let mut wal = Wal::open(dir.join("wal"))?;
        wal.set_sync_mode(options.sync_mode);

        let store = Self {
            dir,
            atoms,
            gspo,
            gpos,
            gosp,
            wal: RwLock::new(wal),
            lock: RwLock::new(()),
            next_tx: AtomicU64::new(1),
        };
        store.recover()?;
        Ok(store)
    }

    fn recover(&self) -> QuadStoreResult<()> {
        let mut max_tx = 0;
        self.wal.write().replay(0, |tx, entry| {
            max_tx = max_tx.max(tx);
            self.apply_entry_unlocked(tx, entry)
                .map_err(|e| WalError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
        })?;
        self.next_tx.store(max_tx + 1, Ordering::Release);
        if max_tx > 0 {
            info!(max_tx, "recovered quad store from write-ahead log");
        }
        Ok(())
    }

    fn apply_entry_unlocked(&self, tx: TransactionId, entry: WalEntry) -> QuadStoreResult<()> {
        match entry {
            WalEntry::InternAtom { bytes, .. } => {
                self.atoms.intern(&bytes)?;
                Ok(())
            }
            WalEntry::InsertQuad {
                graph,
                subject,
                predicate,
                object,
                valid_from,
                valid_until,
            } => {
                let value = LeafValue {
                    tx,
                    valid_from,
                    valid_until,
                    flags: Flags::empty(),
                };
                self.write_all_indexes(graph, subject, predicate, object, value)?;
                Ok(())
            }
            WalEntry::DeleteQuad {
                graph,
                subject,
                predicate,
                object,
            } => {
                self.mark_deleted(graph, subject, predicate, object)?;
                Ok(())
            }
            WalEntry::Checkpoint { .. } => Ok(()),
        }
    }

    /// Intern an RDF term's byte form, logging the interning so
    /// crash recovery can reconstruct the atom store if its own files
    /// are behind the WAL.
    pub fn intern_term(&self, bytes: &[u8]) -> QuadStoreResult<AtomId> {
        if let Some(existing) = self.atoms.lookup(bytes)? {
            return Ok(existing);
        }
        let _guard = self.lock.write();
        let id = self.atoms.intern(bytes)?;
        self.wal.write().append(
            0,
            WalEntry::InternAtom {
                id,
                bytes: bytes.to_vec(),
            },
        )?;
        Ok(id)
    }

    pub fn atom_bytes(&self, id: AtomId) -> QuadStoreResult<Vec<u8>> {
        Ok(self.atoms.atom_bytes(id)?)
    }

    /// Look up a term's atom id without interning it. Used by read-only
    /// query execution to resolve constant pattern terms: a term with no
    /// existing atom simply can't match anything, so there is nothing to
    /// write.
    pub fn lookup_term(&self, bytes: &[u8]) -> QuadStoreResult<Option<AtomId>> {
        Ok(self.atoms.lookup(bytes)?)
    }

    /// Apply a batch of operations as one transaction: logged to the
    /// WAL first, then written into all three indexes, with a single
    /// new transaction id assigned to every insert in the batch.
    pub fn apply_transaction(&self, ops: Vec<QuadOp>) -> QuadStoreResult<TransactionId> {
        let _guard = self.lock.write();
        let tx = self.next_tx.fetch_add(1, Ordering::AcqRel);

        {
            let mut wal = self.wal.write();
            for op in &ops {
                let entry = match op {
                    QuadOp::Insert {
                        graph,
                        subject,
                        predicate,
                        object,
                        valid,
                    } => WalEntry::InsertQuad {
                        graph: *graph,
                        subject: *subject,
                        predicate: *predicate,
                        object: *object,
                        valid_from: valid.from,
                        valid_until: valid.until,
                    },
                    QuadOp::Delete {
                        graph,
                        subject,
                        predicate,
                        object,
                    } => WalEntry::DeleteQuad {
                        graph: *graph,
                        subject: *subject,
                        predicate: *predicate,
                        object: *object,
                    },
                };
                wal.append(tx, entry)?;
            }
            wal.flush()?;
        }

        for op in ops {
            match op {
                QuadOp::Insert {
                    graph,
                    subject,
                    predicate,
                    object,
                    valid,
                } => {
                    let value = LeafValue {
                        tx,
                        valid_from: valid.from,
                        valid_until: valid.until,
                        flags: Flags::empty(),
                    };
                    self.write_all_indexes(graph, subject, predicate, object, value)?;
                }
                QuadOp::Delete {
                    graph,
                    subject,
                    predicate,
                    object,
                } => {
                    self.mark_deleted(graph, subject, predicate, object)?;
                }
            }
        }

        debug!(tx, "applied quad store transaction");
        Ok(tx)
    }

    /// Convenience wrapper for a single insert in its own transaction.
    pub fn insert_quad(
        &self,
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
        valid: ValidTime,
    ) -> QuadStoreResult<TransactionId> {
        self.apply_transaction(vec![QuadOp::Insert {
            graph,
            subject,
            predicate,
            object,
            valid,
        }])
    }

    pub fn delete_quad(
        &self,
        graph: AtomId,
        subject: AtomId,
        predicate: AtomId,
        object: AtomId,
    ) -> QuadStoreResult<TransactionId> {
        self.apply_transaction(vec![QuadOp::Delete {
            graph,
            subject,
            predicate,
            object,
        }])
    }

    fn write_all_indexes(
        &self,
        g: AtomId,
        s: AtomId,
        p: AtomId,
        o: AtomId,
        value: LeafValue,
    ) -> QuadStoreResult<()> {
        self.gspo.insert(Permutation::Gspo.to_key(g, s, p, o), value)?;
        self.gpos.insert(Permutation::Gpos.to_key(g, s, p, o), value)?;
        self.gosp.insert(Permutation::Gosp.to_key(g, s, p, o), value)?;
        Ok(())
    }

    fn mark_deleted(&self, g: AtomId, s: AtomId, p: AtomId, o: AtomId) -> QuadStoreResult<()> {
        let existing = self
            .gspo
            .range(
                Permutation::Gspo.to_key(g, s, p, o),
                Permutation::Gspo.to_key(g, s, p, o),
            )?
            .into_iter()
            .next();
        let Some((_, mut value)) = existing else {
            return Ok(());
        };
        value.flags |= Flags::DELETED;
        self.write_all_indexes(g, s, p, o, value)
    }

    /// Scan for all live quads matching `pattern`, visible as of the
    /// current transaction snapshot (and, if `as_of_valid` is set, also
    /// valid at that application-time instant).
    pub fn scan(&self, pattern: &QuadPattern, as_of_valid: Option<i64>) -> QuadStoreResult<Vec<Quad>> {
        let _guard = self.lock.read();
        let as_of_tx = self.next_tx.load(Ordering::Acquire).saturating_sub(1);

        let permutation = [Permutation::Gspo, Permutation::Gpos, Permutation::Gosp]
            .into_iter()
            .max_by_key(|perm| perm.bound_prefix_len(pattern))
            .unwrap_or(Permutation::Gspo);

        let (low, high) = permutation.bounds(pattern);
        let tree = match permutation {
            Permutation::Gspo => &self.gspo,
            Permutation::Gpos => &self.gpos,
            Permutation::Gosp => &self.gosp,
        };

        let entries = tree.range(low, high)?;
        let mut results = Vec::new();
        for (key, value) in entries {
            let (g, s, p, o) = permutation.from_key(key);
            let quad = Quad {
                graph: g,
                subject: s,
                predicate: p,
                object: o,
                tx: value.tx,
                valid: ValidTime {
                    from: value.valid_from,
                    until: value.valid_until,
                },
                flags: value.flags,
            };
            if pattern.matches(&quad) && quad.visible_at(as_of_tx, as_of_valid) {
                results.push(quad);
            }
        }
        Ok(results)
    }

    /// Scan the default graph only.
    pub fn scan_default_graph(&self, pattern: &QuadPattern) -> QuadStoreResult<Vec<Quad>> {
        let mut pattern = *pattern;
        pattern.graph = Some(DEFAULT_GRAPH);
        self.scan(&pattern, None)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Flush the atom store and indexes, then checkpoint and roll the
    /// WAL. After this returns, a fresh replay from an empty log would
    /// reconstruct nothing new — everything durable is already on disk
    /// in the atom/index files themselves.
    pub fn checkpoint(&self) -> QuadStoreResult<()> {
        let _guard = self.lock.write();
        self.atoms.checkpoint()?;
        self.gspo.flush()?;
        self.gpos.flush()?;
        self.gosp.flush()?;
        self.wal.write().checkpoint()?;
        info!(dir = %self.dir.display(), "quad store checkpoint complete");
        Ok(())
    }

    /// Physically remove every soft-deleted record from all three
    /// permutation indexes. Soft delete only flips `Flags::DELETED`;
    /// this is what actually reclaims the page space, walking a live
    /// scan of `gspo` and dropping the matching entry out of every
    /// permutation wherever it is marked deleted.
    pub fn compact(&self) -> QuadStoreResult<()> {
        let _guard = self.lock.write();
        let all = self.gspo.range([0, 0, 0, 0], [u64::MAX; 4])?;
        for (key, value) in all {
            if value.flags.contains(Flags::DELETED) {
                let (g, s, p, o) = Permutation::Gspo.from_key(key);
                self.gspo.remove(Permutation::Gspo.to_key(g, s, p, o))?;
                self.gpos.remove(Permutation::Gpos.to_key(g, s, p, o))?;
                self.gosp.remove(Permutation::Gosp.to_key(g, s, p, o))?;
            }
        }
        self.gspo.flush()?;
        self.gpos.flush()?;
        self.gosp.flush()?;
        info!(dir = %self.dir.display(), "quad store compaction complete");
        Ok(())
    }

    /// Soft-delete every live quad, then compact, leaving the store
    /// with empty index files. Used by pool copy-switch compaction to
    /// discard whatever was left behind under the old active name.
    pub fn clear(&self) -> QuadStoreResult<()> {
        let live = self.scan(&QuadPattern::default(), None)?;
        for quad in live {
            self.delete_quad(quad.graph, quad.subject, quad.predicate, quad.object)?;
        }
        self.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> QuadStore {
        QuadStore::open(dir, StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_insert_and_scan_by_subject() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let alice = store.intern_term(b"<http://example.org/alice>").unwrap();
        let name = store.intern_term(b"<http://xmlns.com/foaf/0.1/name>").unwrap();
        let alice_lit = store.intern_term(b"\"Alice\"").unwrap();

        store
            .insert_quad(DEFAULT_GRAPH, alice, name, alice_lit, ValidTime::ALWAYS)
            .unwrap();

        let pattern = QuadPattern {
            subject: Some(alice),
            ..Default::default()
        };
        let results = store.scan(&pattern, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].object, alice_lit);
    }

    #[test]
    fn test_delete_makes_quad_invisible() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let s = store.intern_term(b"<http://example.org/s>").unwrap();
        let p = store.intern_term(b"<http://example.org/p>").unwrap();
        let o = store.intern_term(b"<http://example.org/o>").unwrap();

        store.insert_quad(DEFAULT_GRAPH, s, p, o, ValidTime::ALWAYS).unwrap();
        store.delete_quad(DEFAULT_GRAPH, s, p, o).unwrap();

        let pattern = QuadPattern {
            subject: Some(s),
            ..Default::default()
        };
        assert!(store.scan(&pattern, None).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_isolation_excludes_later_transaction() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let s = store.intern_term(b"<http://example.org/s>").unwrap();
        let p = store.intern_term(b"<http://example.org/p>").unwrap();
        let o1 = store.intern_term(b"<http://example.org/o1>").unwrap();
        let o2 = store.intern_term(b"<http://example.org/o2>").unwrap();

        store.insert_quad(DEFAULT_GRAPH, s, p, o1, ValidTime::ALWAYS).unwrap();
        let as_of_tx_before_second_insert = store.next_tx.load(Ordering::Acquire).saturating_sub(1);
        store.insert_quad(DEFAULT_GRAPH, s, p, o2, ValidTime::ALWAYS).unwrap();

        let pattern = QuadPattern {
            subject: Some(s),
            ..Default::default()
        };
        let all = store.scan(&pattern, None).unwrap();
        assert_eq!(all.len(), 2);

        let visible_at_snapshot: Vec<_> = all
            .iter()
            .filter(|q| q.visible_at(as_of_tx_before_second_insert, None))
            .collect();
        assert_eq!(visible_at_snapshot.len(), 1);
    }

    #[test]
    fn test_reopen_recovers_from_wal() {
        let dir = tempdir().unwrap();
        let s;
        let p;
        let o;
        {
            let store = open_store(dir.path());
            s = store.intern_term(b"<http://example.org/s>").unwrap();
            p = store.intern_term(b"<http://example.org/p>").unwrap();
            o = store.intern_term(b"<http://example.org/o>").unwrap();
            store.insert_quad(DEFAULT_GRAPH, s, p, o, ValidTime::ALWAYS).unwrap();
        }
        {
            let store = open_store(dir.path());
            let pattern = QuadPattern {
                subject: Some(s),
                ..Default::default()
            };
            let results = store.scan(&pattern, None).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].predicate, p);
            assert_eq!(results[0].object, o);
        }
    }

    #[test]
    fn test_reopen_recovers_distinct_transaction_ids() {
        let dir = tempdir().unwrap();
        let s;
        let p;
        let o1;
        let o2;
        let tx1;
        let tx2;
        {
            let store = open_store(dir.path());
            s = store.intern_term(b"<http://example.org/s>").unwrap();
            p = store.intern_term(b"<http://example.org/p>").unwrap();
            o1 = store.intern_term(b"<http://example.org/o1>").unwrap();
            o2 = store.intern_term(b"<http://example.org/o2>").unwrap();
            tx1 = store.insert_quad(DEFAULT_GRAPH, s, p, o1, ValidTime::ALWAYS).unwrap();
            tx2 = store.insert_quad(DEFAULT_GRAPH, s, p, o2, ValidTime::ALWAYS).unwrap();
        }
        {
            let store = open_store(dir.path());
            let pattern = QuadPattern {
                subject: Some(s),
                ..Default::default()
            };
            let mut results = store.scan(&pattern, None).unwrap();
            results.sort_by_key(|q| q.tx);
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].tx, tx1);
            assert_eq!(results[1].tx, tx2);
            assert_ne!(results[0].tx, results[1].tx);
        }
    }

    #[test]
    fn test_compact_removes_soft_deleted_records() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let a = store.intern_term(b"<http://example.org/a>").unwrap();
        let p = store.intern_term(b"<http://example.org/p>").unwrap();
        let b = store.intern_term(b"<http://example.org/b>").unwrap();
        let c = store.intern_term(b"<http://example.org/c>").unwrap();

        store.insert_quad(DEFAULT_GRAPH, a, p, b, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, a, p, c, ValidTime::ALWAYS).unwrap();
        store.delete_quad(DEFAULT_GRAPH, a, p, c).unwrap();

        store.compact().unwrap();

        let pattern = QuadPattern {
            subject: Some(a),
            ..Default::default()
        };
        let results = store.scan(&pattern, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].object, b);

        let physical = store
            .gspo
            .range(
                Permutation::Gspo.to_key(DEFAULT_GRAPH, a, p, c),
                Permutation::Gspo.to_key(DEFAULT_GRAPH, a, p, c),
            )
            .unwrap();
        assert!(physical.is_empty(), "soft-deleted record should be physically gone after compaction");
    }

    #[test]
    fn test_clear_empties_store() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let a = store.intern_term(b"<http://example.org/a>").unwrap();
        let p = store.intern_term(b"<http://example.org/p>").unwrap();
        let b = store.intern_term(b"<http://example.org/b>").unwrap();
        store.insert_quad(DEFAULT_GRAPH, a, p, b, ValidTime::ALWAYS).unwrap();

        store.clear().unwrap();

        let results = store.scan(&QuadPattern::default(), None).unwrap();
        assert!(results.is_empty());
    }
}
