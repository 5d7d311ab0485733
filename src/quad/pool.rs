//! A pool of named, independently durable [`QuadStore`]s sharing one
//! root directory, with a small JSON manifest recording which names
//! exist.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::quad::store::{QuadStore, QuadStoreError, StoreOptions};
use crate::quad::types::QuadPattern;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] QuadStoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("no store named {0} in this pool")]
    NotFound(String),
    #[error("store name {0:?} is not a valid directory component")]
    InvalidName(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub store: StoreOptions,
}

/// `pool.json`: which names exist, which directory (by guid) each name
/// currently maps to, and which name is "active". Stored as a
/// name→guid map rather than a flat list so [`QuadStorePool::switch`]
/// can remap a name to a different directory without moving any
/// files on disk.
#[derive(Debug, Serialize, Deserialize, Default)]
struct Manifest {
    stores: HashMap<String, String>,
    active: Option<String>,
}

/// A pool of named quad stores. Each store lives in its own
/// guid-named subdirectory of the pool root; `pool.json` records the
/// name→guid mapping and which name is active, so a reopened pool can
/// enumerate stores without scanning the filesystem and so copy-switch
/// compaction can retarget a name atomically.
pub struct QuadStorePool {
    root: PathBuf,
    options: PoolOptions,
    open_stores: RwLock<HashMap<String, Arc<QuadStore>>>,
}

impl QuadStorePool {
    pub fn open(root: impl AsRef<Path>, options: PoolOptions) -> PoolResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        if !root.join("pool.json").exists() {
            Self::write_manifest(&root, &Manifest::default())?;
        }
        Ok(Self {
            root,
            options,
            open_stores: RwLock::new(HashMap::new()),
        })
    }

    fn manifest_path(root: &Path) -> PathBuf {
        root.join("pool.json")
    }

    fn read_manifest(&self) -> PoolResult<Manifest> {
        let path = Self::manifest_path(&self.root);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the manifest via write-temp-then-rename so a crash never
    /// leaves `pool.json` half-written.
    fn write_manifest(root: &Path, manifest: &Manifest) -> PoolResult<()> {
        let tmp_path = root.join("pool.json.tmp");
        let bytes = serde_json::to_vec_pretty(manifest)?;
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, Self::manifest_path(root))?;
        Ok(())
    }

    fn validate_name(name: &str) -> PoolResult<()> {
        let valid = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            && name != "." && name != "..";
        if valid {
            Ok(())
        } else {
            Err(PoolError::InvalidName(name.to_string()))
        }
    }

    /// Open (creating if absent) the named store, returning a shared
    /// handle. Repeated calls for the same name return the same
    /// underlying `QuadStore`.
    pub fn rent(&self, name: &str) -> PoolResult<Arc<QuadStore>> {
        Self::validate_name(name)?;

        if let Some(existing) = self.open_stores.read().get(name) {
            return Ok(Arc::clone(existing));
        }

        let mut stores = self.open_stores.write();
        if let Some(existing) = stores.get(name) {
            return Ok(Arc::clone(existing));
        }

        let mut manifest = self.read_manifest()?;
        let guid = match manifest.stores.get(name) {
            Some(guid) => guid.clone(),
            None => {
                let guid = Uuid::new_v4().simple().to_string();
                manifest.stores.insert(name.to_string(), guid.clone());
                if manifest.active.is_none() {
                    manifest.active = Some(name.to_string());
                }
                Self::write_manifest(&self.root, &manifest)?;
                guid
            }
        };

        let store = Arc::new(QuadStore::open(
            self.root.join(&guid),
            self.options.store.clone(),
        )?);
        stores.insert(name.to_string(), Arc::clone(&store));

        info!(name, "rented quad store from pool");
        Ok(store)
    }

    /// Create and rent a uniquely-named scratch store tagged with
    /// `purpose` (e.g. `"compact"`, `"service"`), useful for tests,
    /// copy-switch compaction scratch space, and SPARQL `SERVICE`-free
    /// query isolation.
    pub fn create_temp(&self, purpose: &str) -> PoolResult<(String, Arc<QuadStore>)> {
        let tag: String = purpose
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let name = if tag.is_empty() {
            format!("tmp-{}", Uuid::new_v4().simple())
        } else {
            format!("tmp-{tag}-{}", Uuid::new_v4().simple())
        };
        let store = self.rent(&name)?;
        Ok((name, store))
    }

    /// List every store name the pool knows about, including ones not
    /// currently open.
    pub fn list(&self) -> PoolResult<Vec<String>> {
        let mut names: Vec<String> = self.read_manifest()?.stores.into_keys().collect();
        names.sort();
        Ok(names)
    }

    /// The name of the store currently marked active, if any.
    pub fn active(&self) -> PoolResult<Option<String>> {
        Ok(self.read_manifest()?.active)
    }

    /// Mark an existing store name as the pool's active store.
    pub fn set_active(&self, name: &str) -> PoolResult<()> {
        Self::validate_name(name)?;
        let mut manifest = self.read_manifest()?;
        if !manifest.stores.contains_key(name) {
            return Err(PoolError::NotFound(name.to_string()));
        }
        manifest.active = Some(name.to_string());
        Self::write_manifest(&self.root, &manifest)?;
        Ok(())
    }

    /// Atomically swap which directory names `a` and `b` map to. This
    /// is the "switch" half of copy-switch compaction: after copying
    /// live data into a scratch store under `b`, `switch(a, b)` makes
    /// `a` point at that scratch directory (and `b` point at `a`'s old
    /// one) without moving a single file or invalidating handles held
    /// by other callers under either name.
    pub fn switch(&self, a: &str, b: &str) -> PoolResult<()> {
        Self::validate_name(a)?;
        Self::validate_name(b)?;

        let mut manifest = self.read_manifest()?;
        let guid_a = manifest
            .stores
            .get(a)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(a.to_string()))?;
        let guid_b = manifest
            .stores
            .get(b)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(b.to_string()))?;
        manifest.stores.insert(a.to_string(), guid_b);
        manifest.stores.insert(b.to_string(), guid_a);
        if manifest.active.as_deref() == Some(a) {
            manifest.active = Some(b.to_string());
        } else if manifest.active.as_deref() == Some(b) {
            manifest.active = Some(a.to_string());
        }
        Self::write_manifest(&self.root, &manifest)?;

        let mut open = self.open_stores.write();
        let store_a = open.remove(a);
        let store_b = open.remove(b);
        if let Some(store) = store_b {
            open.insert(a.to_string(), store);
        }
        if let Some(store) = store_a {
            open.insert(b.to_string(), store);
        }

        info!(a, b, "switched pool store names");
        Ok(())
    }

    /// Copy-switch compact the named store in place: scan every live
    /// quad out of `name` into a fresh scratch store, switch `name` to
    /// the scratch store's directory, then clear what used to live
    /// under `name` (now reachable under the scratch name) so its
    /// space is reclaimed too.
    pub fn compact(&self, name: &str) -> PoolResult<()> {
        let source = self.rent(name)?;
        let (scratch_name, scratch) = self.create_temp("compact")?;

        for quad in source.scan(&QuadPattern::default(), None)? {
            scratch.insert_quad(quad.graph, quad.subject, quad.predicate, quad.object, quad.valid)?;
        }
        scratch.checkpoint()?;

        self.switch(name, &scratch_name)?;

        let stale = self.rent(&scratch_name)?;
        stale.clear()?;

        info!(name, "compacted pool store via copy-switch");
        Ok(())
    }

    /// Drop a store's in-memory handle and remove it from the
    /// manifest. Does not delete its files — callers that want the
    /// data gone should remove the directory themselves after this
    /// returns, once they are sure no other handle is still live.
    pub fn forget(&self, name: &str) -> PoolResult<()> {
        self.open_stores.write().remove(name);
        let mut manifest = self.read_manifest()?;
        manifest.stores.remove(name);
        if manifest.active.as_deref() == Some(name) {
            manifest.active = None;
        }
        Self::write_manifest(&self.root, &manifest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quad::types::{ValidTime, DEFAULT_GRAPH};
    use tempfile::tempdir;

    #[test]
    fn test_rent_creates_and_reuses() {
        let dir = tempdir().unwrap();
        let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();

        let a = pool.rent("graph-a").unwrap();
        let b = pool.rent("graph-a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.list().unwrap(), vec!["graph-a".to_string()]);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempdir().unwrap();
        let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();
        assert!(pool.rent("../escape").is_err());
    }

    #[test]
    fn test_create_temp_unique_names() {
        let dir = tempdir().unwrap();
        let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();
        let (name_a, _) = pool.create_temp("compact").unwrap();
        let (name_b, _) = pool.create_temp("compact").unwrap();
        assert_ne!(name_a, name_b);
        assert!(name_a.starts_with("tmp-compact-"));
    }

    #[test]
    fn test_manifest_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();
            pool.rent("graph-a").unwrap();
        }
        {
            let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();
            assert_eq!(pool.list().unwrap(), vec!["graph-a".to_string()]);
        }
    }

    #[test]
    fn test_first_rented_store_becomes_active() {
        let dir = tempdir().unwrap();
        let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();
        pool.rent("primary").unwrap();
        assert_eq!(pool.active().unwrap(), Some("primary".to_string()));
    }

    #[test]
    fn test_switch_swaps_names_and_active() {
        let dir = tempdir().unwrap();
        let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();

        let primary = pool.rent("primary").unwrap();
        let s = primary.intern_term(b"<http://example.org/s>").unwrap();
        let p = primary.intern_term(b"<http://example.org/p>").unwrap();
        let o = primary.intern_term(b"<http://example.org/o>").unwrap();
        primary.insert_quad(DEFAULT_GRAPH, s, p, o, ValidTime::ALWAYS).unwrap();

        pool.rent("secondary").unwrap();

        pool.switch("primary", "secondary").unwrap();
        assert_eq!(pool.active().unwrap(), Some("secondary".to_string()));

        let now_primary = pool.rent("primary").unwrap();
        assert!(now_primary.scan(&QuadPattern::default(), None).unwrap().is_empty());

        let now_secondary = pool.rent("secondary").unwrap();
        let pattern = QuadPattern { subject: Some(s), ..Default::default() };
        assert_eq!(now_secondary.scan(&pattern, None).unwrap().len(), 1);
    }

    /// Spec scenario: insert two triples, soft-delete one, copy-switch
    /// compact primary→secondary, switch names. The surviving triple
    /// is still visible under the (now-compacted) active name, and the
    /// prior active is empty after being cleared.
    #[test]
    fn test_soft_delete_then_compact_matches_scenario() {
        let dir = tempdir().unwrap();
        let pool = QuadStorePool::open(dir.path(), PoolOptions::default()).unwrap();

        let primary = pool.rent("primary").unwrap();
        let a = primary.intern_term(b"<http://example.org/a>").unwrap();
        let p = primary.intern_term(b"<http://example.org/p>").unwrap();
        let b = primary.intern_term(b"<http://example.org/b>").unwrap();
        let c = primary.intern_term(b"<http://example.org/c>").unwrap();
        primary.insert_quad(DEFAULT_GRAPH, a, p, b, ValidTime::ALWAYS).unwrap();
        primary.insert_quad(DEFAULT_GRAPH, a, p, c, ValidTime::ALWAYS).unwrap();
        primary.delete_quad(DEFAULT_GRAPH, a, p, c).unwrap();

        pool.compact("primary").unwrap();

        let primary_after = pool.rent("primary").unwrap();
        let pattern = QuadPattern { subject: Some(a), ..Default::default() };
        let results = primary_after.scan(&pattern, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].object, b);

        let scratch_names: Vec<_> = pool
            .list()
            .unwrap()
            .into_iter()
            .filter(|n| n.starts_with("tmp-compact-"))
            .collect();
        assert_eq!(scratch_names.len(), 1);
        let stale = pool.rent(&scratch_names[0]).unwrap();
        assert!(stale.scan(&QuadPattern::default(), None).unwrap().is_empty());
    }
}
