//! Leaf scan over one triple/quad pattern, backed by
//! [`QuadStore::scan`].

use std::sync::Arc;

use crate::quad::{QuadPattern, QuadStore};
use crate::scan::{BindingTable, ScanIterator, ScanResult, Variable};

/// Which positions of a pattern are variables (and what they're
/// called), as opposed to already-bound atoms baked into the
/// [`QuadPattern`] itself.
#[derive(Debug, Clone, Default)]
pub struct ScanVariables {
    pub graph: Option<Variable>,
    pub subject: Option<Variable>,
    pub predicate: Option<Variable>,
    pub object: Option<Variable>,
}

/// Scans a single quad pattern, binding the variable positions into
/// each row it produces. Results are fetched from the store once, on
/// the first [`ScanIterator::move_next`] call, and then paged out of
/// an in-memory buffer — the store's `scan` has no cursor API of its
/// own, so there is nothing incremental to defer.
pub struct TriplePatternScan {
    store: Arc<QuadStore>,
    pattern: QuadPattern,
    vars: ScanVariables,
    as_of_valid: Option<i64>,
    results: Option<Vec<crate::quad::Quad>>,
    cursor: usize,
}

impl TriplePatternScan {
    pub fn new(
        store: Arc<QuadStore>,
        pattern: QuadPattern,
        vars: ScanVariables,
        as_of_valid: Option<i64>,
    ) -> Self {
        Self {
            store,
            pattern,
            vars,
            as_of_valid,
            results: None,
            cursor: 0,
        }
    }
}

impl ScanIterator for TriplePatternScan {
    fn move_next(&mut self, table: &mut BindingTable) -> ScanResult<bool> {
        if self.results.is_none() {
            self.results = Some(self.store.scan(&self.pattern, self.as_of_valid)?);
            self.cursor = 0;
        }

        let results = self.results.as_ref().expect("just populated above");
        let Some(quad) = results.get(self.cursor).copied() else {
            return Ok(false);
        };
        self.cursor += 1;

        if let Some(var) = &self.vars.graph {
            table.set(var, quad.graph);
        }
        if let Some(var) = &self.vars.subject {
            table.set(var, quad.subject);
        }
        if let Some(var) = &self.vars.predicate {
            table.set(var, quad.predicate);
        }
        if let Some(var) = &self.vars.object {
            table.set(var, quad.object);
        }
        Ok(true)
    }

    fn dispose(&mut self) {
        self.results = None;
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quad::{StoreOptions, ValidTime, DEFAULT_GRAPH};
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> Arc<QuadStore> {
        Arc::new(QuadStore::open(dir, StoreOptions::default()).unwrap())
    }

    #[test]
    fn test_scan_binds_unbound_positions() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let alice = store.intern_term(b"<http://example.org/alice>").unwrap();
        let knows = store.intern_term(b"<http://xmlns.com/foaf/0.1/knows>").unwrap();
        let bob = store.intern_term(b"<http://example.org/bob>").unwrap();
        store
            .insert_quad(DEFAULT_GRAPH, alice, knows, bob, ValidTime::ALWAYS)
            .unwrap();

        let pattern = QuadPattern {
            graph: Some(DEFAULT_GRAPH),
            subject: Some(alice),
            predicate: Some(knows),
            object: None,
        };
        let vars = ScanVariables {
            object: Some("o".to_string()),
            ..Default::default()
        };
        let mut scan = TriplePatternScan::new(store, pattern, vars, None);

        let mut table = BindingTable::new();
        assert!(scan.move_next(&mut table).unwrap());
        assert_eq!(table.get("o"), Some(bob));
        assert!(!scan.move_next(&mut table).unwrap());
    }

    #[test]
    fn test_dispose_forces_refetch() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let s = store.intern_term(b"<http://example.org/s>").unwrap();
        let p = store.intern_term(b"<http://example.org/p>").unwrap();
        let o = store.intern_term(b"<http://example.org/o>").unwrap();
        store.insert_quad(DEFAULT_GRAPH, s, p, o, ValidTime::ALWAYS).unwrap();

        let pattern = QuadPattern {
            subject: Some(s),
            ..Default::default()
        };
        let mut scan = TriplePatternScan::new(store, pattern, ScanVariables::default(), None);
        let mut table = BindingTable::new();
        assert!(scan.move_next(&mut table).unwrap());
        assert!(!scan.move_next(&mut table).unwrap());

        scan.dispose();
        assert!(scan.move_next(&mut table).unwrap());
    }
}
