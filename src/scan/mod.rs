//! Binding runtime and the scan iterator contract every physical
//! operator in [`crate::sparql::executor`] is built from.
//!
//! A [`BindingTable`] is the mutable row every scan writes into and
//! every downstream operator reads from; rows are pulled one at a
//! time through [`ScanIterator::move_next`] rather than materialized
//! up front, except where a solution modifier (`DISTINCT`, `ORDER BY`,
//! aggregation) forces the pipeline across the materialization
//! boundary into a `Vec<BindingTable>`.

mod service_scan;
mod triple_scan;

pub use service_scan::{InMemoryServiceScan, ServiceError, ServicePatternScan};
pub use triple_scan::{ScanVariables, TriplePatternScan};

use indexmap::IndexMap;

use crate::atom::AtomId;
use crate::quad::QuadStoreError;

pub type Variable = String;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("quad store error: {0}")]
    QuadStore(#[from] QuadStoreError),
    #[error("SERVICE scan error: {0}")]
    Service(#[from] ServiceError),
}

pub type ScanResult<T> = Result<T, ScanError>;

/// A row of variable bindings, reused across successive
/// [`ScanIterator::move_next`] calls rather than reallocated per row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    columns: IndexMap<Variable, AtomId>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, var: &str) -> Option<AtomId> {
        self.columns.get(var).copied()
    }

    pub fn set(&mut self, var: &str, value: AtomId) {
        self.columns.insert(var.to_string(), value);
    }

    pub fn unset(&mut self, var: &str) {
        self.columns.shift_remove(var);
    }

    pub fn is_bound(&self, var: &str) -> bool {
        self.columns.contains_key(var)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, AtomId)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn clear(&mut self) {
        self.columns.clear();
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Two bindings are compatible for a join if every variable bound
    /// in both has the same value.
    pub fn is_compatible(&self, other: &BindingTable) -> bool {
        for (var, value) in &self.columns {
            if let Some(other_value) = other.columns.get(var) {
                if other_value != value {
                    return false;
                }
            }
        }
        true
    }

    /// Merge `other`'s bindings into `self`, assuming
    /// [`is_compatible`](Self::is_compatible) already holds.
    pub fn merge_from(&mut self, other: &BindingTable) {
        for (var, value) in &other.columns {
            self.columns.insert(var.clone(), *value);
        }
    }
}

/// The uniform pull contract every scan operator implements: advance
/// one row at a time, writing into a caller-owned [`BindingTable`].
pub trait ScanIterator {
    /// Advance to the next matching row, writing its bindings into
    /// `table`. Returns `Ok(false)` once exhausted; `table` is left
    /// unspecified (but never panics to read) after that point.
    fn move_next(&mut self, table: &mut BindingTable) -> ScanResult<bool>;

    /// Release held resources (cached result sets, open HTTP
    /// connections) ahead of drop. Calling `move_next` after `dispose`
    /// must not panic — it should simply report exhaustion.
    fn dispose(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_table_set_get() {
        let mut table = BindingTable::new();
        table.set("s", 1);
        table.set("o", 2);
        assert_eq!(table.get("s"), Some(1));
        assert_eq!(table.get("p"), None);
    }

    #[test]
    fn test_compatibility() {
        let mut a = BindingTable::new();
        a.set("s", 1);
        a.set("o", 2);

        let mut b = BindingTable::new();
        b.set("o", 2);
        b.set("p", 3);
        assert!(a.is_compatible(&b));

        b.set("o", 99);
        assert!(!a.is_compatible(&b));
    }

    #[test]
    fn test_merge_from() {
        let mut a = BindingTable::new();
        a.set("s", 1);
        let mut b = BindingTable::new();
        b.set("p", 2);
        a.merge_from(&b);
        assert_eq!(a.get("s"), Some(1));
        assert_eq!(a.get("p"), Some(2));
    }
}
