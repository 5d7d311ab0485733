//! The bitemporal quad record and its pattern type.

use crate::atom::AtomId;

/// Monotonically increasing id assigned to every write transaction.
pub type TransactionId = u64;

/// Default graph identifier. Chosen as `0` so it sorts first in every
/// index permutation, giving default-graph-only scans a contiguous
/// range without a dedicated fourth index.
pub const DEFAULT_GRAPH: AtomId = 0;

bitflags::bitflags! {
    /// Per-quad state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// Soft-deleted: invisible to new reads, retained until compaction.
        const DELETED = 0b0000_0001;
    }
}

/// Validity window in application (valid) time. `None` bounds are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidTime {
    pub from: Option<i64>,
    pub until: Option<i64>,
}

impl ValidTime {
    pub const ALWAYS: ValidTime = ValidTime {
        from: None,
        until: None,
    };

    pub fn contains(&self, instant: i64) -> bool {
        self.from.map_or(true, |f| instant >= f) && self.until.map_or(true, |u| instant <= u)
    }
}

impl Default for ValidTime {
    fn default() -> Self {
        Self::ALWAYS
    }
}

/// One bitemporal RDF quad: a `(graph, subject, predicate, object)`
/// tuple of atom ids, stamped with the transaction that wrote it and
/// an application-time validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub graph: AtomId,
    pub subject: AtomId,
    pub predicate: AtomId,
    pub object: AtomId,
    pub tx: TransactionId,
    pub valid: ValidTime,
    pub flags: Flags,
}

impl Quad {
    pub fn new(graph: AtomId, subject: AtomId, predicate: AtomId, object: AtomId) -> Self {
        Self {
            graph,
            subject,
            predicate,
            object,
            tx: 0,
            valid: ValidTime::ALWAYS,
            flags: Flags::empty(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(Flags::DELETED)
    }

    pub fn with_tx(mut self, tx: TransactionId) -> Self {
        self.tx = tx;
        self
    }

    pub fn deleted(mut self) -> Self {
        self.flags |= Flags::DELETED;
        self
    }

    /// Visible as of transaction-time snapshot `as_of_tx` and
    /// (optionally) a valid-time instant.
    pub fn visible_at(&self, as_of_tx: TransactionId, as_of_valid: Option<i64>) -> bool {
        if self.is_deleted() || self.tx > as_of_tx {
            return false;
        }
        as_of_valid.map_or(true, |instant| self.valid.contains(instant))
    }
}

/// A quad pattern with `None` standing for an unbound variable in that
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuadPattern {
    pub graph: Option<AtomId>,
    pub subject: Option<AtomId>,
    pub predicate: Option<AtomId>,
    pub object: Option<AtomId>,
}

impl QuadPattern {
    pub fn matches(&self, quad: &Quad) -> bool {
        self.graph.map_or(true, |g| g == quad.graph)
            && self.subject.map_or(true, |s| s == quad.subject)
            && self.predicate.map_or(true, |p| p == quad.predicate)
            && self.object.map_or(true, |o| o == quad.object)
    }

    /// Number of bound positions, used to pick the cheapest index scan.
    pub fn bound_count(&self) -> usize {
        [self.graph, self.subject, self.predicate, self.object]
            .iter()
            .filter(|x| x.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_pattern_matches() {
        let quad = Quad::new(0, 1, 2, 3);
        let pattern = QuadPattern {
            subject: Some(1),
            ..Default::default()
        };
        assert!(pattern.matches(&quad));

        let pattern = QuadPattern {
            subject: Some(99),
            ..Default::default()
        };
        assert!(!pattern.matches(&quad));
    }

    #[test]
    fn test_visible_at_respects_transaction_snapshot() {
        let quad = Quad::new(0, 1, 2, 3).with_tx(5);
        assert!(quad.visible_at(5, None));
        assert!(quad.visible_at(10, None));
        assert!(!quad.visible_at(4, None));
    }

    #[test]
    fn test_deleted_quad_never_visible() {
        let quad = Quad::new(0, 1, 2, 3).with_tx(1).deleted();
        assert!(!quad.visible_at(100, None));
    }

    #[test]
    fn test_valid_time_window() {
        let valid = ValidTime {
            from: Some(100),
            until: Some(200),
        };
        assert!(!valid.contains(50));
        assert!(valid.contains(150));
        assert!(valid.contains(200));
        assert!(!valid.contains(201));
    }
}
