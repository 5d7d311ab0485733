//! BGP join ordering and constant-term resolution. The quad store
//! already picks the cheapest GSPO/GPOS/GOSP permutation for any single
//! pattern in [`crate::quad::QuadStore::scan`]; what's left here is
//! choosing a good order to join several patterns together and turning
//! the AST's constant [`Term`]s into atom ids without touching the WAL.

use std::collections::HashSet;

use crate::quad::{QuadStore, QuadStoreError};
use crate::sparql::ast::{PropertyPath, Term, TriplePattern, Variable};

/// A constant term resolved against the store, or a variable left for
/// the executor to bind at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTerm {
    Bound(crate::atom::AtomId),
    Unbound(Variable),
}

/// Resolves a pattern term to its stored atom id without interning it.
/// A constant term with no existing atom can never match anything —
/// callers should treat `Ok(None)` as "this pattern matches zero rows"
/// rather than as an error.
pub fn resolve_term(store: &QuadStore, term: &Term) -> Result<Option<ResolvedTerm>, QuadStoreError> {
    match term {
        Term::Variable(v) => Ok(Some(ResolvedTerm::Unbound(v.clone()))),
        other => {
            let bytes = other.to_interned_bytes();
            Ok(store.lookup_term(&bytes)?.map(ResolvedTerm::Bound))
        }
    }
}

fn term_score(term: &Term, bound: &HashSet<Variable>) -> u8 {
    match term {
        Term::Variable(v) if bound.contains(v) => 1,
        Term::Variable(_) => 0,
        _ => 2,
    }
}

fn predicate_score(path: &PropertyPath, bound: &HashSet<Variable>) -> u8 {
    match path {
        PropertyPath::Predicate(term) => term_score(term, bound),
        // Path expressions have no fixed predicate to range-scan on;
        // treat them as the least selective position.
        _ => 0,
    }
}

fn pattern_score(tp: &TriplePattern, bound: &HashSet<Variable>) -> u8 {
    term_score(&tp.subject, bound) + predicate_score(&tp.path, bound) + term_score(&tp.object, bound)
}

fn collect_vars(tp: &TriplePattern, out: &mut HashSet<Variable>) {
    if let Term::Variable(v) = &tp.subject {
        out.insert(v.clone());
    }
    if let PropertyPath::Predicate(Term::Variable(v)) = &tp.path {
        out.insert(v.clone());
    }
    if let Term::Variable(v) = &tp.object {
        out.insert(v.clone());
    }
}

/// Greedily orders triple patterns so each new pattern shares as many
/// already-bound positions (constants or variables bound by an earlier
/// pattern in the order) as possible with what precedes it. This
/// approximates a good left-deep join order without real cardinality
/// statistics: the more of a pattern's positions are pinned down by
/// the time it runs, the fewer candidate rows its scan has to produce.
pub fn reorder_bgp(patterns: Vec<TriplePattern>) -> Vec<TriplePattern> {
    let mut remaining = patterns;
    let mut bound = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let best_idx = remaining
            .iter()
            .enumerate()
            .max_by_key(|(_, tp)| pattern_score(tp, &bound))
            .map(|(idx, _)| idx)
            .expect("remaining is non-empty inside the loop guard");
        let chosen = remaining.remove(best_idx);
        collect_vars(&chosen, &mut bound);
        ordered.push(chosen);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Term {
        Term::Variable(name.to_string())
    }

    fn iri(v: &str) -> Term {
        Term::NamedNode(v.to_string())
    }

    fn tp(subject: Term, predicate: Term, object: Term) -> TriplePattern {
        TriplePattern {
            subject,
            path: PropertyPath::Predicate(predicate),
            object,
        }
    }

    #[test]
    fn test_reorder_prefers_fully_bound_pattern_first() {
        let patterns = vec![
            tp(var("s"), var("p"), var("o")),
            tp(iri("http://example.org/s"), iri("http://example.org/p"), var("o")),
        ];
        let ordered = reorder_bgp(patterns);
        assert_eq!(ordered[0].subject, iri("http://example.org/s"));
    }

    #[test]
    fn test_reorder_chains_on_shared_variable() {
        // First pattern binds ?x; the second pattern referencing ?x
        // should be preferred over a third that shares nothing yet.
        let patterns = vec![
            tp(var("x"), iri("http://example.org/knows"), var("y")),
            tp(var("a"), iri("http://example.org/unrelated"), var("b")),
            tp(iri("http://example.org/root"), iri("http://example.org/has"), var("x")),
        ];
        let ordered = reorder_bgp(patterns);
        assert_eq!(ordered[0].subject, iri("http://example.org/root"));
        assert_eq!(ordered[1].object, var("x"));
    }

    #[test]
    fn test_path_expression_scores_as_unselective() {
        let patterns = vec![
            TriplePattern {
                subject: var("s"),
                path: PropertyPath::OneOrMore(Box::new(PropertyPath::Predicate(iri("http://example.org/p")))),
                object: var("o"),
            },
            tp(iri("http://example.org/s"), iri("http://example.org/p"), iri("http://example.org/o")),
        ];
        let ordered = reorder_bgp(patterns);
        assert_eq!(ordered[0].subject, iri("http://example.org/s"));
    }
}
