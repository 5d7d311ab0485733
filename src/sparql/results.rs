//! SPARQL query results.
//!
//! Decoding from atom ids back into [`RdfTerm`]s happens only here, at
//! the materialization boundary — the executor's binding tables carry
//! bare [`AtomId`]s all the way through evaluation, per the atom store's
//! "decode at the edges" convention.

use std::collections::HashMap;

use thiserror::Error;

use crate::atom::AtomId;
use crate::quad::{QuadStore, QuadStoreError};
use crate::rdf::{RdfError, RdfTerm, Triple};
use crate::sparql::ast::Variable;

/// Errors raised while materializing a query's results.
#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("store error while decoding a result row: {0}")]
    Store(#[from] QuadStoreError),

    #[error("atom bytes did not decode to a valid RDF term: {0}")]
    Term(#[from] RdfError),
}

pub type ResultsResult<T> = Result<T, ResultsError>;

/// Result serialization format. The core has no opinion on wire
/// encodings (textual RDF and the SPARQL HTTP protocol are a
/// collaborator's job); this only enumerates the formats a collaborator
/// might ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    Json,
    Xml,
    Csv,
    Tsv,
}

/// One solution row: variable name to bound term. Unbound (optional)
/// variables are simply absent from the map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySolution {
    pub bindings: HashMap<Variable, RdfTerm>,
}

impl QuerySolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variable: &str) -> Option<&RdfTerm> {
        self.bindings.get(variable)
    }

    pub fn bind(&mut self, variable: Variable, term: RdfTerm) {
        self.bindings.insert(variable, term);
    }

    pub fn is_bound(&self, variable: &str) -> bool {
        self.bindings.contains_key(variable)
    }
}

/// A single solution row as the executor produces it: one slot per
/// projected variable, `None` where that variable is unbound in this
/// row (e.g. the non-matching side of an OPTIONAL).
pub type Binding = Vec<Option<AtomId>>;

/// Decode one executor binding row into a [`QuerySolution`], resolving
/// each bound atom id back to its `RdfTerm` via the store.
pub fn decode_binding(
    store: &QuadStore,
    variables: &[Variable],
    row: &Binding,
) -> ResultsResult<QuerySolution> {
    let mut solution = QuerySolution::new();
    for (var, slot) in variables.iter().zip(row.iter()) {
        if let Some(atom) = slot {
            let bytes = store.atom_bytes(*atom)?;
            let term = RdfTerm::from_interned_bytes(&bytes)?;
            solution.bind(var.clone(), term);
        }
    }
    Ok(solution)
}

fn decode_bindings(
    store: &QuadStore,
    variables: &[Variable],
    rows: &[Binding],
) -> ResultsResult<Vec<QuerySolution>> {
    rows.iter()
        .map(|row| decode_binding(store, variables, row))
        .collect()
}

/// A decoded CONSTRUCT/DESCRIBE quad, atom ids resolved to terms. The
/// graph slot is `None` for the default graph.
pub struct QuadBinding {
    pub graph: Option<AtomId>,
    pub subject: AtomId,
    pub predicate: AtomId,
    pub object: AtomId,
}

/// Decode CONSTRUCT/DESCRIBE output quads into [`Triple`]s, dropping the
/// graph component — result graphs are always a single anonymous RDF
/// graph, never quads, per the SPARQL result model.
pub fn decode_triples(store: &QuadStore, quads: &[QuadBinding]) -> ResultsResult<Vec<Triple>> {
    quads
        .iter()
        .map(|q| {
            let subject = RdfTerm::from_interned_bytes(&store.atom_bytes(q.subject)?)?;
            let predicate = RdfTerm::from_interned_bytes(&store.atom_bytes(q.predicate)?)?;
            let object = RdfTerm::from_interned_bytes(&store.atom_bytes(q.object)?)?;
            Ok(Triple {
                subject: subject.try_into()?,
                predicate: predicate.try_into()?,
                object: object.into(),
            })
        })
        .collect()
}

/// The outcome of executing a SPARQL query, materialized at the point
/// the caller asked for it. `Solutions` is built lazily row by row by
/// the executor and only collected into this shape once evaluation
/// completes (or the caller consumes fewer than `LIMIT` rows and stops
/// early, in which case only those rows were ever decoded).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResults {
    /// `SELECT` bindings.
    Solutions {
        variables: Vec<Variable>,
        solutions: Vec<QuerySolution>,
    },
    /// `ASK`.
    Boolean(bool),
    /// `CONSTRUCT`/`DESCRIBE`.
    Graph(Vec<Triple>),
}

impl QueryResults {
    pub fn empty_solutions() -> Self {
        QueryResults::Solutions {
            variables: Vec::new(),
            solutions: Vec::new(),
        }
    }

    pub fn from_bindings(
        store: &QuadStore,
        variables: Vec<Variable>,
        rows: Vec<Binding>,
    ) -> ResultsResult<Self> {
        let solutions = decode_bindings(store, &variables, &rows)?;
        Ok(QueryResults::Solutions {
            variables,
            solutions,
        })
    }

    pub fn from_quads(store: &QuadStore, quads: Vec<QuadBinding>) -> ResultsResult<Self> {
        Ok(QueryResults::Graph(decode_triples(store, &quads)?))
    }

    /// Serialize to a textual result format.
    ///
    /// TODO: wire up against a dedicated results-serialization crate
    /// once the collaborator boundary for textual RDF/SPARQL-JSON
    /// output is chosen; the core itself owns no wire format.
    pub fn serialize(&self, _format: ResultFormat) -> Result<String, String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_solution_bind_and_get() {
        let mut solution = QuerySolution::new();
        assert!(solution.bindings.is_empty());
        solution.bind(
            "name".to_string(),
            RdfTerm::Literal(crate::rdf::Literal::new_simple_literal("Alice")),
        );
        assert!(solution.is_bound("name"));
        assert!(!solution.is_bound("age"));
        assert_eq!(solution.get("name").unwrap().to_string(), "\"Alice\"");
    }

    #[test]
    fn test_empty_solutions() {
        let results = QueryResults::empty_solutions();
        match results {
            QueryResults::Solutions {
                variables,
                solutions,
            } => {
                assert!(variables.is_empty());
                assert!(solutions.is_empty());
            }
            _ => panic!("expected Solutions"),
        }
    }

    #[test]
    fn test_decode_binding_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), Default::default()).unwrap();

        let s = RdfTerm::NamedNode(crate::rdf::NamedNode::new("http://example.org/alice").unwrap());
        let atom = store.intern_term(&s.to_interned_bytes()).unwrap();

        let variables = vec!["s".to_string()];
        let row: Binding = vec![Some(atom)];
        let solution = decode_binding(&store, &variables, &row).unwrap();
        assert_eq!(solution.get("s"), Some(&s));
    }

    #[test]
    fn test_decode_binding_leaves_unbound_variable_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), Default::default()).unwrap();

        let variables = vec!["s".to_string(), "o".to_string()];
        let row: Binding = vec![None, None];
        let solution = decode_binding(&store, &variables, &row).unwrap();
        assert!(!solution.is_bound("s"));
        assert!(!solution.is_bound("o"));
    }
}
