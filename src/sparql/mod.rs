//! SPARQL 1.1 query/update: parsing, algebra, and execution.

mod algebra;
pub mod ast;
mod executor;
mod parser;
mod results;

use std::sync::Arc;

use thiserror::Error;

use crate::quad::{QuadStore, QuadStoreError};

pub use ast::{Query, UpdateOperation, Variable};
pub use executor::{ExecutionError, SparqlExecutor};
pub use parser::ParseError;
pub use results::{Binding, QuadBinding, QuerySolution, QueryResults, ResultFormat, ResultsError};

/// Errors that can occur parsing or executing SPARQL query/update text.
#[derive(Debug, Error)]
pub enum SparqlError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("result materialization error: {0}")]
    Results(#[from] ResultsError),

    #[error("quad store error: {0}")]
    Store(#[from] QuadStoreError),
}

pub type SparqlResult<T> = Result<T, SparqlError>;

/// Outcome of a SPARQL Update request: the number of quads the
/// operation inserted, deleted, or otherwise touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub affected: u64,
}

/// Entry point for running SPARQL 1.1 query and update text against a
/// [`QuadStore`]. Holds the store behind an [`Arc`] so it can be shared
/// with the scan layer's `SERVICE` clause execution, which needs its
/// own owned handle to intern terms from a remote endpoint's response.
pub struct SparqlEngine {
    store: Arc<QuadStore>,
}

impl SparqlEngine {
    pub fn new(store: Arc<QuadStore>) -> Self {
        Self { store }
    }

    pub fn query(&self, source: &str) -> SparqlResult<QueryResults> {
        let query = parser::parse_query(source)?;
        let executor = SparqlExecutor::new(self.store.clone());
        Ok(executor.execute(&query)?)
    }

    pub fn update(&self, source: &str) -> SparqlResult<UpdateResult> {
        let ops = parser::parse_update(source)?;
        let executor = SparqlExecutor::new(self.store.clone());
        let mut affected = 0u64;
        for op in &ops {
            affected += executor.execute_update(op)?;
        }
        Ok(UpdateResult { affected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quad::StoreOptions;

    fn engine() -> SparqlEngine {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), StoreOptions::default()).unwrap();
        SparqlEngine::new(Arc::new(store))
    }

    #[test]
    fn test_insert_and_select_round_trip() {
        let engine = engine();
        engine
            .update("INSERT DATA { <http://example.org/alice> <http://example.org/name> \"Alice\" }")
            .unwrap();

        let results = engine
            .query("SELECT ?name WHERE { <http://example.org/alice> <http://example.org/name> ?name }")
            .unwrap();

        match results {
            QueryResults::Solutions { solutions, .. } => {
                assert_eq!(solutions.len(), 1);
                assert_eq!(solutions[0].get("name").unwrap().to_string(), "\"Alice\"");
            }
            other => panic!("expected Solutions, got {other:?}"),
        }
    }

    #[test]
    fn test_ask_query_over_empty_store() {
        let engine = engine();
        let results = engine.query("ASK { ?s ?p ?o }").unwrap();
        assert_eq!(results, QueryResults::Boolean(false));
    }

    #[test]
    fn test_update_reports_affected_count() {
        let engine = engine();
        let result = engine
            .update("INSERT DATA { <http://example.org/a> <http://example.org/b> <http://example.org/c> }")
            .unwrap();
        assert_eq!(result.affected, 1);
    }
}
