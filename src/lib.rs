//! Mercury — an embeddable RDF quad store with a SPARQL 1.1 query and
//! update engine.
//!
//! # Architecture
//!
//! Mercury is organized in layers, lower layers exposing narrow
//! interfaces to the layers above them:
//!
//! ```text
//!          [sparql]            query parsing, algebra, execution
//!              |
//!          [scan]              binding table, scan iterator contract
//!              |
//!          [buffer]            pooled byte buffers
//!              |
//!   +----------+----------+
//!   |          |          |
//! [quad]     [atom]    (quad::wal)
//!   |          |          |
//!   +---- memory-mapped files ----+
//! ```
//!
//! - [`atom`] interns every distinct RDF term to a dense 64-bit atom id.
//! - [`quad`] maintains ordered B+Tree indexes over quads of atom ids,
//!   a write-ahead log for durability, and a pool of named stores.
//! - [`buffer`] lends pooled, typed buffers to hot paths.
//! - [`scan`] provides the uniform scan-iterator contract and binding
//!   table that the query engine pulls rows through.
//! - [`sparql`] parses SPARQL 1.1 query/update text, plans scans, and
//!   executes joins/unions/optionals/filters/aggregates/paths.
//!
//! Textual RDF serialization (Turtle, N-Triples, N-Quads, TriG,
//! JSON-LD, RDF/XML), the SPARQL HTTP protocol, CLIs, and any Solid/MCP
//! surface are external collaborators that consume this crate through
//! [`quad::store::QuadStore`] and [`sparql::SparqlEngine`] — none of
//! them live here.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mercury::quad::{QuadStore, StoreOptions};
//! use mercury::sparql::SparqlEngine;
//!
//! let store = QuadStore::open("/tmp/mercury-example", StoreOptions::default()).unwrap();
//! let engine = SparqlEngine::new(Arc::new(store));
//! let results = engine.query("SELECT * WHERE { ?s ?p ?o }").unwrap();
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod atom;
pub mod buffer;
mod mmap_file;
pub mod quad;
pub mod rdf;
pub mod scan;
pub mod sparql;

pub use atom::{AtomError, AtomId, AtomResult, AtomStore};
pub use buffer::{BufferManager, Lease};
pub use quad::{PoolError, Quad, QuadStore, QuadStoreError, QuadStorePool};
pub use sparql::{QueryResults, SparqlEngine, SparqlError};

/// Crate version, as recorded in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
