//! Typed RDF term view layered over the byte-opaque atom substrate.
//!
//! This module wraps `oxrdf` term primitives (`NamedNode`, `BlankNode`,
//! `Literal`) the way the rest of Mercury expects to see them at its
//! edges: parsed query results, `CONSTRUCT`/`DESCRIBE` output, and the
//! values handed to [`crate::atom::AtomStore::intern`]. It does not
//! parse or serialize any textual RDF syntax — that stays out of scope.

mod types;

pub use types::{
    BlankNode, Literal, NamedNode, Quad as RdfQuad, RdfError, RdfObject, RdfPredicate, RdfResult,
    RdfSubject, RdfTerm, Triple, TripleEncodeError,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdf_module_exports() {
        let node = NamedNode::new("http://example.org/alice").unwrap();
        let term: RdfTerm = node.into();
        assert!(term.is_named_node());
    }
}
