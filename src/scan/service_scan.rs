//! `SERVICE` clause execution: run a SPARQL query against a remote
//! endpoint over blocking HTTP, intern each returned term into the
//! local store, and page the rows out like any other scan.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::quad::QuadStore;
use crate::scan::{BindingTable, ScanIterator, ScanResult, Variable};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("HTTP request to SERVICE endpoint failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed SPARQL JSON results: {0}")]
    Malformed(String),
    #[error("store error while interning SERVICE result term: {0}")]
    Store(#[from] crate::quad::QuadStoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// The subset of the SPARQL 1.1 JSON results format `ServicePatternScan`
/// needs: https://www.w3.org/TR/sparql11-results-json/
#[derive(Debug, Deserialize)]
struct SparqlJsonResults {
    results: SparqlJsonResultsBody,
}

#[derive(Debug, Deserialize)]
struct SparqlJsonResultsBody {
    bindings: Vec<HashMap<String, SparqlJsonTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparqlJsonTerm {
    #[serde(rename = "type")]
    term_type: String,
    value: String,
    #[serde(rename = "datatype")]
    datatype: Option<String>,
    #[serde(rename = "xml:lang")]
    lang: Option<String>,
}

impl SparqlJsonTerm {
    /// Render this term the same canonical byte form the local atom
    /// store interns RDF terms as, so a joined row compares equal
    /// whether the value came from a local scan or a remote one.
    fn to_interned_bytes(&self) -> Vec<u8> {
        match self.term_type.as_str() {
            "uri" => format!("<{}>", self.value).into_bytes(),
            "bnode" => format!("_:{}", self.value).into_bytes(),
            "literal" | "typed-literal" => {
                let mut out = format!("\"{}\"", self.value.replace('"', "\\\""));
                if let Some(lang) = &self.lang {
                    out.push('@');
                    out.push_str(lang);
                } else if let Some(datatype) = &self.datatype {
                    out.push_str("^^<");
                    out.push_str(datatype);
                    out.push('>');
                }
                out.into_bytes()
            }
            other => format!("\"{}\"", other).into_bytes(),
        }
    }
}

/// Executes one `SELECT` query against a remote SPARQL endpoint and
/// binds the requested variables from its JSON results. Fetches and
/// interns the whole result set on the first `move_next` call; there
/// is no streaming HTTP decode.
pub struct ServicePatternScan {
    store: Arc<QuadStore>,
    client: reqwest::blocking::Client,
    endpoint: String,
    query: String,
    projected: Vec<Variable>,
    rows: Option<Vec<HashMap<String, SparqlJsonTerm>>>,
    cursor: usize,
}

impl ServicePatternScan {
    pub fn new(store: Arc<QuadStore>, endpoint: String, query: String, projected: Vec<Variable>) -> Self {
        Self {
            store,
            client: reqwest::blocking::Client::new(),
            endpoint,
            query,
            projected,
            rows: None,
            cursor: 0,
        }
    }

    fn fetch(&self) -> ServiceResult<Vec<HashMap<String, SparqlJsonTerm>>> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .query(&[("query", self.query.as_str())])
            .send()?
            .error_for_status()?;
        let parsed: SparqlJsonResults = response
            .json()
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        Ok(parsed.results.bindings)
    }
}

impl ScanIterator for ServicePatternScan {
    fn move_next(&mut self, table: &mut BindingTable) -> ScanResult<bool> {
        if self.rows.is_none() {
            self.rows = Some(self.fetch()?);
            self.cursor = 0;
        }

        let rows = self.rows.as_ref().expect("just populated above");
        let Some(row) = rows.get(self.cursor) else {
            return Ok(false);
        };
        self.cursor += 1;

        for var in &self.projected {
            if let Some(term) = row.get(var) {
                let atom = self.store.intern_term(&term.to_interned_bytes())?;
                table.set(var, atom);
            }
        }
        Ok(true)
    }

    fn dispose(&mut self) {
        self.rows = None;
        self.cursor = 0;
    }
}

/// A pre-fetched substitute for [`ServicePatternScan`], used by tests
/// and by query plans that hoist federation to a `prepare()` phase and
/// cache the rows ahead of execution.
pub struct InMemoryServiceScan {
    rows: Vec<BindingTable>,
    cursor: usize,
}

impl InMemoryServiceScan {
    pub fn new(rows: Vec<BindingTable>) -> Self {
        Self { rows, cursor: 0 }
    }
}

impl ScanIterator for InMemoryServiceScan {
    fn move_next(&mut self, table: &mut BindingTable) -> ScanResult<bool> {
        let Some(row) = self.rows.get(self.cursor) else {
            return Ok(false);
        };
        self.cursor += 1;
        table.merge_from(row);
        Ok(true)
    }

    fn dispose(&mut self) {
        self.cursor = self.rows.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_service_scan_yields_rows() {
        let mut row_a = BindingTable::new();
        row_a.set("x", 1);
        let mut row_b = BindingTable::new();
        row_b.set("x", 2);

        let mut scan = InMemoryServiceScan::new(vec![row_a, row_b]);
        let mut table = BindingTable::new();

        assert!(scan.move_next(&mut table).unwrap());
        assert_eq!(table.get("x"), Some(1));
        assert!(scan.move_next(&mut table).unwrap());
        assert_eq!(table.get("x"), Some(2));
        assert!(!scan.move_next(&mut table).unwrap());
    }

    #[test]
    fn test_in_memory_service_scan_dispose_exhausts() {
        let mut row = BindingTable::new();
        row.set("x", 1);
        let mut scan = InMemoryServiceScan::new(vec![row]);
        scan.dispose();

        let mut table = BindingTable::new();
        assert!(!scan.move_next(&mut table).unwrap());
    }

    #[test]
    fn test_term_to_interned_bytes_uri() {
        let term = SparqlJsonTerm {
            term_type: "uri".to_string(),
            value: "http://example.org/s".to_string(),
            datatype: None,
            lang: None,
        };
        assert_eq!(term.to_interned_bytes(), b"<http://example.org/s>".to_vec());
    }

    #[test]
    fn test_term_to_interned_bytes_lang_literal() {
        let term = SparqlJsonTerm {
            term_type: "literal".to_string(),
            value: "hello".to_string(),
            datatype: None,
            lang: Some("en".to_string()),
        };
        assert_eq!(term.to_interned_bytes(), b"\"hello\"@en".to_vec());
    }
}
