//! SPARQL algebra evaluator.
//!
//! [`crate::sparql::ast::GraphPattern`] doubles as the physical plan:
//! this module is a recursive tree-walking interpreter over it, built
//! directly on [`crate::quad::QuadStore::scan`] and the [`crate::scan`]
//! binding runtime rather than a separate plan representation. Binding
//! tables carry bare [`AtomId`]s end to end; terms are only decoded
//! back to [`RdfTerm`] at expression-evaluation time and at the final
//! materialization boundary in [`crate::sparql::results`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::atom::AtomId;
use crate::quad::{QuadOp, QuadPattern, QuadStore, QuadStoreError, ValidTime, DEFAULT_GRAPH};
use crate::rdf::{BlankNode, Literal, NamedNode, RdfError, RdfTerm};
use crate::scan::{BindingTable, ScanIterator, ServicePatternScan, Variable};
use crate::sparql::algebra::{self, ResolvedTerm};
use crate::sparql::ast::{
    AggregateOp, ArithOp, CompareOp, Expression, GraphPattern, GraphTarget, OrderCondition,
    Projection, ProjectionItem, PropertyPath, Query, QuadTemplate, SelectClause,
    SolutionModifiers, Term, TriplePattern, UpdateOperation,
};
use crate::sparql::results::{Binding, QuadBinding, QueryResults, ResultsError};

const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";

const INTEGER_DATATYPES: &[&str] = &[
    XSD_INTEGER,
    "http://www.w3.org/2001/XMLSchema#int",
    "http://www.w3.org/2001/XMLSchema#long",
    "http://www.w3.org/2001/XMLSchema#short",
    "http://www.w3.org/2001/XMLSchema#byte",
    "http://www.w3.org/2001/XMLSchema#nonNegativeInteger",
    "http://www.w3.org/2001/XMLSchema#positiveInteger",
];

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("quad store error: {0}")]
    Store(#[from] QuadStoreError),
    #[error("RDF term error: {0}")]
    Rdf(#[from] RdfError),
    #[error("result materialization error: {0}")]
    Results(#[from] ResultsError),
    #[error("unbound variable: ?{0}")]
    Unbound(Variable),
    #[error("type error: {0}")]
    Type(String),
    #[error("SERVICE error: {0}")]
    Service(String),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// The current graph scope a pattern is evaluated against. Swapped out
/// (never mutated in place) when entering `GRAPH <g> { ... }` or a
/// `USING`-scoped Update pattern.
#[derive(Clone)]
struct EvalContext {
    store: Arc<QuadStore>,
    graph: AtomId,
}

// ---------------------------------------------------------------------
// Term and pattern resolution
// ---------------------------------------------------------------------

/// Resolves one pattern slot against a row. `Ok(None)` means a constant
/// term with no existing atom — the pattern can never match and the
/// caller should treat the whole triple pattern as producing no rows.
/// `Ok(Some(None))` means a genuinely unbound variable; `Ok(Some(Some(id)))`
/// means a bound value, whether pre-bound in `row` or a resolved constant.
fn resolve_slot(
    ctx: &EvalContext,
    term: &Term,
    row: &BindingTable,
) -> ExecutionResult<Option<Option<AtomId>>> {
    if let Term::Variable(v) = term {
        return Ok(Some(row.get(v)));
    }
    match algebra::resolve_term(&ctx.store, term)? {
        None => Ok(None),
        Some(ResolvedTerm::Bound(id)) => Ok(Some(Some(id))),
        Some(ResolvedTerm::Unbound(_)) => unreachable!("a constant Term never resolves to Unbound"),
    }
}

fn resolve_constant(ctx: &EvalContext, term: &Term) -> ExecutionResult<Option<AtomId>> {
    match algebra::resolve_term(&ctx.store, term)? {
        None => Ok(None),
        Some(ResolvedTerm::Bound(id)) => Ok(Some(id)),
        Some(ResolvedTerm::Unbound(_)) => Ok(None),
    }
}

fn build_quad_pattern(
    ctx: &EvalContext,
    subject: &Term,
    predicate: &Term,
    object: &Term,
    row: &BindingTable,
) -> ExecutionResult<Option<QuadPattern>> {
    let (Some(s), Some(p), Some(o)) = (
        resolve_slot(ctx, subject, row)?,
        resolve_slot(ctx, predicate, row)?,
        resolve_slot(ctx, object, row)?,
    ) else {
        return Ok(None);
    };
    Ok(Some(QuadPattern {
        graph: Some(ctx.graph),
        subject: s,
        predicate: p,
        object: o,
    }))
}

/// Binds `term` to `value` in `row`. A constant term always "binds"
/// successfully (the pattern match already enforced equality); a
/// variable binds on first sight, and on a repeat sighting within the
/// same triple pattern (e.g. `?x foaf:knows ?x`) must agree with what
/// it was already bound to instead of silently overwriting it.
fn bind_position(row: &mut BindingTable, term: &Term, value: AtomId) -> bool {
    match term {
        Term::Variable(v) => match row.get(v) {
            Some(existing) => existing == value,
            None => {
                row.set(v, value);
                true
            }
        },
        _ => true,
    }
}

// ---------------------------------------------------------------------
// Triple pattern and property path evaluation
// ---------------------------------------------------------------------

/// Evaluated directly against [`QuadStore::scan`] rather than through
/// [`crate::scan::TriplePatternScan`]: that scan binds each position
/// independently and would silently let a repeated variable (as above)
/// pick up whichever value it saw last.
fn eval_simple_triple_pattern(
    ctx: &EvalContext,
    subject: &Term,
    predicate: &Term,
    object: &Term,
    rows: Vec<BindingTable>,
) -> ExecutionResult<Vec<BindingTable>> {
    let mut out = Vec::new();
    for row in rows {
        let Some(pattern) = build_quad_pattern(ctx, subject, predicate, object, &row)? else {
            continue;
        };
        for quad in ctx.store.scan(&pattern, None)? {
            let mut candidate = row.clone();
            let ok = bind_position(&mut candidate, subject, quad.subject)
                && bind_position(&mut candidate, predicate, quad.predicate)
                && bind_position(&mut candidate, object, quad.object);
            if ok {
                out.push(candidate);
            }
        }
    }
    Ok(out)
}

fn eval_triple_pattern(
    ctx: &EvalContext,
    tp: &TriplePattern,
    rows: Vec<BindingTable>,
) -> ExecutionResult<Vec<BindingTable>> {
    if let PropertyPath::Predicate(term) = &tp.path {
        return eval_simple_triple_pattern(ctx, &tp.subject, term, &tp.object, rows);
    }
    eval_path_triple_pattern(ctx, &tp.subject, &tp.path, &tp.object, rows)
}

/// Every node reachable from `node` by one traversal of `path`.
fn path_successors(ctx: &EvalContext, path: &PropertyPath, node: AtomId) -> ExecutionResult<HashSet<AtomId>> {
    match path {
        PropertyPath::Predicate(term) => {
            let Some(p) = resolve_constant(ctx, term)? else {
                return Ok(HashSet::new());
            };
            let pattern = QuadPattern {
                graph: Some(ctx.graph),
                subject: Some(node),
                predicate: Some(p),
                object: None,
            };
            Ok(ctx.store.scan(&pattern, None)?.into_iter().map(|q| q.object).collect())
        }
        PropertyPath::Inverse(inner) => path_predecessors_via_forward(ctx, inner, node),
        PropertyPath::Sequence(a, b) => {
            let mut out = HashSet::new();
            for mid in path_successors(ctx, a, node)? {
                out.extend(path_successors(ctx, b, mid)?);
            }
            Ok(out)
        }
        PropertyPath::Alternative(a, b) => {
            let mut out = path_successors(ctx, a, node)?;
            out.extend(path_successors(ctx, b, node)?);
            Ok(out)
        }
        PropertyPath::ZeroOrMore(inner) => path_closure(ctx, inner, node, true),
        PropertyPath::OneOrMore(inner) => path_closure(ctx, inner, node, false),
        PropertyPath::ZeroOrOne(inner) => {
            let mut out = path_successors(ctx, inner, node)?;
            out.insert(node);
            Ok(out)
        }
        PropertyPath::NegatedPropertySet(terms) => {
            let mut excluded_forward = HashSet::new();
            let mut excluded_inverse = HashSet::new();
            for (inverse, term) in terms {
                if let Some(p) = resolve_constant(ctx, term)? {
                    if *inverse {
                        excluded_inverse.insert(p);
                    } else {
                        excluded_forward.insert(p);
                    }
                }
            }
            let mut out = HashSet::new();
            let forward = QuadPattern {
                graph: Some(ctx.graph),
                subject: Some(node),
                predicate: None,
                object: None,
            };
            for quad in ctx.store.scan(&forward, None)? {
                if !excluded_forward.contains(&quad.predicate) {
                    out.insert(quad.object);
                }
            }
            let backward = QuadPattern {
                graph: Some(ctx.graph),
                subject: None,
                predicate: None,
                object: Some(node),
            };
            for quad in ctx.store.scan(&backward, None)? {
                if !excluded_inverse.contains(&quad.predicate) {
                    out.insert(quad.subject);
                }
            }
            Ok(out)
        }
    }
}

/// The predecessors of `node` under `inner`, computed without a
/// dedicated backward scan except at the `Predicate` base case —
/// everything else inverts structurally and delegates to
/// [`path_successors`]. Every inversion peels one combinator, so the
/// mutual recursion with [`invert_path`] always terminates.
fn path_predecessors_via_forward(
    ctx: &EvalContext,
    inner: &PropertyPath,
    node: AtomId,
) -> ExecutionResult<HashSet<AtomId>> {
    if let PropertyPath::Predicate(term) = inner {
        let Some(p) = resolve_constant(ctx, term)? else {
            return Ok(HashSet::new());
        };
        let pattern = QuadPattern {
            graph: Some(ctx.graph),
            subject: None,
            predicate: Some(p),
            object: Some(node),
        };
        return Ok(ctx.store.scan(&pattern, None)?.into_iter().map(|q| q.subject).collect());
    }
    path_successors(ctx, &invert_path(inner), node)
}

fn invert_path(path: &PropertyPath) -> PropertyPath {
    match path {
        PropertyPath::Predicate(term) => PropertyPath::Inverse(Box::new(PropertyPath::Predicate(term.clone()))),
        PropertyPath::Inverse(inner) => (**inner).clone(),
        PropertyPath::Sequence(a, b) => PropertyPath::Sequence(Box::new(invert_path(b)), Box::new(invert_path(a))),
        PropertyPath::Alternative(a, b) => {
            PropertyPath::Alternative(Box::new(invert_path(a)), Box::new(invert_path(b)))
        }
        PropertyPath::ZeroOrMore(inner) => PropertyPath::ZeroOrMore(Box::new(invert_path(inner))),
        PropertyPath::OneOrMore(inner) => PropertyPath::OneOrMore(Box::new(invert_path(inner))),
        PropertyPath::ZeroOrOne(inner) => PropertyPath::ZeroOrOne(Box::new(invert_path(inner))),
        PropertyPath::NegatedPropertySet(terms) => {
            PropertyPath::NegatedPropertySet(terms.iter().map(|(inv, t)| (!inv, t.clone())).collect())
        }
    }
}

/// BFS closure for `*`/`+`. `visited` only ever accumulates nodes
/// reached by at least one step — `start` is never pre-seeded into it,
/// or a cycle back to `start` (e.g. `?x (ex:knows)+ ?x`) would find
/// `visited.insert(start)` already `false` and never add `start` to
/// the result. `start` itself is added to `reached` afterwards, based
/// purely on `include_zero` (true for `*`, false for `+`).
fn path_closure(
    ctx: &EvalContext,
    inner: &PropertyPath,
    start: AtomId,
    include_zero: bool,
) -> ExecutionResult<HashSet<AtomId>> {
    let mut visited: HashSet<AtomId> = HashSet::new();
    let mut frontier = vec![start];
    while let Some(node) = frontier.pop() {
        for next in path_successors(ctx, inner, node)? {
            if visited.insert(next) {
                frontier.push(next);
            }
        }
    }
    if include_zero {
        visited.insert(start);
    }
    Ok(visited)
}

fn distinct_subjects(ctx: &EvalContext) -> ExecutionResult<HashSet<AtomId>> {
    let pattern = QuadPattern {
        graph: Some(ctx.graph),
        ..Default::default()
    };
    Ok(ctx.store.scan(&pattern, None)?.into_iter().map(|q| q.subject).collect())
}

/// Every distinct non-default graph id currently in use. There is no
/// graph registry to enumerate (`QuadStore` has no `list_graphs`), so
/// `GRAPH ?g { ... }` with an unbound `?g` has to scan every quad and
/// group by its graph slot — an O(all quads) fallback, acceptable for
/// an embeddable store without a dedicated catalog.
fn distinct_graphs(ctx: &EvalContext) -> ExecutionResult<HashSet<AtomId>> {
    let pattern = QuadPattern::default();
    Ok(ctx
        .store
        .scan(&pattern, None)?
        .into_iter()
        .map(|q| q.graph)
        .filter(|g| *g != DEFAULT_GRAPH)
        .collect())
}

fn eval_path_triple_pattern(
    ctx: &EvalContext,
    subject: &Term,
    path: &PropertyPath,
    object: &Term,
    rows: Vec<BindingTable>,
) -> ExecutionResult<Vec<BindingTable>> {
    let mut out = Vec::new();
    for row in rows {
        let (Some(subj_slot), Some(obj_slot)) = (resolve_slot(ctx, subject, &row)?, resolve_slot(ctx, object, &row)?)
        else {
            continue;
        };
        match (subj_slot, obj_slot) {
            (Some(s), Some(o)) => {
                if path_successors(ctx, path, s)?.contains(&o) {
                    out.push(row);
                }
            }
            (Some(s), None) => {
                for o in path_successors(ctx, path, s)? {
                    let mut candidate = row.clone();
                    if bind_position(&mut candidate, object, o) {
                        out.push(candidate);
                    }
                }
            }
            (None, Some(o)) => {
                let inverted = invert_path(path);
                for s in path_successors(ctx, &inverted, o)? {
                    let mut candidate = row.clone();
                    if bind_position(&mut candidate, subject, s) {
                        out.push(candidate);
                    }
                }
            }
            (None, None) => {
                // No bound endpoint at all: fall back to enumerating every
                // subject in scope. Correct but expensive; unselective
                // unbound path patterns should be rare in practice.
                for s in distinct_subjects(ctx)? {
                    for o in path_successors(ctx, path, s)? {
                        let mut candidate = row.clone();
                        if bind_position(&mut candidate, subject, s) && bind_position(&mut candidate, object, o) {
                            out.push(candidate);
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Pattern algebra
// ---------------------------------------------------------------------

fn eval_pattern(ctx: &EvalContext, pattern: &GraphPattern) -> ExecutionResult<Vec<BindingTable>> {
    match pattern {
        GraphPattern::Unit => Ok(vec![BindingTable::new()]),
        GraphPattern::Bgp(patterns) => {
            let ordered = algebra::reorder_bgp(patterns.clone());
            let mut rows = vec![BindingTable::new()];
            for tp in &ordered {
                if rows.is_empty() {
                    break;
                }
                rows = eval_triple_pattern(ctx, tp, rows)?;
            }
            Ok(rows)
        }
        GraphPattern::Join(l, r) => {
            let left = eval_pattern(ctx, l)?;
            let right = eval_pattern(ctx, r)?;
            Ok(join_rows(&left, &right))
        }
        GraphPattern::Union(l, r) => {
            let mut left = eval_pattern(ctx, l)?;
            left.extend(eval_pattern(ctx, r)?);
            Ok(left)
        }
        GraphPattern::Minus(l, r) => {
            let left = eval_pattern(ctx, l)?;
            let right = eval_pattern(ctx, r)?;
            Ok(eval_minus(left, right))
        }
        GraphPattern::LeftJoin { left, right, filter } => {
            let left_rows = eval_pattern(ctx, left)?;
            let right_rows = eval_pattern(ctx, right)?;
            Ok(eval_left_join(ctx, left_rows, right_rows, filter.as_ref()))
        }
        GraphPattern::Filter { input, expr } => {
            let rows = eval_pattern(ctx, input)?;
            Ok(eval_filter(ctx, rows, expr))
        }
        GraphPattern::Bind { input, var, expr } => {
            let rows = eval_pattern(ctx, input)?;
            Ok(eval_bind(ctx, rows, var, expr))
        }
        GraphPattern::Graph { graph, input } => eval_graph(ctx, graph, input),
        GraphPattern::Service { endpoint, silent, input } => eval_service(ctx, endpoint, *silent, input),
        GraphPattern::Values { variables, rows } => eval_values(ctx, variables, rows),
        GraphPattern::SubSelect(query) => eval_subquery(ctx, query),
    }
}

fn join_rows(left: &[BindingTable], right: &[BindingTable]) -> Vec<BindingTable> {
    let mut out = Vec::new();
    for l in left {
        for r in right {
            if l.is_compatible(r) {
                let mut merged = l.clone();
                merged.merge_from(r);
                out.push(merged);
            }
        }
    }
    out
}

fn shares_variable(a: &BindingTable, b: &BindingTable) -> bool {
    a.variables().any(|v| b.is_bound(v))
}

fn eval_minus(left: Vec<BindingTable>, right: Vec<BindingTable>) -> Vec<BindingTable> {
    left.into_iter()
        .filter(|l| !right.iter().any(|r| shares_variable(l, r) && l.is_compatible(r)))
        .collect()
}

fn eval_left_join(
    ctx: &EvalContext,
    left: Vec<BindingTable>,
    right: Vec<BindingTable>,
    filter: Option<&Expression>,
) -> Vec<BindingTable> {
    let mut out = Vec::new();
    for l in left {
        let mut matched = false;
        for r in &right {
            if !l.is_compatible(r) {
                continue;
            }
            let mut merged = l.clone();
            merged.merge_from(r);
            let keep = match filter {
                Some(expr) => eval_expression(ctx, expr, &merged).and_then(|t| ebv(&t)).unwrap_or(false),
                None => true,
            };
            if keep {
                matched = true;
                out.push(merged);
            }
        }
        if !matched {
            out.push(l);
        }
    }
    out
}

/// FILTER errors drop the row silently, per SPARQL FILTER semantics.
fn eval_filter(ctx: &EvalContext, rows: Vec<BindingTable>, expr: &Expression) -> Vec<BindingTable> {
    rows.into_iter()
        .filter(|row| eval_expression(ctx, expr, row).and_then(|t| ebv(&t)).unwrap_or(false))
        .collect()
}

/// BIND errors leave the variable unbound for that row rather than
/// dropping it, per SPARQL BIND semantics.
fn eval_bind(ctx: &EvalContext, rows: Vec<BindingTable>, var: &str, expr: &Expression) -> Vec<BindingTable> {
    rows.into_iter()
        .map(|mut row| {
            if let Ok(term) = eval_expression(ctx, expr, &row) {
                if let Ok(atom) = ctx.store.intern_term(&term.to_interned_bytes()) {
                    row.set(var, atom);
                }
            }
            row
        })
        .collect()
}

fn eval_graph(ctx: &EvalContext, graph: &Term, input: &GraphPattern) -> ExecutionResult<Vec<BindingTable>> {
    match graph {
        Term::Variable(_) => {
            let mut out = Vec::new();
            for gid in distinct_graphs(ctx)? {
                let scoped = EvalContext {
                    store: ctx.store.clone(),
                    graph: gid,
                };
                for mut row in eval_pattern(&scoped, input)? {
                    if bind_position(&mut row, graph, gid) {
                        out.push(row);
                    }
                }
            }
            Ok(out)
        }
        other => {
            let Some(gid) = resolve_constant(ctx, other)? else {
                return Ok(Vec::new());
            };
            let scoped = EvalContext {
                store: ctx.store.clone(),
                graph: gid,
            };
            eval_pattern(&scoped, input)
        }
    }
}

fn eval_values(
    ctx: &EvalContext,
    variables: &[Variable],
    rows: &[Vec<Option<Term>>],
) -> ExecutionResult<Vec<BindingTable>> {
    let mut out = Vec::new();
    'row: for row_terms in rows {
        let mut table = BindingTable::new();
        for (var, term) in variables.iter().zip(row_terms.iter()) {
            if let Some(term) = term {
                match ctx.store.lookup_term(&term.to_interned_bytes())? {
                    Some(atom) => table.set(var, atom),
                    // A VALUES constant that was never interned can't
                    // match anything downstream; drop the whole row.
                    None => continue 'row,
                }
            }
        }
        out.push(table);
    }
    Ok(out)
}

fn eval_subquery(ctx: &EvalContext, query: &Query) -> ExecutionResult<Vec<BindingTable>> {
    match query {
        Query::Select { select, pattern, modifiers } => {
            let sub_ctx = EvalContext {
                store: ctx.store.clone(),
                graph: ctx.graph,
            };
            let (_, rows) = eval_select(&sub_ctx, select, pattern, modifiers)?;
            Ok(rows)
        }
        _ => Err(ExecutionError::Type("a nested subquery must be a SELECT".to_string())),
    }
}

/// Dispatches a `SERVICE` clause to a remote endpoint over
/// [`ServicePatternScan`], projecting every variable the nested
/// pattern mentions.
fn eval_service(
    ctx: &EvalContext,
    endpoint: &Term,
    silent: bool,
    input: &GraphPattern,
) -> ExecutionResult<Vec<BindingTable>> {
    let Term::NamedNode(iri) = endpoint else {
        return if silent {
            Ok(vec![BindingTable::new()])
        } else {
            Err(ExecutionError::Service("SERVICE endpoint must be a constant IRI".to_string()))
        };
    };

    let projected = pattern_variables(input);
    let query_text = serialize_select(&projected, input);
    let mut scan = ServicePatternScan::new(ctx.store.clone(), iri.clone(), query_text, projected);

    let mut out = Vec::new();
    loop {
        let mut table = BindingTable::new();
        match scan.move_next(&mut table) {
            Ok(true) => out.push(table),
            Ok(false) => break,
            Err(e) => {
                scan.dispose();
                return if silent {
                    Ok(vec![BindingTable::new()])
                } else {
                    Err(ExecutionError::Service(e.to_string()))
                };
            }
        }
    }
    scan.dispose();
    Ok(out)
}

fn pattern_variables(pattern: &GraphPattern) -> Vec<Variable> {
    let mut out = Vec::new();
    collect_pattern_vars(pattern, &mut out);
    out
}

fn collect_term_var(term: &Term, out: &mut Vec<Variable>) {
    if let Term::Variable(v) = term {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
}

fn collect_path_vars(path: &PropertyPath, out: &mut Vec<Variable>) {
    match path {
        PropertyPath::Predicate(term) => collect_term_var(term, out),
        PropertyPath::Inverse(inner)
        | PropertyPath::ZeroOrMore(inner)
        | PropertyPath::OneOrMore(inner)
        | PropertyPath::ZeroOrOne(inner) => collect_path_vars(inner, out),
        PropertyPath::Sequence(a, b) | PropertyPath::Alternative(a, b) => {
            collect_path_vars(a, out);
            collect_path_vars(b, out);
        }
        PropertyPath::NegatedPropertySet(terms) => {
            for (_, term) in terms {
                collect_term_var(term, out);
            }
        }
    }
}

fn collect_pattern_vars(pattern: &GraphPattern, out: &mut Vec<Variable>) {
    match pattern {
        GraphPattern::Unit => {}
        GraphPattern::Bgp(patterns) => {
            for tp in patterns {
                collect_term_var(&tp.subject, out);
                collect_path_vars(&tp.path, out);
                collect_term_var(&tp.object, out);
            }
        }
        GraphPattern::Join(l, r) | GraphPattern::Union(l, r) | GraphPattern::Minus(l, r) => {
            collect_pattern_vars(l, out);
            collect_pattern_vars(r, out);
        }
        GraphPattern::LeftJoin { left, right, .. } => {
            collect_pattern_vars(left, out);
            collect_pattern_vars(right, out);
        }
        GraphPattern::Filter { input, .. } => collect_pattern_vars(input, out),
        GraphPattern::Bind { input, var, .. } => {
            collect_pattern_vars(input, out);
            if !out.contains(var) {
                out.push(var.clone());
            }
        }
        GraphPattern::Graph { graph, input } => {
            collect_term_var(graph, out);
            collect_pattern_vars(input, out);
        }
        GraphPattern::Service { input, .. } => collect_pattern_vars(input, out),
        GraphPattern::Values { variables, .. } => {
            for v in variables {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        GraphPattern::SubSelect(query) => {
            if let Query::Select { select, pattern, .. } = query.as_ref() {
                match &select.projection {
                    None | Some(Projection::Star) => collect_pattern_vars(pattern, out),
                    Some(Projection::Items(items)) => {
                        for item in items {
                            let name = item.alias.clone().or_else(|| match &item.expr {
                                Expression::Term(Term::Variable(v)) => Some(v.clone()),
                                _ => None,
                            });
                            if let Some(name) = name {
                                if !out.contains(&name) {
                                    out.push(name);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// SERVICE query text serialization
// ---------------------------------------------------------------------

fn serialize_term(term: &Term) -> String {
    match term {
        Term::Variable(v) => format!("?{v}"),
        Term::NamedNode(iri) => format!("<{iri}>"),
        Term::BlankNode(id) => format!("_:{id}"),
        Term::Literal { value, language, datatype } => {
            let mut out = format!("\"{}\"", value.replace('"', "\\\""));
            if let Some(lang) = language {
                out.push('@');
                out.push_str(lang);
            } else if let Some(dt) = datatype {
                out.push_str("^^<");
                out.push_str(dt);
                out.push('>');
            }
            out
        }
    }
}

fn serialize_path(path: &PropertyPath) -> String {
    match path {
        PropertyPath::Predicate(term) => serialize_term(term),
        PropertyPath::Inverse(inner) => format!("^{}", serialize_path(inner)),
        PropertyPath::Sequence(a, b) => format!("{}/{}", serialize_path(a), serialize_path(b)),
        PropertyPath::Alternative(a, b) => format!("{}|{}", serialize_path(a), serialize_path(b)),
        PropertyPath::ZeroOrMore(inner) => format!("{}*", serialize_path(inner)),
        PropertyPath::OneOrMore(inner) => format!("{}+", serialize_path(inner)),
        PropertyPath::ZeroOrOne(inner) => format!("{}?", serialize_path(inner)),
        PropertyPath::NegatedPropertySet(terms) => {
            let parts: Vec<String> = terms
                .iter()
                .map(|(inv, t)| {
                    let s = serialize_term(t);
                    if *inv {
                        format!("^{s}")
                    } else {
                        s
                    }
                })
                .collect();
            format!("!({})", parts.join("|"))
        }
    }
}

fn compare_op_str(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::NotEq => "!=",
        CompareOp::Lt => "<",
        CompareOp::LtEq => "<=",
        CompareOp::Gt => ">",
        CompareOp::GtEq => ">=",
    }
}

fn serialize_expression(expr: &Expression) -> String {
    match expr {
        Expression::Term(term) => serialize_term(term),
        Expression::Compare(op, a, b) => {
            format!("({} {} {})", serialize_expression(a), compare_op_str(*op), serialize_expression(b))
        }
        Expression::And(a, b) => format!("({} && {})", serialize_expression(a), serialize_expression(b)),
        Expression::Or(a, b) => format!("({} || {})", serialize_expression(a), serialize_expression(b)),
        Expression::Not(inner) => format!("!{}", serialize_expression(inner)),
        Expression::Bound(v) => format!("bound(?{v})", v = v),
        // A handful of combinators a remote endpoint can still be asked
        // to honor; anything else degrades to an always-true filter
        // rather than failing the whole SERVICE call.
        _ => "true".to_string(),
    }
}

/// Serializes the fragment of the pattern algebra a SPARQL 1.1 endpoint
/// can be sent as query text. Combinators that don't round-trip through
/// a textual SELECT this simply (nested `OPTIONAL`, `GRAPH`, subselects)
/// fall back to an empty group rather than failing to build a request —
/// the remote call still happens, just without that sub-pattern's
/// constraints applied remotely.
fn serialize_pattern(pattern: &GraphPattern) -> String {
    match pattern {
        GraphPattern::Unit => String::new(),
        GraphPattern::Bgp(patterns) => patterns
            .iter()
            .map(|tp| format!("{} {} {} .", serialize_term(&tp.subject), serialize_path(&tp.path), serialize_term(&tp.object)))
            .collect::<Vec<_>>()
            .join(" "),
        GraphPattern::Join(l, r) => format!("{} {}", serialize_pattern(l), serialize_pattern(r)),
        GraphPattern::Union(l, r) => format!("{{ {} }} UNION {{ {} }}", serialize_pattern(l), serialize_pattern(r)),
        GraphPattern::Filter { input, expr } => {
            format!("{} FILTER({})", serialize_pattern(input), serialize_expression(expr))
        }
        _ => String::new(),
    }
}

fn serialize_select(variables: &[Variable], pattern: &GraphPattern) -> String {
    let vars = if variables.is_empty() {
        "*".to_string()
    } else {
        variables.iter().map(|v| format!("?{v}")).collect::<Vec<_>>().join(" ")
    };
    format!("SELECT {vars} WHERE {{ {} }}", serialize_pattern(pattern))
}

// ---------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------

fn term_of(ctx: &EvalContext, var: &str, row: &BindingTable) -> ExecutionResult<RdfTerm> {
    let atom = row.get(var).ok_or_else(|| ExecutionError::Unbound(var.to_string()))?;
    let bytes = ctx.store.atom_bytes(atom)?;
    Ok(RdfTerm::from_interned_bytes(&bytes)?)
}

fn ast_term_to_rdf(term: &Term) -> ExecutionResult<RdfTerm> {
    match term {
        Term::NamedNode(iri) => Ok(RdfTerm::NamedNode(NamedNode::new(iri)?)),
        Term::BlankNode(id) => Ok(RdfTerm::BlankNode(BlankNode::from_str(id)?)),
        Term::Literal { value, language, datatype } => {
            if let Some(lang) = language {
                Ok(RdfTerm::Literal(Literal::new_language_tagged_literal(value.clone(), lang.clone())?))
            } else if let Some(dt) = datatype {
                Ok(RdfTerm::Literal(Literal::new_typed_literal(value.clone(), NamedNode::new(dt)?)))
            } else {
                Ok(RdfTerm::Literal(Literal::new_simple_literal(value.clone())))
            }
        }
        Term::Variable(_) => unreachable!("ast_term_to_rdf is only called on ground terms"),
    }
}

fn bool_term(value: bool) -> ExecutionResult<RdfTerm> {
    Ok(RdfTerm::Literal(Literal::new_typed_literal(
        if value { "true" } else { "false" },
        NamedNode::new(XSD_BOOLEAN)?,
    )))
}

fn literal_value(term: &RdfTerm) -> ExecutionResult<String> {
    match term {
        RdfTerm::Literal(lit) => Ok(lit.value().to_string()),
        other => Err(ExecutionError::Type(format!("expected a literal, got {other}"))),
    }
}

fn ebv(term: &RdfTerm) -> ExecutionResult<bool> {
    match term {
        RdfTerm::Literal(lit) => {
            let dt = lit.datatype();
            if dt.as_str() == XSD_BOOLEAN {
                Ok(lit.value() == "true" || lit.value() == "1")
            } else if let Ok(n) = lit.value().parse::<f64>() {
                Ok(n != 0.0)
            } else {
                Ok(!lit.value().is_empty())
            }
        }
        _ => Err(ExecutionError::Type("effective boolean value requires a literal".to_string())),
    }
}

/// Numeric arithmetic and comparison work over `f64` rather than exact
/// xsd:decimal/xsd:dateTime semantics — a deliberate simplification for
/// an embeddable engine, traded for a single, simple numeric path.
fn numeric_value(term: &RdfTerm) -> ExecutionResult<(f64, bool)> {
    match term {
        RdfTerm::Literal(lit) => {
            let n = lit
                .value()
                .parse::<f64>()
                .map_err(|_| ExecutionError::Type(format!("not a numeric literal: {lit}")))?;
            Ok((n, INTEGER_DATATYPES.contains(&lit.datatype().as_str())))
        }
        other => Err(ExecutionError::Type(format!("not a numeric literal: {other}"))),
    }
}

fn numeric_term(value: f64, is_integer: bool) -> ExecutionResult<RdfTerm> {
    let (text, dt) = if is_integer {
        (format!("{}", value as i64), XSD_INTEGER)
    } else {
        (value.to_string(), XSD_DECIMAL)
    };
    Ok(RdfTerm::Literal(Literal::new_typed_literal(text, NamedNode::new(dt)?)))
}

fn arithmetic(op: ArithOp, a: &RdfTerm, b: &RdfTerm) -> ExecutionResult<RdfTerm> {
    let (av, ai) = numeric_value(a)?;
    let (bv, bi) = numeric_value(b)?;
    let result_is_integer = ai && bi && op != ArithOp::Div;
    let value = match op {
        ArithOp::Add => av + bv,
        ArithOp::Sub => av - bv,
        ArithOp::Mul => av * bv,
        ArithOp::Div => {
            if bv == 0.0 {
                return Err(ExecutionError::Type("division by zero".to_string()));
            }
            av / bv
        }
    };
    numeric_term(value, result_is_integer)
}

fn negate_numeric(term: &RdfTerm) -> ExecutionResult<RdfTerm> {
    let (v, is_integer) = numeric_value(term)?;
    numeric_term(-v, is_integer)
}

fn term_sort_key(term: &RdfTerm) -> String {
    match term {
        RdfTerm::Literal(lit) => lit.value().to_string(),
        RdfTerm::NamedNode(n) => n.as_str().to_string(),
        RdfTerm::BlankNode(b) => b.as_str().to_string(),
    }
}

fn term_ordering(a: &RdfTerm, b: &RdfTerm) -> std::cmp::Ordering {
    if let (Ok((av, _)), Ok((bv, _))) = (numeric_value(a), numeric_value(b)) {
        return av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal);
    }
    term_sort_key(a).cmp(&term_sort_key(b))
}

fn compare_terms(op: CompareOp, a: &RdfTerm, b: &RdfTerm) -> ExecutionResult<bool> {
    let equal = a == b || term_ordering(a, b) == std::cmp::Ordering::Equal;
    Ok(match op {
        CompareOp::Eq => equal,
        CompareOp::NotEq => !equal,
        CompareOp::Lt => term_ordering(a, b) == std::cmp::Ordering::Less,
        CompareOp::LtEq => term_ordering(a, b) != std::cmp::Ordering::Greater,
        CompareOp::Gt => term_ordering(a, b) == std::cmp::Ordering::Greater,
        CompareOp::GtEq => term_ordering(a, b) != std::cmp::Ordering::Less,
    })
}

fn terms_equal(a: &RdfTerm, b: &RdfTerm) -> bool {
    a == b || term_ordering(a, b) == std::cmp::Ordering::Equal
}

fn eval_expression(ctx: &EvalContext, expr: &Expression, row: &BindingTable) -> ExecutionResult<RdfTerm> {
    match expr {
        Expression::Term(Term::Variable(v)) => term_of(ctx, v, row),
        Expression::Term(term) => ast_term_to_rdf(term),
        Expression::And(a, b) => {
            let av = ebv(&eval_expression(ctx, a, row)?)?;
            if !av {
                return bool_term(false);
            }
            bool_term(ebv(&eval_expression(ctx, b, row)?)?)
        }
        Expression::Or(a, b) => {
            let av = ebv(&eval_expression(ctx, a, row)?)?;
            if av {
                return bool_term(true);
            }
            bool_term(ebv(&eval_expression(ctx, b, row)?)?)
        }
        Expression::Not(inner) => bool_term(!ebv(&eval_expression(ctx, inner, row)?)?),
        Expression::UnaryMinus(inner) => negate_numeric(&eval_expression(ctx, inner, row)?),
        Expression::Compare(op, a, b) => {
            let av = eval_expression(ctx, a, row)?;
            let bv = eval_expression(ctx, b, row)?;
            bool_term(compare_terms(*op, &av, &bv)?)
        }
        Expression::Arithmetic(op, a, b) => {
            let av = eval_expression(ctx, a, row)?;
            let bv = eval_expression(ctx, b, row)?;
            arithmetic(*op, &av, &bv)
        }
        Expression::In { needle, haystack, negated } => {
            let needle_val = eval_expression(ctx, needle, row)?;
            let mut found = false;
            for candidate in haystack {
                if let Ok(cv) = eval_expression(ctx, candidate, row) {
                    if terms_equal(&needle_val, &cv) {
                        found = true;
                        break;
                    }
                }
            }
            bool_term(found != *negated)
        }
        Expression::Bound(v) => bool_term(row.is_bound(v)),
        Expression::FunctionCall { name, .. } => {
            Err(ExecutionError::Type(format!("user-defined function not supported: {name}")))
        }
        Expression::Builtin { name, args } => eval_builtin(ctx, name, args, row),
        Expression::If { condition, then_expr, else_expr } => {
            if ebv(&eval_expression(ctx, condition, row)?)? {
                eval_expression(ctx, then_expr, row)
            } else {
                eval_expression(ctx, else_expr, row)
            }
        }
        Expression::Coalesce(items) => {
            for item in items {
                if let Ok(v) = eval_expression(ctx, item, row) {
                    return Ok(v);
                }
            }
            Err(ExecutionError::Type("COALESCE: every argument failed to evaluate".to_string()))
        }
        Expression::Exists { negated, pattern } => {
            let found = eval_correlated(ctx, pattern, row)?;
            bool_term(found != *negated)
        }
        Expression::Aggregate { .. } => Err(ExecutionError::Type(
            "aggregate expression used outside of a SELECT/HAVING/ORDER BY context".to_string(),
        )),
    }
}

fn eval_correlated(ctx: &EvalContext, pattern: &GraphPattern, row: &BindingTable) -> ExecutionResult<bool> {
    let rows = eval_pattern(ctx, pattern)?;
    Ok(rows.iter().any(|candidate| candidate.is_compatible(row)))
}

fn eval_builtin(ctx: &EvalContext, name: &str, args: &[Expression], row: &BindingTable) -> ExecutionResult<RdfTerm> {
    match name.to_ascii_uppercase().as_str() {
        "STR" => {
            let v = eval_expression(ctx, &args[0], row)?;
            let s = match &v {
                RdfTerm::Literal(lit) => lit.value().to_string(),
                other => other.to_string(),
            };
            Ok(RdfTerm::Literal(Literal::new_simple_literal(s)))
        }
        "LANG" => {
            let v = eval_expression(ctx, &args[0], row)?;
            let lang = match &v {
                RdfTerm::Literal(lit) => lit.language().unwrap_or("").to_string(),
                _ => String::new(),
            };
            Ok(RdfTerm::Literal(Literal::new_simple_literal(lang)))
        }
        "DATATYPE" => match eval_expression(ctx, &args[0], row)? {
            RdfTerm::Literal(lit) => Ok(RdfTerm::NamedNode(lit.datatype())),
            _ => Err(ExecutionError::Type("DATATYPE() requires a literal argument".to_string())),
        },
        "ISIRI" | "ISURI" => bool_term(eval_expression(ctx, &args[0], row)?.is_named_node()),
        "ISLITERAL" => bool_term(eval_expression(ctx, &args[0], row)?.is_literal()),
        "ISBLANK" => bool_term(eval_expression(ctx, &args[0], row)?.is_blank_node()),
        "ISNUMERIC" => bool_term(numeric_value(&eval_expression(ctx, &args[0], row)?).is_ok()),
        "STRLEN" => {
            let s = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            numeric_term(s.chars().count() as f64, true)
        }
        "UCASE" => {
            let s = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            Ok(RdfTerm::Literal(Literal::new_simple_literal(s.to_uppercase())))
        }
        "LCASE" => {
            let s = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            Ok(RdfTerm::Literal(Literal::new_simple_literal(s.to_lowercase())))
        }
        "CONCAT" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&literal_value(&eval_expression(ctx, arg, row)?)?);
            }
            Ok(RdfTerm::Literal(Literal::new_simple_literal(out)))
        }
        "CONTAINS" => {
            let a = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            let b = literal_value(&eval_expression(ctx, &args[1], row)?)?;
            bool_term(a.contains(&b))
        }
        "STRSTARTS" => {
            let a = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            let b = literal_value(&eval_expression(ctx, &args[1], row)?)?;
            bool_term(a.starts_with(&b))
        }
        "STRENDS" => {
            let a = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            let b = literal_value(&eval_expression(ctx, &args[1], row)?)?;
            bool_term(a.ends_with(&b))
        }
        "SUBSTR" => {
            let s = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            let (start, _) = numeric_value(&eval_expression(ctx, &args[1], row)?)?;
            let start = (start.round() as isize - 1).max(0) as usize;
            let chars: Vec<char> = s.chars().collect();
            let len = if args.len() > 2 {
                let (l, _) = numeric_value(&eval_expression(ctx, &args[2], row)?)?;
                l.round().max(0.0) as usize
            } else {
                chars.len().saturating_sub(start)
            };
            let substr: String = chars.into_iter().skip(start).take(len).collect();
            Ok(RdfTerm::Literal(Literal::new_simple_literal(substr)))
        }
        "REGEX" => {
            let text = literal_value(&eval_expression(ctx, &args[0], row)?)?;
            let pattern = literal_value(&eval_expression(ctx, &args[1], row)?)?;
            let flags = if args.len() > 2 {
                literal_value(&eval_expression(ctx, &args[2], row)?)?
            } else {
                String::new()
            };
            let mut builder = regex::RegexBuilder::new(&pattern);
            builder.case_insensitive(flags.contains('i'));
            builder.dot_matches_new_line(flags.contains('s'));
            builder.multi_line(flags.contains('m'));
            let re = builder
                .build()
                .map_err(|e| ExecutionError::Type(format!("invalid REGEX pattern: {e}")))?;
            bool_term(re.is_match(&text))
        }
        "ABS" => {
            let (v, is_integer) = numeric_value(&eval_expression(ctx, &args[0], row)?)?;
            numeric_term(v.abs(), is_integer)
        }
        "CEIL" => numeric_term(numeric_value(&eval_expression(ctx, &args[0], row)?)?.0.ceil(), true),
        "FLOOR" => numeric_term(numeric_value(&eval_expression(ctx, &args[0], row)?)?.0.floor(), true),
        "ROUND" => numeric_term(numeric_value(&eval_expression(ctx, &args[0], row)?)?.0.round(), true),
        other => Err(ExecutionError::Type(format!("unsupported builtin function: {other}"))),
    }
}

// ---------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------

fn collect_aggregates(expr: &Expression, out: &mut Vec<Expression>) {
    match expr {
        Expression::Aggregate { .. } => {
            if !out.iter().any(|e| e == expr) {
                out.push(expr.clone());
            }
        }
        Expression::Term(_) | Expression::Bound(_) => {}
        Expression::And(a, b)
        | Expression::Or(a, b)
        | Expression::Compare(_, a, b)
        | Expression::Arithmetic(_, a, b) => {
            collect_aggregates(a, out);
            collect_aggregates(b, out);
        }
        Expression::Not(inner) | Expression::UnaryMinus(inner) => collect_aggregates(inner, out),
        Expression::In { needle, haystack, .. } => {
            collect_aggregates(needle, out);
            for item in haystack {
                collect_aggregates(item, out);
            }
        }
        Expression::FunctionCall { args, .. } | Expression::Builtin { args, .. } => {
            for arg in args {
                collect_aggregates(arg, out);
            }
        }
        Expression::If { condition, then_expr, else_expr } => {
            collect_aggregates(condition, out);
            collect_aggregates(then_expr, out);
            collect_aggregates(else_expr, out);
        }
        Expression::Coalesce(items) => {
            for item in items {
                collect_aggregates(item, out);
            }
        }
        // Aggregates nested inside EXISTS{} are not supported — EXISTS
        // evaluates its pattern independently, with no access to the
        // enclosing group.
        Expression::Exists { .. } => {}
    }
}

fn expression_has_aggregate(expr: &Expression) -> bool {
    let mut out = Vec::new();
    collect_aggregates(expr, &mut out);
    !out.is_empty()
}

fn substitute_aggregates(expr: &Expression, subs: &[(Expression, Variable)]) -> Expression {
    if let Some((_, name)) = subs.iter().find(|(agg, _)| agg == expr) {
        return Expression::Term(Term::Variable(name.clone()));
    }
    match expr {
        Expression::Term(_) | Expression::Bound(_) | Expression::Aggregate { .. } | Expression::Exists { .. } => {
            expr.clone()
        }
        Expression::And(a, b) => {
            Expression::And(Box::new(substitute_aggregates(a, subs)), Box::new(substitute_aggregates(b, subs)))
        }
        Expression::Or(a, b) => {
            Expression::Or(Box::new(substitute_aggregates(a, subs)), Box::new(substitute_aggregates(b, subs)))
        }
        Expression::Not(inner) => Expression::Not(Box::new(substitute_aggregates(inner, subs))),
        Expression::UnaryMinus(inner) => Expression::UnaryMinus(Box::new(substitute_aggregates(inner, subs))),
        Expression::Compare(op, a, b) => Expression::Compare(
            *op,
            Box::new(substitute_aggregates(a, subs)),
            Box::new(substitute_aggregates(b, subs)),
        ),
        Expression::Arithmetic(op, a, b) => Expression::Arithmetic(
            *op,
            Box::new(substitute_aggregates(a, subs)),
            Box::new(substitute_aggregates(b, subs)),
        ),
        Expression::In { needle, haystack, negated } => Expression::In {
            needle: Box::new(substitute_aggregates(needle, subs)),
            haystack: haystack.iter().map(|e| substitute_aggregates(e, subs)).collect(),
            negated: *negated,
        },
        Expression::FunctionCall { name, args } => Expression::FunctionCall {
            name: name.clone(),
            args: args.iter().map(|e| substitute_aggregates(e, subs)).collect(),
        },
        Expression::Builtin { name, args } => Expression::Builtin {
            name: name.clone(),
            args: args.iter().map(|e| substitute_aggregates(e, subs)).collect(),
        },
        Expression::If { condition, then_expr, else_expr } => Expression::If {
            condition: Box::new(substitute_aggregates(condition, subs)),
            then_expr: Box::new(substitute_aggregates(then_expr, subs)),
            else_expr: Box::new(substitute_aggregates(else_expr, subs)),
        },
        Expression::Coalesce(items) => {
            Expression::Coalesce(items.iter().map(|e| substitute_aggregates(e, subs)).collect())
        }
    }
}

/// Groups rows by the interned atom ids of `group_by`'s expressions. An
/// empty `group_by` puts every row (even zero rows) into a single
/// `[]`-keyed group, so `COUNT(*)` over an empty pattern still yields
/// one result row reporting zero — an explicit non-empty `GROUP BY`
/// over zero input rows correctly yields zero groups instead.
fn group_rows(
    ctx: &EvalContext,
    rows: Vec<BindingTable>,
    group_by: &[Expression],
) -> ExecutionResult<IndexMap<Vec<Option<AtomId>>, Vec<BindingTable>>> {
    let mut groups: IndexMap<Vec<Option<AtomId>>, Vec<BindingTable>> = IndexMap::new();
    if group_by.is_empty() {
        groups.entry(Vec::new()).or_default().extend(rows);
        return Ok(groups);
    }
    for row in rows {
        let mut key = Vec::with_capacity(group_by.len());
        for expr in group_by {
            let slot = match eval_expression(ctx, expr, &row) {
                Ok(term) => Some(ctx.store.intern_term(&term.to_interned_bytes())?),
                Err(_) => None,
            };
            key.push(slot);
        }
        groups.entry(key).or_default().push(row);
    }
    Ok(groups)
}

fn eval_aggregate(ctx: &EvalContext, agg: &Expression, rows: &[BindingTable]) -> ExecutionResult<RdfTerm> {
    let Expression::Aggregate { op, distinct, arg, separator } = agg else {
        return Err(ExecutionError::Type("expected an aggregate expression".to_string()));
    };

    let mut values: Vec<RdfTerm> = Vec::new();
    if let Some(arg_expr) = arg {
        for row in rows {
            if let Ok(v) = eval_expression(ctx, arg_expr, row) {
                values.push(v);
            }
        }
    }
    if *distinct {
        let mut seen: Vec<RdfTerm> = Vec::new();
        values.retain(|v| {
            if seen.contains(v) {
                false
            } else {
                seen.push(v.clone());
                true
            }
        });
    }

    match op {
        AggregateOp::Count => numeric_term(if arg.is_some() { values.len() } else { rows.len() } as f64, true),
        AggregateOp::Sum => {
            let mut total = 0.0;
            let mut all_integer = true;
            for v in &values {
                let (n, is_integer) = numeric_value(v)?;
                total += n;
                all_integer &= is_integer;
            }
            numeric_term(total, all_integer)
        }
        AggregateOp::Avg => {
            if values.is_empty() {
                return numeric_term(0.0, false);
            }
            let mut total = 0.0;
            for v in &values {
                total += numeric_value(v)?.0;
            }
            numeric_term(total / values.len() as f64, false)
        }
        AggregateOp::Min => values
            .into_iter()
            .reduce(|a, b| if term_ordering(&b, &a) == std::cmp::Ordering::Less { b } else { a })
            .ok_or_else(|| ExecutionError::Type("MIN over an empty group".to_string())),
        AggregateOp::Max => values
            .into_iter()
            .reduce(|a, b| if term_ordering(&b, &a) == std::cmp::Ordering::Greater { b } else { a })
            .ok_or_else(|| ExecutionError::Type("MAX over an empty group".to_string())),
        AggregateOp::Sample => values
            .into_iter()
            .next()
            .ok_or_else(|| ExecutionError::Type("SAMPLE over an empty group".to_string())),
        AggregateOp::GroupConcat => {
            let sep = separator.clone().unwrap_or_else(|| " ".to_string());
            let joined = values
                .iter()
                .map(|v| literal_value(v).unwrap_or_else(|_| v.to_string()))
                .collect::<Vec<_>>()
                .join(&sep);
            Ok(RdfTerm::Literal(Literal::new_simple_literal(joined)))
        }
    }
}

// ---------------------------------------------------------------------
// Solution modifiers and SELECT
// ---------------------------------------------------------------------

fn expr_display_name(expr: &Expression) -> Variable {
    match expr {
        Expression::Term(Term::Variable(v)) => v.clone(),
        _ => "_unnamed".to_string(),
    }
}

fn row_key(row: &BindingTable, variables: &[Variable]) -> Vec<Option<AtomId>> {
    variables.iter().map(|v| row.get(v)).collect()
}

fn compare_rows(ctx: &EvalContext, a: &BindingTable, b: &BindingTable, order_by: &[OrderCondition]) -> std::cmp::Ordering {
    for cond in order_by {
        let ordering = match (eval_expression(ctx, &cond.expr, a), eval_expression(ctx, &cond.expr, b)) {
            (Ok(av), Ok(bv)) => term_ordering(&av, &bv),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        };
        let ordering = if cond.descending { ordering.reverse() } else { ordering };
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}

fn apply_distinct_and_paging(
    distinct: bool,
    reduced: bool,
    variables: &[Variable],
    mut rows: Vec<BindingTable>,
    offset: Option<u64>,
    limit: Option<u64>,
) -> Vec<BindingTable> {
    if distinct {
        let mut seen = HashSet::new();
        rows.retain(|row| seen.insert(row_key(row, variables)));
    } else if reduced {
        let mut last: Option<Vec<Option<AtomId>>> = None;
        rows.retain(|row| {
            let key = row_key(row, variables);
            let keep = last.as_ref() != Some(&key);
            last = Some(key);
            keep
        });
    }
    let rows: Vec<BindingTable> = rows.into_iter().skip(offset.unwrap_or(0) as usize).collect();
    match limit {
        Some(limit) => rows.into_iter().take(limit as usize).collect(),
        None => rows,
    }
}

/// ORDER BY + OFFSET + LIMIT only, no DISTINCT/projection — used by
/// CONSTRUCT/ASK/DESCRIBE, whose pattern solutions are paged before
/// being templated rather than projected into named output columns.
fn apply_simple_modifiers(ctx: &EvalContext, mut rows: Vec<BindingTable>, modifiers: &SolutionModifiers) -> Vec<BindingTable> {
    rows.sort_by(|a, b| compare_rows(ctx, a, b, &modifiers.order_by));
    let rows: Vec<BindingTable> = rows.into_iter().skip(modifiers.offset.unwrap_or(0) as usize).collect();
    match modifiers.limit {
        Some(limit) => rows.into_iter().take(limit as usize).collect(),
        None => rows,
    }
}

fn resolve_projection_items(select: &SelectClause, pattern: &GraphPattern) -> Vec<ProjectionItem> {
    match &select.projection {
        None | Some(Projection::Star) => pattern_variables(pattern)
            .into_iter()
            .map(|v| ProjectionItem {
                expr: Expression::Term(Term::Variable(v)),
                alias: None,
            })
            .collect(),
        Some(Projection::Items(items)) => items.clone(),
    }
}

/// The SELECT pipeline, in the SPARQL 1.1 algebra's evaluation order:
/// pattern, then Group/Having, then Order By, then Project, then
/// Distinct/Reduced, then Offset, then Limit. Notably ORDER BY is
/// evaluated *before* projection (against the full pattern bindings,
/// or for aggregated queries against the per-group environment with
/// its synthetic aggregate bindings still present) — projecting first
/// would break `ORDER BY` on a variable that isn't in the SELECT list,
/// or on a raw (pre-substitution) aggregate value.
fn eval_select(
    ctx: &EvalContext,
    select: &SelectClause,
    pattern: &GraphPattern,
    modifiers: &SolutionModifiers,
) -> ExecutionResult<(Vec<Variable>, Vec<BindingTable>)> {
    let rows = eval_pattern(ctx, pattern)?;
    let items = resolve_projection_items(select, pattern);
    let variables: Vec<Variable> = items
        .iter()
        .map(|item| item.alias.clone().unwrap_or_else(|| expr_display_name(&item.expr)))
        .collect();

    let has_aggregate = !modifiers.group_by.is_empty()
        || items.iter().any(|item| expression_has_aggregate(&item.expr))
        || modifiers.having.iter().any(expression_has_aggregate)
        || modifiers.order_by.iter().any(|o| expression_has_aggregate(&o.expr));

    let projected_rows = if has_aggregate {
        let groups = group_rows(ctx, rows, &modifiers.group_by)?;

        let mut agg_exprs: Vec<Expression> = Vec::new();
        for item in &items {
            collect_aggregates(&item.expr, &mut agg_exprs);
        }
        for h in &modifiers.having {
            collect_aggregates(h, &mut agg_exprs);
        }
        for o in &modifiers.order_by {
            collect_aggregates(&o.expr, &mut agg_exprs);
        }

        let mut scored: Vec<(BindingTable, BindingTable)> = Vec::new();
        for (_, group) in groups {
            let mut env = group.first().cloned().unwrap_or_default();
            let mut subs: Vec<(Expression, Variable)> = Vec::new();
            for (idx, agg_expr) in agg_exprs.iter().enumerate() {
                let value = eval_aggregate(ctx, agg_expr, &group)?;
                let atom = ctx.store.intern_term(&value.to_interned_bytes())?;
                let synth = format!("__agg_{idx}");
                env.set(&synth, atom);
                subs.push((agg_expr.clone(), synth));
            }

            let mut having_ok = true;
            for having_expr in &modifiers.having {
                let substituted = substitute_aggregates(having_expr, &subs);
                let keep = eval_expression(ctx, &substituted, &env).and_then(|t| ebv(&t)).unwrap_or(false);
                if !keep {
                    having_ok = false;
                    break;
                }
            }
            if !having_ok {
                continue;
            }

            let mut out_row = BindingTable::new();
            for (item, var) in items.iter().zip(variables.iter()) {
                let substituted = substitute_aggregates(&item.expr, &subs);
                if let Ok(value) = eval_expression(ctx, &substituted, &env) {
                    let atom = ctx.store.intern_term(&value.to_interned_bytes())?;
                    out_row.set(var, atom);
                }
            }
            scored.push((env, out_row));
        }

        scored.sort_by(|a, b| compare_rows(ctx, &a.0, &b.0, &modifiers.order_by));
        scored.into_iter().map(|(_, out)| out).collect()
    } else {
        let mut rows = rows;
        rows.sort_by(|a, b| compare_rows(ctx, a, b, &modifiers.order_by));

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut out_row = BindingTable::new();
            for (item, var) in items.iter().zip(variables.iter()) {
                if let Ok(value) = eval_expression(ctx, &item.expr, row) {
                    let atom = ctx.store.intern_term(&value.to_interned_bytes())?;
                    out_row.set(var, atom);
                }
            }
            out.push(out_row);
        }
        out
    };

    let final_rows = apply_distinct_and_paging(
        select.distinct,
        select.reduced,
        &variables,
        projected_rows,
        modifiers.offset,
        modifiers.limit,
    );
    Ok((variables, final_rows))
}

// ---------------------------------------------------------------------
// CONSTRUCT/DESCRIBE template instantiation
// ---------------------------------------------------------------------

fn instantiate_term(
    ctx: &EvalContext,
    term: &Term,
    row: &BindingTable,
    blanks: &mut HashMap<String, AtomId>,
    create: bool,
) -> ExecutionResult<Option<AtomId>> {
    match term {
        Term::Variable(v) => Ok(row.get(v)),
        Term::BlankNode(label) => {
            if !create {
                // Blank node labels in a DELETE template have no stable
                // identity to match an existing quad against; SPARQL
                // Update leaves this implementation-defined, so such a
                // clause simply never matches.
                return Ok(None);
            }
            if let Some(existing) = blanks.get(label) {
                return Ok(Some(*existing));
            }
            let atom = ctx.store.intern_term(&RdfTerm::BlankNode(BlankNode::new()).to_interned_bytes())?;
            blanks.insert(label.clone(), atom);
            Ok(Some(atom))
        }
        other => {
            let bytes = other.to_interned_bytes();
            if create {
                Ok(Some(ctx.store.intern_term(&bytes)?))
            } else {
                Ok(ctx.store.lookup_term(&bytes)?)
            }
        }
    }
}

fn instantiate_template(
    ctx: &EvalContext,
    template: &QuadTemplate,
    row: &BindingTable,
    blanks: &mut HashMap<String, AtomId>,
    create: bool,
) -> ExecutionResult<Option<(AtomId, AtomId, AtomId, AtomId)>> {
    let graph = match &template.graph {
        Some(term) => match instantiate_term(ctx, term, row, blanks, create)? {
            Some(id) => id,
            None => return Ok(None),
        },
        None => ctx.graph,
    };
    let Some(s) = instantiate_term(ctx, &template.subject, row, blanks, create)? else {
        return Ok(None);
    };
    let Some(p) = instantiate_term(ctx, &template.predicate, row, blanks, create)? else {
        return Ok(None);
    };
    let Some(o) = instantiate_term(ctx, &template.object, row, blanks, create)? else {
        return Ok(None);
    };
    Ok(Some((graph, s, p, o)))
}

// ---------------------------------------------------------------------
// Update operations
// ---------------------------------------------------------------------

fn resolve_graph_atom(ctx: &EvalContext, target: &GraphTarget, create: bool) -> ExecutionResult<Option<AtomId>> {
    match target {
        GraphTarget::Default => Ok(Some(DEFAULT_GRAPH)),
        GraphTarget::All => Ok(None),
        GraphTarget::Named(term) => {
            let bytes = term.to_interned_bytes();
            if create {
                Ok(Some(ctx.store.intern_term(&bytes)?))
            } else {
                Ok(ctx.store.lookup_term(&bytes)?)
            }
        }
    }
}

fn graph_pattern_for(gid: Option<AtomId>) -> QuadPattern {
    match gid {
        Some(g) => QuadPattern {
            graph: Some(g),
            ..Default::default()
        },
        None => QuadPattern::default(),
    }
}

/// `INSERT DATA`/`DELETE DATA`: ground quad templates with no pattern,
/// evaluated against one empty row. A repeated blank node label within
/// the same block denotes the same blank node, since `blanks` is shared
/// across every template in `templates`.
fn apply_quad_templates(ctx: &EvalContext, templates: &[QuadTemplate], insert: bool) -> ExecutionResult<u64> {
    let empty_row = BindingTable::new();
    let mut blanks = HashMap::new();
    let mut ops = Vec::new();
    for tpl in templates {
        let Some((g, s, p, o)) = instantiate_template(ctx, tpl, &empty_row, &mut blanks, insert)? else {
            continue;
        };
        ops.push(if insert {
            QuadOp::Insert {
                graph: g,
                subject: s,
                predicate: p,
                object: o,
                valid: ValidTime::ALWAYS,
            }
        } else {
            QuadOp::Delete {
                graph: g,
                subject: s,
                predicate: p,
                object: o,
            }
        });
    }
    let count = ops.len() as u64;
    if !ops.is_empty() {
        ctx.store.apply_transaction(ops)?;
    }
    Ok(count)
}

/// `DELETE`/`INSERT ... WHERE`. `USING`/`USING NAMED` select which
/// graph(s) the pattern is evaluated against; restricting which named
/// graphs a nested `GRAPH` clause inside the pattern can additionally
/// see (the full `USING NAMED` semantics) is not enforced here.
fn exec_delete_insert(
    ctx: &EvalContext,
    delete: &[QuadTemplate],
    insert: &[QuadTemplate],
    using: &[Term],
    using_named: &[Term],
    pattern: &GraphPattern,
) -> ExecutionResult<u64> {
    let graph_scopes: Vec<AtomId> = if using.is_empty() && using_named.is_empty() {
        vec![ctx.graph]
    } else {
        let mut scopes = Vec::new();
        for term in using.iter().chain(using_named.iter()) {
            if let Some(gid) = resolve_constant(ctx, term)? {
                scopes.push(gid);
            }
        }
        scopes
    };

    let mut all_rows = Vec::new();
    for gid in &graph_scopes {
        let scoped = EvalContext {
            store: ctx.store.clone(),
            graph: *gid,
        };
        all_rows.extend(eval_pattern(&scoped, pattern)?);
    }

    let mut ops = Vec::new();
    let mut affected = 0u64;
    for row in &all_rows {
        let mut delete_blanks = HashMap::new();
        for tpl in delete {
            if let Some((g, s, p, o)) = instantiate_template(ctx, tpl, row, &mut delete_blanks, false)? {
                ops.push(QuadOp::Delete {
                    graph: g,
                    subject: s,
                    predicate: p,
                    object: o,
                });
                affected += 1;
            }
        }
        let mut insert_blanks = HashMap::new();
        for tpl in insert {
            if let Some((g, s, p, o)) = instantiate_template(ctx, tpl, row, &mut insert_blanks, true)? {
                ops.push(QuadOp::Insert {
                    graph: g,
                    subject: s,
                    predicate: p,
                    object: o,
                    valid: ValidTime::ALWAYS,
                });
                affected += 1;
            }
        }
    }
    if !ops.is_empty() {
        ctx.store.apply_transaction(ops)?;
    }
    Ok(affected)
}

/// The core owns no textual RDF parser (see
/// [`crate::sparql::results::QueryResults::serialize`] for the same
/// boundary on the output side), so `LOAD` can't actually fetch and
/// parse a remote document here.
fn exec_load(silent: bool) -> ExecutionResult<u64> {
    if silent {
        Ok(0)
    } else {
        Err(ExecutionError::Type(
            "LOAD requires a textual RDF parser, which is out of scope for the core store".to_string(),
        ))
    }
}

fn exec_clear(ctx: &EvalContext, target: &GraphTarget, silent: bool) -> ExecutionResult<u64> {
    let pattern = match target {
        GraphTarget::All => QuadPattern::default(),
        GraphTarget::Default => graph_pattern_for(Some(DEFAULT_GRAPH)),
        GraphTarget::Named(term) => match resolve_constant(ctx, term)? {
            Some(gid) => graph_pattern_for(Some(gid)),
            None => {
                return if silent {
                    Ok(0)
                } else {
                    Err(ExecutionError::Type("CLEAR/DROP: named graph does not exist".to_string()))
                };
            }
        },
    };
    let quads = ctx.store.scan(&pattern, None)?;
    let ops: Vec<QuadOp> = quads
        .iter()
        .map(|q| QuadOp::Delete {
            graph: q.graph,
            subject: q.subject,
            predicate: q.predicate,
            object: q.object,
        })
        .collect();
    let count = ops.len() as u64;
    if !ops.is_empty() {
        ctx.store.apply_transaction(ops)?;
    }
    Ok(count)
}

fn exec_copy_move(
    ctx: &EvalContext,
    from: &GraphTarget,
    to: &GraphTarget,
    silent: bool,
    remove_source: bool,
) -> ExecutionResult<u64> {
    let Some(from_gid) = resolve_graph_atom(ctx, from, false)? else {
        return if silent {
            Ok(0)
        } else {
            Err(ExecutionError::Type("COPY/MOVE: source graph does not exist".to_string()))
        };
    };
    let Some(to_gid) = resolve_graph_atom(ctx, to, true)? else {
        return Err(ExecutionError::Type("COPY/MOVE: destination graph could not be resolved".to_string()));
    };

    exec_clear(ctx, to, true)?;

    let source_quads = ctx.store.scan(&graph_pattern_for(Some(from_gid)), None)?;
    let mut ops: Vec<QuadOp> = source_quads
        .iter()
        .map(|q| QuadOp::Insert {
            graph: to_gid,
            subject: q.subject,
            predicate: q.predicate,
            object: q.object,
            valid: q.valid,
        })
        .collect();
    let count = ops.len() as u64;
    if remove_source {
        for q in &source_quads {
            ops.push(QuadOp::Delete {
                graph: from_gid,
                subject: q.subject,
                predicate: q.predicate,
                object: q.object,
            });
        }
    }
    if !ops.is_empty() {
        ctx.store.apply_transaction(ops)?;
    }
    Ok(count)
}

fn exec_add(ctx: &EvalContext, from: &GraphTarget, to: &GraphTarget, silent: bool) -> ExecutionResult<u64> {
    let Some(from_gid) = resolve_graph_atom(ctx, from, false)? else {
        return if silent {
            Ok(0)
        } else {
            Err(ExecutionError::Type("ADD: source graph does not exist".to_string()))
        };
    };
    let Some(to_gid) = resolve_graph_atom(ctx, to, true)? else {
        return Err(ExecutionError::Type("ADD: destination graph could not be resolved".to_string()));
    };
    let source_quads = ctx.store.scan(&graph_pattern_for(Some(from_gid)), None)?;
    let ops: Vec<QuadOp> = source_quads
        .iter()
        .map(|q| QuadOp::Insert {
            graph: to_gid,
            subject: q.subject,
            predicate: q.predicate,
            object: q.object,
            valid: q.valid,
        })
        .collect();
    let count = ops.len() as u64;
    if !ops.is_empty() {
        ctx.store.apply_transaction(ops)?;
    }
    Ok(count)
}

// ---------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------

/// Evaluates parsed SPARQL Query/Update algebra against a quad store.
pub struct SparqlExecutor {
    store: Arc<QuadStore>,
}

impl SparqlExecutor {
    pub fn new(store: Arc<QuadStore>) -> Self {
        Self { store }
    }

    pub fn execute(&self, query: &Query) -> ExecutionResult<QueryResults> {
        let ctx = EvalContext {
            store: self.store.clone(),
            graph: DEFAULT_GRAPH,
        };
        match query {
            Query::Select { select, pattern, modifiers } => {
                let (variables, rows) = eval_select(&ctx, select, pattern, modifiers)?;
                let bindings: Vec<Binding> = rows
                    .iter()
                    .map(|row| variables.iter().map(|v| row.get(v)).collect())
                    .collect();
                Ok(QueryResults::from_bindings(&self.store, variables, bindings)?)
            }
            Query::Ask { pattern } => {
                let rows = eval_pattern(&ctx, pattern)?;
                Ok(QueryResults::Boolean(!rows.is_empty()))
            }
            Query::Construct { template, pattern, modifiers } => {
                let rows = eval_pattern(&ctx, pattern)?;
                let rows = apply_simple_modifiers(&ctx, rows, modifiers);
                let mut seen = HashSet::new();
                let mut quads = Vec::new();
                for row in &rows {
                    let mut blanks = HashMap::new();
                    for tpl in template {
                        if let Some((g, s, p, o)) = instantiate_template(&ctx, tpl, row, &mut blanks, true)? {
                            if seen.insert((g, s, p, o)) {
                                quads.push(QuadBinding {
                                    graph: if g == DEFAULT_GRAPH { None } else { Some(g) },
                                    subject: s,
                                    predicate: p,
                                    object: o,
                                });
                            }
                        }
                    }
                }
                Ok(QueryResults::from_quads(&self.store, quads)?)
            }
            Query::Describe { targets, pattern, modifiers } => {
                let mut subjects: Vec<AtomId> = Vec::new();
                if let Some(pattern) = pattern {
                    let rows = eval_pattern(&ctx, pattern)?;
                    let rows = apply_simple_modifiers(&ctx, rows, modifiers);
                    for target in targets {
                        if let Term::Variable(v) = target {
                            for row in &rows {
                                if let Some(atom) = row.get(v) {
                                    if !subjects.contains(&atom) {
                                        subjects.push(atom);
                                    }
                                }
                            }
                        }
                    }
                }
                for target in targets {
                    if !matches!(target, Term::Variable(_)) {
                        if let Some(atom) = resolve_constant(&ctx, target)? {
                            if !subjects.contains(&atom) {
                                subjects.push(atom);
                            }
                        }
                    }
                }

                let mut quads = Vec::new();
                for subject in subjects {
                    let pattern = QuadPattern {
                        graph: Some(ctx.graph),
                        subject: Some(subject),
                        ..Default::default()
                    };
                    for quad in self.store.scan(&pattern, None)? {
                        quads.push(QuadBinding {
                            graph: None,
                            subject: quad.subject,
                            predicate: quad.predicate,
                            object: quad.object,
                        });
                    }
                }
                Ok(QueryResults::from_quads(&self.store, quads)?)
            }
        }
    }

    pub fn execute_update(&self, op: &UpdateOperation) -> ExecutionResult<u64> {
        let ctx = EvalContext {
            store: self.store.clone(),
            graph: DEFAULT_GRAPH,
        };
        match op {
            UpdateOperation::InsertData(templates) => apply_quad_templates(&ctx, templates, true),
            UpdateOperation::DeleteData(templates) => apply_quad_templates(&ctx, templates, false),
            UpdateOperation::DeleteInsert { delete, insert, using, using_named, pattern } => {
                exec_delete_insert(&ctx, delete, insert, using, using_named, pattern)
            }
            UpdateOperation::Load { silent, .. } => exec_load(*silent),
            UpdateOperation::Clear { target, silent } => exec_clear(&ctx, target, *silent),
            UpdateOperation::Drop { target, silent } => exec_clear(&ctx, target, *silent),
            // Graphs are implicit in the atom-id model: nothing has to
            // exist ahead of time for a later INSERT/quad to target it.
            UpdateOperation::Create { .. } => Ok(0),
            UpdateOperation::Copy { from, to, silent } => exec_copy_move(&ctx, from, to, *silent, false),
            UpdateOperation::Move { from, to, silent } => exec_copy_move(&ctx, from, to, *silent, true),
            UpdateOperation::Add { from, to, silent } => exec_add(&ctx, from, to, *silent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quad::StoreOptions;

    fn store() -> Arc<QuadStore> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(QuadStore::open(dir.path(), StoreOptions::default()).unwrap())
    }

    fn iri(store: &QuadStore, s: &str) -> AtomId {
        store.intern_term(format!("<{s}>").as_bytes()).unwrap()
    }

    fn lit(store: &QuadStore, s: &str) -> AtomId {
        store.intern_term(format!("\"{s}\"").as_bytes()).unwrap()
    }

    fn var(name: &str) -> Term {
        Term::Variable(name.to_string())
    }

    fn named(iri: &str) -> Term {
        Term::NamedNode(iri.to_string())
    }

    fn tp(subject: Term, predicate: Term, object: Term) -> TriplePattern {
        TriplePattern {
            subject,
            path: PropertyPath::Predicate(predicate),
            object,
        }
    }

    const KNOWS: &str = "http://example.org/knows";
    const NAME: &str = "http://example.org/name";

    #[test]
    fn test_bgp_join_across_two_patterns() {
        let store = store();
        let alice = iri(&store, "http://example.org/alice");
        let bob = iri(&store, "http://example.org/bob");
        let knows = iri(&store, KNOWS);
        let name = iri(&store, NAME);
        let bob_name = lit(&store, "Bob");

        store.insert_quad(DEFAULT_GRAPH, alice, knows, bob, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, bob, name, bob_name, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let pattern = GraphPattern::Bgp(vec![
            tp(named("http://example.org/alice"), named(KNOWS), var("x")),
            tp(var("x"), named(NAME), var("n")),
        ]);

        let rows = eval_pattern(&ctx, &pattern).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(bob));
        assert_eq!(rows[0].get("n"), Some(bob_name));
    }

    #[test]
    fn test_bgp_self_join_repeated_variable() {
        let store = store();
        let alice = iri(&store, "http://example.org/alice");
        let bob = iri(&store, "http://example.org/bob");
        let knows = iri(&store, KNOWS);

        store.insert_quad(DEFAULT_GRAPH, alice, knows, alice, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, alice, knows, bob, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let pattern = GraphPattern::Bgp(vec![tp(var("x"), named(KNOWS), var("x"))]);

        let rows = eval_pattern(&ctx, &pattern).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(alice));
    }

    #[test]
    fn test_left_join_preserves_unmatched_left_row() {
        let store = store();
        let alice = iri(&store, "http://example.org/alice");
        let carol = iri(&store, "http://example.org/carol");
        let knows = iri(&store, KNOWS);
        let name = iri(&store, NAME);
        let carol_name = lit(&store, "Carol");

        store.insert_quad(DEFAULT_GRAPH, alice, knows, carol, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, carol, name, carol_name, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let left = GraphPattern::Bgp(vec![tp(var("s"), named(KNOWS), var("x"))]);
        let right = GraphPattern::Bgp(vec![tp(var("x"), named("http://example.org/email"), var("e"))]);
        let pattern = GraphPattern::LeftJoin {
            left: Box::new(left),
            right: Box::new(right),
            filter: None,
        };

        let rows = eval_pattern(&ctx, &pattern).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(carol));
        assert_eq!(rows[0].get("e"), None);
    }

    #[test]
    fn test_filter_drops_non_matching_rows() {
        let store = store();
        let age = iri(&store, "http://example.org/age");
        let alice = iri(&store, "http://example.org/alice");
        let bob = iri(&store, "http://example.org/bob");
        let thirty = store.intern_term(b"\"30\"^^<http://www.w3.org/2001/XMLSchema#integer>").unwrap();
        let ten = store.intern_term(b"\"10\"^^<http://www.w3.org/2001/XMLSchema#integer>").unwrap();

        store.insert_quad(DEFAULT_GRAPH, alice, age, thirty, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, bob, age, ten, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let pattern = GraphPattern::Filter {
            input: Box::new(GraphPattern::Bgp(vec![tp(var("s"), named("http://example.org/age"), var("a"))])),
            expr: Expression::Compare(CompareOp::Gt, Box::new(Expression::Term(var("a"))), Box::new(Expression::Term(Term::Literal {
                value: "20".to_string(),
                language: None,
                datatype: Some("http://www.w3.org/2001/XMLSchema#integer".to_string()),
            }))),
        };

        let rows = eval_pattern(&ctx, &pattern).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("s"), Some(alice));
    }

    #[test]
    fn test_one_or_more_path_includes_cycle_start() {
        let store = store();
        let a = iri(&store, "http://example.org/a");
        let b = iri(&store, "http://example.org/b");
        let knows = iri(&store, KNOWS);

        // a knows b, b knows a: a cycle back to the start.
        store.insert_quad(DEFAULT_GRAPH, a, knows, b, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, b, knows, a, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let path = PropertyPath::OneOrMore(Box::new(PropertyPath::Predicate(named(KNOWS))));
        let reached = path_successors(&ctx, &path, a).unwrap();

        assert!(reached.contains(&b));
        assert!(reached.contains(&a), "a cyclic (ex:knows)+ path must include its own start node");
    }

    #[test]
    fn test_zero_or_more_path_includes_start_even_without_cycle() {
        let store = store();
        let a = iri(&store, "http://example.org/a");
        let b = iri(&store, "http://example.org/b");
        let knows = iri(&store, KNOWS);
        store.insert_quad(DEFAULT_GRAPH, a, knows, b, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let path = PropertyPath::ZeroOrMore(Box::new(PropertyPath::Predicate(named(KNOWS))));
        let reached = path_successors(&ctx, &path, a).unwrap();

        assert!(reached.contains(&a));
        assert!(reached.contains(&b));
    }

    #[test]
    fn test_values_binds_matching_rows() {
        let store = store();
        let alice = iri(&store, "http://example.org/alice");
        let _ = iri(&store, "http://example.org/bob");

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let rows = eval_values(
            &ctx,
            &["x".to_string()],
            &[vec![Some(named("http://example.org/alice"))], vec![Some(named("http://example.org/unknown"))]],
        )
        .unwrap();

        // "unknown" was never interned, so its VALUES row is dropped.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("x"), Some(alice));
    }

    #[test]
    fn test_count_aggregate_over_empty_group_by_yields_one_row() {
        let store = store();
        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let rows: Vec<BindingTable> = Vec::new();
        let groups = group_rows(&ctx, rows, &[]).unwrap();
        assert_eq!(groups.len(), 1);

        let count_expr = Expression::Aggregate {
            op: AggregateOp::Count,
            distinct: false,
            arg: None,
            separator: None,
        };
        let only_group = groups.values().next().unwrap();
        let result = eval_aggregate(&ctx, &count_expr, only_group).unwrap();
        assert_eq!(literal_value(&result).unwrap(), "0");
    }

    #[test]
    fn test_select_with_group_by_and_count() {
        let store = store();
        let alice = iri(&store, "http://example.org/alice");
        let bob = iri(&store, "http://example.org/bob");
        let knows = iri(&store, KNOWS);
        let carol = iri(&store, "http://example.org/carol");
        let dave = iri(&store, "http://example.org/dave");

        store.insert_quad(DEFAULT_GRAPH, alice, knows, carol, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, alice, knows, dave, ValidTime::ALWAYS).unwrap();
        store.insert_quad(DEFAULT_GRAPH, bob, knows, carol, ValidTime::ALWAYS).unwrap();

        let ctx = EvalContext { store: store.clone(), graph: DEFAULT_GRAPH };
        let pattern = GraphPattern::Bgp(vec![tp(var("s"), named(KNOWS), var("o"))]);
        let select = SelectClause {
            distinct: false,
            reduced: false,
            projection: Some(Projection::Items(vec![
                ProjectionItem { expr: Expression::Term(var("s")), alias: None },
                ProjectionItem {
                    expr: Expression::Aggregate {
                        op: AggregateOp::Count,
                        distinct: false,
                        arg: None,
                        separator: None,
                    },
                    alias: Some("c".to_string()),
                },
            ])),
        };
        let modifiers = SolutionModifiers {
            group_by: vec![Expression::Term(var("s"))],
            ..Default::default()
        };

        let (variables, rows) = eval_select(&ctx, &select, &pattern, &modifiers).unwrap();
        assert_eq!(variables, vec!["s".to_string(), "c".to_string()]);
        assert_eq!(rows.len(), 2);

        let alice_row = rows.iter().find(|r| r.get("s") == Some(alice)).unwrap();
        let count_bytes = store.atom_bytes(alice_row.get("c").unwrap()).unwrap();
        assert_eq!(RdfTerm::from_interned_bytes(&count_bytes).unwrap().to_string(), "\"2\"^^<http://www.w3.org/2001/XMLSchema#integer>");
    }

    #[test]
    fn test_insert_data_then_select() {
        let store = store();
        let executor = SparqlExecutor::new(store.clone());

        let template = vec![QuadTemplate {
            graph: None,
            subject: named("http://example.org/alice"),
            predicate: named(NAME),
            object: Term::Literal {
                value: "Alice".to_string(),
                language: None,
                datatype: None,
            },
        }];
        let affected = executor.execute_update(&UpdateOperation::InsertData(template)).unwrap();
        assert_eq!(affected, 1);

        let pattern = GraphPattern::Bgp(vec![tp(var("s"), named(NAME), var("n"))]);
        let result = executor
            .execute(&Query::Ask { pattern })
            .unwrap();
        assert_eq!(result, QueryResults::Boolean(true));
    }

    #[test]
    fn test_delete_data_removes_inserted_quad() {
        let store = store();
        let executor = SparqlExecutor::new(store.clone());

        let template = vec![QuadTemplate {
            graph: None,
            subject: named("http://example.org/alice"),
            predicate: named(NAME),
            object: Term::Literal {
                value: "Alice".to_string(),
                language: None,
                datatype: None,
            },
        }];
        executor.execute_update(&UpdateOperation::InsertData(template.clone())).unwrap();
        let affected = executor.execute_update(&UpdateOperation::DeleteData(template)).unwrap();
        assert_eq!(affected, 1);

        let pattern = GraphPattern::Bgp(vec![tp(var("s"), named(NAME), var("n"))]);
        let result = executor.execute(&Query::Ask { pattern }).unwrap();
        assert_eq!(result, QueryResults::Boolean(false));
    }

    #[test]
    fn test_construct_deduplicates_quads_across_rows() {
        let store = store();
        let alice = iri(&store, "http://example.org/alice");
        let bob = iri(&store, "http://example.org/bob");
        let knows = iri(&store, KNOWS);
        store.insert_quad(DEFAULT_GRAPH, alice, knows, bob, ValidTime::ALWAYS).unwrap();

        let executor = SparqlExecutor::new(store.clone());
        let pattern = GraphPattern::Union(
            Box::new(GraphPattern::Bgp(vec![tp(var("s"), named(KNOWS), var("o"))])),
            Box::new(GraphPattern::Bgp(vec![tp(var("s"), named(KNOWS), var("o"))])),
        );
        let query = Query::Construct {
            template: vec![QuadTemplate {
                graph: None,
                subject: var("s"),
                predicate: named("http://example.org/associatedWith"),
                object: var("o"),
            }],
            pattern,
            modifiers: SolutionModifiers::default(),
        };
        let result = executor.execute(&query).unwrap();
        match result {
            QueryResults::Graph(triples) => assert_eq!(triples.len(), 1),
            other => panic!("expected Graph, got {other:?}"),
        }
    }
}
