//! Pest-derived parser for SPARQL 1.1 Query and Update, built the same
//! way the donor's Cypher grammar is consumed: a `#[derive(Parser)]`
//! struct over a `.pest` grammar file, walked into an owned AST.
//!
//! Operator precedence here comes from the grammar's own nesting
//! (`conditional_or_expression` > `conditional_and_expression` > ... >
//! `primary_expression`) rather than a runtime Pratt parser — the
//! grammar is static, so there is no token stream left to climb.

use std::collections::HashMap;

use oxiri::Iri;
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser as PestParser;

use crate::sparql::ast::*;

#[derive(PestParser)]
#[grammar = "sparql/sparql.pest"]
struct Grammar;

/// A stable, machine-matchable identifier for each kind of semantic
/// error the parser can raise, independent of the human-readable
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparqlErrorCode {
    InvalidBaseIri,
    InvalidRelativeIri,
    MalformedPrefixedName,
    UndeclaredPrefix,
    MalformedPathPrimary,
    MalformedGraphTarget,
}

impl std::fmt::Display for SparqlErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            SparqlErrorCode::InvalidBaseIri => "invalid-base-iri",
            SparqlErrorCode::InvalidRelativeIri => "invalid-relative-iri",
            SparqlErrorCode::MalformedPrefixedName => "malformed-prefixed-name",
            SparqlErrorCode::UndeclaredPrefix => "undeclared-prefix",
            SparqlErrorCode::MalformedPathPrimary => "malformed-path-primary",
            SparqlErrorCode::MalformedGraphTarget => "malformed-graph-target",
        };
        f.write_str(code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(#[from] Box<pest::error::Error<Rule>>),
    #[error("semantic error [{code}] at byte {}..{}: {message}", span.0, span.1)]
    Semantic {
        code: SparqlErrorCode,
        /// Byte offsets into the source text the error was raised for.
        span: (usize, usize),
        message: String,
    },
}

impl From<pest::error::Error<Rule>> for ParseError {
    fn from(e: pest::error::Error<Rule>) -> Self {
        ParseError::Syntax(Box::new(e))
    }
}

impl ParseError {
    fn semantic(code: SparqlErrorCode, span: pest::Span, msg: impl Into<String>) -> Self {
        ParseError::Semantic {
            code,
            span: (span.start(), span.end()),
            message: msg.into(),
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
const RDF_NIL: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#nil";

#[derive(Debug, Default)]
struct Context {
    base: Option<String>,
    prefixes: HashMap<String, String>,
}

/// Parse a `SELECT`/`CONSTRUCT`/`ASK`/`DESCRIBE` query.
pub fn parse_query(input: &str) -> ParseResult<Query> {
    let mut pairs = Grammar::parse(Rule::query_unit, input)?;
    let query_unit = pairs.next().expect("query_unit always present on success");
    let mut ctx = Context::default();
    let mut inner = query_unit.into_inner();
    let prologue_pair = inner.next().expect("prologue always present");
    parse_prologue(&mut ctx, prologue_pair)?;
    let query_pair = inner.next().expect("query always present");
    build_query(&mut ctx, query_pair)
}

/// Parse a sequence of SPARQL Update operations.
pub fn parse_update(input: &str) -> ParseResult<Vec<UpdateOperation>> {
    let mut pairs = Grammar::parse(Rule::update_unit, input)?;
    let unit = pairs.next().expect("update_unit always present on success");
    let mut ctx = Context::default();
    let mut inner = unit.into_inner();
    let prologue_pair = inner.next().expect("prologue always present");
    parse_prologue(&mut ctx, prologue_pair)?;

    let mut ops = Vec::new();
    for p in inner {
        if p.as_rule() == Rule::update_sequence {
            for up in p.into_inner() {
                if up.as_rule() == Rule::update {
                    ops.push(parse_single_update(&mut ctx, up)?);
                }
            }
        }
    }
    Ok(ops)
}

// --- prologue / IRI resolution -------------------------------------------

fn parse_prologue(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<()> {
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::base_decl => {
                let iriref_pair = p.into_inner().next().expect("base_decl has an iriref");
                let raw = strip_angle_brackets(iriref_pair.as_str());
                let resolved = resolve_iri(ctx, raw, iriref_pair.as_span())?;
                ctx.base = Some(resolved);
            }
            Rule::prefix_decl => {
                let mut it = p.into_inner();
                let ns_pair = it.next().expect("prefix_decl has a pname_ns");
                let iriref_pair = it.next().expect("prefix_decl has an iriref");
                let prefix = ns_pair.as_str().trim_end_matches(':').to_string();
                let raw = strip_angle_brackets(iriref_pair.as_str());
                let resolved = resolve_iri(ctx, raw, iriref_pair.as_span())?;
                ctx.prefixes.insert(prefix, resolved);
            }
            _ => {}
        }
    }
    Ok(())
}

fn strip_angle_brackets(s: &str) -> &str {
    &s[1..s.len() - 1]
}

/// Resolves a raw IRI reference against the current `BASE`, if any.
/// IRI references that already look absolute (contain a `:`) are used
/// as-is — relative references in SPARQL are almost always bare paths
/// or fragments, and skipping `oxiri` for the common absolute case
/// avoids rejecting schemes it doesn't recognize.
fn resolve_iri(ctx: &Context, raw: &str, span: pest::Span) -> ParseResult<String> {
    if raw.contains(':') {
        return Ok(raw.to_string());
    }
    match &ctx.base {
        Some(base) => {
            let base_iri = Iri::parse(base.as_str()).map_err(|e| {
                ParseError::semantic(SparqlErrorCode::InvalidBaseIri, span, format!("invalid BASE IRI: {e}"))
            })?;
            let resolved = base_iri.resolve(raw).map_err(|e| {
                ParseError::semantic(
                    SparqlErrorCode::InvalidRelativeIri,
                    span,
                    format!("invalid relative IRI reference: {e}"),
                )
            })?;
            Ok(resolved.into_inner())
        }
        None => Ok(raw.to_string()),
    }
}

fn expand_prefixed_name(ctx: &Context, pair: &Pair<Rule>) -> ParseResult<String> {
    let text = pair.as_str();
    let idx = text.find(':').ok_or_else(|| {
        ParseError::semantic(
            SparqlErrorCode::MalformedPrefixedName,
            pair.as_span(),
            format!("malformed prefixed name '{text}'"),
        )
    })?;
    let prefix = &text[..idx];
    let local = &text[idx + 1..];
    let ns = ctx.prefixes.get(prefix).ok_or_else(|| {
        ParseError::semantic(
            SparqlErrorCode::UndeclaredPrefix,
            pair.as_span(),
            format!("undeclared prefix '{prefix}:'"),
        )
    })?;
    Ok(format!("{ns}{local}"))
}

fn parse_iri_term(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let inner = pair.into_inner().next().expect("iri has a child");
    match inner.as_rule() {
        Rule::iriref => {
            let raw = strip_angle_brackets(inner.as_str());
            Ok(Term::NamedNode(resolve_iri(ctx, raw, inner.as_span())?))
        }
        Rule::prefixed_name => Ok(Term::NamedNode(expand_prefixed_name(ctx, &inner)?)),
        other => unreachable!("iri child rule {other:?}"),
    }
}

fn parse_var(pair: Pair<Rule>) -> Variable {
    pair.as_str()[1..].to_string()
}

fn parse_var_or_iri(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let inner = pair.into_inner().next().expect("var_or_iri has a child");
    match inner.as_rule() {
        Rule::var => Ok(Term::Variable(parse_var(inner))),
        Rule::iri => parse_iri_term(ctx, inner),
        other => unreachable!("var_or_iri child rule {other:?}"),
    }
}

fn unescape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn parse_rdf_literal(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let mut inner = pair.into_inner();
    let string_pair = inner.next().expect("rdf_literal has a string_literal");
    let raw = string_pair.as_str();
    let value = unescape_string(&raw[1..raw.len() - 1]);

    let mut language = None;
    let mut datatype = None;
    if let Some(next) = inner.next() {
        match next.as_rule() {
            Rule::lang_tag => language = Some(next.as_str()[1..].to_string()),
            Rule::iri => {
                datatype = Some(match parse_iri_term(ctx, next)? {
                    Term::NamedNode(iri) => iri,
                    _ => unreachable!("iri parses to a NamedNode"),
                })
            }
            other => unreachable!("rdf_literal suffix rule {other:?}"),
        }
    }
    Ok(Term::Literal {
        value,
        language,
        datatype,
    })
}

fn parse_numeric_literal(pair: Pair<Rule>) -> Term {
    let inner = pair.into_inner().next().expect("numeric_literal has a child");
    let text = inner.as_str().to_string();
    let datatype = match inner.as_rule() {
        Rule::integer_literal => "http://www.w3.org/2001/XMLSchema#integer",
        Rule::decimal_literal => "http://www.w3.org/2001/XMLSchema#decimal",
        Rule::double_literal => "http://www.w3.org/2001/XMLSchema#double",
        other => unreachable!("numeric_literal child rule {other:?}"),
    };
    Term::Literal {
        value: text,
        language: None,
        datatype: Some(datatype.to_string()),
    }
}

fn parse_boolean_literal(pair: Pair<Rule>) -> Term {
    Term::Literal {
        value: pair.as_str().to_ascii_lowercase(),
        language: None,
        datatype: Some("http://www.w3.org/2001/XMLSchema#boolean".to_string()),
    }
}

fn parse_blank_node(pair: Pair<Rule>) -> Term {
    Term::BlankNode(pair.as_str()[2..].to_string())
}

fn parse_graph_term(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let inner = pair.into_inner().next().expect("graph_term has a child");
    match inner.as_rule() {
        Rule::iri => parse_iri_term(ctx, inner),
        Rule::rdf_literal => parse_rdf_literal(ctx, inner),
        Rule::numeric_literal => Ok(parse_numeric_literal(inner)),
        Rule::boolean_literal => Ok(parse_boolean_literal(inner)),
        Rule::blank_node => Ok(parse_blank_node(inner)),
        Rule::nil => Ok(Term::NamedNode(RDF_NIL.to_string())),
        other => unreachable!("graph_term child rule {other:?}"),
    }
}

fn parse_var_or_term(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let inner = pair.into_inner().next().expect("var_or_term has a child");
    match inner.as_rule() {
        Rule::var => Ok(Term::Variable(parse_var(inner))),
        Rule::graph_term => parse_graph_term(ctx, inner),
        other => unreachable!("var_or_term child rule {other:?}"),
    }
}

// --- property paths -------------------------------------------------------

fn parse_path(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    parse_path_alternative(ctx, pair.into_inner().next().expect("path has a path_alternative"))
}

fn parse_path_alternative(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let mut it = pair.into_inner();
    let mut result = parse_path_sequence(ctx, it.next().expect("at least one path_sequence"))?;
    for next in it {
        result = PropertyPath::Alternative(Box::new(result), Box::new(parse_path_sequence(ctx, next)?));
    }
    Ok(result)
}

fn parse_path_sequence(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let mut it = pair.into_inner();
    let mut result = parse_path_elt_or_inverse(ctx, it.next().expect("at least one path_elt_or_inverse"))?;
    for next in it {
        result = PropertyPath::Sequence(Box::new(result), Box::new(parse_path_elt_or_inverse(ctx, next)?));
    }
    Ok(result)
}

fn parse_path_elt_or_inverse(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let inverse = pair.as_str().starts_with('^');
    let elt_pair = pair.into_inner().next().expect("path_elt_or_inverse has a path_elt");
    let elt = parse_path_elt(ctx, elt_pair)?;
    Ok(if inverse { PropertyPath::Inverse(Box::new(elt)) } else { elt })
}

fn parse_path_elt(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let mut it = pair.into_inner();
    let base = parse_path_primary(ctx, it.next().expect("path_elt has a path_primary"))?;
    Ok(match it.next() {
        None => base,
        Some(modifier) => match modifier.as_str() {
            "*" => PropertyPath::ZeroOrMore(Box::new(base)),
            "+" => PropertyPath::OneOrMore(Box::new(base)),
            "?" => PropertyPath::ZeroOrOne(Box::new(base)),
            other => unreachable!("path_mod token {other:?}"),
        },
    })
}

fn parse_path_primary(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let span = pair.as_span();
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::semantic(SparqlErrorCode::MalformedPathPrimary, span, "empty path_primary"))?;
    match inner.as_rule() {
        Rule::iri => Ok(PropertyPath::Predicate(parse_iri_term(ctx, inner)?)),
        Rule::rdf_type_keyword => Ok(PropertyPath::Predicate(Term::NamedNode(RDF_TYPE.to_string()))),
        Rule::path_negated_property_set => parse_negated_property_set(ctx, inner),
        Rule::path => parse_path(ctx, inner),
        other => unreachable!("path_primary child rule {other:?}"),
    }
}

fn parse_negated_property_set(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let mut terms = Vec::new();
    for item in pair.into_inner().filter(|p| p.as_rule() == Rule::path_one_in_property_set) {
        let inverse = item.as_str().starts_with('^');
        let inner = item
            .into_inner()
            .next()
            .expect("path_one_in_property_set has a child");
        let term = match inner.as_rule() {
            Rule::iri => parse_iri_term(ctx, inner)?,
            Rule::rdf_type_keyword => Term::NamedNode(RDF_TYPE.to_string()),
            other => unreachable!("path_one_in_property_set child rule {other:?}"),
        };
        terms.push((inverse, term));
    }
    Ok(PropertyPath::NegatedPropertySet(terms))
}

fn parse_verb_path(ctx: &Context, pair: Pair<Rule>) -> ParseResult<PropertyPath> {
    let inner = pair.into_inner().next().expect("verb_path has a child");
    match inner.as_rule() {
        Rule::path => parse_path(ctx, inner),
        Rule::rdf_type_keyword => Ok(PropertyPath::Predicate(Term::NamedNode(RDF_TYPE.to_string()))),
        other => unreachable!("verb_path child rule {other:?}"),
    }
}

fn parse_verb(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let inner = pair.into_inner().next().expect("verb has a child");
    match inner.as_rule() {
        Rule::var_or_iri => parse_var_or_iri(ctx, inner),
        Rule::rdf_type_keyword => Ok(Term::NamedNode(RDF_TYPE.to_string())),
        other => unreachable!("verb child rule {other:?}"),
    }
}

// --- triples ---------------------------------------------------------------

fn parse_triples_block(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<TriplePattern>> {
    let mut out = Vec::new();
    let mut it = pair.into_inner();
    let subject_pair = it.next().expect("triples_block has a triples_same_subject_path");
    out.extend(parse_triples_same_subject_path(ctx, subject_pair)?);
    if let Some(next_block) = it.next() {
        out.extend(parse_triples_block(ctx, next_block)?);
    }
    Ok(out)
}

fn parse_triples_same_subject_path(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<TriplePattern>> {
    let mut it = pair.into_inner();
    let subject = parse_var_or_term(ctx, it.next().expect("has var_or_term"))?;
    let plist = it.next().expect("has property_list_path_not_empty");
    parse_property_list_path(ctx, subject, plist)
}

fn parse_property_list_path(ctx: &Context, subject: Term, pair: Pair<Rule>) -> ParseResult<Vec<TriplePattern>> {
    let mut out = Vec::new();
    let mut current_path: Option<PropertyPath> = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::verb_path => current_path = Some(parse_verb_path(ctx, p)?),
            Rule::object_list => {
                let path = current_path
                    .clone()
                    .expect("object_list always follows a verb_path");
                for obj_pair in p.into_inner() {
                    let object = parse_graph_node(ctx, obj_pair)?;
                    out.push(TriplePattern {
                        subject: subject.clone(),
                        path: path.clone(),
                        object,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn parse_graph_node(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let inner = pair.into_inner().next().expect("graph_node has a var_or_term");
    parse_var_or_term(ctx, inner)
}

fn parse_triples_template(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<QuadTemplate>> {
    let mut out = Vec::new();
    let mut it = pair.into_inner();
    let subject_pair = it.next().expect("triples_template has a triples_same_subject");
    out.extend(parse_triples_same_subject(ctx, subject_pair)?);
    if let Some(next) = it.next() {
        out.extend(parse_triples_template(ctx, next)?);
    }
    Ok(out)
}

fn parse_triples_same_subject(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<QuadTemplate>> {
    let mut it = pair.into_inner();
    let subject = parse_var_or_term(ctx, it.next().expect("has var_or_term"))?;
    let plist = it.next().expect("has property_list_not_empty");

    let mut out = Vec::new();
    let mut current_verb: Option<Term> = None;
    for p in plist.into_inner() {
        match p.as_rule() {
            Rule::verb => current_verb = Some(parse_verb(ctx, p)?),
            Rule::object_list => {
                let predicate = current_verb.clone().expect("object_list always follows a verb");
                for obj_pair in p.into_inner() {
                    let object = parse_graph_node(ctx, obj_pair)?;
                    out.push(QuadTemplate {
                        graph: None,
                        subject: subject.clone(),
                        predicate: predicate.clone(),
                        object,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

// --- graph patterns ----------------------------------------------------

/// What a `graph_pattern_not_triples` contributes to the group it's
/// nested in; each combines with what comes before it differently, so
/// the caller dispatches rather than getting back a ready-made
/// [`GraphPattern`] in every case.
enum NotTriples {
    Combine(GraphPattern),
    Optional(GraphPattern),
    Minus(GraphPattern),
    Filter(Expression),
    Bind(Variable, Expression),
}

fn parse_group_graph_pattern(ctx: &Context, pair: Pair<Rule>) -> ParseResult<GraphPattern> {
    let inner = pair
        .into_inner()
        .next()
        .expect("group_graph_pattern has a sub_select or group_graph_pattern_sub");
    match inner.as_rule() {
        Rule::sub_select => Ok(GraphPattern::SubSelect(Box::new(parse_sub_select(ctx, inner)?))),
        Rule::group_graph_pattern_sub => parse_group_graph_pattern_sub(ctx, inner),
        other => unreachable!("group_graph_pattern child rule {other:?}"),
    }
}

fn parse_sub_select(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Query> {
    let mut it = pair.into_inner();
    let select = parse_select_clause(ctx, it.next().expect("sub_select has a select_clause"))?;
    let pattern = parse_where_clause(ctx, it.next().expect("sub_select has a where_clause"))?;
    let modifiers = parse_solution_modifier(ctx, it.next().expect("sub_select has a solution_modifier"))?;
    Ok(Query::Select {
        select,
        pattern,
        modifiers,
    })
}

fn parse_where_clause(ctx: &Context, pair: Pair<Rule>) -> ParseResult<GraphPattern> {
    let gg = pair.into_inner().next().expect("where_clause has a group_graph_pattern");
    parse_group_graph_pattern(ctx, gg)
}

fn parse_group_graph_pattern_sub(ctx: &Context, pair: Pair<Rule>) -> ParseResult<GraphPattern> {
    let mut bgp: Vec<TriplePattern> = Vec::new();
    let mut result: Option<GraphPattern> = None;
    let mut pending_filters: Vec<Expression> = Vec::new();

    for child in pair.into_inner() {
        match child.as_rule() {
            Rule::triples_block => bgp.extend(parse_triples_block(ctx, child)?),
            Rule::graph_pattern_not_triples => {
                if !bgp.is_empty() {
                    let taken = GraphPattern::Bgp(std::mem::take(&mut bgp));
                    result = Some(join_with(result.take(), taken));
                }
                match parse_graph_pattern_not_triples(ctx, child)? {
                    NotTriples::Combine(p) => result = Some(join_with(result.take(), p)),
                    NotTriples::Optional(right) => {
                        result = Some(GraphPattern::LeftJoin {
                            left: Box::new(result.take().unwrap_or(GraphPattern::Unit)),
                            right: Box::new(right),
                            filter: None,
                        })
                    }
                    NotTriples::Minus(right) => {
                        result = Some(GraphPattern::Minus(
                            Box::new(result.take().unwrap_or(GraphPattern::Unit)),
                            Box::new(right),
                        ))
                    }
                    NotTriples::Filter(expr) => pending_filters.push(expr),
                    NotTriples::Bind(var, expr) => {
                        result = Some(GraphPattern::Bind {
                            input: Box::new(result.take().unwrap_or(GraphPattern::Unit)),
                            var,
                            expr,
                        })
                    }
                }
            }
            _ => {}
        }
    }
    if !bgp.is_empty() {
        result = Some(join_with(result.take(), GraphPattern::Bgp(bgp)));
    }
    let mut pattern = result.unwrap_or(GraphPattern::Unit);
    for expr in pending_filters {
        pattern = GraphPattern::Filter {
            input: Box::new(pattern),
            expr,
        };
    }
    Ok(pattern)
}

fn join_with(acc: Option<GraphPattern>, next: GraphPattern) -> GraphPattern {
    match acc {
        Some(left) => GraphPattern::Join(Box::new(left), Box::new(next)),
        None => next,
    }
}

fn parse_graph_pattern_not_triples(ctx: &Context, pair: Pair<Rule>) -> ParseResult<NotTriples> {
    let inner = pair
        .into_inner()
        .next()
        .expect("graph_pattern_not_triples has a child");
    match inner.as_rule() {
        Rule::group_or_union_graph_pattern => Ok(NotTriples::Combine(parse_group_or_union(ctx, inner)?)),
        Rule::optional_graph_pattern => {
            let gg = inner
                .into_inner()
                .next()
                .expect("optional_graph_pattern has a group_graph_pattern");
            Ok(NotTriples::Optional(parse_group_graph_pattern(ctx, gg)?))
        }
        Rule::minus_graph_pattern => {
            let gg = inner
                .into_inner()
                .next()
                .expect("minus_graph_pattern has a group_graph_pattern");
            Ok(NotTriples::Minus(parse_group_graph_pattern(ctx, gg)?))
        }
        Rule::graph_graph_pattern => {
            let mut it = inner.into_inner();
            let graph = parse_var_or_iri(ctx, it.next().expect("graph_graph_pattern has a var_or_iri"))?;
            let gg = it.next().expect("graph_graph_pattern has a group_graph_pattern");
            let input = parse_group_graph_pattern(ctx, gg)?;
            Ok(NotTriples::Combine(GraphPattern::Graph {
                graph,
                input: Box::new(input),
            }))
        }
        Rule::service_graph_pattern => {
            let mut silent = false;
            let mut endpoint = None;
            let mut gg = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::silent_kw => silent = true,
                    Rule::var_or_iri => endpoint = Some(parse_var_or_iri(ctx, p)?),
                    Rule::group_graph_pattern => gg = Some(parse_group_graph_pattern(ctx, p)?),
                    _ => {}
                }
            }
            Ok(NotTriples::Combine(GraphPattern::Service {
                endpoint: endpoint.expect("service_graph_pattern has an endpoint"),
                silent,
                input: Box::new(gg.expect("service_graph_pattern has a body")),
            }))
        }
        Rule::filter_clause => {
            let constraint_pair = inner.into_inner().next().expect("filter_clause has a constraint");
            Ok(NotTriples::Filter(parse_constraint(ctx, constraint_pair)?))
        }
        Rule::bind_clause => {
            let mut it = inner.into_inner();
            let expr = parse_expression(ctx, it.next().expect("bind_clause has an expression"))?;
            let var = parse_var(it.next().expect("bind_clause has a var"));
            Ok(NotTriples::Bind(var, expr))
        }
        Rule::values_clause => {
            let data_block_pair = inner.into_inner().next().expect("values_clause has a data_block");
            let (variables, rows) = parse_data_block(ctx, data_block_pair)?;
            Ok(NotTriples::Combine(GraphPattern::Values { variables, rows }))
        }
        other => unreachable!("graph_pattern_not_triples child rule {other:?}"),
    }
}

fn parse_group_or_union(ctx: &Context, pair: Pair<Rule>) -> ParseResult<GraphPattern> {
    let mut it = pair.into_inner();
    let mut result = parse_group_graph_pattern(ctx, it.next().expect("at least one group_graph_pattern"))?;
    for next in it {
        result = GraphPattern::Union(Box::new(result), Box::new(parse_group_graph_pattern(ctx, next)?));
    }
    Ok(result)
}

fn parse_constraint(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    match pair.as_rule() {
        Rule::bracketted_expression => parse_bracketted_expression(ctx, pair),
        Rule::built_in_call => parse_built_in_call(ctx, pair),
        Rule::function_call => {
            let mut it = pair.into_inner();
            let iri_pair = it.next().expect("function_call has an iri");
            let name = match parse_iri_term(ctx, iri_pair)? {
                Term::NamedNode(n) => n,
                _ => unreachable!("iri parses to a NamedNode"),
            };
            let args = parse_arg_list(ctx, it.next().expect("function_call has an arg_list"))?;
            Ok(Expression::FunctionCall { name, args })
        }
        other => unreachable!("constraint child rule {other:?}"),
    }
}

fn parse_data_block(ctx: &Context, pair: Pair<Rule>) -> ParseResult<(Vec<Variable>, Vec<Vec<Option<Term>>>)> {
    let inner = pair.into_inner().next().expect("data_block has a child");
    match inner.as_rule() {
        Rule::inline_data_one_var => {
            let mut it = inner.into_inner();
            let var = parse_var(it.next().expect("inline_data_one_var has a var"));
            let mut rows = Vec::new();
            for p in it {
                rows.push(vec![parse_data_block_value(ctx, p)?]);
            }
            Ok((vec![var], rows))
        }
        Rule::inline_data_full => {
            let mut vars = Vec::new();
            let mut rows = Vec::new();
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::var => vars.push(parse_var(p)),
                    Rule::data_block_row => {
                        let mut row = Vec::new();
                        for v in p.into_inner() {
                            row.push(parse_data_block_value(ctx, v)?);
                        }
                        rows.push(row);
                    }
                    _ => {}
                }
            }
            Ok((vars, rows))
        }
        other => unreachable!("data_block child rule {other:?}"),
    }
}

fn parse_data_block_value(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Option<Term>> {
    let inner = pair.into_inner().next().expect("data_block_value has a child");
    Ok(match inner.as_rule() {
        Rule::iri => Some(parse_iri_term(ctx, inner)?),
        Rule::rdf_literal => Some(parse_rdf_literal(ctx, inner)?),
        Rule::numeric_literal => Some(parse_numeric_literal(inner)),
        Rule::boolean_literal => Some(parse_boolean_literal(inner)),
        Rule::undef => None,
        other => unreachable!("data_block_value child rule {other:?}"),
    })
}

// --- expressions -------------------------------------------------------

fn parse_expression(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    parse_conditional_or(ctx, pair.into_inner().next().expect("expression has a child"))
}

fn parse_conditional_or(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let mut result = parse_conditional_and(ctx, it.next().expect("at least one conditional_and_expression"))?;
    for next in it {
        result = Expression::Or(Box::new(result), Box::new(parse_conditional_and(ctx, next)?));
    }
    Ok(result)
}

fn parse_conditional_and(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let mut result = parse_value_logical(ctx, it.next().expect("at least one value_logical"))?;
    for next in it {
        result = Expression::And(Box::new(result), Box::new(parse_value_logical(ctx, next)?));
    }
    Ok(result)
}

fn parse_value_logical(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    parse_relational(ctx, pair.into_inner().next().expect("value_logical has a child"))
}

fn parse_relational(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let left = parse_numeric_expression(ctx, it.next().expect("relational_expression has a numeric_expression"))?;
    match it.next() {
        None => Ok(left),
        Some(p) if p.as_rule() == Rule::relational_op => {
            let op = match p.as_str() {
                "=" => CompareOp::Eq,
                "!=" => CompareOp::NotEq,
                "<" => CompareOp::Lt,
                "<=" => CompareOp::LtEq,
                ">" => CompareOp::Gt,
                ">=" => CompareOp::GtEq,
                other => unreachable!("relational_op token {other:?}"),
            };
            let right = parse_numeric_expression(ctx, it.next().expect("relational_op has a right operand"))?;
            Ok(Expression::Compare(op, Box::new(left), Box::new(right)))
        }
        Some(p) if p.as_rule() == Rule::in_kw => {
            let list_pair = it.next().expect("IN has an expression_list");
            let haystack = parse_expression_list(ctx, list_pair)?;
            Ok(Expression::In {
                needle: Box::new(left),
                haystack,
                negated: false,
            })
        }
        Some(p) if p.as_rule() == Rule::not_in_kw => {
            let list_pair = it.next().expect("NOT IN has an expression_list");
            let haystack = parse_expression_list(ctx, list_pair)?;
            Ok(Expression::In {
                needle: Box::new(left),
                haystack,
                negated: true,
            })
        }
        Some(other) => unreachable!("relational_expression suffix rule {:?}", other.as_rule()),
    }
}

fn parse_expression_list(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<Expression>> {
    pair.into_inner().map(|p| parse_expression(ctx, p)).collect()
}

fn parse_numeric_expression(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    parse_additive(ctx, pair.into_inner().next().expect("numeric_expression has a child"))
}

fn parse_additive(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let mut result = parse_multiplicative(ctx, it.next().expect("at least one multiplicative_expression"))?;
    loop {
        let Some(op_pair) = it.next() else { break };
        let rhs_pair = it.next().expect("additive_op has a right operand");
        let op = if op_pair.as_str() == "+" { ArithOp::Add } else { ArithOp::Sub };
        let rhs = parse_multiplicative(ctx, rhs_pair)?;
        result = Expression::Arithmetic(op, Box::new(result), Box::new(rhs));
    }
    Ok(result)
}

fn parse_multiplicative(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let mut result = parse_unary(ctx, it.next().expect("at least one unary_expression"))?;
    loop {
        let Some(op_pair) = it.next() else { break };
        let rhs_pair = it.next().expect("multiplicative_op has a right operand");
        let op = if op_pair.as_str() == "*" { ArithOp::Mul } else { ArithOp::Div };
        let rhs = parse_unary(ctx, rhs_pair)?;
        result = Expression::Arithmetic(op, Box::new(result), Box::new(rhs));
    }
    Ok(result)
}

fn parse_unary(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let first = it.next().expect("unary_expression has a child");
    if first.as_rule() == Rule::unary_op {
        let op = first.as_str();
        let primary_pair = it.next().expect("unary_op has an operand");
        let inner_expr = parse_primary(ctx, primary_pair)?;
        Ok(match op {
            "!" => Expression::Not(Box::new(inner_expr)),
            "-" => Expression::UnaryMinus(Box::new(inner_expr)),
            "+" => inner_expr,
            other => unreachable!("unary_op token {other:?}"),
        })
    } else {
        parse_primary(ctx, first)
    }
}

fn parse_primary(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let inner = pair.into_inner().next().expect("primary_expression has a child");
    match inner.as_rule() {
        Rule::bracketted_expression => parse_bracketted_expression(ctx, inner),
        Rule::aggregate => parse_aggregate(ctx, inner),
        Rule::built_in_call => parse_built_in_call(ctx, inner),
        Rule::iri_or_function => parse_iri_or_function(ctx, inner),
        Rule::rdf_literal => Ok(Expression::Term(parse_rdf_literal(ctx, inner)?)),
        Rule::numeric_literal => Ok(Expression::Term(parse_numeric_literal(inner))),
        Rule::boolean_literal => Ok(Expression::Term(parse_boolean_literal(inner))),
        Rule::var => Ok(Expression::Term(Term::Variable(parse_var(inner)))),
        other => unreachable!("primary_expression child rule {other:?}"),
    }
}

fn parse_bracketted_expression(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    parse_expression(ctx, pair.into_inner().next().expect("bracketted_expression has an expression"))
}

fn parse_iri_or_function(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut it = pair.into_inner();
    let iri_term = parse_iri_term(ctx, it.next().expect("iri_or_function has an iri"))?;
    match it.next() {
        None => Ok(Expression::Term(iri_term)),
        Some(arglist_pair) => {
            let name = match iri_term {
                Term::NamedNode(n) => n,
                _ => unreachable!("iri parses to a NamedNode"),
            };
            let args = parse_arg_list(ctx, arglist_pair)?;
            Ok(Expression::FunctionCall { name, args })
        }
    }
}

fn parse_arg_list(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<Expression>> {
    pair.into_inner()
        .filter(|p| p.as_rule() == Rule::expression)
        .map(|p| parse_expression(ctx, p))
        .collect()
}

fn parse_aggregate(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let inner = pair.into_inner().next().expect("aggregate has a child");
    match inner.as_rule() {
        Rule::count_agg => {
            let mut distinct = false;
            let mut arg = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::distinct_kw => distinct = true,
                    Rule::count_star => {}
                    Rule::expression => arg = Some(Box::new(parse_expression(ctx, p)?)),
                    _ => {}
                }
            }
            Ok(Expression::Aggregate {
                op: AggregateOp::Count,
                distinct,
                arg,
                separator: None,
            })
        }
        Rule::sum_agg | Rule::min_agg | Rule::max_agg | Rule::avg_agg | Rule::sample_agg => {
            let op = match inner.as_rule() {
                Rule::sum_agg => AggregateOp::Sum,
                Rule::min_agg => AggregateOp::Min,
                Rule::max_agg => AggregateOp::Max,
                Rule::avg_agg => AggregateOp::Avg,
                Rule::sample_agg => AggregateOp::Sample,
                _ => unreachable!(),
            };
            let mut distinct = false;
            let mut arg = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::distinct_kw => distinct = true,
                    Rule::expression => arg = Some(Box::new(parse_expression(ctx, p)?)),
                    _ => {}
                }
            }
            Ok(Expression::Aggregate {
                op,
                distinct,
                arg,
                separator: None,
            })
        }
        Rule::group_concat_agg => {
            let mut distinct = false;
            let mut arg = None;
            let mut separator = None;
            for p in inner.into_inner() {
                match p.as_rule() {
                    Rule::distinct_kw => distinct = true,
                    Rule::expression => arg = Some(Box::new(parse_expression(ctx, p)?)),
                    Rule::string_literal => {
                        let raw = p.as_str();
                        separator = Some(unescape_string(&raw[1..raw.len() - 1]));
                    }
                    _ => {}
                }
            }
            Ok(Expression::Aggregate {
                op: AggregateOp::GroupConcat,
                distinct,
                arg,
                separator,
            })
        }
        other => unreachable!("aggregate child rule {other:?}"),
    }
}

fn parse_built_in_call(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Expression> {
    let inner = pair.into_inner().next().expect("built_in_call has a child");
    match inner.as_rule() {
        Rule::regular_builtin_call => {
            let mut it = inner.into_inner();
            let name = it
                .next()
                .expect("regular_builtin_call has a builtin_name")
                .as_str()
                .to_ascii_uppercase();
            let args = it.map(|p| parse_expression(ctx, p)).collect::<ParseResult<Vec<_>>>()?;
            Ok(Expression::Builtin { name, args })
        }
        Rule::bound_call => {
            let var_pair = inner.into_inner().next().expect("bound_call has a var");
            Ok(Expression::Bound(parse_var(var_pair)))
        }
        Rule::exists_call => {
            let gg = inner.into_inner().next().expect("exists_call has a group_graph_pattern");
            Ok(Expression::Exists {
                negated: false,
                pattern: Box::new(parse_group_graph_pattern(ctx, gg)?),
            })
        }
        Rule::not_exists_call => {
            let gg = inner
                .into_inner()
                .next()
                .expect("not_exists_call has a group_graph_pattern");
            Ok(Expression::Exists {
                negated: true,
                pattern: Box::new(parse_group_graph_pattern(ctx, gg)?),
            })
        }
        Rule::if_call => {
            let mut it = inner.into_inner();
            let condition = parse_expression(ctx, it.next().expect("if_call condition"))?;
            let then_expr = parse_expression(ctx, it.next().expect("if_call then branch"))?;
            let else_expr = parse_expression(ctx, it.next().expect("if_call else branch"))?;
            Ok(Expression::If {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            })
        }
        Rule::coalesce_call => {
            let args = inner.into_inner().map(|p| parse_expression(ctx, p)).collect::<ParseResult<Vec<_>>>()?;
            Ok(Expression::Coalesce(args))
        }
        other => unreachable!("built_in_call child rule {other:?}"),
    }
}

// --- SELECT/CONSTRUCT/ASK/DESCRIBE ---------------------------------------

fn build_query(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<Query> {
    let inner = pair.into_inner().next().expect("query has a child");
    match inner.as_rule() {
        Rule::select_query => build_select_query(ctx, inner),
        Rule::construct_query => build_construct_query(ctx, inner),
        Rule::ask_query => build_ask_query(ctx, inner),
        Rule::describe_query => build_describe_query(ctx, inner),
        other => unreachable!("query child rule {other:?}"),
    }
}

fn parse_select_clause(ctx: &Context, pair: Pair<Rule>) -> ParseResult<SelectClause> {
    let mut distinct = false;
    let mut reduced = false;
    let mut star = false;
    let mut items = Vec::new();

    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::distinct_or_reduced => {
                if p.as_str().eq_ignore_ascii_case("distinct") {
                    distinct = true;
                } else {
                    reduced = true;
                }
            }
            Rule::select_star => star = true,
            Rule::select_item => {
                let mut it = p.into_inner();
                let first = it.next().expect("select_item has a child");
                if first.as_rule() == Rule::var {
                    items.push(ProjectionItem {
                        expr: Expression::Term(Term::Variable(parse_var(first))),
                        alias: None,
                    });
                } else {
                    let expr = parse_expression(ctx, first)?;
                    let alias = parse_var(it.next().expect("aliased select_item has a var"));
                    items.push(ProjectionItem {
                        expr,
                        alias: Some(alias),
                    });
                }
            }
            _ => {}
        }
    }

    let projection = if star {
        Some(Projection::Star)
    } else if !items.is_empty() {
        Some(Projection::Items(items))
    } else {
        None
    };
    Ok(SelectClause {
        distinct,
        reduced,
        projection,
    })
}

fn parse_solution_modifier(ctx: &Context, pair: Pair<Rule>) -> ParseResult<SolutionModifiers> {
    let mut modifiers = SolutionModifiers::default();
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::group_clause => {
                for cond in p.into_inner() {
                    let expr_pair = cond.into_inner().next().expect("group_condition has an expression");
                    modifiers.group_by.push(parse_expression(ctx, expr_pair)?);
                }
            }
            Rule::having_clause => {
                for expr_pair in p.into_inner() {
                    modifiers.having.push(parse_expression(ctx, expr_pair)?);
                }
            }
            Rule::order_clause => {
                for cond in p.into_inner() {
                    modifiers.order_by.push(parse_order_condition(ctx, cond)?);
                }
            }
            Rule::limit_offset_clauses => {
                for clause in p.into_inner() {
                    match clause.as_rule() {
                        Rule::limit_clause => {
                            let n = clause
                                .into_inner()
                                .next()
                                .expect("limit_clause has an integer")
                                .as_str()
                                .parse()
                                .expect("integer token parses as u64");
                            modifiers.limit = Some(n);
                        }
                        Rule::offset_clause => {
                            let n = clause
                                .into_inner()
                                .next()
                                .expect("offset_clause has an integer")
                                .as_str()
                                .parse()
                                .expect("integer token parses as u64");
                            modifiers.offset = Some(n);
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    Ok(modifiers)
}

fn parse_order_condition(ctx: &Context, pair: Pair<Rule>) -> ParseResult<OrderCondition> {
    let mut descending = false;
    let mut expr = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::order_direction => descending = p.as_str().eq_ignore_ascii_case("desc"),
            Rule::bracketted_expression => expr = Some(parse_bracketted_expression(ctx, p)?),
            Rule::var => expr = Some(Expression::Term(Term::Variable(parse_var(p)))),
            _ => {}
        }
    }
    Ok(OrderCondition {
        expr: expr.expect("order_condition always carries an expression"),
        descending,
    })
}

fn build_select_query(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<Query> {
    let mut select = None;
    let mut where_pair = None;
    let mut modifiers_pair = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::select_clause => select = Some(parse_select_clause(ctx, p)?),
            Rule::dataset_clause => {}
            Rule::where_clause => where_pair = Some(p),
            Rule::solution_modifier => modifiers_pair = Some(p),
            _ => {}
        }
    }
    let pattern = parse_where_clause(ctx, where_pair.expect("select_query has a WHERE clause"))?;
    let modifiers = parse_solution_modifier(ctx, modifiers_pair.expect("select_query has a solution_modifier"))?;
    Ok(Query::Select {
        select: select.expect("select_query has a select_clause"),
        pattern,
        modifiers,
    })
}

fn build_construct_query(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<Query> {
    let mut template = Vec::new();
    let mut where_pair = None;
    let mut modifiers_pair = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::construct_template => {
                if let Some(tt) = p.into_inner().next() {
                    template = parse_triples_template(ctx, tt)?;
                }
            }
            Rule::dataset_clause => {}
            Rule::where_clause => where_pair = Some(p),
            Rule::solution_modifier => modifiers_pair = Some(p),
            _ => {}
        }
    }
    let pattern = parse_where_clause(ctx, where_pair.expect("construct_query has a WHERE clause"))?;
    let modifiers = parse_solution_modifier(ctx, modifiers_pair.expect("construct_query has a solution_modifier"))?;
    Ok(Query::Construct {
        template,
        pattern,
        modifiers,
    })
}

fn build_ask_query(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<Query> {
    let mut where_pair = None;
    for p in pair.into_inner() {
        if p.as_rule() == Rule::where_clause {
            where_pair = Some(p);
        }
    }
    let pattern = parse_where_clause(ctx, where_pair.expect("ask_query has a WHERE clause"))?;
    Ok(Query::Ask { pattern })
}

fn build_describe_query(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<Query> {
    let mut targets = Vec::new();
    let mut where_pair = None;
    let mut modifiers_pair = None;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::describe_star => {}
            Rule::describe_target => {
                let inner = p.into_inner().next().expect("describe_target has a child");
                targets.push(match inner.as_rule() {
                    Rule::var => Term::Variable(parse_var(inner)),
                    Rule::iri => parse_iri_term(ctx, inner)?,
                    other => unreachable!("describe_target child rule {other:?}"),
                });
            }
            Rule::dataset_clause => {}
            Rule::where_clause => where_pair = Some(p),
            Rule::solution_modifier => modifiers_pair = Some(p),
            _ => {}
        }
    }
    let pattern = where_pair.map(|p| parse_where_clause(ctx, p)).transpose()?;
    let modifiers = modifiers_pair
        .map(|p| parse_solution_modifier(ctx, p))
        .transpose()?
        .unwrap_or_default();
    Ok(Query::Describe {
        targets,
        pattern,
        modifiers,
    })
}

// --- Update ---------------------------------------------------------------

fn parse_single_update(ctx: &mut Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let inner = pair.into_inner().next().expect("update has a child");
    match inner.as_rule() {
        Rule::load_update => parse_load_update(ctx, inner),
        Rule::clear_update => parse_clear_update(ctx, inner),
        Rule::drop_update => parse_drop_update(ctx, inner),
        Rule::create_update => parse_create_update(ctx, inner),
        Rule::copy_update => parse_copy_update(ctx, inner),
        Rule::move_update => parse_move_update(ctx, inner),
        Rule::add_update => parse_add_update(ctx, inner),
        Rule::insert_data_update => parse_insert_data_update(ctx, inner),
        Rule::delete_data_update => parse_delete_data_update(ctx, inner),
        Rule::delete_where_update => parse_delete_where_update(ctx, inner),
        Rule::modify_update => parse_modify_update(ctx, inner),
        other => unreachable!("update child rule {other:?}"),
    }
}

fn parse_load_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let mut silent = false;
    let mut iris = Vec::new();
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::silent_kw => silent = true,
            Rule::iri => iris.push(parse_iri_term(ctx, p)?),
            _ => {}
        }
    }
    let source = iris.remove(0);
    let into = if iris.is_empty() { None } else { Some(iris.remove(0)) };
    Ok(UpdateOperation::Load { source, into, silent })
}

fn parse_graph_ref_iri(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Term> {
    let iri_pair = pair.into_inner().next().expect("graph_ref has an iri");
    parse_iri_term(ctx, iri_pair)
}

fn parse_graph_ref_all(ctx: &Context, pair: Pair<Rule>) -> ParseResult<GraphTarget> {
    let inner = pair.into_inner().next().expect("graph_ref_all has a child");
    Ok(match inner.as_rule() {
        Rule::graph_ref => GraphTarget::Named(parse_graph_ref_iri(ctx, inner)?),
        Rule::default_kw => GraphTarget::Default,
        Rule::named_kw | Rule::all_kw => GraphTarget::All,
        other => unreachable!("graph_ref_all child rule {other:?}"),
    })
}

fn parse_clear_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let mut silent = false;
    let mut target = GraphTarget::Default;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::silent_kw => silent = true,
            Rule::graph_ref_all => target = parse_graph_ref_all(ctx, p)?,
            _ => {}
        }
    }
    Ok(UpdateOperation::Clear { target, silent })
}

fn parse_drop_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let mut silent = false;
    let mut target = GraphTarget::Default;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::silent_kw => silent = true,
            Rule::graph_ref_all => target = parse_graph_ref_all(ctx, p)?,
            _ => {}
        }
    }
    Ok(UpdateOperation::Drop { target, silent })
}

fn parse_create_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let mut silent = false;
    let mut target = GraphTarget::Default;
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::silent_kw => silent = true,
            Rule::graph_ref => target = GraphTarget::Named(parse_graph_ref_iri(ctx, p)?),
            _ => {}
        }
    }
    Ok(UpdateOperation::Create { target, silent })
}

fn parse_graph_or_default(ctx: &Context, pair: Pair<Rule>) -> ParseResult<GraphTarget> {
    let span = pair.as_span();
    let inner = pair.into_inner().next();
    match inner {
        Some(p) if p.as_rule() == Rule::default_kw => Ok(GraphTarget::Default),
        Some(p) if p.as_rule() == Rule::iri => Ok(GraphTarget::Named(parse_iri_term(ctx, p)?)),
        _ => Err(ParseError::semantic(SparqlErrorCode::MalformedGraphTarget, span, "malformed graph target")),
    }
}

fn parse_copy_like(ctx: &Context, pair: Pair<Rule>) -> ParseResult<(GraphTarget, GraphTarget, bool)> {
    let mut silent = false;
    let mut targets = Vec::new();
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::silent_kw => silent = true,
            Rule::graph_or_default => targets.push(parse_graph_or_default(ctx, p)?),
            _ => {}
        }
    }
    let to = targets.pop().expect("copy-like update has a target graph_or_default");
    let from = targets.pop().expect("copy-like update has a source graph_or_default");
    Ok((from, to, silent))
}

fn parse_copy_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let (from, to, silent) = parse_copy_like(ctx, pair)?;
    Ok(UpdateOperation::Copy { from, to, silent })
}

fn parse_move_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let (from, to, silent) = parse_copy_like(ctx, pair)?;
    Ok(UpdateOperation::Move { from, to, silent })
}

fn parse_add_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let (from, to, silent) = parse_copy_like(ctx, pair)?;
    Ok(UpdateOperation::Add { from, to, silent })
}

fn parse_quad_data(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<QuadTemplate>> {
    let mut out = Vec::new();
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::triples_template => out.extend(parse_triples_template(ctx, p)?),
            Rule::quads_graph => out.extend(parse_quads_graph(ctx, p)?),
            _ => {}
        }
    }
    Ok(out)
}

fn parse_quads_graph(ctx: &Context, pair: Pair<Rule>) -> ParseResult<Vec<QuadTemplate>> {
    let mut it = pair.into_inner();
    let graph_term = parse_var_or_iri(ctx, it.next().expect("quads_graph has a var_or_iri"))?;
    let mut triples = Vec::new();
    if let Some(tt) = it.next() {
        triples = parse_triples_template(ctx, tt)?;
    }
    for t in triples.iter_mut() {
        t.graph = Some(graph_term.clone());
    }
    Ok(triples)
}

/// Converts a quad template list (from `DELETE WHERE` or a `DELETE`
/// clause reused as a pattern) into the equivalent `GraphPattern`,
/// grouping triples by graph and wrapping each group in `GRAPH`.
fn quad_templates_to_pattern(templates: &[QuadTemplate]) -> GraphPattern {
    let mut default_triples = Vec::new();
    let mut graphed: Vec<(Term, Vec<TriplePattern>)> = Vec::new();
    for t in templates {
        let tp = TriplePattern {
            subject: t.subject.clone(),
            path: PropertyPath::Predicate(t.predicate.clone()),
            object: t.object.clone(),
        };
        match &t.graph {
            None => default_triples.push(tp),
            Some(g) => match graphed.iter_mut().find(|(gg, _)| gg == g) {
                Some(entry) => entry.1.push(tp),
                None => graphed.push((g.clone(), vec![tp])),
            },
        }
    }

    let mut result = if default_triples.is_empty() {
        None
    } else {
        Some(GraphPattern::Bgp(default_triples))
    };
    for (graph, triples) in graphed {
        let gp = GraphPattern::Graph {
            graph,
            input: Box::new(GraphPattern::Bgp(triples)),
        };
        result = Some(join_with(result.take(), gp));
    }
    result.unwrap_or(GraphPattern::Unit)
}

fn parse_insert_data_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let qd = pair.into_inner().next().expect("insert_data_update has a quad_data");
    Ok(UpdateOperation::InsertData(parse_quad_data(ctx, qd)?))
}

fn parse_delete_data_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let qd = pair.into_inner().next().expect("delete_data_update has a quad_data");
    Ok(UpdateOperation::DeleteData(parse_quad_data(ctx, qd)?))
}

fn parse_delete_where_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let qp = pair.into_inner().next().expect("delete_where_update has a quad_pattern");
    let templates = parse_quad_data(ctx, qp)?;
    let pattern = quad_templates_to_pattern(&templates);
    Ok(UpdateOperation::DeleteInsert {
        delete: templates,
        insert: Vec::new(),
        using: Vec::new(),
        using_named: Vec::new(),
        pattern,
    })
}

fn parse_modify_update(ctx: &Context, pair: Pair<Rule>) -> ParseResult<UpdateOperation> {
    let mut with_graph = None;
    let mut delete = Vec::new();
    let mut insert = Vec::new();
    let mut using = Vec::new();
    let mut using_named = Vec::new();
    let mut pattern = None;

    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::iri => with_graph = Some(parse_iri_term(ctx, p)?),
            Rule::delete_clause => {
                let qp = p.into_inner().next().expect("delete_clause has a quad_pattern");
                delete = parse_quad_data(ctx, qp)?;
            }
            Rule::insert_clause => {
                let qp = p.into_inner().next().expect("insert_clause has a quad_pattern");
                insert = parse_quad_data(ctx, qp)?;
            }
            Rule::using_clause => {
                let mut named = false;
                let mut iri_pair = None;
                for c in p.into_inner() {
                    match c.as_rule() {
                        Rule::using_named_kw => named = true,
                        Rule::iri => iri_pair = Some(c),
                        _ => {}
                    }
                }
                let iri_term = parse_iri_term(ctx, iri_pair.expect("using_clause has an iri"))?;
                if named {
                    using_named.push(iri_term);
                } else {
                    using.push(iri_term);
                }
            }
            Rule::group_graph_pattern => pattern = Some(parse_group_graph_pattern(ctx, p)?),
            _ => {}
        }
    }

    let mut pattern = pattern.expect("modify_update has a WHERE pattern");
    if let Some(graph) = with_graph {
        pattern = GraphPattern::Graph {
            graph,
            input: Box::new(pattern),
        };
    }
    Ok(UpdateOperation::DeleteInsert {
        delete,
        insert,
        using,
        using_named,
        pattern,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_select() {
        let query = parse_query(
            "PREFIX foaf: <http://xmlns.com/foaf/0.1/> SELECT ?name WHERE { ?p foaf:name ?name }",
        )
        .unwrap();
        match query {
            Query::Select { select, pattern, .. } => {
                assert!(matches!(select.projection, Some(Projection::Items(_))));
                assert!(matches!(pattern, GraphPattern::Bgp(_)));
            }
            _ => panic!("expected a SELECT query"),
        }
    }

    #[test]
    fn test_parse_select_star_distinct() {
        let query = parse_query("SELECT DISTINCT * WHERE { ?s ?p ?o }").unwrap();
        match query {
            Query::Select { select, .. } => {
                assert!(select.distinct);
                assert!(matches!(select.projection, Some(Projection::Star)));
            }
            _ => panic!("expected a SELECT query"),
        }
    }

    #[test]
    fn test_parse_ask_query() {
        let query = parse_query("ASK { <http://example.org/s> <http://example.org/p> ?o }").unwrap();
        assert!(matches!(query, Query::Ask { .. }));
    }

    #[test]
    fn test_parse_optional_and_filter() {
        let query = parse_query(
            "SELECT ?s WHERE { ?s ?p ?o OPTIONAL { ?s <http://example.org/extra> ?x } FILTER(?o != 1) }",
        )
        .unwrap();
        match query {
            Query::Select { pattern, .. } => {
                assert!(matches!(pattern, GraphPattern::Filter { .. }));
            }
            _ => panic!("expected a SELECT query"),
        }
    }

    #[test]
    fn test_parse_property_path() {
        let query = parse_query(
            "PREFIX foaf: <http://xmlns.com/foaf/0.1/> SELECT ?x WHERE { ?a foaf:knows+ ?x }",
        )
        .unwrap();
        match query {
            Query::Select {
                pattern: GraphPattern::Bgp(triples),
                ..
            } => {
                assert_eq!(triples.len(), 1);
                assert!(matches!(triples[0].path, PropertyPath::OneOrMore(_)));
            }
            _ => panic!("expected a BGP with one triple pattern"),
        }
    }

    #[test]
    fn test_parse_insert_data() {
        let ops = parse_update(
            "PREFIX ex: <http://example.org/> INSERT DATA { ex:s ex:p ex:o }",
        )
        .unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            UpdateOperation::InsertData(templates) => assert_eq!(templates.len(), 1),
            _ => panic!("expected InsertData"),
        }
    }

    #[test]
    fn test_parse_clear_default() {
        let ops = parse_update("CLEAR DEFAULT").unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0],
            UpdateOperation::Clear {
                target: GraphTarget::Default,
                silent: false,
            }
        ));
    }

    #[test]
    fn test_parse_values_clause() {
        let query = parse_query("SELECT ?x WHERE { VALUES ?x { 1 2 } }").unwrap();
        match query {
            Query::Select {
                pattern: GraphPattern::Values { variables, rows },
                ..
            } => {
                assert_eq!(variables, vec!["x".to_string()]);
                assert_eq!(rows.len(), 2);
            }
            _ => panic!("expected a VALUES pattern"),
        }
    }

    #[test]
    fn test_undeclared_prefix_is_semantic_error() {
        let source = "SELECT ?s WHERE { ?s unknown:p ?o }";
        let err = parse_query(source).unwrap_err();
        match err {
            ParseError::Semantic { code, span, .. } => {
                assert_eq!(code, SparqlErrorCode::UndeclaredPrefix);
                assert_eq!(&source[span.0..span.1], "unknown:p");
            }
            other => panic!("expected a semantic error, got {other:?}"),
        }
    }
}
