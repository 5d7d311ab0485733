//! Abstract syntax tree for SPARQL 1.1 Query and Update, doubling as
//! the algebra the executor consumes directly — [`GraphPattern`] is
//! already the join/union/optional/filter tree shape the executor
//! walks, so [`crate::sparql::algebra`] only has to pick join order
//! and resolve terms to atom ids, not rebuild the tree.

pub type Variable = String;

/// An RDF term appearing in a query, before atom interning.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    NamedNode(String),
    BlankNode(String),
    Literal {
        value: String,
        language: Option<String>,
        datatype: Option<String>,
    },
    Variable(Variable),
}

impl Term {
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Term::Variable(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Canonical byte form used to intern/look up this term as an atom.
    /// Mirrors `RdfTerm::to_interned_bytes` so a query term and a
    /// stored term compare equal once both are interned.
    pub fn to_interned_bytes(&self) -> Vec<u8> {
        match self {
            Term::NamedNode(iri) => format!("<{iri}>").into_bytes(),
            Term::BlankNode(id) => format!("_:{id}").into_bytes(),
            Term::Literal {
                value,
                language,
                datatype,
            } => {
                let mut out = format!("\"{}\"", value.replace('"', "\\\""));
                if let Some(lang) = language {
                    out.push('@');
                    out.push_str(lang);
                } else if let Some(dt) = datatype {
                    out.push_str("^^<");
                    out.push_str(dt);
                    out.push('>');
                }
                out.into_bytes()
            }
            Term::Variable(_) => panic!("variable term has no interned byte form"),
        }
    }
}

/// One step of a property path expression.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyPath {
    Predicate(Term),
    Inverse(Box<PropertyPath>),
    Sequence(Box<PropertyPath>, Box<PropertyPath>),
    Alternative(Box<PropertyPath>, Box<PropertyPath>),
    ZeroOrMore(Box<PropertyPath>),
    OneOrMore(Box<PropertyPath>),
    ZeroOrOne(Box<PropertyPath>),
    NegatedPropertySet(Vec<(bool, Term)>),
}

/// One triple pattern, predicate generalized to a property path.
#[derive(Debug, Clone, PartialEq)]
pub struct TriplePattern {
    pub subject: Term,
    pub path: PropertyPath,
    pub object: Term,
}

/// A ground triple for CONSTRUCT templates and Update quad data — no
/// property paths, since those only make sense in WHERE patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadTemplate {
    pub graph: Option<Term>,
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Sample,
    GroupConcat,
}

/// A SPARQL expression, covering the operators and built-ins needed by
/// FILTER/BIND/HAVING/ORDER BY/SELECT expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Term(Term),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    UnaryMinus(Box<Expression>),
    Compare(CompareOp, Box<Expression>, Box<Expression>),
    Arithmetic(ArithOp, Box<Expression>, Box<Expression>),
    In {
        needle: Box<Expression>,
        haystack: Vec<Expression>,
        negated: bool,
    },
    Bound(Variable),
    FunctionCall {
        name: String,
        args: Vec<Expression>,
    },
    Builtin {
        name: String,
        args: Vec<Expression>,
    },
    If {
        condition: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
    },
    Coalesce(Vec<Expression>),
    Exists {
        negated: bool,
        pattern: Box<GraphPattern>,
    },
    Aggregate {
        op: AggregateOp,
        distinct: bool,
        /// `None` only for `COUNT(*)`.
        arg: Option<Box<Expression>>,
        separator: Option<String>,
    },
}

/// The query pattern tree. Combinators nest exactly the way the
/// executor's operators compose, so lowering is close to a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphPattern {
    /// No-op pattern matching the single empty solution, used for
    /// `WHERE {}` and as the identity element of joins.
    Unit,
    Bgp(Vec<TriplePattern>),
    Join(Box<GraphPattern>, Box<GraphPattern>),
    LeftJoin {
        left: Box<GraphPattern>,
        right: Box<GraphPattern>,
        filter: Option<Expression>,
    },
    Union(Box<GraphPattern>, Box<GraphPattern>),
    Minus(Box<GraphPattern>, Box<GraphPattern>),
    Filter {
        input: Box<GraphPattern>,
        expr: Expression,
    },
    Bind {
        input: Box<GraphPattern>,
        var: Variable,
        expr: Expression,
    },
    Graph {
        graph: Term,
        input: Box<GraphPattern>,
    },
    Service {
        endpoint: Term,
        silent: bool,
        input: Box<GraphPattern>,
    },
    Values {
        variables: Vec<Variable>,
        rows: Vec<Vec<Option<Term>>>,
    },
    /// A `{ SELECT ... }` subquery nested inside a group graph pattern.
    /// Evaluated independently and joined into the outer pattern on
    /// its projected variables.
    SubSelect(Box<Query>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub expr: Expression,
    pub alias: Option<Variable>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Star,
    Items(Vec<ProjectionItem>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectClause {
    pub distinct: bool,
    pub reduced: bool,
    pub projection: Option<Projection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderCondition {
    pub expr: Expression,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SolutionModifiers {
    pub group_by: Vec<Expression>,
    pub having: Vec<Expression>,
    pub order_by: Vec<OrderCondition>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select {
        select: SelectClause,
        pattern: GraphPattern,
        modifiers: SolutionModifiers,
    },
    Construct {
        template: Vec<QuadTemplate>,
        pattern: GraphPattern,
        modifiers: SolutionModifiers,
    },
    Ask {
        pattern: GraphPattern,
    },
    Describe {
        targets: Vec<Term>,
        pattern: Option<GraphPattern>,
        modifiers: SolutionModifiers,
    },
}

/// The target of a graph-level Update operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphTarget {
    Default,
    Named(Term),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOperation {
    InsertData(Vec<QuadTemplate>),
    DeleteData(Vec<QuadTemplate>),
    DeleteInsert {
        delete: Vec<QuadTemplate>,
        insert: Vec<QuadTemplate>,
        using: Vec<Term>,
        using_named: Vec<Term>,
        pattern: GraphPattern,
    },
    Load {
        source: Term,
        into: Option<Term>,
        silent: bool,
    },
    Clear {
        target: GraphTarget,
        silent: bool,
    },
    Drop {
        target: GraphTarget,
        silent: bool,
    },
    Create {
        target: GraphTarget,
        silent: bool,
    },
    Copy {
        from: GraphTarget,
        to: GraphTarget,
        silent: bool,
    },
    Move {
        from: GraphTarget,
        to: GraphTarget,
        silent: bool,
    },
    Add {
        from: GraphTarget,
        to: GraphTarget,
        silent: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_interned_bytes_named_node() {
        let term = Term::NamedNode("http://example.org/s".to_string());
        assert_eq!(term.to_interned_bytes(), b"<http://example.org/s>".to_vec());
    }

    #[test]
    fn test_term_interned_bytes_typed_literal() {
        let term = Term::Literal {
            value: "42".to_string(),
            language: None,
            datatype: Some("http://www.w3.org/2001/XMLSchema#integer".to_string()),
        };
        assert_eq!(
            term.to_interned_bytes(),
            b"\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>".to_vec()
        );
    }

    #[test]
    fn test_as_variable() {
        assert_eq!(Term::Variable("x".to_string()).as_variable(), Some("x"));
        assert_eq!(Term::NamedNode("http://example.org".to_string()).as_variable(), None);
    }
}
