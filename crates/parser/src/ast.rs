//! Typed statement/expression nodes.
//!
//! This is the "opaque input that yields typed statement/expression nodes"
//! boundary from §1: tree-sitter's concrete syntax tree is converted into
//! this shape once, in [`crate::build`], and everything downstream
//! (normalizer, CFG builder, fingerprint engine) works only with these
//! types, never with a `tree_sitter::Node` directly.
//!
//! Constructs the grammar exposes that aren't explicitly modeled here (most
//! comprehensions, walrus targets, complex match patterns) fall through to
//! `Expr::Opaque`/`Stmt::Opaque`, carrying only their tree-sitter node kind.
//! That keeps their contribution to a fingerprint honest ("some node of this
//! shape was here") without claiming an understanding the builder doesn't have.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Name(String),
    Constant(String),
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    BinOp {
        op: String,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    BoolOp {
        op: String, // "and" | "or"
        values: Vec<Expr>,
    },
    UnaryOp {
        op: String,
        operand: Box<Expr>,
    },
    /// `not (x in y)`-shaped or `not (x is y)`-shaped negation, kept distinct
    /// from the generic `UnaryOp("not", ...)` case so the normalizer can
    /// apply the local logical-equivalence rewrite (§4.1 rule 6).
    NotIn {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    NotIs {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Chained comparison: `a OP1 b OP2 c ...`.
    Compare {
        left: Box<Expr>,
        ops: Vec<String>,
        comparators: Vec<Expr>,
    },
    Tuple(Vec<Expr>),
    ListLit(Vec<Expr>),
    SetLit(Vec<Expr>),
    DictLit(Vec<(Expr, Expr)>),
    Starred(Box<Expr>),
    Ternary {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    Yield(Option<Box<Expr>>),
    YieldFrom(Box<Expr>),
    Await(Box<Expr>),
    /// Fallback: unmodeled node kind, no substructure.
    Opaque(&'static str),
}

impl Expr {
    /// True when the expression contains a call, subscript, yield, or await,
    /// any of which means evaluating it may raise or suspend.
    pub fn may_raise(&self) -> bool {
        match self {
            Expr::Call { .. } | Expr::Subscript { .. } => true,
            Expr::Yield(_) | Expr::YieldFrom(_) | Expr::Await(_) => true,
            Expr::Attribute { value, .. } => value.may_raise() || true, // attribute access itself may raise
            Expr::BinOp { left, right, .. } => left.may_raise() || right.may_raise(),
            Expr::BoolOp { values, .. } => values.iter().any(Expr::may_raise),
            Expr::UnaryOp { operand, .. } => operand.may_raise(),
            Expr::NotIn { left, right } | Expr::NotIs { left, right } => {
                left.may_raise() || right.may_raise()
            }
            Expr::Compare {
                left, comparators, ..
            } => left.may_raise() || comparators.iter().any(Expr::may_raise),
            Expr::Tuple(xs) | Expr::ListLit(xs) | Expr::SetLit(xs) => xs.iter().any(Expr::may_raise),
            Expr::DictLit(pairs) => pairs.iter().any(|(k, v)| k.may_raise() || v.may_raise()),
            Expr::Starred(e) | Expr::Ternary { test: e, .. } => e.may_raise(),
            Expr::Lambda { .. } => false,
            Expr::Name(_) | Expr::Constant(_) | Expr::Opaque(_) => false,
        }
    }

    /// True when the expression is side-effect-free for commutative-reorder
    /// purposes: literals, bare names, or attribute chains over those (§4.1
    /// rule 5). Calls, indexing, and comparisons inhibit reordering.
    pub fn is_reorder_safe(&self) -> bool {
        match self {
            Expr::Name(_) | Expr::Constant(_) => true,
            Expr::Attribute { value, .. } => value.is_reorder_safe(),
            Expr::UnaryOp { operand, .. } => operand.is_reorder_safe(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptHandler {
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCase {
    pub pattern_kind: &'static str,
    pub is_wildcard: bool,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Expr(Expr),
    Assign {
        targets: Vec<Expr>,
        value: Expr,
    },
    /// Always the pre-expansion form; the normalizer rewrites this into
    /// `Assign { targets: [target], value: BinOp { op, target, value } }`
    /// per §4.1 rule 4 before CFG construction ever sees it.
    AugAssign {
        target: Expr,
        op: String,
        value: Expr,
    },
    Return(Option<Expr>),
    Pass,
    Break,
    Continue,
    Raise(Option<Expr>),
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Import,
    Delete(Vec<Expr>),
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        is_async: bool,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
    },
    With {
        items: Vec<Expr>,
        body: Vec<Stmt>,
        is_async: bool,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
    },
    /// Nested `def`/`class`: not expanded here. The extraction pass that
    /// walks the file for top-level units visits nested functions
    /// independently, so within an enclosing function's body a nested
    /// definition is just an opaque statement that cannot raise.
    NestedDef(&'static str),
    Opaque(&'static str),
}

/// A single function or method, as handed to the normalizer.
#[derive(Debug, Clone)]
pub struct FunctionAst {
    pub qualified_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub body: Vec<Stmt>,
    /// Source line of each top-level statement in `body`, same length and
    /// order as `body`. Exists only for this one level: nested statements
    /// don't carry line numbers, because block/segment window extraction
    /// operates strictly over the top-level statement sequence and needs a
    /// line span to report per window.
    pub top_level_lines: Vec<u32>,
}
