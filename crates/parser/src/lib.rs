//! `ParserHost`: the tree-sitter-python entry point that turns one source
//! file into zero or more [`ast::FunctionAst`] units.
//!
//! A single reusable `tree_sitter::Parser`, a cached entity-extraction
//! `Query` over the grammar, and a `dissect` method that walks query matches
//! rather than hand-rolling tree traversal for the top-level "find every
//! function/method" pass. The function body itself is then converted node by
//! node via [`build`].

pub mod ast;
mod build;

use std::sync::OnceLock;

use ast::FunctionAst;
use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator};

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("failed to set tree-sitter-python language: {0}")]
    Language(#[from] tree_sitter::LanguageError),
    #[error("tree-sitter produced no parse tree")]
    NoTree,
    #[error("source is not valid UTF-8")]
    InvalidUtf8,
    #[error("entity query is malformed: {0}")]
    QueryBuild(#[from] tree_sitter::QueryError),
}

/// Query capturing every function definition (including async and
/// decorated forms) and every class definition, so the extraction pass can
/// enumerate both in one traversal and track class nesting for qualified
/// names.
const ENTITY_QUERY: &str = r#"
(function_definition) @function
(class_definition) @class
"#;

fn entity_query() -> &'static Query {
    static QUERY: OnceLock<Query> = OnceLock::new();
    QUERY.get_or_init(|| {
        Query::new(&tree_sitter_python::LANGUAGE.into(), ENTITY_QUERY)
            .expect("ENTITY_QUERY is a fixed, known-valid query string")
    })
}

pub struct ParserHost {
    parser: Parser,
}

impl Default for ParserHost {
    fn default() -> Self {
        Self::new().expect("tree-sitter-python grammar is statically linked and always loads")
    }
}

impl ParserHost {
    pub fn new() -> Result<Self, ParserError> {
        let mut parser = Parser::new();
        parser.set_language(&tree_sitter_python::LANGUAGE.into())?;
        Ok(Self { parser })
    }

    /// Parses `source` and extracts every function/method as a
    /// [`FunctionAst`]. Order follows source position (query matches are
    /// emitted in a deterministic, depth-first order by tree-sitter).
    pub fn dissect(&mut self, source: &[u8]) -> Result<Vec<FunctionAst>, ParserError> {
        let text = std::str::from_utf8(source).map_err(|_| ParserError::InvalidUtf8)?;
        let tree = self.parser.parse(text, None).ok_or(ParserError::NoTree)?;
        let root = tree.root_node();
        tracing::trace!(bytes = source.len(), "parsed source");

        let query = entity_query();
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, root, source);

        let mut out = Vec::new();
        while let Some(m) = matches.next() {
            for capture in m.captures {
                let node = capture.node;
                if node.kind() != "function_definition" {
                    continue;
                }
                // Skip nested functions here: they're reachable as their own
                // top-level query match, and are represented inside their
                // enclosing function's body as `Stmt::NestedDef`.
                if is_nested_in_function(node) {
                    continue;
                }
                let qualified_name = qualified_name_of(node, source);
                tracing::trace!(%qualified_name, "extracted function");
                out.push(build::convert_function(node, source, qualified_name));
            }
        }

        out.sort_by_key(|f| f.start_line);
        Ok(out)
    }
}

fn is_nested_in_function(node: Node) -> bool {
    let mut current = node.parent();
    while let Some(p) = current {
        if p.kind() == "function_definition" {
            return true;
        }
        current = p.parent();
    }
    false
}

/// Walks enclosing `class_definition` ancestors to build `Outer.inner.method`
/// style qualified names. Decorated definitions are unwrapped transparently
/// since the decorator itself carries no structural signal for the CFG.
fn qualified_name_of(node: Node, src: &[u8]) -> String {
    let name = node
        .child_by_field_name("name")
        .and_then(|n| n.utf8_text(src).ok())
        .unwrap_or("<anonymous>");

    let mut parts = vec![name.to_string()];
    let mut current = node.parent();
    while let Some(p) = current {
        if p.kind() == "class_definition" {
            if let Some(cname) = p
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(src).ok())
            {
                parts.push(cname.to_string());
            }
        }
        current = p.parent();
    }
    parts.reverse();
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dissect(src: &str) -> Vec<FunctionAst> {
        ParserHost::new().unwrap().dissect(src.as_bytes()).unwrap()
    }

    #[test]
    fn simple_function() {
        let units = dissect("def foo():\n    return 1\n");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].qualified_name, "foo");
    }

    #[test]
    fn async_function() {
        let units = dissect("async def foo():\n    await bar()\n");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].qualified_name, "foo");
    }

    #[test]
    fn method_inside_class() {
        let units = dissect(
            "class Widget:\n    def render(self):\n        return self.x\n",
        );
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].qualified_name, "Widget.render");
    }

    #[test]
    fn nested_function_is_separate_unit_and_opaque_in_parent() {
        let units = dissect(
            "def outer():\n    def inner():\n        return 1\n    return inner()\n",
        );
        assert_eq!(units.len(), 2);
        let names: Vec<&str> = units.iter().map(|u| u.qualified_name.as_str()).collect();
        assert!(names.contains(&"outer"));
        assert!(names.contains(&"inner"));
    }

    #[test]
    fn elif_chain_normalizes_to_nested_if() {
        use ast::Stmt;
        let units = dissect(
            "def f(x):\n    if x == 1:\n        return 1\n    elif x == 2:\n        return 2\n    else:\n        return 3\n",
        );
        assert_eq!(units.len(), 1);
        match &units[0].body[0] {
            Stmt::If { orelse, .. } => match &orelse[0] {
                Stmt::If { .. } => {}
                other => panic!("expected nested If from elif, got {other:?}"),
            },
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn try_except_finally() {
        use ast::Stmt;
        let units = dissect(
            "def f():\n    try:\n        risky()\n    except ValueError:\n        handle()\n    finally:\n        cleanup()\n",
        );
        assert_eq!(units.len(), 1);
        match &units[0].body[0] {
            Stmt::Try {
                handlers,
                finalbody,
                ..
            } => {
                assert_eq!(handlers.len(), 1);
                assert!(!finalbody.is_empty());
            }
            other => panic!("expected Try, got {other:?}"),
        }
    }

    #[test]
    fn short_circuit_bool_op_flattens() {
        use ast::Expr;
        let units = dissect("def f(a, b, c):\n    return a and b and c\n");
        match &units[0].body[0] {
            ast::Stmt::Return(Some(Expr::BoolOp { op, values })) => {
                assert_eq!(op, "and");
                assert_eq!(values.len(), 3);
            }
            other => panic!("expected flattened BoolOp, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_construct_falls_back_to_opaque() {
        use ast::Stmt;
        let units = dissect("def f():\n    [x for x in range(10)]\n");
        assert_eq!(units.len(), 1);
        match &units[0].body[0] {
            Stmt::Expr(ast::Expr::Opaque(_)) => {}
            other => panic!("expected opaque fallback, got {other:?}"),
        }
    }

    #[test]
    fn not_in_rewrites() {
        use ast::{Expr, Stmt};
        let units = dissect("def f(x, y):\n    return not (x in y)\n");
        match &units[0].body[0] {
            Stmt::Return(Some(Expr::NotIn { .. })) => {}
            Stmt::Return(Some(other)) => panic!("expected NotIn, got {other:?}"),
            other => panic!("expected Return, got {other:?}"),
        }
    }
}
