//! Structural normalization: erases everything in a function's AST that is a
//! naming choice rather than a structural choice, so that code shaped the
//! same way prints the same way regardless of what the author called things.
//!
//! Operates on [`parser::ast`] trees. Every rewrite rule here is a pure
//! structural rewrite: no rule here ever looks at a value, so normalization
//! is safe to run on code that could not actually execute.

use parser::ast::{Expr, ExceptHandler, FunctionAst, MatchCase, Stmt};

/// Prefix for synthetic markers injected by this crate or by the CFG
/// builder. Kept in one place so a marker can never collide with an erased
/// user identifier, which only ever takes the form `_VAR_`/`_ATTR_`/
/// `_CONST_`/`_CALL_<name>_`.
pub const MARKER_PREFIX: &str = "__CC_META__::";

const COMMUTATIVE_OPS: &[&str] = &["+", "*", "|", "&", "^"];

/// Runs every rewrite rule over a function's body, in place conceptually
/// (the AST is consumed and rebuilt, since `Expr`/`Stmt` hold owned data).
pub fn normalize_function(f: FunctionAst) -> FunctionAst {
    let mut top_level_lines = f.top_level_lines;
    if is_leading_docstring(&f.body) && !top_level_lines.is_empty() {
        top_level_lines.remove(0);
    }
    FunctionAst {
        qualified_name: f.qualified_name,
        start_line: f.start_line,
        end_line: f.end_line,
        body: normalize_block(f.body),
        top_level_lines,
    }
}

fn is_leading_docstring(stmts: &[Stmt]) -> bool {
    matches!(
        stmts.first(),
        Some(Stmt::Expr(Expr::Constant(label)))
            if label == "<string>" || label == "<concatenated_string>"
    )
}

fn normalize_block(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let stmts = strip_leading_docstring(stmts);
    stmts.into_iter().map(normalize_stmt).collect()
}

/// A leading string-literal expression statement in any block is a
/// docstring; it carries no control-flow or data-flow signal and is dropped
/// before the rest of normalization sees it.
fn strip_leading_docstring(mut stmts: Vec<Stmt>) -> Vec<Stmt> {
    if is_leading_docstring(&stmts) {
        stmts.remove(0);
    }
    stmts
}

fn normalize_stmt(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::Expr(e) => Stmt::Expr(normalize_expr(e)),
        Stmt::Assign { targets, value } => Stmt::Assign {
            targets: targets.into_iter().map(normalize_expr).collect(),
            value: normalize_expr(value),
        },
        // Expansion per rule 4: `x op= y` becomes `x = x op y`, then that
        // reconstructed assignment is normalized like any other.
        Stmt::AugAssign { target, op, value } => normalize_stmt(Stmt::Assign {
            targets: vec![target.clone()],
            value: Expr::BinOp {
                op,
                left: Box::new(target),
                right: Box::new(value),
            },
        }),
        Stmt::Return(e) => Stmt::Return(e.map(normalize_expr)),
        Stmt::Pass => Stmt::Pass,
        Stmt::Break => Stmt::Break,
        Stmt::Continue => Stmt::Continue,
        Stmt::Raise(e) => Stmt::Raise(e.map(normalize_expr)),
        Stmt::Global(names) => Stmt::Global(names.into_iter().map(|_| "_VAR_".to_string()).collect()),
        Stmt::Nonlocal(names) => {
            Stmt::Nonlocal(names.into_iter().map(|_| "_VAR_".to_string()).collect())
        }
        Stmt::Import => Stmt::Import,
        Stmt::Delete(targets) => Stmt::Delete(targets.into_iter().map(normalize_expr).collect()),
        Stmt::If { test, body, orelse } => Stmt::If {
            test: normalize_expr(test),
            body: normalize_block(body),
            orelse: normalize_block(orelse),
        },
        Stmt::While { test, body, orelse } => Stmt::While {
            test: normalize_expr(test),
            body: normalize_block(body),
            orelse: normalize_block(orelse),
        },
        Stmt::For {
            target,
            iter,
            body,
            orelse,
            is_async,
        } => Stmt::For {
            target: normalize_expr(target),
            iter: normalize_expr(iter),
            body: normalize_block(body),
            orelse: normalize_block(orelse),
            is_async,
        },
        Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => Stmt::Try {
            body: normalize_block(body),
            handlers: handlers.into_iter().map(normalize_handler).collect(),
            orelse: normalize_block(orelse),
            finalbody: normalize_block(finalbody),
        },
        Stmt::With {
            items,
            body,
            is_async,
        } => Stmt::With {
            items: items.into_iter().map(normalize_expr).collect(),
            body: normalize_block(body),
            is_async,
        },
        Stmt::Match { subject, cases } => Stmt::Match {
            subject: normalize_expr(subject),
            cases: cases.into_iter().map(normalize_case).collect(),
        },
        Stmt::NestedDef(k) => Stmt::NestedDef(k),
        Stmt::Opaque(k) => Stmt::Opaque(k),
    }
}

fn normalize_handler(h: ExceptHandler) -> ExceptHandler {
    ExceptHandler {
        test: h.test.map(normalize_expr),
        body: normalize_block(h.body),
    }
}

fn normalize_case(c: MatchCase) -> MatchCase {
    MatchCase {
        pattern_kind: c.pattern_kind,
        is_wildcard: c.is_wildcard,
        body: normalize_block(c.body),
    }
}

fn normalize_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Name(_) => Expr::Name("_VAR_".into()),
        Expr::Constant(_) => Expr::Constant("_CONST_".into()),
        Expr::Attribute { value, attr: _ } => Expr::Attribute {
            value: Box::new(normalize_expr(*value)),
            attr: "_ATTR_".into(),
        },
        Expr::Call { callee, args } => {
            let args = args.into_iter().map(normalize_expr).collect();
            match dotted_tail(&callee) {
                Some(tail) => Expr::Call {
                    callee: Box::new(Expr::Name(format!("_CALL_{tail}_"))),
                    args,
                },
                None => Expr::Call {
                    callee: Box::new(normalize_expr(*callee)),
                    args,
                },
            }
        }
        Expr::Subscript { value, index } => Expr::Subscript {
            value: Box::new(normalize_expr(*value)),
            index: Box::new(normalize_expr(*index)),
        },
        Expr::BinOp { op, left, right } => {
            let left = normalize_expr(*left);
            let right = normalize_expr(*right);
            if COMMUTATIVE_OPS.contains(&op.as_str())
                && left.is_reorder_safe()
                && right.is_reorder_safe()
            {
                let (left, right) = canonical_order(left, right);
                Expr::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            } else {
                Expr::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
        }
        Expr::BoolOp { op, values } => Expr::BoolOp {
            op,
            values: values.into_iter().map(normalize_expr).collect(),
        },
        Expr::UnaryOp { op, operand } => Expr::UnaryOp {
            op,
            operand: Box::new(normalize_expr(*operand)),
        },
        Expr::NotIn { left, right } => Expr::NotIn {
            left: Box::new(normalize_expr(*left)),
            right: Box::new(normalize_expr(*right)),
        },
        Expr::NotIs { left, right } => Expr::NotIs {
            left: Box::new(normalize_expr(*left)),
            right: Box::new(normalize_expr(*right)),
        },
        Expr::Compare {
            left,
            ops,
            comparators,
        } => Expr::Compare {
            left: Box::new(normalize_expr(*left)),
            ops,
            comparators: comparators.into_iter().map(normalize_expr).collect(),
        },
        Expr::Tuple(xs) => Expr::Tuple(xs.into_iter().map(normalize_expr).collect()),
        Expr::ListLit(xs) => Expr::ListLit(xs.into_iter().map(normalize_expr).collect()),
        Expr::SetLit(xs) => Expr::SetLit(xs.into_iter().map(normalize_expr).collect()),
        Expr::DictLit(pairs) => Expr::DictLit(
            pairs
                .into_iter()
                .map(|(k, v)| (normalize_expr(k), normalize_expr(v)))
                .collect(),
        ),
        Expr::Starred(e) => Expr::Starred(Box::new(normalize_expr(*e))),
        Expr::Ternary { test, body, orelse } => Expr::Ternary {
            test: Box::new(normalize_expr(*test)),
            body: Box::new(normalize_expr(*body)),
            orelse: Box::new(normalize_expr(*orelse)),
        },
        Expr::Lambda { params, body } => Expr::Lambda {
            params: params.into_iter().map(|_| "_VAR_".to_string()).collect(),
            body: Box::new(normalize_expr(*body)),
        },
        Expr::Yield(inner) => Expr::Yield(inner.map(|b| Box::new(normalize_expr(*b)))),
        Expr::YieldFrom(inner) => Expr::YieldFrom(Box::new(normalize_expr(*inner))),
        Expr::Await(inner) => Expr::Await(Box::new(normalize_expr(*inner))),
        Expr::Opaque(k) => Expr::Opaque(k),
    }
}

/// The tail identifier of a call target, if the target is a bare name or an
/// unbroken chain of attribute accesses over names (rule 2). A call whose
/// target is itself a call, subscript, or anything else structurally richer
/// is not eligible for call-target preservation.
fn dotted_tail(callee: &Expr) -> Option<String> {
    match callee {
        Expr::Name(n) => Some(n.clone()),
        Expr::Attribute { value, attr } if is_dotted_chain(value) => Some(attr.clone()),
        _ => None,
    }
}

fn is_dotted_chain(e: &Expr) -> bool {
    match e {
        Expr::Name(_) => true,
        Expr::Attribute { value, .. } => is_dotted_chain(value),
        _ => false,
    }
}

fn canonical_order(left: Expr, right: Expr) -> (Expr, Expr) {
    if dump_expr(&left) <= dump_expr(&right) {
        (left, right)
    } else {
        (right, left)
    }
}

/// Deterministic textual dump of an expression, used both to decide
/// commutative ordering here and, downstream, as the per-statement text the
/// CFG builder and fingerprint engine hash. Two structurally equivalent,
/// already-normalized expressions always dump identically.
pub fn dump_expr(e: &Expr) -> String {
    match e {
        Expr::Name(n) => n.clone(),
        Expr::Constant(c) => c.clone(),
        Expr::Attribute { value, attr } => format!("{}.{}", dump_expr(value), attr),
        Expr::Call { callee, args } => format!(
            "{}({})",
            dump_expr(callee),
            args.iter().map(dump_expr).collect::<Vec<_>>().join(",")
        ),
        Expr::Subscript { value, index } => format!("{}[{}]", dump_expr(value), dump_expr(index)),
        Expr::BinOp { op, left, right } => {
            format!("({} {op} {})", dump_expr(left), dump_expr(right))
        }
        Expr::BoolOp { op, values } => format!(
            "({})",
            values
                .iter()
                .map(dump_expr)
                .collect::<Vec<_>>()
                .join(&format!(" {op} "))
        ),
        Expr::UnaryOp { op, operand } => format!("({op} {})", dump_expr(operand)),
        Expr::NotIn { left, right } => format!("({} not in {})", dump_expr(left), dump_expr(right)),
        Expr::NotIs { left, right } => format!("({} is not {})", dump_expr(left), dump_expr(right)),
        Expr::Compare {
            left,
            ops,
            comparators,
        } => {
            let mut s = dump_expr(left);
            for (op, cmp) in ops.iter().zip(comparators.iter()) {
                s.push_str(&format!(" {op} {}", dump_expr(cmp)));
            }
            format!("({s})")
        }
        Expr::Tuple(xs) => format!("({})", join_dumps(xs)),
        Expr::ListLit(xs) => format!("[{}]", join_dumps(xs)),
        Expr::SetLit(xs) => format!("{{{}}}", join_dumps(xs)),
        Expr::DictLit(pairs) => format!(
            "{{{}}}",
            pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", dump_expr(k), dump_expr(v)))
                .collect::<Vec<_>>()
                .join(",")
        ),
        Expr::Starred(inner) => format!("*{}", dump_expr(inner)),
        Expr::Ternary { test, body, orelse } => format!(
            "({} if {} else {})",
            dump_expr(body),
            dump_expr(test),
            dump_expr(orelse)
        ),
        Expr::Lambda { params, body } => format!("(lambda {}: {})", params.join(","), dump_expr(body)),
        Expr::Yield(inner) => match inner {
            Some(e) => format!("(yield {})", dump_expr(e)),
            None => "(yield)".into(),
        },
        Expr::YieldFrom(inner) => format!("(yield from {})", dump_expr(inner)),
        Expr::Await(inner) => format!("(await {})", dump_expr(inner)),
        Expr::Opaque(k) => format!("<opaque:{k}>"),
    }
}

fn join_dumps(xs: &[Expr]) -> String {
    xs.iter().map(dump_expr).collect::<Vec<_>>().join(",")
}

/// Deterministic textual dump of a statement, descending fully into nested
/// blocks. Used for block/segment window hashing (§4.3), where each
/// top-level statement of a function contributes one dump to the window.
pub fn dump_stmt(s: &Stmt) -> String {
    match s {
        Stmt::Expr(e) => format!("expr:{}", dump_expr(e)),
        Stmt::Assign { targets, value } => {
            format!("assign:{}={}", join_dumps(targets), dump_expr(value))
        }
        Stmt::AugAssign { target, op, value } => {
            format!("augassign:{} {op}= {}", dump_expr(target), dump_expr(value))
        }
        Stmt::Return(Some(e)) => format!("return:{}", dump_expr(e)),
        Stmt::Return(None) => "return".into(),
        Stmt::Pass => "pass".into(),
        Stmt::Break => "break".into(),
        Stmt::Continue => "continue".into(),
        Stmt::Raise(Some(e)) => format!("raise:{}", dump_expr(e)),
        Stmt::Raise(None) => "raise".into(),
        Stmt::Global(names) => format!("global:{}", names.len()),
        Stmt::Nonlocal(names) => format!("nonlocal:{}", names.len()),
        Stmt::Import => "import".into(),
        Stmt::Delete(targets) => format!("delete:{}", join_dumps(targets)),
        Stmt::If { test, body, orelse } => format!(
            "if:{}:{{{}}}else:{{{}}}",
            dump_expr(test),
            dump_stmts(body),
            dump_stmts(orelse)
        ),
        Stmt::While { test, body, orelse } => format!(
            "while:{}:{{{}}}else:{{{}}}",
            dump_expr(test),
            dump_stmts(body),
            dump_stmts(orelse)
        ),
        Stmt::For {
            target,
            iter,
            body,
            orelse,
            is_async,
        } => format!(
            "{}for:{}in{}:{{{}}}else:{{{}}}",
            if *is_async { "async" } else { "" },
            dump_expr(target),
            dump_expr(iter),
            dump_stmts(body),
            dump_stmts(orelse)
        ),
        Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => format!(
            "try:{{{}}}except:[{}]else:{{{}}}finally:{{{}}}",
            dump_stmts(body),
            handlers
                .iter()
                .map(|h| format!(
                    "{}:{{{}}}",
                    h.test.as_ref().map(dump_expr).unwrap_or_default(),
                    dump_stmts(&h.body)
                ))
                .collect::<Vec<_>>()
                .join(";"),
            dump_stmts(orelse),
            dump_stmts(finalbody)
        ),
        Stmt::With {
            items,
            body,
            is_async,
        } => format!(
            "{}with:[{}]:{{{}}}",
            if *is_async { "async" } else { "" },
            join_dumps(items),
            dump_stmts(body)
        ),
        Stmt::Match { subject, cases } => format!(
            "match:{}:[{}]",
            dump_expr(subject),
            cases
                .iter()
                .map(|c| format!(
                    "{}{}:{{{}}}",
                    c.pattern_kind,
                    if c.is_wildcard { "(_)" } else { "" },
                    dump_stmts(&c.body)
                ))
                .collect::<Vec<_>>()
                .join(";")
        ),
        Stmt::NestedDef(k) => format!("nesteddef:{k}"),
        Stmt::Opaque(k) => format!("opaque:{k}"),
    }
}

pub fn dump_stmts(stmts: &[Stmt]) -> String {
    stmts.iter().map(dump_stmt).collect::<Vec<_>>().join(";")
}

/// Coarse per-statement kind label, used to populate `stmt_kinds` on
/// `BlockWindow`/`SegmentWindow` and to decide boilerplate suppression
/// (§4.4: a segment needs ≥2 unique kinds or ≥1 control-flow statement).
pub fn stmt_kind(s: &Stmt) -> &'static str {
    match s {
        Stmt::Expr(_) => "expr",
        Stmt::Assign { .. } => "assign",
        Stmt::AugAssign { .. } => "aug_assign",
        Stmt::Return(_) => "return",
        Stmt::Pass => "pass",
        Stmt::Break => "break",
        Stmt::Continue => "continue",
        Stmt::Raise(_) => "raise",
        Stmt::Global(_) => "global",
        Stmt::Nonlocal(_) => "nonlocal",
        Stmt::Import => "import",
        Stmt::Delete(_) => "delete",
        Stmt::If { .. } => "if",
        Stmt::While { .. } => "while",
        Stmt::For { .. } => "for",
        Stmt::Try { .. } => "try",
        Stmt::With { .. } => "with",
        Stmt::Match { .. } => "match",
        Stmt::NestedDef(_) => "nested_def",
        Stmt::Opaque(_) => "opaque",
    }
}

/// Whether a statement kind counts as control flow for boilerplate
/// suppression purposes.
pub fn is_control_flow(s: &Stmt) -> bool {
    matches!(
        s,
        Stmt::If { .. }
            | Stmt::While { .. }
            | Stmt::For { .. }
            | Stmt::Try { .. }
            | Stmt::With { .. }
            | Stmt::Match { .. }
            | Stmt::Return(_)
            | Stmt::Raise(_)
            | Stmt::Break
            | Stmt::Continue
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parser::ParserHost;

    fn normalize_src(src: &str) -> FunctionAst {
        let units = ParserHost::new().unwrap().dissect(src.as_bytes()).unwrap();
        normalize_function(units.into_iter().next().unwrap())
    }

    #[test]
    fn rename_invariance_produces_identical_dump() {
        let a = normalize_src("def a(x):\n    return x + 1\n");
        let b = normalize_src("def b(y):\n    return y + 1\n");
        assert_eq!(dump_stmts(&a.body), dump_stmts(&b.body));
    }

    #[test]
    fn call_target_discrimination() {
        let f = normalize_src("def f(x):\n    return load_user(x)\n");
        let g = normalize_src("def g(y):\n    return delete_user(y)\n");
        assert_ne!(dump_stmts(&f.body), dump_stmts(&g.body));
    }

    #[test]
    fn dotted_call_target_uses_tail() {
        let f = normalize_src("def f(x):\n    return db.session.load_user(x)\n");
        assert!(dump_stmts(&f.body).contains("_CALL_load_user_"));
    }

    #[test]
    fn commutative_reorder_is_deterministic_for_safe_operands() {
        let a = normalize_src("def p(a, b):\n    return a + b\n");
        let b = normalize_src("def q(b, a):\n    return b + a\n");
        assert_eq!(dump_stmts(&a.body), dump_stmts(&b.body));
    }

    #[test]
    fn calls_inhibit_commutative_reorder() {
        let a = normalize_src("def p():\n    return f() + g()\n");
        let b = normalize_src("def q():\n    return g() + f()\n");
        assert_ne!(dump_stmts(&a.body), dump_stmts(&b.body));
    }

    #[test]
    fn leading_docstring_is_removed() {
        let f = normalize_src("def f():\n    \"\"\"does a thing\"\"\"\n    return 1\n");
        assert_eq!(f.body.len(), 1);
        assert!(matches!(f.body[0], Stmt::Return(Some(_))));
    }

    #[test]
    fn not_in_rewrite_survives_normalization() {
        let f = normalize_src("def f(x, y):\n    return not (x in y)\n");
        assert!(dump_stmts(&f.body).contains("not in"));
    }

    #[test]
    fn aug_assign_expands_to_assign() {
        let f = normalize_src("def f(x):\n    x += 1\n");
        match &f.body[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::BinOp { op, .. } if op == "+"));
            }
            other => panic!("expected expanded Assign, got {other:?}"),
        }
    }
}
