//! Control-flow graph construction (§4.2).
//!
//! Consumes a normalizer-rewritten [`parser::ast::FunctionAst`] and produces
//! a [`Cfg`]: an arena of [`Block`]s with deterministic integer ids assigned
//! by a depth-first walk in source order, and explicit ordered successor
//! lists. Synthetic blocks (merge points, loop after-blocks, the
//! unhandled-exception target of a handler chain) aren't known until *after*
//! the branches that lead into them are built, so edges are wired in a
//! second step once both endpoints exist. A plain `Vec<Block>` arena with a
//! `push_successor` that can be called any time after both ends are
//! allocated fits that shape directly, using ids instead of pointers to
//! avoid reference cycles through back-edges (loops).

use normalizer::dump_expr;
use parser::ast::{Expr, ExceptHandler, FunctionAst, MatchCase, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A plain sequential block: no special role in the shape of the graph.
    Plain,
    /// A condition, loop-header, or handler/case test block.
    Head,
    /// A block only reached along one conditional path (then/else/handler/case body).
    Branch,
    /// A loop body block, distinguished from `Branch` because it carries a back-edge.
    Loop,
    /// An explicit reconvergence point (after an if, loop, try, or match).
    Merge,
}

impl BlockKind {
    fn marker(self) -> &'static str {
        match self {
            BlockKind::Plain => "plain",
            BlockKind::Head => "head",
            BlockKind::Branch => "branch",
            BlockKind::Loop => "loop",
            BlockKind::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: u32,
    pub kind: BlockKind,
    pub stmts: Vec<String>,
    pub successors: Vec<u32>,
}

impl Block {
    pub fn marker(&self) -> &'static str {
        self.kind.marker()
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    pub entry: u32,
}

struct LoopFrame {
    continue_target: usize,
    pending_breaks: Vec<usize>,
    /// `try_stack.len()` at the time this loop was entered: break/continue
    /// only detour through a `finally` whose try frame was pushed after
    /// this point, since a try wrapping the whole loop is not exited by
    /// merely leaving the loop.
    try_stack_depth: usize,
}

/// Where a terminating statement (`return`/`raise`/`break`/`continue`) is
/// ultimately headed, once any intervening `finally` blocks have run.
#[derive(Clone, Copy)]
enum ExitKind {
    /// `return`/`raise`: no further successor once finally chaining ends.
    Terminal,
    /// `continue`: the loop's condition/header block, already resolved.
    Continue(usize),
    /// `break`: resolved later against the loop's `after` block.
    Break,
}

struct TryFrame {
    pending_raises: Vec<usize>,
    /// Entry block of this try's `finally`, reserved before the body is
    /// built so early exits from the body can route through it.
    finally_id: Option<usize>,
    /// Exits that detoured through this frame's finally and still need to
    /// reach their real destination once the finally's own exit block is
    /// known.
    pending_exits: Vec<(usize, ExitKind)>,
}

#[derive(Default)]
struct BuildCtx {
    loop_stack: Vec<LoopFrame>,
    try_stack: Vec<TryFrame>,
}

struct Builder {
    blocks: Vec<Block>,
}

impl Builder {
    fn new_block(&mut self, kind: BlockKind) -> usize {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id: id as u32,
            kind,
            stmts: Vec::new(),
            successors: Vec::new(),
        });
        id
    }

    fn push_stmt(&mut self, id: usize, text: String) {
        self.blocks[id].stmts.push(text);
    }

    fn push_successor(&mut self, from: usize, to: usize) {
        self.blocks[from].successors.push(to as u32);
    }

    fn set_successors(&mut self, id: usize, targets: Vec<usize>) {
        self.blocks[id].successors = targets.into_iter().map(|t| t as u32).collect();
    }
}

/// Builds the control-flow graph for one function body. Construction never
/// fails: anything the builder doesn't structurally understand is represented
/// as an opaque block via `Stmt::Opaque`/`Expr::Opaque`, already produced
/// upstream by the parser, so this function always returns a usable (if
/// low-quality) graph.
pub fn build_cfg(function: &FunctionAst) -> Cfg {
    let mut b = Builder { blocks: Vec::new() };
    let entry = b.new_block(BlockKind::Plain);
    let mut ctx = BuildCtx::default();
    build_stmts(&mut b, Some(entry), &function.body, &mut ctx);
    Cfg {
        blocks: b.blocks,
        entry: entry as u32,
    }
}

fn stmt_header_may_raise(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Expr(e) => e.may_raise(),
        Stmt::Assign { targets, value } => value.may_raise() || targets.iter().any(Expr::may_raise),
        Stmt::AugAssign { target, value, .. } => target.may_raise() || value.may_raise(),
        Stmt::Return(Some(e)) => e.may_raise(),
        Stmt::Return(None) => false,
        Stmt::Raise(_) => true,
        Stmt::Delete(targets) => targets.iter().any(Expr::may_raise),
        Stmt::If { test, .. } | Stmt::While { test, .. } => test.may_raise(),
        Stmt::For { iter, .. } => iter.may_raise(),
        Stmt::With { items, .. } => items.iter().any(Expr::may_raise),
        Stmt::Match { subject, .. } => subject.may_raise(),
        Stmt::Pass
        | Stmt::Break
        | Stmt::Continue
        | Stmt::Global(_)
        | Stmt::Nonlocal(_)
        | Stmt::Import
        | Stmt::Try { .. }
        | Stmt::NestedDef(_)
        | Stmt::Opaque(_) => false,
    }
}

/// Folds `stmts` into the flow starting at `current` (an already-open block,
/// or `None` if the previous statement terminated its block). Returns the
/// block still open for the caller to continue appending into, or `None` if
/// every path through `stmts` terminates (return/raise/break/continue).
fn build_stmts(
    b: &mut Builder,
    mut current: Option<usize>,
    stmts: &[Stmt],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    for stmt in stmts {
        match stmt {
            Stmt::If { test, body, orelse } => {
                current = build_if(b, current, test, body, orelse, ctx);
            }
            Stmt::While { test, body, orelse } => {
                current = build_while(b, current, test, body, orelse, ctx);
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
                ..
            } => {
                current = build_for(b, current, target, iter, body, orelse, ctx);
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                current = build_try(b, current, body, handlers, orelse, finalbody, ctx);
            }
            Stmt::With { items, body, .. } => {
                current = build_with(b, current, items, body, ctx);
            }
            Stmt::Match { subject, cases } => {
                current = build_match(b, current, subject, cases, ctx);
            }
            leaf => {
                current = build_leaf(b, current, leaf, ctx);
            }
        }
        if current.is_none() {
            // Every remaining statement in this list is unreachable; the
            // builder doesn't model dead code beyond a terminated block.
            break;
        }
    }
    current
}

fn open_block(b: &mut Builder, current: Option<usize>) -> usize {
    current.unwrap_or_else(|| b.new_block(BlockKind::Plain))
}

fn link_if_open(b: &mut Builder, current: Option<usize>, to: usize) {
    if let Some(prev) = current {
        b.push_successor(prev, to);
    }
}

fn record_raise(ctx: &mut BuildCtx, block: usize, raises: bool) {
    if raises {
        if let Some(frame) = ctx.try_stack.last_mut() {
            frame.pending_raises.push(block);
        }
    }
}

/// Routes `source`'s exit edge toward `kind`'s real destination, detouring
/// through the nearest open try frame's `finally` within
/// `[boundary, try_stack.len())` first (§4.2: a finally runs on every exit
/// path out of its protected body, not just normal completion and handled
/// exceptions). `boundary` is 0 for return/raise, which must pass through
/// every enclosing finally on the way out of the function, and a loop's
/// recorded try-stack depth for break/continue, which only detour through
/// trys pushed after that loop was entered.
fn route_exit(b: &mut Builder, ctx: &mut BuildCtx, source: usize, boundary: usize, kind: ExitKind) {
    for i in (boundary..ctx.try_stack.len()).rev() {
        if let Some(finally_id) = ctx.try_stack[i].finally_id {
            b.push_successor(source, finally_id);
            ctx.try_stack[i].pending_exits.push((boundary, kind));
            return;
        }
    }
    match kind {
        ExitKind::Terminal => {}
        ExitKind::Continue(target) => b.push_successor(source, target),
        ExitKind::Break => {
            if let Some(frame) = ctx.loop_stack.last_mut() {
                frame.pending_breaks.push(source);
            }
        }
    }
}

/// Leaf (non-branching) statements. Outside a protected `try` body these
/// batch into the already-open block: sequential statements append to the
/// current block. Inside a protected `try` body each gets its own block,
/// since a may-raise edge is a property of one statement, not of whatever
/// else shares its block (a bare-name load carries no handler edge, a call
/// does).
fn build_leaf(b: &mut Builder, current: Option<usize>, stmt: &Stmt, ctx: &mut BuildCtx) -> Option<usize> {
    let protected = !ctx.try_stack.is_empty();
    let block_id = if protected {
        let id = b.new_block(BlockKind::Plain);
        link_if_open(b, current, id);
        id
    } else {
        open_block(b, current)
    };
    b.push_stmt(block_id, normalizer::dump_stmt(stmt));
    if protected {
        record_raise(ctx, block_id, stmt_header_may_raise(stmt));
    }
    match stmt {
        Stmt::Return(_) | Stmt::Raise(_) => {
            route_exit(b, ctx, block_id, 0, ExitKind::Terminal);
            None
        }
        Stmt::Break => {
            let boundary = ctx
                .loop_stack
                .last()
                .map(|f| f.try_stack_depth)
                .unwrap_or(ctx.try_stack.len());
            route_exit(b, ctx, block_id, boundary, ExitKind::Break);
            None
        }
        Stmt::Continue => {
            if let Some(frame) = ctx.loop_stack.last() {
                let target = frame.continue_target;
                let boundary = frame.try_stack_depth;
                route_exit(b, ctx, block_id, boundary, ExitKind::Continue(target));
            }
            None
        }
        _ => Some(block_id),
    }
}

/// A condition expression, expanded into a micro-CFG when it's a
/// short-circuit `and`/`or` chain (§4.2: "boolean `and`/`or` expressions used
/// in a condition position are expanded into one block per operand"). Blocks
/// are allocated depth-first in operand order first (`alloc`), then wired
/// once both the true- and false-targets exist (`wire`), so the allocation
/// order matches source order even when the targets are synthetic blocks
/// created later (an if's merge block, a loop's after block).
enum CondPlan {
    Leaf(usize),
    BoolOp { op: String, operands: Vec<CondPlan> },
}

fn alloc_cond_plan(b: &mut Builder, expr: &Expr) -> CondPlan {
    match expr {
        Expr::BoolOp { op, values } => CondPlan::BoolOp {
            op: op.clone(),
            operands: values.iter().map(|v| alloc_cond_plan(b, v)).collect(),
        },
        _ => {
            let id = b.new_block(BlockKind::Head);
            b.push_stmt(id, format!("test:{}", dump_expr(expr)));
            CondPlan::Leaf(id)
        }
    }
}

fn wire_cond_plan(b: &mut Builder, plan: &CondPlan, true_target: usize, false_target: usize) -> usize {
    match plan {
        CondPlan::Leaf(id) => {
            b.set_successors(*id, vec![true_target, false_target]);
            *id
        }
        CondPlan::BoolOp { op, operands } => {
            let n = operands.len();
            let mut next_entry = wire_cond_plan(b, &operands[n - 1], true_target, false_target);
            for operand in operands[..n - 1].iter().rev() {
                let (t, f) = if op == "and" {
                    (next_entry, false_target)
                } else {
                    (true_target, next_entry)
                };
                next_entry = wire_cond_plan(b, operand, t, f);
            }
            next_entry
        }
    }
}

fn cond_raises(expr: &Expr) -> bool {
    expr.may_raise()
}

fn build_if(
    b: &mut Builder,
    current: Option<usize>,
    test: &Expr,
    body: &[Stmt],
    orelse: &[Stmt],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    let plan = alloc_cond_plan(b, test);
    let then_id = b.new_block(BlockKind::Branch);
    let then_exit = build_stmts(b, Some(then_id), body, ctx);

    let (else_id, else_exit) = if orelse.is_empty() {
        (None, None)
    } else {
        let id = b.new_block(BlockKind::Branch);
        let exit = build_stmts(b, Some(id), orelse, ctx);
        (Some(id), exit)
    };

    let merge = b.new_block(BlockKind::Merge);
    let false_target = else_id.unwrap_or(merge);
    let entry = wire_cond_plan(b, &plan, then_id, false_target);
    link_if_open(b, current, entry);

    if let Some(frame) = ctx.try_stack.last_mut() {
        if cond_raises(test) {
            // The test block itself (the first allocated block of the plan) is
            // the one whose evaluation may raise; everything past it is a
            // successful-evaluation continuation.
            frame.pending_raises.push(entry);
        }
    }

    if let Some(t) = then_exit {
        b.push_successor(t, merge);
    }
    if !orelse.is_empty() {
        if let Some(e) = else_exit {
            b.push_successor(e, merge);
        }
    }

    let merge_reachable = then_exit.is_some() || orelse.is_empty() || else_exit.is_some();
    merge_reachable.then_some(merge)
}

fn build_while(
    b: &mut Builder,
    current: Option<usize>,
    test: &Expr,
    body: &[Stmt],
    orelse: &[Stmt],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    let plan = alloc_cond_plan(b, test);
    let entry = first_block_of(&plan);
    link_if_open(b, current, entry);

    let body_id = b.new_block(BlockKind::Loop);
    ctx.loop_stack.push(LoopFrame {
        continue_target: entry,
        pending_breaks: Vec::new(),
        try_stack_depth: ctx.try_stack.len(),
    });
    let body_exit = build_stmts(b, Some(body_id), body, ctx);
    let frame = ctx.loop_stack.pop().unwrap();

    let loop_else_id = if orelse.is_empty() { None } else { Some(b.new_block(BlockKind::Branch)) };
    let loop_else_exit = match loop_else_id {
        Some(id) => build_stmts(b, Some(id), orelse, ctx),
        None => None,
    };

    let after = b.new_block(BlockKind::Plain);
    let false_target = loop_else_id.unwrap_or(after);
    wire_cond_plan(b, &plan, body_id, false_target);

    if let Some(owner) = ctx.try_stack.last_mut() {
        if cond_raises(test) {
            owner.pending_raises.push(entry);
        }
    }

    if let Some(exit) = body_exit {
        b.push_successor(exit, entry);
    }
    if let Some(exit) = loop_else_exit {
        b.push_successor(exit, after);
    }
    for src in frame.pending_breaks {
        b.push_successor(src, after);
    }

    Some(after)
}

fn first_block_of(plan: &CondPlan) -> usize {
    match plan {
        CondPlan::Leaf(id) => *id,
        CondPlan::BoolOp { operands, .. } => first_block_of(&operands[0]),
    }
}

fn build_for(
    b: &mut Builder,
    current: Option<usize>,
    target: &Expr,
    iter: &Expr,
    body: &[Stmt],
    orelse: &[Stmt],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    let header = b.new_block(BlockKind::Head);
    b.push_stmt(header, format!("for:{} in {}", dump_expr(target), dump_expr(iter)));
    link_if_open(b, current, header);
    if let Some(frame) = ctx.try_stack.last_mut() {
        if iter.may_raise() {
            frame.pending_raises.push(header);
        }
    }

    let body_id = b.new_block(BlockKind::Loop);
    ctx.loop_stack.push(LoopFrame {
        continue_target: header,
        pending_breaks: Vec::new(),
        try_stack_depth: ctx.try_stack.len(),
    });
    let body_exit = build_stmts(b, Some(body_id), body, ctx);
    let frame = ctx.loop_stack.pop().unwrap();

    let loop_else_id = if orelse.is_empty() { None } else { Some(b.new_block(BlockKind::Branch)) };
    let loop_else_exit = match loop_else_id {
        Some(id) => build_stmts(b, Some(id), orelse, ctx),
        None => None,
    };

    let after = b.new_block(BlockKind::Plain);
    let false_target = loop_else_id.unwrap_or(after);
    b.set_successors(header, vec![body_id, false_target]);

    if let Some(exit) = body_exit {
        b.push_successor(exit, header);
    }
    if let (Some(_), Some(exit)) = (loop_else_id, loop_else_exit) {
        b.push_successor(exit, after);
    }
    for src in frame.pending_breaks {
        b.push_successor(src, after);
    }

    Some(after)
}

fn build_try(
    b: &mut Builder,
    current: Option<usize>,
    body: &[Stmt],
    handlers: &[ExceptHandler],
    orelse: &[Stmt],
    finalbody: &[Stmt],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    let body_id = b.new_block(BlockKind::Branch);
    link_if_open(b, current, body_id);

    // Reserved ahead of the body so a return/raise/break/continue inside it
    // can route through this finally before its own statements are known.
    let finally_id = if finalbody.is_empty() {
        None
    } else {
        Some(b.new_block(BlockKind::Branch))
    };

    ctx.try_stack.push(TryFrame {
        pending_raises: Vec::new(),
        finally_id,
        pending_exits: Vec::new(),
    });
    let body_exit = build_stmts(b, Some(body_id), body, ctx);
    let frame = ctx.try_stack.pop().unwrap();

    // Normal completion (no exception) runs the `else` clause, if any.
    let (normal_exit, else_entry) = if orelse.is_empty() {
        (body_exit, None)
    } else {
        let id = b.new_block(BlockKind::Branch);
        let exit = build_stmts(b, Some(id), orelse, ctx);
        (exit, Some(id))
    };
    if let (Some(be), Some(ee)) = (body_exit, else_entry) {
        b.push_successor(be, ee);
    }

    // Handler chain: each test's match edge enters its body, its no-match
    // edge falls through to the next handler's test, and the last handler's
    // no-match edge (and the try-body's unhandled-raise target) leads to
    // `finally` if present, otherwise escapes the graph unmodeled.
    let handler_entries: Vec<(usize, usize, Option<usize>)> = handlers
        .iter()
        .map(|h| {
            let test_id = b.new_block(BlockKind::Head);
            if let Some(test) = &h.test {
                b.push_stmt(test_id, format!("except:{}", dump_expr(test)));
            } else {
                b.push_stmt(test_id, "except:*".to_string());
            }
            let body_id = b.new_block(BlockKind::Branch);
            let exit = build_stmts(b, Some(body_id), &h.body, ctx);
            (test_id, body_id, exit)
        })
        .collect();

    let after = b.new_block(BlockKind::Plain);
    let finally_exit = finally_id.and_then(|id| build_stmts(b, Some(id), finalbody, ctx));
    let convergence = finally_id.unwrap_or(after);

    for (i, (test_id, body_id, _)) in handler_entries.iter().enumerate() {
        let no_match = handler_entries
            .get(i + 1)
            .map(|(next_test, _, _)| *next_test)
            .unwrap_or(convergence);
        b.set_successors(*test_id, vec![*body_id, no_match]);
    }
    for (_, _, exit) in &handler_entries {
        if let Some(e) = exit {
            b.push_successor(*e, convergence);
        }
    }
    if let Some(ne) = normal_exit {
        b.push_successor(ne, convergence);
    }
    if let Some(exit) = finally_exit {
        b.push_successor(exit, after);
        // Returns/raises/breaks/continues that detoured into this finally
        // now continue toward their real destination (or the next
        // enclosing try's finally, found the same way they were).
        for (boundary, kind) in frame.pending_exits {
            route_exit(b, ctx, exit, boundary, kind);
        }
    }

    if let Some((first_test, _, _)) = handler_entries.first() {
        for src in frame.pending_raises {
            b.push_successor(src, *first_test);
        }
    }

    Some(after)
}

fn build_with(
    b: &mut Builder,
    current: Option<usize>,
    items: &[Expr],
    body: &[Stmt],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    let id = open_block(b, current);
    for item in items {
        b.push_stmt(id, format!("with:{}", dump_expr(item)));
    }
    if let Some(frame) = ctx.try_stack.last_mut() {
        if items.iter().any(Expr::may_raise) {
            frame.pending_raises.push(id);
        }
    }
    let body_exit = build_stmts(b, Some(id), body, ctx);
    let after = b.new_block(BlockKind::Plain);
    if let Some(exit) = body_exit {
        b.push_successor(exit, after);
    }
    Some(after)
}

fn build_match(
    b: &mut Builder,
    current: Option<usize>,
    subject: &Expr,
    cases: &[MatchCase],
    ctx: &mut BuildCtx,
) -> Option<usize> {
    let first_test = b.new_block(BlockKind::Head);
    b.push_stmt(first_test, format!("match:{}", dump_expr(subject)));
    link_if_open(b, current, first_test);
    if let Some(frame) = ctx.try_stack.last_mut() {
        if subject.may_raise() {
            frame.pending_raises.push(first_test);
        }
    }

    let after = {
        let mut test_ids = vec![first_test];
        for _ in 1..cases.len() {
            test_ids.push(b.new_block(BlockKind::Head));
        }
        let mut body_exits = Vec::with_capacity(cases.len());
        for (i, case) in cases.iter().enumerate() {
            b.push_stmt(test_ids[i], format!("case:{}", case.pattern_kind));
            let body_id = b.new_block(BlockKind::Branch);
            let exit = build_stmts(b, Some(body_id), &case.body, ctx);
            body_exits.push((body_id, exit));
        }
        let after = b.new_block(BlockKind::Plain);
        for (i, test_id) in test_ids.iter().enumerate() {
            let (body_id, _) = body_exits[i];
            let fallthrough = test_ids.get(i + 1).copied().unwrap_or(after);
            b.set_successors(*test_id, vec![body_id, fallthrough]);
        }
        for (_, exit) in body_exits {
            if let Some(e) = exit {
                b.push_successor(e, after);
            }
        }
        after
    };

    Some(after)
}
