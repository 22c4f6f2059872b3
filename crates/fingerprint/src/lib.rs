//! Canonical CFG printing, hashing, and window extraction (§4.3).
//!
//! The canonical print walks a [`cfgbuild::Cfg`] in block-id order, which is
//! already the deterministic depth-first-in-source-order the builder
//! guarantees, and hashes the result with `blake3` for an identifier-blind
//! structural digest, truncated to 160 bits since identity rather than
//! collision-resistance against an adversary is all this needs.

use cfgbuild::Cfg;
use common::{BlockWindow, SegmentWindow, Unit};
use parser::ast::FunctionAst;

/// Tunable extraction parameters; the CLI layer overrides
/// `min_stmt_for_windows` from `--min-stmt`.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintConfig {
    pub block_window: usize,
    pub segment_window: usize,
    pub min_stmt_for_windows: u32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            block_window: common::DEFAULT_BLOCK_WINDOW,
            segment_window: common::DEFAULT_BLOCK_WINDOW * 2,
            min_stmt_for_windows: 6,
        }
    }
}

/// Fingerprints one normalized function: builds its CFG, hashes the
/// canonical printing, and extracts block/segment windows over its top-level
/// statement sequence.
pub fn fingerprint_function(f: &FunctionAst, file_path: &str, config: &FingerprintConfig) -> Unit {
    let cfg = cfgbuild::build_cfg(f);
    let fingerprint = stable_hash_160(canonical_print(&cfg).as_bytes());
    let loc = f.end_line.saturating_sub(f.start_line) + 1;
    let loc_bucket = loc / common::LOC_BUCKET_SIZE;
    let stmt_count = f.body.len() as u32;

    let stmt_hashes: Vec<String> = f
        .body
        .iter()
        .map(|s| stable_hash_160(normalizer::dump_stmt(s).as_bytes()))
        .collect();
    let stmt_kinds: Vec<&'static str> = f.body.iter().map(normalizer::stmt_kind).collect();

    let blocks = extract_block_windows(f, file_path, config, &stmt_hashes, &stmt_kinds);
    let segments = extract_segment_windows(f, file_path, config, &stmt_hashes, &stmt_kinds);

    Unit {
        qualified_name: f.qualified_name.clone(),
        file_path: file_path.to_string(),
        start_line: f.start_line,
        end_line: f.end_line,
        loc,
        stmt_count,
        fingerprint,
        loc_bucket,
        blocks,
        segments,
    }
}

/// Walks blocks in id order, emitting id, kind marker, the joined statement
/// dumps, and the *sorted* successor id list, sorted here specifically for
/// canonical printing, even though [`cfgbuild::Block::successors`] preserves
/// semantic (true-branch-first) order for everything downstream that cares
/// about which edge is which.
fn canonical_print(cfg: &Cfg) -> String {
    let mut out = String::new();
    for block in &cfg.blocks {
        let mut succ = block.successors.clone();
        succ.sort_unstable();
        let succ_list = succ.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        out.push_str(&format!(
            "[{}|{}|{}|{}]",
            block.id,
            block.marker(),
            block.stmts.join(","),
            succ_list
        ));
    }
    out
}

/// Truncated `blake3` digest, hex-encoded: a stable 160-bit identity hash,
/// not a security boundary.
pub fn stable_hash_160(data: &[u8]) -> String {
    let digest = blake3::hash(data);
    hex::encode(&digest.as_bytes()[..20])
}

fn window_span(f: &FunctionAst, start: usize, end: usize) -> (u32, u32) {
    let s = f.top_level_lines.get(start).copied().unwrap_or(f.start_line);
    let e = f.top_level_lines.get(end).copied().unwrap_or(f.end_line);
    (s, e)
}

fn is_constructor(qualified_name: &str) -> bool {
    qualified_name.rsplit('.').next() == Some("__init__")
}

fn extract_block_windows(
    f: &FunctionAst,
    file_path: &str,
    config: &FingerprintConfig,
    stmt_hashes: &[String],
    stmt_kinds: &[&'static str],
) -> Vec<BlockWindow> {
    let n = f.body.len();
    if is_constructor(&f.qualified_name) || (n as u32) < config.min_stmt_for_windows || n < config.block_window {
        return Vec::new();
    }
    let mut out = Vec::new();
    for start in 0..=(n - config.block_window) {
        let end = start + config.block_window - 1;
        let block_hash = stable_hash_160(stmt_hashes[start..=end].join("|").as_bytes());
        let (start_line, end_line) = window_span(f, start, end);
        out.push(BlockWindow {
            block_hash,
            qualified_name: f.qualified_name.clone(),
            file_path: file_path.to_string(),
            start_line,
            end_line,
            stmt_kinds: stmt_kinds[start..=end].iter().map(|k| k.to_string()).collect(),
        });
    }
    out
}

fn extract_segment_windows(
    f: &FunctionAst,
    file_path: &str,
    config: &FingerprintConfig,
    stmt_hashes: &[String],
    stmt_kinds: &[&'static str],
) -> Vec<SegmentWindow> {
    let n = f.body.len();
    if n < config.segment_window {
        return Vec::new();
    }
    let mut out = Vec::new();
    for start in 0..=(n - config.segment_window) {
        let end = start + config.segment_window - 1;
        let window = &stmt_hashes[start..=end];
        let segment_hash = stable_hash_160(window.join("|").as_bytes());
        let mut sorted = window.to_vec();
        sorted.sort();
        let segment_sig = stable_hash_160(sorted.join("|").as_bytes());
        let has_control_flow = f.body[start..=end].iter().any(normalizer::is_control_flow);
        let (start_line, end_line) = window_span(f, start, end);
        out.push(SegmentWindow {
            segment_hash,
            segment_sig,
            qualified_name: f.qualified_name.clone(),
            file_path: file_path.to_string(),
            start_line,
            end_line,
            stmt_kinds: stmt_kinds[start..=end].iter().map(|k| k.to_string()).collect(),
            has_control_flow,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use normalizer::normalize_function;
    use parser::ParserHost;

    fn unit_of(src: &str, config: &FingerprintConfig) -> Unit {
        let units = ParserHost::new().unwrap().dissect(src.as_bytes()).unwrap();
        let f = normalize_function(units.into_iter().next().unwrap());
        fingerprint_function(&f, "a.py", config)
    }

    #[test]
    fn renaming_locals_does_not_change_fingerprint() {
        let cfg = FingerprintConfig::default();
        let a = unit_of("def add(x, y):\n    return x + y\n", &cfg);
        let b = unit_of("def sum_two(a, b):\n    return a + b\n", &cfg);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn different_shapes_hash_differently() {
        let cfg = FingerprintConfig::default();
        let a = unit_of("def f(x):\n    return x + 1\n", &cfg);
        let b = unit_of("def f(x):\n    if x:\n        return 1\n    return 0\n", &cfg);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn call_target_discrimination() {
        let cfg = FingerprintConfig::default();
        let load = unit_of("def f(db, id):\n    return db.load_user(id)\n", &cfg);
        let delete = unit_of("def f(db, id):\n    return db.delete_user(id)\n", &cfg);
        assert_ne!(load.fingerprint, delete.fingerprint);
    }

    #[test]
    fn loc_bucket_is_loc_div_bucket_size() {
        let cfg = FingerprintConfig::default();
        let src = "def f():\n".to_string() + &"    x = 1\n".repeat(25);
        let u = unit_of(&src, &cfg);
        assert_eq!(u.loc_bucket, u.loc / common::LOC_BUCKET_SIZE);
    }

    #[test]
    fn init_methods_never_get_block_windows() {
        let cfg = FingerprintConfig {
            block_window: 2,
            segment_window: 2,
            min_stmt_for_windows: 2,
        };
        let u = unit_of(
            "class C:\n    def __init__(self):\n        self.a = 1\n        self.b = 2\n        self.c = 3\n",
            &cfg,
        );
        assert!(u.blocks.is_empty());
    }

    #[test]
    fn short_functions_get_no_block_windows() {
        let cfg = FingerprintConfig::default();
        let u = unit_of("def f(x):\n    return x\n", &cfg);
        assert!(u.blocks.is_empty());
    }

    #[test]
    fn segment_sig_is_order_insensitive_segment_hash_is_not() {
        let cfg = FingerprintConfig {
            block_window: 2,
            segment_window: 2,
            min_stmt_for_windows: 2,
        };
        let forward = unit_of("def f():\n    a = 1\n    b = 2\n", &cfg);
        let backward = unit_of("def f():\n    b = 2\n    a = 1\n", &cfg);
        assert_eq!(forward.segments[0].segment_sig, backward.segments[0].segment_sig);
        assert_ne!(forward.segments[0].segment_hash, backward.segments[0].segment_hash);
    }

    #[test]
    fn block_window_line_span_matches_top_level_statements() {
        let cfg = FingerprintConfig {
            block_window: 2,
            segment_window: 2,
            min_stmt_for_windows: 2,
        };
        let u = unit_of("def f():\n    a = 1\n    b = 2\n    c = 3\n", &cfg);
        assert_eq!(u.blocks[0].start_line, 2);
        assert_eq!(u.blocks[0].end_line, 3);
        assert_eq!(u.blocks[1].start_line, 3);
        assert_eq!(u.blocks[1].end_line, 4);
    }
}
