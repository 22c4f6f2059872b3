//! Shared data model for the clone-detection pipeline.
//!
//! Every other crate in the workspace depends on this one for the handful of
//! cross-cutting types (units, windows, skip reasons) and for the canonical
//! JSON encoder that the baseline and cache contracts both hash.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generator tag stored in baseline metadata. Any baseline whose
/// `meta.generator.name` differs from this is rejected as a generator mismatch.
pub const GENERATOR_NAME: &str = "codeclone";

/// Current on-disk generator version (distinct from the crate's own Cargo
/// version; this is the contract version advertised to consumers).
pub const GENERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for the baseline `meta` block. Bumped only when the
/// top-level baseline shape changes in a way existing readers can't parse.
pub const BASELINE_SCHEMA_VERSION: u32 = 1;

/// Schema version for the cache top-level `v` field.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Version of the fingerprinting algorithm itself. Any change to normalization
/// rules, CFG construction, or canonical printing must bump this: baselines
/// and caches keyed on an older value are untrusted/ignored wholesale.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Opaque tag capturing the parser/runtime flavor that produced an analysis.
///
/// This implementation targets Python via `tree-sitter-python`; the tag
/// encodes that grammar's version so that a grammar upgrade (which can shift
/// node-kind ids and therefore fingerprints) invalidates old baselines.
pub const PYTHON_TAG: &str = "tspy25";

/// Default sliding-window size for block-window extraction (§4.3).
pub const DEFAULT_BLOCK_WINDOW: usize = 4;

/// LOC-bucket width: functions are classified by `loc / LOC_BUCKET_SIZE`.
pub const LOC_BUCKET_SIZE: u32 = 20;

/// Reason a source file was not analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Exceeded the configured maximum file size.
    TooLarge,
    /// I/O failure reading the file (permissions, vanished file, non-UTF-8 decode).
    SourceIo,
    /// Tree-sitter returned no tree, or the per-file parse budget was exceeded.
    ParseFailure,
    /// Path resolved (via a symlink) outside the scan root.
    OutsideRoot,
    /// Path matched the sensitive-directory blocklist.
    Blocklisted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::TooLarge => "too_large",
            SkipReason::SourceIo => "source_io",
            SkipReason::ParseFailure => "parse_failure",
            SkipReason::OutsideRoot => "outside_root",
            SkipReason::Blocklisted => "blocklisted",
        };
        f.write_str(s)
    }
}

/// `(mtime_ns, size_bytes)`: the stat signature used by the cache to decide
/// whether a file's previously-computed units can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSignature {
    pub mtime_ns: i128,
    pub size_bytes: u64,
}

/// A function or method extracted from a single file, after fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub qualified_name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub loc: u32,
    pub stmt_count: u32,
    pub fingerprint: String,
    pub loc_bucket: u32,
    pub blocks: Vec<BlockWindow>,
    pub segments: Vec<SegmentWindow>,
}

impl Unit {
    /// The function group key: `fingerprint|loc_bucket`.
    pub fn group_key(&self) -> String {
        format!("{}|{}", self.fingerprint, self.loc_bucket)
    }
}

/// A fixed-size sliding window over a function's top-level normalized
/// statements, identified by the hash of its joined statement hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub block_hash: String,
    pub qualified_name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub stmt_kinds: Vec<String>,
}

/// A larger, in-function-only window reported for repetition within a single
/// function. Carries both an order-sensitive and an order-insensitive hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentWindow {
    pub segment_hash: String,
    pub segment_sig: String,
    pub qualified_name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub stmt_kinds: Vec<String>,
    pub has_control_flow: bool,
}

/// Outcome of analyzing a single file: either a list of units, or a typed
/// skip reason. Never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileOutcome {
    Analyzed(Vec<Unit>),
    Skipped(SkipReason),
}

/// Serializes `value` as canonical JSON: UTF-8, keys sorted lexicographically
/// at every nesting level, no insignificant whitespace, numbers in their
/// shortest round-trip form.
///
/// Implemented by routing through `serde_json::Value`, whose `Map` is a
/// `BTreeMap` (as long as the `preserve_order` feature is not enabled
/// anywhere in the dependency graph) and therefore serializes with sorted
/// keys at every level for free.
pub fn canonical_json_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    serde_json::to_string(&v)
}

/// Byte-for-byte comparison that doesn't short-circuit on the first
/// mismatch, so the time spent doesn't leak how many leading bytes matched.
/// Shared by `baseline`'s payload-hash check and `cache`'s signature check,
/// the two places an integrity digest is compared against an untrusted file.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unsorted {
            z: u32,
            a: u32,
            m: u32,
        }
        let s = canonical_json_string(&Unsorted { z: 1, a: 2, m: 3 }).unwrap();
        assert_eq!(s, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn constant_time_eq_matches_ordinary_equality() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
        assert!(!constant_time_eq(b"short", b"longerstring"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn canonical_json_is_deterministic() {
        let u = Unit {
            qualified_name: "foo".into(),
            file_path: "a.py".into(),
            start_line: 1,
            end_line: 2,
            loc: 2,
            stmt_count: 1,
            fingerprint: "abc".into(),
            loc_bucket: 0,
            blocks: vec![],
            segments: vec![],
        };
        let s1 = canonical_json_string(&u).unwrap();
        let s2 = canonical_json_string(&u).unwrap();
        assert_eq!(s1, s2);
        assert!(!s1.contains(' '));
    }

    #[test]
    fn group_key_format() {
        let u = Unit {
            qualified_name: "foo".into(),
            file_path: "a.py".into(),
            start_line: 1,
            end_line: 2,
            loc: 2,
            stmt_count: 1,
            fingerprint: "abc123".into(),
            loc_bucket: 0,
            blocks: vec![],
            segments: vec![],
        };
        assert_eq!(u.group_key(), "abc123|0");
    }

    #[test]
    fn skip_reason_display() {
        assert_eq!(SkipReason::TooLarge.to_string(), "too_large");
        assert_eq!(SkipReason::ParseFailure.to_string(), "parse_failure");
    }
}
