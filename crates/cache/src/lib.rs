//! Per-file fingerprint cache: skip re-fingerprinting a file whose stat
//! signature hasn't changed since the last run (§4.6).
//!
//! Unlike `baseline`, every failure mode here is fail-open by design: a
//! cache is a pure optimization, never a correctness input, so nothing
//! about it is ever allowed to abort a run or flip a gating decision. The
//! signature check follows the same "recompute the canonical hash, compare,
//! distrust on mismatch" shape as `baseline::load_baseline_bytes`, swapping
//! HMAC-SHA256 for plain SHA-256 since a cache is local, mutable state that
//! should detect accidental corruption or a stale/foreign file, not serve as
//! a baseline-grade integrity boundary.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use common::{canonical_json_string, BlockWindow, SegmentWindow, StatSignature, Unit};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed application key for the cache's tamper-evidence signature. The
/// cache is local, non-secret state: this isn't a secrecy boundary, just a
/// way to detect hand-edited or foreign-tool-written cache files the same
/// way a checksum would, without adding a second hashing primitive.
const CACHE_HMAC_KEY: &[u8] = b"codeclone-cache-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFile {
    pub st: StatSignature,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub u: Vec<Unit>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub b: Vec<BlockWindow>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub s: Vec<SegmentWindow>,
}

impl CachedFile {
    pub fn from_units(stat: StatSignature, units: Vec<Unit>) -> Self {
        let b = units.iter().flat_map(|u| u.blocks.iter().cloned()).collect();
        let s = units.iter().flat_map(|u| u.segments.iter().cloned()).collect();
        Self { st: stat, u: units, b, s }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePayload {
    pub py: String,
    pub fp: u32,
    pub files: BTreeMap<String, CachedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDoc {
    pub v: u32,
    pub payload: CachePayload,
    pub sig: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Ok,
    Missing,
    TooLarge,
    InvalidJson,
    InvalidType,
    MissingFields,
    MismatchSchemaVersion,
    MismatchFingerprintVersion,
    MismatchPythonVersion,
    SignatureInvalid,
}

pub struct CacheLoad {
    pub status: CacheStatus,
    pub payload: Option<CachePayload>,
}

impl CacheLoad {
    fn untrusted(status: CacheStatus) -> Self {
        Self { status, payload: None }
    }
}

fn sign_payload(payload: &CachePayload) -> String {
    let canonical = canonical_json_string(payload).expect("payload always serializes");
    let mut mac = HmacSha256::new_from_slice(CACHE_HMAC_KEY).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn build_cache(files: BTreeMap<String, CachedFile>) -> CacheDoc {
    let payload = CachePayload {
        py: common::PYTHON_TAG.to_string(),
        fp: common::FINGERPRINT_VERSION,
        files,
    };
    let sig = sign_payload(&payload);
    CacheDoc { v: common::CACHE_SCHEMA_VERSION, payload, sig }
}

/// Every failure here returns `Missing`/an untrusted status and `None`.
/// Callers are expected to treat any non-`Ok` status identically: proceed
/// as if there were no cache at all. The status is kept for logging only.
pub fn load_cache_file(path: &Path, max_size_bytes: u64) -> CacheLoad {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return CacheLoad::untrusted(CacheStatus::Missing),
    };
    if metadata.len() > max_size_bytes {
        return CacheLoad::untrusted(CacheStatus::TooLarge);
    }
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return CacheLoad::untrusted(CacheStatus::Missing),
    };
    load_cache_bytes(&bytes)
}

pub fn load_cache_bytes(bytes: &[u8]) -> CacheLoad {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(_) => return CacheLoad::untrusted(CacheStatus::InvalidJson),
    };
    let obj = match value.as_object() {
        Some(o) => o,
        None => return CacheLoad::untrusted(CacheStatus::InvalidType),
    };
    if !obj.contains_key("v") || !obj.contains_key("payload") || !obj.contains_key("sig") {
        return CacheLoad::untrusted(CacheStatus::MissingFields);
    }
    let doc: CacheDoc = match serde_json::from_value(value) {
        Ok(d) => d,
        Err(_) => return CacheLoad::untrusted(CacheStatus::InvalidType),
    };
    if doc.v != common::CACHE_SCHEMA_VERSION {
        return CacheLoad::untrusted(CacheStatus::MismatchSchemaVersion);
    }
    if doc.payload.fp != common::FINGERPRINT_VERSION {
        return CacheLoad::untrusted(CacheStatus::MismatchFingerprintVersion);
    }
    if doc.payload.py != common::PYTHON_TAG {
        return CacheLoad::untrusted(CacheStatus::MismatchPythonVersion);
    }
    let expected = sign_payload(&doc.payload);
    if !common::constant_time_eq(expected.as_bytes(), doc.sig.as_bytes()) {
        return CacheLoad::untrusted(CacheStatus::SignatureInvalid);
    }
    CacheLoad { status: CacheStatus::Ok, payload: Some(doc.payload) }
}

/// Looks up a file's cached units, but only if the stat signature on record
/// matches exactly. A mismatch invalidates that one file's entry; it never
/// invalidates the rest of the cache.
pub fn lookup<'a>(payload: &'a CachePayload, wire_path: &str, stat: StatSignature) -> Option<&'a CachedFile> {
    payload.files.get(wire_path).filter(|f| f.st == stat)
}

#[derive(Debug, thiserror::Error)]
pub enum CacheWriteError {
    #[error("I/O error writing cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn write_cache_atomic(path: &Path, doc: &CacheDoc) -> Result<(), CacheWriteError> {
    let json = serde_json::to_string(doc)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_files() -> BTreeMap<String, CachedFile> {
        let mut files = BTreeMap::new();
        files.insert(
            "a.py".to_string(),
            CachedFile::from_units(
                StatSignature { mtime_ns: 100, size_bytes: 50 },
                vec![Unit {
                    qualified_name: "f".into(),
                    file_path: "a.py".into(),
                    start_line: 1,
                    end_line: 2,
                    loc: 2,
                    stmt_count: 1,
                    fingerprint: "abc".into(),
                    loc_bucket: 0,
                    blocks: vec![],
                    segments: vec![],
                }],
            ),
        );
        files
    }

    #[test]
    fn round_trips_as_ok() {
        let doc = build_cache(sample_files());
        let json = serde_json::to_vec(&doc).unwrap();
        let loaded = load_cache_bytes(&json);
        assert_eq!(loaded.status, CacheStatus::Ok);
        assert!(loaded.payload.is_some());
    }

    #[test]
    fn tampered_payload_fails_signature_and_is_fail_open() {
        let doc = build_cache(sample_files());
        let mut value: serde_json::Value = serde_json::to_value(&doc).unwrap();
        value["payload"]["fp"] = serde_json::json!(common::FINGERPRINT_VERSION);
        value["payload"]["files"]["a.py"]["st"]["size_bytes"] = serde_json::json!(9999);
        let loaded = load_cache_bytes(value.to_string().as_bytes());
        assert_eq!(loaded.status, CacheStatus::SignatureInvalid);
        assert!(loaded.payload.is_none());
    }

    #[test]
    fn fingerprint_version_mismatch_is_fail_open() {
        let doc = build_cache(sample_files());
        let mut value: serde_json::Value = serde_json::to_value(&doc).unwrap();
        value["payload"]["fp"] = serde_json::json!(common::FINGERPRINT_VERSION + 1);
        let loaded = load_cache_bytes(value.to_string().as_bytes());
        assert_eq!(loaded.status, CacheStatus::MismatchFingerprintVersion);
    }

    #[test]
    fn garbage_bytes_are_fail_open() {
        let loaded = load_cache_bytes(b"not json");
        assert_eq!(loaded.status, CacheStatus::InvalidJson);
        assert!(loaded.payload.is_none());
    }

    #[test]
    fn lookup_requires_exact_stat_match() {
        let doc = build_cache(sample_files());
        let matching = StatSignature { mtime_ns: 100, size_bytes: 50 };
        let stale = StatSignature { mtime_ns: 200, size_bytes: 50 };
        assert!(lookup(&doc.payload, "a.py", matching).is_some());
        assert!(lookup(&doc.payload, "a.py", stale).is_none());
    }

    #[test]
    fn lookup_missing_wire_path_is_none() {
        let doc = build_cache(sample_files());
        assert!(lookup(&doc.payload, "b.py", StatSignature { mtime_ns: 1, size_bytes: 1 }).is_none());
    }

    #[test]
    fn empty_block_and_segment_arrays_are_omitted_from_json() {
        let doc = build_cache(sample_files());
        let json = serde_json::to_string(&doc).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let entry = &value["payload"]["files"]["a.py"];
        assert!(entry.get("b").is_none());
        assert!(entry.get("s").is_none());
    }
}
