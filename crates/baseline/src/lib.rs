//! Baseline contract: a signed-by-hash snapshot of known clone groups,
//! loaded, validated, and diffed against the current run (§4.5).
//!
//! The on-disk shape and validation order follow `scan::ScanError`'s pattern
//! of a closed `thiserror` enum for the things that can go wrong, but the
//! *outcome* of loading a baseline is data, not an error: an untrusted
//! baseline is a normal, expected state the caller must keep running after,
//! so it's modeled as a status enum returned alongside an `Option<Baseline>`
//! rather than a `Result` that would tempt a `?` past the distinction.

use std::fs;
use std::path::Path;

use common::canonical_json_string;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineMeta {
    pub generator: Generator,
    pub schema_version: u32,
    pub fingerprint_version: u32,
    pub python_tag: String,
    pub created_at: String,
    pub payload_sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonesSection {
    pub functions: Vec<String>,
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub meta: BaselineMeta,
    pub clones: ClonesSection,
}

/// Every terminal outcome of attempting to load and trust a baseline file.
/// Anything other than `Ok` means "proceed as if there were no baseline",
/// the caller just needs to know which message to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineStatus {
    Ok,
    Missing,
    TooLarge,
    InvalidJson,
    InvalidType,
    MissingFields,
    MismatchSchemaVersion,
    MismatchFingerprintVersion,
    MismatchPythonVersion,
    GeneratorMismatch,
    IntegrityMissing,
    IntegrityFailed,
}

impl BaselineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BaselineStatus::Ok => "ok",
            BaselineStatus::Missing => "missing",
            BaselineStatus::TooLarge => "too_large",
            BaselineStatus::InvalidJson => "invalid_json",
            BaselineStatus::InvalidType => "invalid_type",
            BaselineStatus::MissingFields => "missing_fields",
            BaselineStatus::MismatchSchemaVersion => "mismatch_schema_version",
            BaselineStatus::MismatchFingerprintVersion => "mismatch_fingerprint_version",
            BaselineStatus::MismatchPythonVersion => "mismatch_python_version",
            BaselineStatus::GeneratorMismatch => "generator_mismatch",
            BaselineStatus::IntegrityMissing => "integrity_missing",
            BaselineStatus::IntegrityFailed => "integrity_failed",
        }
    }

    pub fn is_trusted(self) -> bool {
        matches!(self, BaselineStatus::Ok)
    }
}

pub struct BaselineLoad {
    pub status: BaselineStatus,
    pub baseline: Option<Baseline>,
}

impl BaselineLoad {
    fn untrusted(status: BaselineStatus) -> Self {
        Self { status, baseline: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BaselineWriteError {
    #[error("I/O error writing baseline: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize baseline: {0}")]
    Serialize(#[from] serde_json::Error),
}

const REQUIRED_META_FIELDS: &[&str] =
    &["generator", "schema_version", "fingerprint_version", "python_tag", "created_at", "payload_sha256"];

/// Builds a fresh, self-consistent baseline from the current run's group
/// keys. Dedupes and sorts both sections, then hashes the payload before
/// anything is written.
pub fn build_baseline(functions: &[String], blocks: &[String]) -> Baseline {
    let functions = dedup_sorted(functions);
    let blocks = dedup_sorted(blocks);
    let payload_sha256 = compute_payload_hash(&functions, &blocks, common::FINGERPRINT_VERSION, common::PYTHON_TAG);
    Baseline {
        meta: BaselineMeta {
            generator: Generator {
                name: common::GENERATOR_NAME.to_string(),
                version: common::GENERATOR_VERSION.to_string(),
            },
            schema_version: common::BASELINE_SCHEMA_VERSION,
            fingerprint_version: common::FINGERPRINT_VERSION,
            python_tag: common::PYTHON_TAG.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            payload_sha256,
        },
        clones: ClonesSection { functions, blocks },
    }
}

fn dedup_sorted(keys: &[String]) -> Vec<String> {
    let mut out: Vec<String> = keys.to_vec();
    out.sort();
    out.dedup();
    out
}

/// The hash that pins a baseline to the exact clone data it claims to
/// describe. Computed over a canonical JSON encoding so key order and
/// whitespace in the on-disk file never affect it.
pub fn compute_payload_hash(functions: &[String], blocks: &[String], fingerprint_version: u32, python_tag: &str) -> String {
    #[derive(Serialize)]
    struct Payload<'a> {
        functions: &'a [String],
        blocks: &'a [String],
        fingerprint_version: u32,
        python_tag: &'a str,
    }
    let payload = Payload { functions, blocks, fingerprint_version, python_tag };
    let canonical = canonical_json_string(&payload).expect("payload always serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reads and validates a baseline file against the currently-running
/// generator's expectations. Validation runs in a fixed order with an early
/// short-circuit on the first failure: a baseline too large to reasonably
/// parse shouldn't pay the cost of a JSON decode, a baseline that doesn't
/// decode shouldn't pay the cost of shape checks, and so on.
pub fn load_baseline_file(path: &Path, max_size_bytes: u64, fingerprint_version: u32, python_tag: &str) -> BaselineLoad {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return BaselineLoad::untrusted(BaselineStatus::Missing),
    };
    if metadata.len() > max_size_bytes {
        return BaselineLoad::untrusted(BaselineStatus::TooLarge);
    }
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return BaselineLoad::untrusted(BaselineStatus::Missing),
    };
    load_baseline_bytes(&bytes, fingerprint_version, python_tag)
}

pub fn load_baseline_bytes(bytes: &[u8], fingerprint_version: u32, python_tag: &str) -> BaselineLoad {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(_) => return BaselineLoad::untrusted(BaselineStatus::InvalidJson),
    };
    let obj = match value.as_object() {
        Some(o) => o,
        None => return BaselineLoad::untrusted(BaselineStatus::InvalidType),
    };

    let (Some(meta_v), Some(clones_v)) = (obj.get("meta"), obj.get("clones")) else {
        return BaselineLoad::untrusted(BaselineStatus::MissingFields);
    };
    let meta_obj = match meta_v.as_object() {
        Some(o) => o,
        None => return BaselineLoad::untrusted(BaselineStatus::InvalidType),
    };
    for field in REQUIRED_META_FIELDS {
        if !meta_obj.contains_key(*field) {
            return BaselineLoad::untrusted(BaselineStatus::MissingFields);
        }
    }
    let generator_has_fields = meta_obj
        .get("generator")
        .and_then(|g| g.as_object())
        .map(|g| g.contains_key("name") && g.contains_key("version"))
        .unwrap_or(false);
    if !generator_has_fields {
        return BaselineLoad::untrusted(BaselineStatus::MissingFields);
    }
    let clones_obj = match clones_v.as_object() {
        Some(o) => o,
        None => return BaselineLoad::untrusted(BaselineStatus::InvalidType),
    };
    if !clones_obj.contains_key("functions") || !clones_obj.contains_key("blocks") {
        return BaselineLoad::untrusted(BaselineStatus::MissingFields);
    }

    let doc: Baseline = match serde_json::from_value(value) {
        Ok(d) => d,
        Err(_) => return BaselineLoad::untrusted(BaselineStatus::InvalidType),
    };

    if doc.meta.generator.name != common::GENERATOR_NAME {
        return BaselineLoad::untrusted(BaselineStatus::GeneratorMismatch);
    }
    if doc.meta.schema_version != common::BASELINE_SCHEMA_VERSION {
        return BaselineLoad::untrusted(BaselineStatus::MismatchSchemaVersion);
    }
    if doc.meta.fingerprint_version != fingerprint_version {
        return BaselineLoad::untrusted(BaselineStatus::MismatchFingerprintVersion);
    }
    if doc.meta.python_tag != python_tag {
        return BaselineLoad::untrusted(BaselineStatus::MismatchPythonVersion);
    }
    if doc.meta.payload_sha256.is_empty() {
        return BaselineLoad::untrusted(BaselineStatus::IntegrityMissing);
    }
    let expected = compute_payload_hash(&doc.clones.functions, &doc.clones.blocks, doc.meta.fingerprint_version, &doc.meta.python_tag);
    if !common::constant_time_eq(expected.as_bytes(), doc.meta.payload_sha256.as_bytes()) {
        return BaselineLoad::untrusted(BaselineStatus::IntegrityFailed);
    }

    BaselineLoad { status: BaselineStatus::Ok, baseline: Some(doc) }
}

/// Writes a baseline atomically: serialize, write to a sibling temp file,
/// then rename over the destination. A crash mid-write never leaves a
/// truncated or partially-written baseline in place.
pub fn write_baseline_atomic(path: &Path, baseline: &Baseline) -> Result<(), BaselineWriteError> {
    let json = serde_json::to_string_pretty(baseline)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct BaselineDiff {
    pub new_functions: Vec<String>,
    pub new_blocks: Vec<String>,
}

/// `current_keys \ baseline_keys` per section. Segments are never part of a
/// baseline and never diffed; they're report-only. Baseline keys that are
/// no longer present in the current run are dropped silently; this tool
/// flags new duplication, not removed duplication.
pub fn diff(current_functions: &[String], current_blocks: &[String], trusted: Option<&Baseline>) -> BaselineDiff {
    match trusted {
        Some(b) => BaselineDiff {
            new_functions: new_keys(current_functions, &b.clones.functions),
            new_blocks: new_keys(current_blocks, &b.clones.blocks),
        },
        None => BaselineDiff {
            new_functions: dedup_sorted(current_functions),
            new_blocks: dedup_sorted(current_blocks),
        },
    }
}

fn new_keys(current: &[String], baseline: &[String]) -> Vec<String> {
    let baseline: std::collections::BTreeSet<&String> = baseline.iter().collect();
    let mut out: Vec<String> = current.iter().filter(|k| !baseline.contains(k)).cloned().collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys() -> (Vec<String>, Vec<String>) {
        (vec!["fpA|0".to_string(), "fpB|1".to_string()], vec!["blkA".to_string()])
    }

    #[test]
    fn build_and_reload_round_trips_as_ok() {
        let (functions, blocks) = sample_keys();
        let baseline = build_baseline(&functions, &blocks);
        let json = serde_json::to_vec(&baseline).unwrap();
        let loaded = load_baseline_bytes(&json, common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::Ok);
        assert!(loaded.baseline.is_some());
    }

    #[test]
    fn legacy_top_level_layout_is_missing_fields() {
        let legacy = serde_json::json!({
            "functions": ["fpA|0"],
            "blocks": [],
        });
        let loaded = load_baseline_bytes(legacy.to_string().as_bytes(), common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::MissingFields);
    }

    #[test]
    fn garbage_json_is_invalid_json() {
        let loaded = load_baseline_bytes(b"not json at all {", common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::InvalidJson);
    }

    #[test]
    fn non_object_top_level_is_invalid_type() {
        let loaded = load_baseline_bytes(b"[1,2,3]", common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::InvalidType);
    }

    #[test]
    fn tampered_payload_fails_integrity() {
        let (functions, blocks) = sample_keys();
        let mut baseline = build_baseline(&functions, &blocks);
        baseline.clones.functions.push("fpC|9".to_string());
        let json = serde_json::to_vec(&baseline).unwrap();
        let loaded = load_baseline_bytes(&json, common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::IntegrityFailed);
    }

    #[test]
    fn fingerprint_version_mismatch_is_rejected_before_integrity_check() {
        let (functions, blocks) = sample_keys();
        let baseline = build_baseline(&functions, &blocks);
        let json = serde_json::to_vec(&baseline).unwrap();
        let loaded = load_baseline_bytes(&json, common::FINGERPRINT_VERSION + 1, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::MismatchFingerprintVersion);
    }

    #[test]
    fn python_tag_mismatch_is_rejected() {
        let (functions, blocks) = sample_keys();
        let baseline = build_baseline(&functions, &blocks);
        let json = serde_json::to_vec(&baseline).unwrap();
        let loaded = load_baseline_bytes(&json, common::FINGERPRINT_VERSION, "tspy99");
        assert_eq!(loaded.status, BaselineStatus::MismatchPythonVersion);
    }

    #[test]
    fn generator_name_mismatch_is_rejected() {
        let (functions, blocks) = sample_keys();
        let mut baseline = build_baseline(&functions, &blocks);
        baseline.meta.generator.name = "some-other-tool".to_string();
        baseline.meta.payload_sha256 =
            compute_payload_hash(&baseline.clones.functions, &baseline.clones.blocks, baseline.meta.fingerprint_version, &baseline.meta.python_tag);
        let json = serde_json::to_vec(&baseline).unwrap();
        let loaded = load_baseline_bytes(&json, common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        assert_eq!(loaded.status, BaselineStatus::GeneratorMismatch);
    }

    #[test]
    fn diff_with_no_trusted_baseline_treats_everything_as_new() {
        let (functions, blocks) = sample_keys();
        let d = diff(&functions, &blocks, None);
        assert_eq!(d.new_functions, functions);
        assert_eq!(d.new_blocks, blocks);
    }

    #[test]
    fn diff_against_trusted_baseline_excludes_known_keys() {
        let (functions, blocks) = sample_keys();
        let baseline = build_baseline(&functions, &blocks);
        let current_functions = vec!["fpA|0".to_string(), "fpC|2".to_string()];
        let d = diff(&current_functions, &blocks, Some(&baseline));
        assert_eq!(d.new_functions, vec!["fpC|2".to_string()]);
        assert!(d.new_blocks.is_empty());
    }

    #[test]
    fn removed_baseline_keys_are_not_reported_as_new() {
        let (functions, blocks) = sample_keys();
        let baseline = build_baseline(&functions, &blocks);
        let d = diff(&[], &[], Some(&baseline));
        assert!(d.new_functions.is_empty());
        assert!(d.new_blocks.is_empty());
    }
}
