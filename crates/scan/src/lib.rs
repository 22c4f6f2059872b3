//! Stat/IO layer: deterministic source-tree traversal and size-bounded reads.
//!
//! This is the leaf of the dependency graph (§2): it knows nothing about
//! Python, ASTs, or fingerprints. It hands the rest of the pipeline a sorted
//! list of `.py` files with their stat signatures, and a single entry point
//! for reading a file's bytes under a size ceiling.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use common::{SkipReason, StatSignature};
use walkdir::WalkDir;

/// Directory segments that are never descended into, regardless of depth.
///
/// Covers VCS/tooling caches (never source) and the policy blocklist for
/// "obviously sensitive" system paths a misconfigured `root` might include.
const EXCLUDED_DIR_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".venv",
    "venv",
    "node_modules",
    "target",
    ".cache",
    "proc",
    "sys",
    "dev",
];

/// Errors from the traversal step. Per-file read failures are not part of
/// this enum; they are represented as `SkipReason` and attributed to the
/// specific file, since one bad file must never abort the whole scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("scan root is not a UTF-8 path: {0}")]
    NonUtf8Root(PathBuf),
}

/// A file discovered during traversal, not yet read.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Absolute, canonicalized path on disk.
    pub absolute_path: PathBuf,
    /// Path relative to the scan root, forward-slash separated. Used as the
    /// cache key and as the file identity in reports.
    pub wire_path: String,
    pub stat: StatSignature,
}

/// Walks `root` and returns every `.py` file reachable without crossing a
/// symlink boundary out of `root`, sorted lexicographically by `wire_path`.
///
/// Sorting here, rather than leaving it to a later stage, is what makes
/// "reorder files on disk, get a byte-identical report" hold: nothing
/// downstream may depend on directory-entry order.
pub fn discover(root: &Path) -> Result<Vec<DiscoveredFile>, ScanError> {
    let root_abs = dunce::canonicalize(root)?;

    let mut out = Vec::new();
    for entry in WalkDir::new(&root_abs)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_excluded_dir(e.path()))
    {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }

        // Symlink containment: canonicalize and verify the real path is still
        // under root. Resolution failures (dangling symlink) are silently skipped.
        let canonical = match dunce::canonicalize(path) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if !canonical.starts_with(&root_abs) {
            continue;
        }

        let relative = match canonical.strip_prefix(&root_abs) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let wire_path = match relative.to_str() {
            Some(s) => s.replace('\\', "/"),
            None => continue,
        };

        let metadata = match fs::metadata(&canonical) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);

        out.push(DiscoveredFile {
            absolute_path: canonical,
            wire_path,
            stat: StatSignature {
                mtime_ns,
                size_bytes: metadata.len(),
            },
        });
    }

    out.sort_by(|a, b| a.wire_path.cmp(&b.wire_path));
    tracing::debug!(count = out.len(), root = %root_abs.display(), "discovered source files");
    Ok(out)
}

fn is_excluded_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| EXCLUDED_DIR_NAMES.contains(&n))
        .unwrap_or(false)
}

/// Reads a file's contents, enforcing the maximum file size before reading.
///
/// Checking size via `metadata` first, rather than reading then discarding,
/// avoids paying I/O cost for files the caller will skip anyway.
pub fn read_bounded(path: &Path, max_size_bytes: u64) -> Result<Vec<u8>, SkipReason> {
    let metadata = fs::metadata(path).map_err(|_| SkipReason::SourceIo)?;
    if metadata.len() > max_size_bytes {
        tracing::warn!(path = %path.display(), size = metadata.len(), max_size_bytes, "file exceeds size ceiling, skipping");
        return Err(SkipReason::TooLarge);
    }
    fs::read(path).map_err(|_| SkipReason::SourceIo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("codeclone_scan_{name}"));
        let _ = fs::remove_dir_all(&p);
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn discovers_py_files_sorted() {
        let root = tmp("sorted");
        fs::write(root.join("b.py"), "x = 1\n").unwrap();
        fs::write(root.join("a.py"), "y = 2\n").unwrap();
        fs::write(root.join("c.txt"), "not python\n").unwrap();

        let files = discover(&root).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.wire_path.as_str()).collect();
        assert_eq!(names, vec!["a.py", "b.py"]);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn excludes_pycache_and_venv() {
        let root = tmp("excluded");
        fs::create_dir_all(root.join("__pycache__")).unwrap();
        fs::write(root.join("__pycache__/x.py"), "z = 1\n").unwrap();
        fs::create_dir_all(root.join("venv/lib")).unwrap();
        fs::write(root.join("venv/lib/y.py"), "z = 1\n").unwrap();
        fs::write(root.join("real.py"), "z = 1\n").unwrap();

        let files = discover(&root).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.wire_path.as_str()).collect();
        assert_eq!(names, vec!["real.py"]);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn read_bounded_rejects_oversize() {
        let root = tmp("oversize");
        let path = root.join("big.py");
        fs::write(&path, "x = 1\n").unwrap();

        let err = read_bounded(&path, 2).unwrap_err();
        assert_eq!(err, SkipReason::TooLarge);

        let ok = read_bounded(&path, 1024).unwrap();
        assert_eq!(ok, b"x = 1\n");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn read_bounded_missing_file_is_source_io() {
        let root = tmp("missing");
        let err = read_bounded(&root.join("nope.py"), 1024).unwrap_err();
        assert_eq!(err, SkipReason::SourceIo);
        fs::remove_dir_all(&root).ok();
    }
}
