//! Groups fingerprinted units/windows into clone groups and applies the
//! noise filters that keep the report from drowning in trivial matches
//! (§4.4).
//!
//! Filtering follows a fixed ordered sequence of stages, each a pure
//! `Vec -> Vec` transform over the previous stage's output, so each noise
//! filter can be reasoned about and tested independently of the others.

use std::collections::{BTreeMap, BTreeSet};

use common::{BlockWindow, SegmentWindow, Unit};

#[derive(Debug, Clone, Copy)]
pub struct GroupingConfig {
    pub min_loc: u32,
    pub min_stmt: u32,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self { min_loc: 15, min_stmt: 6 }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionGroup {
    pub key: String,
    pub members: Vec<Unit>,
}

#[derive(Debug, Clone)]
pub struct BlockGroup {
    pub key: String,
    pub members: Vec<BlockWindow>,
}

#[derive(Debug, Clone)]
pub struct SegmentGroup {
    pub key: String,
    pub members: Vec<SegmentWindow>,
}

fn member_sort_key(file_path: &str, start_line: u32, qualified_name: &str) -> (String, u32, String) {
    (file_path.to_string(), start_line, qualified_name.to_string())
}

/// Groups units by `(fingerprint, loc_bucket)`. Units below the tuning
/// thresholds never enter a group at all: a function too small to be an
/// interesting clone shouldn't count toward another function's group size
/// either.
pub fn group_functions(units: &[Unit], config: &GroupingConfig) -> Vec<FunctionGroup> {
    let mut by_key: BTreeMap<String, Vec<Unit>> = BTreeMap::new();
    for u in units {
        if u.loc >= config.min_loc && u.stmt_count >= config.min_stmt {
            by_key.entry(u.group_key()).or_default().push(u.clone());
        }
    }
    by_key
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(key, mut members)| {
            members.sort_by_key(|u| member_sort_key(&u.file_path, u.start_line, &u.qualified_name));
            FunctionGroup { key, members }
        })
        .collect()
}

fn is_constructor(qualified_name: &str) -> bool {
    qualified_name.rsplit('.').next() == Some("__init__")
}

/// Groups block windows by hash and applies the ordered noise filters:
/// reject single-function groups (repetition inside one function is a
/// segment concern, not a cross-site clone), reject groups overlapping an
/// already-accepted block group at the same site (the same repeated region
/// otherwise surfaces once per sliding-window offset), reject any group
/// touching a constructor, and enforce the minimum span length.
pub fn group_blocks(windows: &[BlockWindow], config: &GroupingConfig) -> Vec<BlockGroup> {
    let mut by_hash: BTreeMap<String, Vec<BlockWindow>> = BTreeMap::new();
    for w in windows {
        by_hash.entry(w.block_hash.clone()).or_default().push(w.clone());
    }

    let mut candidates: Vec<(String, Vec<BlockWindow>)> =
        by_hash.into_iter().filter(|(_, m)| m.len() >= 2).collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    candidates.retain(|(_, members)| {
        let first = (members[0].file_path.as_str(), members[0].qualified_name.as_str());
        !members
            .iter()
            .all(|m| (m.file_path.as_str(), m.qualified_name.as_str()) == first)
    });

    candidates.retain(|(_, members)| !members.iter().any(|m| is_constructor(&m.qualified_name)));

    candidates.retain(|(_, members)| {
        members
            .iter()
            .all(|m| m.end_line.saturating_sub(m.start_line) + 1 >= config.min_loc)
    });

    let mut claimed: BTreeMap<(String, String), Vec<(u32, u32)>> = BTreeMap::new();
    let mut out = Vec::new();
    for (key, mut members) in candidates {
        let overlaps_claimed = members.iter().any(|m| {
            claimed
                .get(&(m.file_path.clone(), m.qualified_name.clone()))
                .is_some_and(|ranges| ranges.iter().any(|&(s, e)| m.start_line <= e && s <= m.end_line))
        });
        if overlaps_claimed {
            continue;
        }
        for m in &members {
            claimed
                .entry((m.file_path.clone(), m.qualified_name.clone()))
                .or_default()
                .push((m.start_line, m.end_line));
        }
        members.sort_by_key(|m| member_sort_key(&m.file_path, m.start_line, &m.qualified_name));
        out.push(BlockGroup { key, members });
    }
    out
}

/// Segment grouping is report-only (§4.4): it never feeds the baseline or
/// gating decision, only the human-facing report. Candidate clusters form on
/// `segment_sig` (order-insensitive, so `a=1; b=2` and `b=2; a=1` land in the
/// same cluster), then each cluster is split into strictly-confirmed groups
/// by `segment_hash` (order-sensitive). Overlapping windows from the same
/// function are merged to one maximal span so a genuinely-repeated block
/// doesn't produce one entry per sliding-window offset, and a group of pure
/// boilerplate (one statement kind, no control flow) is dropped.
pub fn group_segments(windows: &[SegmentWindow]) -> Vec<SegmentGroup> {
    let mut by_sig: BTreeMap<String, Vec<SegmentWindow>> = BTreeMap::new();
    for w in windows {
        by_sig.entry(w.segment_sig.clone()).or_default().push(w.clone());
    }

    let mut out = Vec::new();
    for (_, candidates) in by_sig {
        if candidates.len() < 2 {
            continue;
        }
        let mut by_hash: BTreeMap<String, Vec<SegmentWindow>> = BTreeMap::new();
        for w in candidates {
            by_hash.entry(w.segment_hash.clone()).or_default().push(w);
        }
        for (hash, members) in by_hash {
            if members.len() < 2 {
                continue;
            }
            let merged = merge_same_function_overlaps(members);
            if merged.len() < 2 || !passes_boilerplate_filter(&merged) {
                continue;
            }
            out.push(SegmentGroup { key: hash, members: merged });
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

fn merge_same_function_overlaps(mut members: Vec<SegmentWindow>) -> Vec<SegmentWindow> {
    members.sort_by_key(|m| member_sort_key(&m.file_path, m.start_line, &m.qualified_name));
    let mut out: Vec<SegmentWindow> = Vec::new();
    for m in members {
        if let Some(last) = out.last_mut() {
            let same_site = last.file_path == m.file_path && last.qualified_name == m.qualified_name;
            if same_site && m.start_line <= last.end_line {
                last.start_line = last.start_line.min(m.start_line);
                last.end_line = last.end_line.max(m.end_line);
                continue;
            }
        }
        out.push(m);
    }
    out.sort_by_key(|m| member_sort_key(&m.file_path, m.start_line, &m.qualified_name));
    out
}

fn passes_boilerplate_filter(members: &[SegmentWindow]) -> bool {
    let exemplar = &members[0];
    let unique_kinds: BTreeSet<&String> = exemplar.stmt_kinds.iter().collect();
    unique_kinds.len() >= 2 || exemplar.has_control_flow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(file: &str, name: &str, start: u32, fp: &str, loc: u32, stmt_count: u32) -> Unit {
        Unit {
            qualified_name: name.into(),
            file_path: file.into(),
            start_line: start,
            end_line: start + loc - 1,
            loc,
            stmt_count,
            fingerprint: fp.into(),
            loc_bucket: loc / common::LOC_BUCKET_SIZE,
            blocks: vec![],
            segments: vec![],
        }
    }

    #[test]
    fn function_groups_require_at_least_two_members() {
        let units = vec![unit("a.py", "f", 1, "hash1", 20, 8)];
        let groups = group_functions(&units, &GroupingConfig::default());
        assert!(groups.is_empty());
    }

    #[test]
    fn function_groups_below_threshold_are_excluded() {
        let units = vec![
            unit("a.py", "f", 1, "hash1", 3, 2),
            unit("b.py", "g", 1, "hash1", 3, 2),
        ];
        let groups = group_functions(&units, &GroupingConfig::default());
        assert!(groups.is_empty());
    }

    #[test]
    fn function_group_members_sorted_by_file_then_line_then_name() {
        let units = vec![
            unit("b.py", "z", 5, "hash1", 20, 8),
            unit("a.py", "y", 10, "hash1", 20, 8),
            unit("a.py", "x", 2, "hash1", 20, 8),
        ];
        let groups = group_functions(&units, &GroupingConfig::default());
        assert_eq!(groups.len(), 1);
        let names: Vec<&str> = groups[0].members.iter().map(|u| u.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
    }

    fn window(file: &str, name: &str, start: u32, end: u32, hash: &str) -> BlockWindow {
        BlockWindow {
            block_hash: hash.into(),
            qualified_name: name.into(),
            file_path: file.into(),
            start_line: start,
            end_line: end,
            stmt_kinds: vec!["assign".into(); 4],
        }
    }

    #[test]
    fn block_group_rejected_when_all_members_in_same_function() {
        let windows = vec![
            window("a.py", "f", 1, 4, "h1"),
            window("a.py", "f", 10, 13, "h1"),
        ];
        let groups = group_blocks(&windows, &GroupingConfig { min_loc: 1, min_stmt: 1 });
        assert!(groups.is_empty());
    }

    #[test]
    fn block_group_kept_across_different_functions() {
        let windows = vec![window("a.py", "f", 1, 4, "h1"), window("b.py", "g", 1, 4, "h1")];
        let groups = group_blocks(&windows, &GroupingConfig { min_loc: 1, min_stmt: 1 });
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn block_group_rejected_when_member_is_in_a_constructor() {
        let windows = vec![
            window("a.py", "C.__init__", 1, 4, "h1"),
            window("b.py", "g", 1, 4, "h1"),
        ];
        let groups = group_blocks(&windows, &GroupingConfig { min_loc: 1, min_stmt: 1 });
        assert!(groups.is_empty());
    }

    #[test]
    fn overlapping_block_group_at_claimed_site_is_rejected() {
        let windows = vec![
            window("a.py", "f", 1, 4, "h1"),
            window("b.py", "g", 1, 4, "h1"),
            window("a.py", "f", 2, 5, "h2"),
            window("c.py", "k", 2, 5, "h2"),
        ];
        let groups = group_blocks(&windows, &GroupingConfig { min_loc: 1, min_stmt: 1 });
        assert_eq!(groups.len(), 1, "second group overlaps the first at a.py::f");
        assert_eq!(groups[0].key, "h1");
    }

    fn segment(file: &str, name: &str, start: u32, end: u32, hash: &str, sig: &str, kinds: &[&str], cf: bool) -> SegmentWindow {
        SegmentWindow {
            segment_hash: hash.into(),
            segment_sig: sig.into(),
            qualified_name: name.into(),
            file_path: file.into(),
            start_line: start,
            end_line: end,
            stmt_kinds: kinds.iter().map(|s| s.to_string()).collect(),
            has_control_flow: cf,
        }
    }

    #[test]
    fn segment_group_requires_matching_hash_not_just_matching_sig() {
        let windows = vec![
            segment("a.py", "f", 1, 2, "hashA", "sig1", &["assign", "return"], false),
            segment("b.py", "g", 1, 2, "hashB", "sig1", &["assign", "return"], false),
        ];
        assert!(group_segments(&windows).is_empty());
    }

    #[test]
    fn segment_group_suppressed_for_pure_boilerplate() {
        let windows = vec![
            segment("a.py", "f", 1, 2, "hashA", "sig1", &["assign", "assign"], false),
            segment("b.py", "g", 1, 2, "hashA", "sig1", &["assign", "assign"], false),
        ];
        assert!(group_segments(&windows).is_empty());
    }

    #[test]
    fn segment_group_kept_with_control_flow_even_if_one_stmt_kind() {
        let windows = vec![
            segment("a.py", "f", 1, 2, "hashA", "sig1", &["if", "if"], true),
            segment("b.py", "g", 1, 2, "hashA", "sig1", &["if", "if"], true),
        ];
        assert_eq!(group_segments(&windows).len(), 1);
    }

    #[test]
    fn overlapping_same_function_segments_merge_to_maximal_span() {
        let windows = vec![
            segment("a.py", "f", 1, 3, "hashA", "sig1", &["assign", "return"], false),
            segment("a.py", "f", 2, 4, "hashA", "sig1", &["assign", "return"], false),
            segment("b.py", "g", 1, 3, "hashA", "sig1", &["assign", "return"], false),
        ];
        let groups = group_segments(&windows);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 2, "the two overlapping a.py::f windows merge into one");
        let merged = groups[0].members.iter().find(|m| m.file_path == "a.py").unwrap();
        assert_eq!((merged.start_line, merged.end_line), (1, 4));
    }
}
