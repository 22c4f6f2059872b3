//! Deterministic JSON report assembly (§4.7).
//!
//! Every ordering decision here exists to make "run twice on an unchanged
//! tree, get byte-identical output" hold: `canonical_json_string` (shared
//! with `baseline`/`cache`) sorts object keys, and everything that isn't
//! already a `BTreeMap` is sorted explicitly before being written into the
//! report.

use std::collections::BTreeMap;

use baseline::BaselineDiff;
use common::canonical_json_string;
use grouping::{BlockGroup, FunctionGroup, SegmentGroup};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Generator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    pub generator: Generator,
    pub created_at: String,
    pub fingerprint_version: u32,
    pub python_tag: String,
    pub baseline_status: String,
    pub skip_counts: SkipCounts,
}

/// Per-reason counts of files that never made it into the analyzed set,
/// surfaced so a consumer can tell "zero duplicates" from "zero files read".
#[derive(Debug, Clone, Default, Serialize)]
pub struct SkipCounts {
    pub source_io: u32,
    pub parse_failure: u32,
}

/// Declares, per section, the field names positional items are encoded in.
/// The items themselves are plain tuples (serialized as JSON arrays) rather
/// than objects, so a large report doesn't repeat four field names per
/// clone instance; this struct is the one place that schema is spelled out.
#[derive(Debug, Clone, Serialize)]
pub struct GroupItemLayout {
    pub functions: [&'static str; 4],
    pub blocks: [&'static str; 4],
    pub segments: [&'static str; 4],
}

impl Default for GroupItemLayout {
    fn default() -> Self {
        Self {
            functions: ["file_index", "qualified_name", "start_line", "end_line"],
            blocks: ["file_index", "qualified_name", "start_line", "end_line"],
            segments: ["file_index", "qualified_name", "start_line", "end_line"],
        }
    }
}

pub type Item = (u32, String, u32, u32);

#[derive(Debug, Clone, Default, Serialize)]
pub struct Groups {
    pub functions: BTreeMap<String, Vec<Item>>,
    pub blocks: BTreeMap<String, Vec<Item>>,
    pub segments: BTreeMap<String, Vec<Item>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SplitKeys {
    pub new: Vec<String>,
    pub known: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupsSplit {
    pub functions: SplitKeys,
    pub blocks: SplitKeys,
    pub segments: SplitKeys,
}

#[derive(Debug, Clone, Serialize)]
pub struct Facts {
    pub total_files: u32,
    pub total_functions: u32,
    pub function_groups: u32,
    pub block_groups: u32,
    pub segment_groups: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub meta: ReportMeta,
    pub files: Vec<String>,
    pub group_item_layout: GroupItemLayout,
    pub groups: Groups,
    pub groups_split: GroupsSplit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<Facts>,
}

/// Inputs needed to assemble one report. `baseline_trusted` gates whether
/// `groups_split` is computed from an actual diff or collapses to
/// "everything is new". Segments are always "everything is new" regardless,
/// since they're never part of a baseline.
pub struct ReportInput<'a> {
    pub function_groups: &'a [FunctionGroup],
    pub block_groups: &'a [BlockGroup],
    pub segment_groups: &'a [SegmentGroup],
    pub diff: Option<&'a BaselineDiff>,
    pub baseline_status: &'a str,
    pub total_files_scanned: u32,
    pub total_functions_scanned: u32,
    pub files_skipped_source_io: u32,
    pub files_skipped_parse: u32,
}

pub fn build_report(input: &ReportInput) -> Report {
    let mut file_set: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for g in input.function_groups {
        file_set.extend(g.members.iter().map(|u| u.file_path.clone()));
    }
    for g in input.block_groups {
        file_set.extend(g.members.iter().map(|b| b.file_path.clone()));
    }
    for g in input.segment_groups {
        file_set.extend(g.members.iter().map(|s| s.file_path.clone()));
    }
    let files: Vec<String> = file_set.into_iter().collect();
    let file_index: BTreeMap<&str, u32> = files.iter().enumerate().map(|(i, f)| (f.as_str(), i as u32)).collect();

    let mut groups = Groups::default();
    for g in input.function_groups {
        groups.functions.insert(g.key.clone(), items(&g.members, &file_index, |u| (&u.file_path, &u.qualified_name, u.start_line, u.end_line)));
    }
    for g in input.block_groups {
        groups.blocks.insert(g.key.clone(), items(&g.members, &file_index, |b| (&b.file_path, &b.qualified_name, b.start_line, b.end_line)));
    }
    for g in input.segment_groups {
        groups.segments.insert(g.key.clone(), items(&g.members, &file_index, |s| (&s.file_path, &s.qualified_name, s.start_line, s.end_line)));
    }

    let function_keys: Vec<String> = input.function_groups.iter().map(|g| g.key.clone()).collect();
    let functions_split = match input.diff {
        Some(diff) => split_by_presence(&function_keys, &diff.new_functions),
        None => SplitKeys { new: sorted(&function_keys), known: Vec::new() },
    };
    let block_keys: Vec<String> = input.block_groups.iter().map(|g| g.key.clone()).collect();
    let blocks_split = match input.diff {
        Some(diff) => split_by_presence(&block_keys, &diff.new_blocks),
        None => SplitKeys { new: sorted(&block_keys), known: Vec::new() },
    };
    let segment_keys: Vec<String> = input.segment_groups.iter().map(|g| g.key.clone()).collect();
    let segments_split = SplitKeys { new: sorted(&segment_keys), known: Vec::new() };

    Report {
        meta: ReportMeta {
            generator: Generator {
                name: common::GENERATOR_NAME.to_string(),
                version: common::GENERATOR_VERSION.to_string(),
            },
            created_at: chrono::Utc::now().to_rfc3339(),
            fingerprint_version: common::FINGERPRINT_VERSION,
            python_tag: common::PYTHON_TAG.to_string(),
            baseline_status: input.baseline_status.to_string(),
            skip_counts: SkipCounts {
                source_io: input.files_skipped_source_io,
                parse_failure: input.files_skipped_parse,
            },
        },
        files,
        group_item_layout: GroupItemLayout::default(),
        groups,
        groups_split: GroupsSplit { functions: functions_split, blocks: blocks_split, segments: segments_split },
        facts: Some(Facts {
            total_files: input.total_files_scanned,
            total_functions: input.total_functions_scanned,
            function_groups: input.function_groups.len() as u32,
            block_groups: input.block_groups.len() as u32,
            segment_groups: input.segment_groups.len() as u32,
        }),
    }
}

fn items<T>(members: &[T], file_index: &BTreeMap<&str, u32>, project: impl Fn(&T) -> (&str, &str, u32, u32)) -> Vec<Item> {
    let mut out: Vec<Item> = members
        .iter()
        .map(|m| {
            let (file_path, qualified_name, start_line, end_line) = project(m);
            let idx = *file_index.get(file_path).expect("file already registered");
            (idx, qualified_name.to_string(), start_line, end_line)
        })
        .collect();
    out.sort_by(|a, b| (a.0, a.1.as_str(), a.2, a.3).cmp(&(b.0, b.1.as_str(), b.2, b.3)));
    out
}

fn sorted(keys: &[String]) -> Vec<String> {
    let mut out = keys.to_vec();
    out.sort();
    out.dedup();
    out
}

fn split_by_presence(current_keys: &[String], new_keys: &[String]) -> SplitKeys {
    let new_set: std::collections::BTreeSet<&String> = new_keys.iter().collect();
    let mut new = Vec::new();
    let mut known = Vec::new();
    for key in sorted(current_keys) {
        if new_set.contains(&key) {
            new.push(key);
        } else {
            known.push(key);
        }
    }
    SplitKeys { new, known }
}

/// Human/tool-facing serialization: sorted keys (structs already enforce
/// field order; maps are `BTreeMap`) and pretty-printed for `--json`/`--html`
/// consumers.
pub fn to_pretty_json(report: &Report) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// Canonical minimized form, for when a report's bytes are themselves an
/// input to a hash (e.g. CI caching the report artifact itself).
pub fn to_canonical_json(report: &Report) -> Result<String, serde_json::Error> {
    canonical_json_string(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BlockWindow, SegmentWindow, Unit};

    fn unit(file: &str, name: &str, start: u32) -> Unit {
        Unit {
            qualified_name: name.into(),
            file_path: file.into(),
            start_line: start,
            end_line: start + 4,
            loc: 5,
            stmt_count: 3,
            fingerprint: "fp1".into(),
            loc_bucket: 0,
            blocks: vec![],
            segments: vec![],
        }
    }

    #[test]
    fn files_are_sorted_and_unique() {
        let fg = FunctionGroup { key: "fp1|0".into(), members: vec![unit("b.py", "g", 1), unit("a.py", "f", 1), unit("a.py", "h", 1)] };
        let report = build_report(&ReportInput {
            function_groups: &[fg],
            block_groups: &[],
            segment_groups: &[],
            diff: None,
            baseline_status: "missing",
            total_files_scanned: 2,
            total_functions_scanned: 3,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        assert_eq!(report.files, vec!["a.py".to_string(), "b.py".to_string()]);
    }

    #[test]
    fn items_sorted_by_file_index_then_name_then_lines() {
        let fg = FunctionGroup { key: "fp1|0".into(), members: vec![unit("a.py", "z", 10), unit("a.py", "a", 1)] };
        let report = build_report(&ReportInput {
            function_groups: &[fg],
            block_groups: &[],
            segment_groups: &[],
            diff: None,
            baseline_status: "missing",
            total_files_scanned: 1,
            total_functions_scanned: 2,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        let items = &report.groups.functions["fp1|0"];
        assert_eq!(items[0].1, "a");
        assert_eq!(items[1].1, "z");
    }

    #[test]
    fn untrusted_baseline_puts_everything_in_new() {
        let fg = FunctionGroup { key: "fp1|0".into(), members: vec![unit("a.py", "f", 1), unit("a.py", "g", 1)] };
        let report = build_report(&ReportInput {
            function_groups: &[fg],
            block_groups: &[],
            segment_groups: &[],
            diff: None,
            baseline_status: "missing",
            total_files_scanned: 1,
            total_functions_scanned: 2,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        assert_eq!(report.groups_split.functions.new, vec!["fp1|0".to_string()]);
        assert!(report.groups_split.functions.known.is_empty());
    }

    #[test]
    fn trusted_baseline_splits_known_from_new() {
        let fg_known = FunctionGroup { key: "fp1|0".into(), members: vec![unit("a.py", "f", 1), unit("a.py", "g", 1)] };
        let fg_new = FunctionGroup { key: "fp2|0".into(), members: vec![unit("b.py", "h", 1), unit("b.py", "i", 1)] };
        let diff = BaselineDiff { new_functions: vec!["fp2|0".to_string()], new_blocks: vec![] };
        let report = build_report(&ReportInput {
            function_groups: &[fg_known, fg_new],
            block_groups: &[],
            segment_groups: &[],
            diff: Some(&diff),
            baseline_status: "ok",
            total_files_scanned: 2,
            total_functions_scanned: 4,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        assert_eq!(report.groups_split.functions.new, vec!["fp2|0".to_string()]);
        assert_eq!(report.groups_split.functions.known, vec!["fp1|0".to_string()]);
    }

    #[test]
    fn segments_are_always_all_new() {
        let sw = SegmentWindow {
            segment_hash: "sh1".into(),
            segment_sig: "sig1".into(),
            qualified_name: "f".into(),
            file_path: "a.py".into(),
            start_line: 1,
            end_line: 4,
            stmt_kinds: vec!["assign".into()],
            has_control_flow: false,
        };
        let sg = SegmentGroup { key: "sh1".into(), members: vec![sw.clone(), sw] };
        let diff = BaselineDiff { new_functions: vec![], new_blocks: vec![] };
        let report = build_report(&ReportInput {
            function_groups: &[],
            block_groups: &[],
            segment_groups: &[sg],
            diff: Some(&diff),
            baseline_status: "ok",
            total_files_scanned: 1,
            total_functions_scanned: 1,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        assert_eq!(report.groups_split.segments.new, vec!["sh1".to_string()]);
        assert!(report.groups_split.segments.known.is_empty());
    }

    #[test]
    fn canonical_json_has_no_insignificant_whitespace() {
        let fg = FunctionGroup { key: "fp1|0".into(), members: vec![unit("a.py", "f", 1), unit("a.py", "g", 1)] };
        let report = build_report(&ReportInput {
            function_groups: &[fg],
            block_groups: &[],
            segment_groups: &[],
            diff: None,
            baseline_status: "missing",
            total_files_scanned: 1,
            total_functions_scanned: 2,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        let s = to_canonical_json(&report).unwrap();
        assert!(!s.contains('\n'));
    }

    #[test]
    fn block_group_items_use_block_window_fields() {
        let bw = BlockWindow {
            block_hash: "bh1".into(),
            qualified_name: "f".into(),
            file_path: "a.py".into(),
            start_line: 1,
            end_line: 4,
            stmt_kinds: vec!["assign".into(); 4],
        };
        let bg = BlockGroup { key: "bh1".into(), members: vec![bw.clone(), bw] };
        let report = build_report(&ReportInput {
            function_groups: &[],
            block_groups: &[bg],
            segment_groups: &[],
            diff: None,
            baseline_status: "missing",
            total_files_scanned: 1,
            total_functions_scanned: 1,
            files_skipped_source_io: 0,
            files_skipped_parse: 0,
        });
        assert_eq!(report.groups.blocks["bh1"].len(), 2);
    }

    #[test]
    fn skip_counts_flow_into_meta() {
        let report = build_report(&ReportInput {
            function_groups: &[],
            block_groups: &[],
            segment_groups: &[],
            diff: None,
            baseline_status: "missing",
            total_files_scanned: 5,
            total_functions_scanned: 0,
            files_skipped_source_io: 2,
            files_skipped_parse: 1,
        });
        assert_eq!(report.meta.skip_counts.source_io, 2);
        assert_eq!(report.meta.skip_counts.parse_failure, 1);
    }
}
