//! Command-line entry point (§6, §7): wires `scan` -> `parser` ->
//! `normalizer` -> `fingerprint` -> `grouping` -> `baseline`/`cache` ->
//! `report` into one run, and owns the exit-code contract.
//!
//! `clap::Parser` for argument parsing and `tracing_subscriber` for logging
//! setup; the worker pool is `rayon` rather than an async runtime, since
//! fingerprinting a tree of files is CPU-bound batch work, not I/O-bound
//! async work (see `DESIGN.md`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use rayon::prelude::*;
use tracing::{error, warn};

use baseline::BaselineStatus;
use cache::CachedFile;
use common::{SkipReason, Unit};
use fingerprint::FingerprintConfig;
use grouping::GroupingConfig;
use parser::ParserHost;
use report::ReportInput;
use scan::DiscoveredFile;

/// Source files larger than this are skipped as `too_large` regardless of
/// `--max-cache-size-mb`/`--max-baseline-size-mb`, which bound the *contract
/// files*, not the Python sources being analyzed.
const MAX_SOURCE_FILE_BYTES: u64 = 5 * 1024 * 1024;

const MB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "codeclone",
    about = "Find structurally duplicate Python functions by comparing control-flow shapes, not text."
)]
struct Cli {
    /// Python project root to analyze.
    root: PathBuf,

    /// Minimum function length (lines) to be considered in a clone group.
    #[arg(long, default_value_t = 15)]
    min_loc: u32,
    /// Minimum top-level statement count to be considered in a clone group.
    #[arg(long, default_value_t = 6)]
    min_stmt: u32,
    /// Worker thread count for parsing/fingerprinting.
    #[arg(long, default_value_t = 4)]
    processes: usize,

    /// Path to a persistent per-file fingerprint cache.
    #[arg(long)]
    cache_path: Option<PathBuf>,
    #[arg(long, default_value_t = 50)]
    max_cache_size_mb: u64,

    /// Path to a baseline of previously-accepted clone groups.
    #[arg(long)]
    baseline: Option<PathBuf>,
    #[arg(long, default_value_t = 5)]
    max_baseline_size_mb: u64,
    /// Overwrite the baseline with the current run's clone groups.
    #[arg(long)]
    update_baseline: bool,

    /// Fail (exit 3) if any new clone group appears beyond the baseline.
    #[arg(long)]
    fail_on_new: bool,
    /// New-group count tolerated before `--fail-on-new`/`--ci` trips.
    #[arg(long, default_value_t = 0)]
    fail_threshold: u32,
    /// CI mode: implies gating, and promotes normally-recoverable source/
    /// baseline trust problems into contract errors (exit 2) instead of warnings.
    #[arg(long)]
    ci: bool,

    /// Write the report as HTML to this path (must end in `.html`).
    #[arg(long)]
    html: Option<PathBuf>,
    /// Write the report as JSON to this path (must end in `.json`).
    #[arg(long)]
    json: Option<PathBuf>,
    /// Write the report as plain text to this path (must end in `.txt`).
    #[arg(long)]
    text: Option<PathBuf>,

    #[arg(long)]
    no_progress: bool,
    #[arg(long)]
    no_color: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Contract(String),
    #[error("{0}")]
    Internal(String),
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    let debug = cli.debug || std::env::var("CODECLONE_DEBUG").is_ok();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(&cli)));
    match outcome {
        Ok(Ok(true)) => process::exit(0),
        Ok(Ok(false)) => process::exit(3),
        Ok(Err(CliError::Contract(msg))) => {
            error!("{msg}");
            process::exit(2);
        }
        Ok(Err(CliError::Internal(msg))) => {
            report_internal(&msg, debug);
            process::exit(5);
        }
        Err(panic) => {
            report_internal(&panic_message(&panic), debug);
            process::exit(5);
        }
    }
}

fn report_internal(msg: &str, debug: bool) {
    println!("INTERNAL ERROR: {msg}");
    if debug {
        eprintln!("debug: {msg}");
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `--ci` is "`--fail-on-new --no-color --quiet`" (§6): callers that read
/// `cli.quiet`/`cli.no_color` directly would miss the implied half of that
/// bundle, so every read site goes through these instead.
fn effective_quiet(cli: &Cli) -> bool {
    cli.quiet || cli.ci
}

fn effective_no_color(cli: &Cli) -> bool {
    cli.no_color || cli.ci
}

fn init_logging(cli: &Cli) {
    let debug_env = std::env::var("CODECLONE_DEBUG").is_ok();
    let level = if cli.debug || debug_env {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if effective_quiet(cli) {
        "error"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!effective_no_color(cli))
        .with_target(false)
        .try_init();
}

/// Returns `true` on a passing gate (exit 0), `false` on a gating failure
/// (exit 3). Any `Err` takes priority over both: a contract error always
/// exits 2, even if a gating failure was also detected in the same run.
fn run(cli: &Cli) -> Result<bool, CliError> {
    validate_extension(&cli.html, "html")?;
    validate_extension(&cli.json, "json")?;
    validate_extension(&cli.text, "txt")?;

    let files = scan::discover(&cli.root)
        .map_err(|e| CliError::Contract(format!("failed to scan {}: {e}", cli.root.display())))?;

    let cache_payload = cli.cache_path.as_ref().map(|p| {
        let load = cache::load_cache_file(p, cli.max_cache_size_mb * MB);
        tracing::debug!(status = ?load.status, "cache load");
        load.payload
    }).flatten();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.processes.max(1))
        .build()
        .map_err(|e| CliError::Internal(format!("failed to start worker pool: {e}")))?;

    let fp_config = FingerprintConfig { min_stmt_for_windows: cli.min_stmt, ..Default::default() };
    let analyzed: Vec<(DiscoveredFile, FileResult)> = pool.install(|| {
        files
            .par_iter()
            .map(|file| {
                let cached = cache_payload.as_ref().and_then(|p| cache::lookup(p, &file.wire_path, file.stat));
                (file.clone(), analyze_file(file, cached, &fp_config))
            })
            .collect()
    });

    let mut all_units: Vec<Unit> = Vec::new();
    let mut cache_files: BTreeMap<String, CachedFile> = BTreeMap::new();
    let mut contract_error: Option<String> = None;
    let mut files_skipped_source_io: u32 = 0;
    let mut files_skipped_parse: u32 = 0;

    for (file, result) in analyzed {
        match result {
            FileResult::Units(units) => {
                cache_files.insert(file.wire_path.clone(), CachedFile::from_units(file.stat, units.clone()));
                all_units.extend(units);
            }
            FileResult::Skipped(reason) => {
                warn!(file = %file.wire_path, %reason, "skipping file");
                files_skipped_source_io += 1;
                if cli.ci {
                    contract_error.get_or_insert_with(|| format!("source read error: {} ({reason})", file.wire_path));
                }
            }
            FileResult::ParseFailed => {
                warn!(file = %file.wire_path, "parse failed, skipping file");
                files_skipped_parse += 1;
            }
        }
    }

    if let Some(path) = &cli.cache_path {
        let doc = cache::build_cache(cache_files);
        cache::write_cache_atomic(path, &doc).map_err(|e| CliError::Contract(format!("failed to write cache: {e}")))?;
    }

    let block_windows: Vec<common::BlockWindow> = all_units.iter().flat_map(|u| u.blocks.iter().cloned()).collect();
    let segment_windows: Vec<common::SegmentWindow> = all_units.iter().flat_map(|u| u.segments.iter().cloned()).collect();

    let grouping_config = GroupingConfig { min_loc: cli.min_loc, min_stmt: cli.min_stmt };
    let function_groups = grouping::group_functions(&all_units, &grouping_config);
    let block_groups = grouping::group_blocks(&block_windows, &grouping_config);
    let segment_groups = grouping::group_segments(&segment_windows);

    let mut baseline_status_str = "missing";
    let mut trusted_baseline = None;
    if let Some(baseline_path) = &cli.baseline {
        let load = baseline::load_baseline_file(baseline_path, cli.max_baseline_size_mb * MB, common::FINGERPRINT_VERSION, common::PYTHON_TAG);
        baseline_status_str = load.status.as_str();
        if load.status.is_trusted() {
            trusted_baseline = load.baseline;
        } else if load.status != BaselineStatus::Missing {
            if cli.ci {
                contract_error.get_or_insert_with(|| format!("baseline untrusted: {}", load.status.as_str()));
            } else {
                warn!(status = load.status.as_str(), "baseline untrusted, diffing against an empty baseline");
            }
        }
    }

    let function_keys: Vec<String> = function_groups.iter().map(|g| g.key.clone()).collect();
    let block_keys: Vec<String> = block_groups.iter().map(|g| g.key.clone()).collect();
    let diff = baseline::diff(&function_keys, &block_keys, trusted_baseline.as_ref());

    if cli.update_baseline {
        let path = cli
            .baseline
            .as_ref()
            .ok_or_else(|| CliError::Contract("--update-baseline requires --baseline <path>".to_string()))?;
        let new_baseline = baseline::build_baseline(&function_keys, &block_keys);
        baseline::write_baseline_atomic(path, &new_baseline)
            .map_err(|e| CliError::Contract(format!("failed to write baseline: {e}")))?;
    }

    let report_doc = report::build_report(&ReportInput {
        function_groups: &function_groups,
        block_groups: &block_groups,
        segment_groups: &segment_groups,
        diff: Some(&diff),
        baseline_status: baseline_status_str,
        total_files_scanned: files.len() as u32,
        total_functions_scanned: all_units.len() as u32,
        files_skipped_source_io,
        files_skipped_parse,
    });

    write_outputs(cli, &report_doc)?;

    if let Some(msg) = contract_error {
        return Err(CliError::Contract(msg));
    }

    let gating_active = cli.fail_on_new || cli.ci;
    let new_total = (report_doc.groups_split.functions.new.len() + report_doc.groups_split.blocks.new.len()) as u32;
    Ok(!gating_active || new_total <= cli.fail_threshold)
}

enum FileResult {
    Units(Vec<Unit>),
    Skipped(SkipReason),
    ParseFailed,
}

fn analyze_file(file: &DiscoveredFile, cached: Option<&CachedFile>, fp_config: &FingerprintConfig) -> FileResult {
    if let Some(c) = cached {
        return FileResult::Units(c.u.clone());
    }
    let bytes = match scan::read_bounded(&file.absolute_path, MAX_SOURCE_FILE_BYTES) {
        Ok(b) => b,
        Err(reason) => return FileResult::Skipped(reason),
    };
    let mut host = match ParserHost::new() {
        Ok(h) => h,
        Err(_) => return FileResult::ParseFailed,
    };
    let functions = match host.dissect(&bytes) {
        Ok(f) => f,
        Err(_) => return FileResult::ParseFailed,
    };
    let absolute_path = file.absolute_path.to_string_lossy().into_owned();
    let units = functions
        .into_iter()
        .map(normalizer::normalize_function)
        .map(|f| fingerprint::fingerprint_function(&f, &absolute_path, fp_config))
        .collect();
    FileResult::Units(units)
}

fn validate_extension(path: &Option<PathBuf>, ext: &str) -> Result<(), CliError> {
    if let Some(p) = path {
        if p.extension().and_then(|e| e.to_str()) != Some(ext) {
            return Err(CliError::Contract(format!("{} must end in .{ext}", p.display())));
        }
    }
    Ok(())
}

fn write_outputs(cli: &Cli, report_doc: &report::Report) -> Result<(), CliError> {
    let mut wrote_any = false;
    if let Some(path) = &cli.json {
        let json = report::to_pretty_json(report_doc).map_err(|e| CliError::Internal(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| CliError::Contract(format!("failed to write {}: {e}", path.display())))?;
        wrote_any = true;
    }
    if let Some(path) = &cli.text {
        std::fs::write(path, text_summary(report_doc)).map_err(|e| CliError::Contract(format!("failed to write {}: {e}", path.display())))?;
        wrote_any = true;
    }
    if let Some(path) = &cli.html {
        let json = report::to_pretty_json(report_doc).map_err(|e| CliError::Internal(e.to_string()))?;
        let html = format!("<!doctype html><html><head><meta charset=\"utf-8\"><title>codeclone report</title></head><body><pre>{}</pre></body></html>", html_escape(&json));
        std::fs::write(path, html).map_err(|e| CliError::Contract(format!("failed to write {}: {e}", path.display())))?;
        wrote_any = true;
    }
    if !wrote_any && !effective_quiet(cli) {
        let json = report::to_pretty_json(report_doc).map_err(|e| CliError::Internal(e.to_string()))?;
        println!("{json}");
    }
    Ok(())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn text_summary(report_doc: &report::Report) -> String {
    let mut out = String::new();
    out.push_str(&format!("codeclone {}\n", report_doc.meta.generator.version));
    out.push_str(&format!("baseline: {}\n", report_doc.meta.baseline_status));
    out.push_str(&format!("files analyzed: {}\n", report_doc.files.len()));
    out.push_str(&format!(
        "function clone groups: {} ({} new, {} known)\n",
        report_doc.groups.functions.len(),
        report_doc.groups_split.functions.new.len(),
        report_doc.groups_split.functions.known.len()
    ));
    out.push_str(&format!(
        "block clone groups: {} ({} new, {} known)\n",
        report_doc.groups.blocks.len(),
        report_doc.groups_split.blocks.new.len(),
        report_doc.groups_split.blocks.known.len()
    ));
    out.push_str(&format!("segment groups (report-only): {}\n", report_doc.groups.segments.len()));
    out
}
