//! Turning one pulled session directory into its persisted tables.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use crate::aggregate::{AggregateOptions, Aggregation, Aggregator};
use crate::symbols::Symbols;
use crate::trace::{SessionFiles, decode_file};

/// Outcome of analyzing one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAnalysis {
    pub base: String,
    pub segments: usize,
    pub events: usize,
    /// Segments abandoned on a format or corruption error, with the reason
    pub failed_segments: Vec<(PathBuf, String)>,
    pub messages: usize,
    pub idle_snapshots: usize,
    pub unknown_methods: usize,
    pub messages_table: PathBuf,
    pub idle_table: PathBuf,
}

/// Decode every segment of session `base` in `dir` and write
/// `<base>messages.json` and `<base>idle.json` next to them.
///
/// A bad segment is logged and skipped; the events decoded before the error
/// still count. Missing or malformed symbol files fail the whole session.
pub fn analyze_session(
    dir: &Path,
    base: &str,
    options: &AggregateOptions,
) -> anyhow::Result<SessionAnalysis> {
    let files = SessionFiles::discover(dir, base)?;
    let symbols = Symbols::load_files(&files.threads, &files.methods, &files.fields)
        .with_context(|| format!("Failed to load symbols for {base}"))?;

    let mut aggregator = Aggregator::new(&symbols, options);
    let mut events = 0;
    let mut failed_segments = Vec::new();
    for segment in &files.segments {
        match decode_file(segment, &mut aggregator) {
            Ok(summary) => {
                if summary.header.is_none() {
                    log::debug!("{} has no complete header yet", segment.display());
                }
                events += summary.events;
            }
            Err(e) => {
                log::error!("Skipping rest of {}: {e}", segment.display());
                failed_segments.push((segment.clone(), e.to_string()));
            }
        }
    }

    let aggregation = aggregator.finish();
    let (messages_table, idle_table) = write_tables(dir, base, &aggregation)?;

    log::info!(
        "Analyzed {base}: {} segment(s), {events} events, {} messages, {} idle snapshots",
        files.segments.len(),
        aggregation.messages.messages.len(),
        aggregation.idle.snapshots.len()
    );

    Ok(SessionAnalysis {
        base: base.to_string(),
        segments: files.segments.len(),
        events,
        failed_segments,
        messages: aggregation.messages.messages.len(),
        idle_snapshots: aggregation.idle.snapshots.len(),
        unknown_methods: aggregation.unknown_methods,
        messages_table,
        idle_table,
    })
}

/// Write both tables for `base` into `dir`.
pub fn write_tables(
    dir: &Path,
    base: &str,
    aggregation: &Aggregation,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    let messages = dir.join(format!("{base}messages.json"));
    let idle = dir.join(format!("{base}idle.json"));
    write_json_atomic(&messages, &aggregation.messages)?;
    write_json_atomic(&idle, &aggregation.idle)?;
    Ok((messages, idle))
}

/// Atomic write via temp file + rename; readers never see a partial table.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;

    #[cfg(windows)]
    let _ = fs::remove_file(path);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("Failed to rename into {}", path.display()));
    }
    Ok(())
}
