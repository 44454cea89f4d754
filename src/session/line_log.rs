//! Journal of every trace-server line seen during one run.
//!
//! Kept in memory and written out as JSONL (`server-lines.jsonl`) when the run
//! is cleaned up, so a protocol failure can be read against the exact line
//! sequence that produced it.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::device::LineSource;

/// File name of the journal inside the run's output directory.
pub const LINE_LOG_FILE: &str = "server-lines.jsonl";

/// Maximum stored line length.
const MAX_LINE_LENGTH: usize = 2000;

#[derive(Debug, Clone)]
pub struct LineEntry {
    pub ts: DateTime<Utc>,
    pub source: LineSource,
    pub kind: &'static str,
    pub line: String,
}

#[derive(Debug, Default)]
pub struct LineLog {
    entries: Vec<LineEntry>,
}

impl LineLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, source: LineSource, kind: &'static str, line: &str) {
        self.entries.push(LineEntry {
            ts: Utc::now(),
            source,
            kind,
            line: truncate_line(line),
        });
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Print the whole history through the logger at `level`.
    pub fn dump(&self, reason: &str, level: log::Level) {
        log::log!(
            level,
            "Server line history ({} lines, {reason}):",
            self.entries.len()
        );
        for entry in &self.entries {
            log::log!(
                level,
                "  {} [{}] {}",
                entry.ts.format("%H:%M:%S%.3f"),
                entry.source,
                entry.line
            );
        }
    }

    /// Write the history as JSONL to `path`, replacing any previous file.
    pub fn write_jsonl(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for entry in &self.entries {
            let json = serde_json::json!({
                "ts": entry.ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "source": entry.source.to_string(),
                "kind": entry.kind,
                "line": entry.line,
            });
            writeln!(out, "{json}")?;
        }
        out.flush()
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Truncate to `MAX_LINE_LENGTH` characters, appending `…` if truncated.
fn truncate_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_LENGTH) {
        Some((byte_idx, _)) => {
            let mut s = line[..byte_idx].to_string();
            s.push('…');
            s
        }
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_multibyte() {
        let long = "é".repeat(MAX_LINE_LENGTH + 10);
        let truncated = truncate_line(&long);
        assert_eq!(truncated.chars().count(), MAX_LINE_LENGTH + 1);
        assert!(truncated.ends_with('…'));
        assert_eq!(truncate_line("short"), "short");
    }

    #[test]
    fn test_write_jsonl() {
        let mut log = LineLog::new();
        log.record(LineSource::Stdout, "server-ready", "Server with uid 10080");
        log.record(LineSource::Stderr, "informational", "say \"hi\"");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join(LINE_LOG_FILE);
        log.write_jsonl(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "server-ready");
        assert_eq!(lines[0]["source"], "stdout");
        assert_eq!(lines[1]["line"], "say \"hi\"");
        assert!(lines[1]["ts"].as_str().unwrap().ends_with('Z'));
    }
}
