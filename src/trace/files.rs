//! Locating one session's files in a pulled output directory.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// The symbol files and ordered data segments for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    pub base: String,
    pub threads: PathBuf,
    pub methods: PathBuf,
    pub fields: PathBuf,
    /// `<base>data_<N>.bin`, ascending by N
    pub segments: Vec<PathBuf>,
}

impl SessionFiles {
    /// Scan `dir` for files named `<base>...`.
    ///
    /// Fails when any of the three symbol files is missing. A session with no
    /// data segments is valid (the process exited before its first flush).
    pub fn discover(dir: &Path, base: &str) -> anyhow::Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read session directory {}", dir.display()))?;

        let mut segments: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name.strip_prefix(base) else {
                log::debug!("Ignoring {name}: not part of session {base}");
                continue;
            };
            if let Some(index) = segment_index(rest) {
                segments.push((index, entry.path()));
            } else if !matches!(rest, "info_t.log" | "info_m.log" | "info_f.log") {
                log::debug!("Ignoring {name}: unrecognized session file");
            }
        }
        segments.sort();

        let files = Self {
            base: base.to_string(),
            threads: dir.join(format!("{base}info_t.log")),
            methods: dir.join(format!("{base}info_m.log")),
            fields: dir.join(format!("{base}info_f.log")),
            segments: segments.into_iter().map(|(_, path)| path).collect(),
        };

        for path in [&files.threads, &files.methods, &files.fields] {
            anyhow::ensure!(path.is_file(), "Missing symbol file {}", path.display());
        }

        Ok(files)
    }
}

/// Session bases in `dir`, one per `<base>info_t.log`, sorted.
pub fn find_bases(dir: &Path) -> anyhow::Result<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read session directory {}", dir.display()))?;
    let mut bases = Vec::new();
    for entry in entries {
        let name = entry?.file_name();
        if let Some(base) = name.to_str().and_then(|n| n.strip_suffix("info_t.log")) {
            bases.push(base.to_string());
        }
    }
    bases.sort();
    Ok(bases)
}

/// Session base of a segment file name: `mt_0_data_3.bin` -> `mt_0_`.
pub fn segment_base(file_name: &str) -> Option<&str> {
    let at = file_name.rfind("data_")?;
    segment_index(&file_name[at..])?;
    Some(&file_name[..at])
}

/// `N` from `data_N.bin`.
fn segment_index(name: &str) -> Option<u64> {
    name.strip_prefix("data_")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}
