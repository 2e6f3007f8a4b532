//! Archive discovery: map a job's output directory to its ordered list of
//! archive files.
//!
//! The capture subprocess writes an [`ArchiveState`] descriptor listing the
//! attempt directories it used. Files are returned attempt by attempt in
//! descriptor order, and lexically by relative path within an attempt. A
//! missing or unreadable descriptor falls back to the most recently modified
//! attempt directory.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

/// File name of the descriptor inside a job's output directory.
pub const STATE_FILE: &str = "archive_state.json";

const ARCHIVE_GLOBS: &[&str] = &["**/*.warc", "**/*.warc.gz"];

/// Descriptor written by the capture subprocess. Read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveState {
    /// Attempt directories in attempt order, relative to the output
    /// directory or absolute.
    pub attempt_dirs: Vec<PathBuf>,
    /// Whether the capture considers itself finished.
    #[serde(default)]
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub files: Vec<PathBuf>,
    /// True when the descriptor was unusable and the newest attempt
    /// directory was scanned instead.
    pub used_fallback: bool,
    pub complete: Option<bool>,
}

pub fn read_state(output_dir: &Path) -> Result<ArchiveState> {
    let content = std::fs::read_to_string(output_dir.join(STATE_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

/// Resolve the archive files for a job.
///
/// Errors only when the output directory itself cannot be read.
pub fn discover(output_dir: &Path) -> io::Result<Discovery> {
    // Surface mount and permission problems before anything else
    std::fs::read_dir(output_dir)?;

    let globs = build_globset(ARCHIVE_GLOBS).map_err(io::Error::other)?;

    match read_state(output_dir) {
        Ok(state) => {
            let mut seen = HashSet::new();
            let mut files = Vec::new();
            for dir in &state.attempt_dirs {
                let dir = if dir.is_absolute() {
                    dir.clone()
                } else {
                    output_dir.join(dir)
                };
                if !seen.insert(dir.clone()) {
                    continue;
                }
                if !dir.is_dir() {
                    warn!(attempt_dir = %dir.display(), "attempt directory listed in archive state is missing");
                    continue;
                }
                files.extend(scan_attempt(&dir, &globs)?);
            }
            Ok(Discovery {
                files,
                used_fallback: false,
                complete: Some(state.complete),
            })
        }
        Err(e) => {
            let dir = newest_attempt_dir(output_dir)?.unwrap_or_else(|| output_dir.to_path_buf());
            warn!(
                output_dir = %output_dir.display(),
                fallback_dir = %dir.display(),
                error = %e,
                "archive state unusable, falling back to most recently modified attempt directory"
            );
            Ok(Discovery {
                files: scan_attempt(&dir, &globs)?,
                used_fallback: true,
                complete: None,
            })
        }
    }
}

fn scan_attempt(dir: &Path, globs: &GlobSet) -> io::Result<Vec<PathBuf>> {
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if globs.is_match(&rel_str) {
            found.push((rel_str, path.to_path_buf()));
        }
    }

    // Lexical order within an attempt
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn newest_attempt_dir(output_dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let path = entry.path();
        let replace = match &newest {
            None => true,
            // Ties break on name so the choice is repeatable
            Some((t, p)) => modified > *t || (modified == *t && path > *p),
        };
        if replace {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}
