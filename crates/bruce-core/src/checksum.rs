use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::config::{ProjectLayout, TrackingConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub checksum: String,
    pub size: u64,
    /// Present only for recognized text extensions.
    pub line_count: Option<usize>,
}

pub type Snapshot = BTreeMap<PathBuf, FileSnapshot>;

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub files: Snapshot,
    /// Files or directories that could not be read. The scan continues past them.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanDiff {
    pub created: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }
}

/// Walks a bounded set of roots and hashes every file with a monitored extension.
#[derive(Debug, Clone)]
pub struct FileChecksumScanner {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    text_extensions: Vec<String>,
    ignore: Vec<String>,
    excluded: Vec<PathBuf>,
}

impl FileChecksumScanner {
    pub fn new(roots: Vec<PathBuf>, extensions: &[String]) -> Self {
        Self {
            roots,
            extensions: normalize_extensions(extensions),
            text_extensions: Vec::new(),
            ignore: Vec::new(),
            excluded: Vec::new(),
        }
    }

    /// Scanner for a project: monitored dirs from `tracking`, with the session storage
    /// directory excluded so session bookkeeping never shows up as a change.
    pub fn for_project(layout: &ProjectLayout, tracking: &TrackingConfig) -> Self {
        Self::new(layout.monitored_roots(tracking), &tracking.extensions)
            .with_text_extensions(&tracking.text_extensions)
            .with_ignore(&tracking.ignore)
            .exclude(layout.sessions_dir.clone())
    }

    pub fn with_text_extensions(mut self, extensions: &[String]) -> Self {
        self.text_extensions = normalize_extensions(extensions);
        self
    }

    pub fn with_ignore(mut self, names: &[String]) -> Self {
        self.ignore = names.to_vec();
        self
    }

    pub fn exclude(mut self, path: PathBuf) -> Self {
        self.excluded.push(path);
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_text_file(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.text_extensions.iter().any(|known| *known == ext))
            .unwrap_or(false)
    }

    pub fn scan(&self) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        for root in &self.roots {
            if !root.is_dir() {
                continue;
            }
            let walker = WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| !self.is_skipped(entry));
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        outcome.errors.push(err.to_string());
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !self.matches_extension(entry.path()) {
                    continue;
                }
                match self.snapshot_file(entry.path()) {
                    Ok(snapshot) => {
                        outcome.files.insert(entry.path().to_path_buf(), snapshot);
                    }
                    Err(err) => outcome
                        .errors
                        .push(format!("{}: {}", entry.path().display(), err)),
                }
            }
        }
        tracing::debug!(
            files = outcome.files.len(),
            errors = outcome.errors.len(),
            "checksum scan"
        );
        outcome
    }

    fn snapshot_file(&self, path: &Path) -> Result<FileSnapshot, std::io::Error> {
        let bytes = fs::read(path)?;
        let line_count = if self.is_text_file(path) {
            Some(count_lines(&bytes))
        } else {
            None
        };
        Ok(FileSnapshot {
            checksum: hash_bytes(&bytes),
            size: bytes.len() as u64,
            line_count,
        })
    }

    fn is_skipped(&self, entry: &DirEntry) -> bool {
        if self.excluded.iter().any(|path| entry.path().starts_with(path)) {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        self.ignore.iter().any(|ignored| name == ignored.as_str())
    }

    fn matches_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        extension_of(path)
            .map(|ext| self.extensions.iter().any(|known| *known == ext))
            .unwrap_or(false)
    }
}

/// Compares two snapshots. Each list is in path order.
pub fn diff_snapshots(baseline: &Snapshot, current: &Snapshot) -> ScanDiff {
    let mut diff = ScanDiff::default();
    for (path, snapshot) in current {
        match baseline.get(path) {
            None => diff.created.push(path.clone()),
            Some(previous) if previous.checksum != snapshot.checksum => {
                diff.modified.push(path.clone())
            }
            Some(_) => {}
        }
    }
    for path in baseline.keys() {
        if !current.contains_key(path) {
            diff.deleted.push(path.clone());
        }
    }
    diff
}

/// Returns `(added, removed)` from the line counts of two snapshots of one file.
pub fn line_delta(before: Option<&FileSnapshot>, after: Option<&FileSnapshot>) -> (usize, usize) {
    let before = before.and_then(|snap| snap.line_count).unwrap_or(0);
    let after = after.and_then(|snap| snap.line_count).unwrap_or(0);
    if after >= before {
        (after - before, 0)
    } else {
        (0, before - after)
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("{:x}", digest)
}

fn count_lines(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    if bytes.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}
