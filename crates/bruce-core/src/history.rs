use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::hash_bytes;
use crate::clock::file_stamp;
use crate::session::{CompletedSession, Session};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to access session history: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One line of `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub session_file: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub completion_status: String,
    pub duration_seconds: f64,
    pub files_changed: usize,
    pub notes_captured: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastSession {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub completion_status: Option<String>,
}

/// Totals across every session of one task, active and archived.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskSessionSummary {
    pub task_id: String,
    pub total_sessions: usize,
    pub total_duration_seconds: f64,
    pub files_modified: Vec<String>,
    pub total_commits: usize,
    pub last_session: Option<LastSession>,
}

impl TaskSessionSummary {
    pub fn total_files_modified(&self) -> usize {
        self.files_modified.len()
    }
}

/// Append-only archive under the completed-sessions directory.
///
/// Each finished session is one immutable `session_<task>_<stamp>.json`; `history.jsonl`
/// indexes them in completion order.
#[derive(Debug, Clone)]
pub struct SessionHistory {
    dir: PathBuf,
}

impl SessionHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    /// Base name shared by the session JSON and its hand-off markdown.
    pub fn file_stem(session: &Session) -> String {
        format!(
            "{}_{}",
            safe_file_component(&session.task_id),
            file_stamp(session.start_time)
        )
    }

    /// Writes the session file (never overwriting an existing one) and appends the index.
    pub fn archive(&self, completed: &CompletedSession) -> Result<PathBuf, HistoryError> {
        fs::create_dir_all(&self.dir)?;
        let stem = Self::file_stem(&completed.session);
        let (path, mut file) = create_unique(&self.dir, &format!("session_{}", stem), "json")?;
        let body = serde_json::to_string_pretty(completed)?;
        file.write_all(body.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        let entry = HistoryEntry {
            task_id: completed.session.task_id.clone(),
            session_file: path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string(),
            start_time: completed.session.start_time,
            end_time: completed.session.end_time,
            completion_status: completed.completion_status.clone(),
            duration_seconds: completed.metrics.duration_seconds,
            files_changed: completed.session.file_changes.len(),
            notes_captured: completed.session.notes.len(),
        };
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        let line = serde_json::to_string(&entry)?;
        writeln!(index, "{}", line)?;
        tracing::debug!(file = %path.display(), "archived session");
        Ok(path)
    }

    /// Writes a companion document next to the archived session, e.g. the hand-off.
    pub fn write_companion(
        &self,
        prefix: &str,
        session: &Session,
        extension: &str,
        body: &str,
    ) -> Result<PathBuf, HistoryError> {
        fs::create_dir_all(&self.dir)?;
        let stem = format!("{}_{}", prefix, Self::file_stem(session));
        let (path, mut file) = create_unique(&self.dir, &stem, extension)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        Ok(path)
    }

    /// Index entries, newest start first, optionally for one task.
    pub fn list(&self, task_id: Option<&str>) -> Vec<HistoryEntry> {
        let file = match File::open(self.index_path()) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };
        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read session history");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => {
                    if task_id.map(|id| id == entry.task_id).unwrap_or(true) {
                        entries.push(entry);
                    }
                }
                Err(err) => {
                    tracing::warn!(line = idx + 1, error = %err, "skipping malformed history line")
                }
            }
        }
        entries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        entries
    }

    pub fn load(&self, entry: &HistoryEntry) -> Result<CompletedSession, HistoryError> {
        let text = fs::read_to_string(self.dir.join(&entry.session_file))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Archived sessions for a task, newest first. Unreadable files are skipped.
    pub fn sessions_for(&self, task_id: &str) -> Vec<CompletedSession> {
        self.list(Some(task_id))
            .iter()
            .filter_map(|entry| match self.load(entry) {
                Ok(session) => Some(session),
                Err(err) => {
                    tracing::warn!(file = %entry.session_file, error = %err, "skipping archived session");
                    None
                }
            })
            .collect()
    }

    pub fn task_summary(
        &self,
        task_id: &str,
        active: Option<&Session>,
        now: DateTime<Utc>,
    ) -> TaskSessionSummary {
        let archived = self.sessions_for(task_id);
        let mut summary = TaskSessionSummary {
            task_id: task_id.to_string(),
            ..TaskSessionSummary::default()
        };
        let mut files = BTreeSet::new();
        let mut latest: Option<LastSession> = None;

        let mut consider = |session: &Session, duration: f64, status: Option<&str>| {
            summary.total_sessions += 1;
            summary.total_duration_seconds += duration;
            summary.total_commits += session.git_commits.len();
            files.extend(session.files_created.iter().cloned());
            files.extend(session.files_modified.iter().cloned());
            let newer = latest
                .as_ref()
                .map(|last| session.start_time > last.start_time)
                .unwrap_or(true);
            if newer {
                latest = Some(LastSession {
                    start_time: session.start_time,
                    end_time: session.end_time,
                    duration_seconds: duration,
                    completion_status: status.map(str::to_string),
                });
            }
        };

        for completed in &archived {
            consider(
                &completed.session,
                completed.metrics.duration_seconds,
                Some(completed.completion_status.as_str()),
            );
        }
        if let Some(session) = active {
            consider(session, session.active_seconds(now), None);
        }
        summary.files_modified = files.into_iter().collect();
        summary.last_session = latest;
        summary
    }
}

fn create_unique(dir: &Path, stem: &str, extension: &str) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0;
    loop {
        let name = if attempt == 0 {
            format!("{}.{}", stem, extension)
        } else {
            format!("{}_{}.{}", stem, attempt + 1, extension)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < 100 => {
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Task ids become part of file names; keep them to a portable character set.
///
/// Ids that had to be rewritten get a short digest of the raw id appended, so `a/b` and
/// `a_b` never share a file.
pub fn safe_file_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == value {
        return cleaned;
    }
    let digest = hash_bytes(value.as_bytes());
    format!("{}-{}", cleaned, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn finished(task: &str, start_offset: i64, secs: i64) -> CompletedSession {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
            + Duration::seconds(start_offset);
        let mut session = Session::new(task, start);
        session.files_modified.insert("src/a.rs".into());
        session.end_time = Some(start + Duration::seconds(secs));
        session.is_active = false;
        CompletedSession {
            metrics: session.metrics(start + Duration::seconds(secs)),
            session,
            completion_status: "completed".into(),
        }
    }

    #[test]
    fn archive_never_overwrites() {
        let temp = TempDir::new().expect("tempdir");
        let history = SessionHistory::new(temp.path().join("completed"));
        let first = history.archive(&finished("A", 0, 10)).expect("archive");
        let second = history.archive(&finished("A", 0, 20)).expect("archive");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_2.json"));
        assert_eq!(history.list(Some("A")).len(), 2);
    }

    #[test]
    fn list_is_newest_first_and_skips_bad_lines() {
        let temp = TempDir::new().expect("tempdir");
        let history = SessionHistory::new(temp.path());
        history.archive(&finished("A", 0, 10)).expect("archive");
        history.archive(&finished("B", 100, 10)).expect("archive");
        history.archive(&finished("A", 200, 10)).expect("archive");
        let mut index = OpenOptions::new()
            .append(true)
            .open(history.index_path())
            .expect("open");
        writeln!(index, "{{not json").expect("write");

        let all = history.list(None);
        assert_eq!(
            all.iter().map(|e| e.task_id.as_str()).collect::<Vec<_>>(),
            vec!["A", "B", "A"]
        );
        assert!(all[0].start_time > all[2].start_time);
        assert_eq!(history.list(Some("B")).len(), 1);
    }

    #[test]
    fn task_summary_combines_archive_and_active() {
        let temp = TempDir::new().expect("tempdir");
        let history = SessionHistory::new(temp.path());
        history.archive(&finished("A", 0, 60)).expect("archive");

        let empty = history.task_summary("Z", None, Utc::now());
        assert_eq!(empty.total_sessions, 0);
        assert!(empty.last_session.is_none());

        let start = Utc.with_ymd_and_hms(2026, 2, 2, 9, 0, 0).unwrap();
        let mut active = Session::new("A", start);
        active.files_created.insert("src/b.rs".into());
        let summary = history.task_summary("A", Some(&active), start + Duration::seconds(30));
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.total_duration_seconds, 90.0);
        assert_eq!(summary.files_modified, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(summary.last_session.map(|l| l.start_time), Some(start));
    }

    #[test]
    fn file_components_are_sanitized() {
        assert_eq!(safe_file_component("T-1.2"), "T-1.2");
        assert_eq!(safe_file_component("a_b"), "a_b");
        let rewritten = safe_file_component("a/b");
        assert!(rewritten.starts_with("a_b-"));
        assert_eq!(rewritten.len(), "a_b-".len() + 8);
        assert_ne!(rewritten, safe_file_component("a_b"));
        assert_ne!(rewritten, safe_file_component("a b"));
    }
}
