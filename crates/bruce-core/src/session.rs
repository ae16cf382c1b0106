use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Snapshot;

/// Warnings kept on a session are capped so a broken monitor cannot grow the file forever.
const MAX_WARNINGS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Project-relative path with `/` separators.
    pub path: String,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    pub size_before: Option<u64>,
    pub size_after: Option<u64>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteCategory {
    Decision,
    Problem,
    Solution,
    Context,
    Completion,
}

impl NoteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteCategory::Decision => "decision",
            NoteCategory::Problem => "problem",
            NoteCategory::Solution => "solution",
            NoteCategory::Context => "context",
            NoteCategory::Completion => "completion",
        }
    }

    /// Unknown categories fall back to `context`.
    pub fn parse(value: &str) -> NoteCategory {
        match value.trim().to_lowercase().as_str() {
            "decision" | "decisions" => NoteCategory::Decision,
            "problem" | "problems" | "issue" => NoteCategory::Problem,
            "solution" | "solutions" | "fix" => NoteCategory::Solution,
            "completion" | "done" => NoteCategory::Completion,
            _ => NoteCategory::Context,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            NoteCategory::Decision => "Decision",
            NoteCategory::Problem => "Problem",
            NoteCategory::Solution => "Solution",
            NoteCategory::Context => "Context",
            NoteCategory::Completion => "Completion",
        }
    }
}

impl Default for NoteCategory {
    fn default() -> Self {
        NoteCategory::Context
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNote {
    pub timestamp: DateTime<Utc>,
    pub note: String,
    pub category: NoteCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub hash: String,
    pub message: String,
}

/// One task's work period. Persisted as JSON while active and archived on end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub pause_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_pause_seconds: f64,
    #[serde(default)]
    pub files_created: BTreeSet<String>,
    #[serde(default)]
    pub files_modified: BTreeSet<String>,
    #[serde(default)]
    pub files_deleted: BTreeSet<String>,
    #[serde(default)]
    pub file_changes: Vec<FileChange>,
    #[serde(default)]
    pub git_commits: Vec<GitCommit>,
    #[serde(default)]
    pub notes: Vec<SessionNote>,
    #[serde(default)]
    pub peak_memory_mb: f64,
    #[serde(default)]
    pub cpu_seconds: f64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Checksums as of the last scan; lets a restored session keep diffing incrementally.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baseline: Snapshot,
}

impl Session {
    pub fn new(task_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.to_string(),
            start_time: now,
            end_time: None,
            is_active: true,
            is_paused: false,
            pause_started: None,
            total_pause_seconds: 0.0,
            files_created: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            files_deleted: BTreeSet::new(),
            file_changes: Vec::new(),
            git_commits: Vec::new(),
            notes: Vec::new(),
            peak_memory_mb: 0.0,
            cpu_seconds: 0.0,
            last_activity: Some(now),
            warnings: Vec::new(),
            baseline: Snapshot::new(),
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active || self.is_paused {
            return false;
        }
        self.is_paused = true;
        self.pause_started = Some(now);
        self.last_activity = Some(now);
        true
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active || !self.is_paused {
            return false;
        }
        if let Some(started) = self.pause_started.take() {
            self.total_pause_seconds += seconds_between(started, now);
        }
        self.is_paused = false;
        self.last_activity = Some(now);
        true
    }

    /// Accumulated pause time, including a pause that is still open.
    pub fn paused_seconds(&self, now: DateTime<Utc>) -> f64 {
        let open = match (self.is_paused, self.pause_started) {
            (true, Some(started)) => seconds_between(started, now),
            _ => 0.0,
        };
        self.total_pause_seconds + open
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.start_time, self.end_time.unwrap_or(now))
    }

    pub fn active_seconds(&self, now: DateTime<Utc>) -> f64 {
        let end = self.end_time.unwrap_or(now);
        (self.elapsed_seconds(now) - self.paused_seconds(end)).max(0.0)
    }

    /// Folds one change into the cumulative file sets.
    pub fn record_change(&mut self, change: FileChange) {
        let path = change.path.clone();
        match change.kind {
            ChangeKind::Created => {
                if self.files_deleted.remove(&path) {
                    self.files_modified.insert(path);
                } else {
                    self.files_created.insert(path);
                }
            }
            ChangeKind::Modified => {
                if !self.files_created.contains(&path) {
                    self.files_modified.insert(path);
                }
            }
            ChangeKind::Deleted => {
                if !self.files_created.remove(&path) {
                    self.files_modified.remove(&path);
                    self.files_deleted.insert(path);
                }
            }
        }
        self.last_activity = Some(change.timestamp);
        self.file_changes.push(change);
    }

    /// Appends commits not seen before; returns how many were new.
    ///
    /// `commits` arrives newest first, as `git log` prints it. The session keeps them
    /// oldest first so the tail is always the most recent work.
    pub fn record_commits(&mut self, commits: Vec<GitCommit>) -> usize {
        let mut added = 0;
        for commit in commits.into_iter().rev() {
            if self.git_commits.iter().any(|known| known.hash == commit.hash) {
                continue;
            }
            self.git_commits.push(commit);
            added += 1;
        }
        added
    }

    pub fn add_note(
        &mut self,
        note: &str,
        category: NoteCategory,
        file_context: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.notes.push(SessionNote {
            timestamp: now,
            note: note.to_string(),
            category,
            file_context,
        });
        self.last_activity = Some(now);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.warnings.contains(&message) || self.warnings.len() >= MAX_WARNINGS {
            return;
        }
        tracing::warn!(task = %self.task_id, warning = %message, "session degraded");
        self.warnings.push(message);
    }

    pub fn record_usage(&mut self, memory_mb: Option<f64>, cpu_seconds: Option<f64>) {
        if let Some(memory) = memory_mb {
            if memory > self.peak_memory_mb {
                self.peak_memory_mb = memory;
            }
        }
        if let Some(cpu) = cpu_seconds {
            if cpu > self.cpu_seconds {
                self.cpu_seconds = cpu;
            }
        }
    }

    pub fn lines_added(&self) -> usize {
        self.file_changes.iter().map(|c| c.lines_added).sum()
    }

    pub fn lines_removed(&self) -> usize {
        self.file_changes.iter().map(|c| c.lines_removed).sum()
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> SessionMetrics {
        let end = self.end_time.unwrap_or(now);
        SessionMetrics {
            start_time: Some(self.start_time),
            end_time: self.end_time,
            duration_seconds: self.active_seconds(end),
            elapsed_seconds: self.elapsed_seconds(end),
            paused_seconds: self.paused_seconds(end),
            files_created: self.files_created.len(),
            files_modified: self.files_modified.len(),
            files_deleted: self.files_deleted.len(),
            total_lines_added: self.lines_added(),
            total_lines_removed: self.lines_removed(),
            git_commits: self.git_commits.len(),
            notes_captured: self.notes.len(),
            cpu_seconds: self.cpu_seconds,
            memory_peak_mb: self.peak_memory_mb,
        }
    }

    pub fn notes_in(&self, category: NoteCategory) -> impl Iterator<Item = &SessionNote> {
        self.notes.iter().filter(move |n| n.category == category)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Active time: wall-clock minus pauses.
    pub duration_seconds: f64,
    pub elapsed_seconds: f64,
    pub paused_seconds: f64,
    pub files_created: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
    pub git_commits: usize,
    pub notes_captured: usize,
    pub cpu_seconds: f64,
    pub memory_peak_mb: f64,
}

/// Result of ending a session. The default value means nothing was active.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub task_id: String,
    pub completion_status: String,
    pub metrics: SessionMetrics,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_deleted: Vec<String>,
    pub git_commits: Vec<GitCommit>,
    pub notes: Vec<SessionNote>,
    pub warnings: Vec<String>,
    pub history_file: Option<PathBuf>,
    pub handoff_file: Option<PathBuf>,
}

impl SessionSummary {
    pub fn is_empty(&self) -> bool {
        self.task_id.is_empty()
    }

    pub fn from_session(session: &Session, completion_status: &str, now: DateTime<Utc>) -> Self {
        Self {
            task_id: session.task_id.clone(),
            completion_status: completion_status.to_string(),
            metrics: session.metrics(now),
            files_created: session.files_created.iter().cloned().collect(),
            files_modified: session.files_modified.iter().cloned().collect(),
            files_deleted: session.files_deleted.iter().cloned().collect(),
            git_commits: session.git_commits.clone(),
            notes: session.notes.clone(),
            warnings: session.warnings.clone(),
            history_file: None,
            handoff_file: None,
        }
    }
}

/// Archived form of a finished session. Written once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSession {
    #[serde(flatten)]
    pub session: Session,
    pub completion_status: String,
    pub metrics: SessionMetrics,
}

/// Live view of one session for `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub task_id: String,
    pub active: bool,
    pub paused: bool,
    pub start_time: DateTime<Utc>,
    pub active_seconds: f64,
    pub paused_seconds: f64,
    pub files_changed: usize,
    pub git_commits: usize,
    pub notes: usize,
    pub current_memory_mb: Option<f64>,
    pub peak_memory_mb: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

/// `1h 05m 09s` style rendering for summaries.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
