use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::checksum::{diff_snapshots, line_delta, FileChecksumScanner};
use crate::clock::{Clock, SystemClock};
use crate::config::{ProjectLayout, TrackingConfig};
use crate::git::{GitCli, VcsAdapter};
use crate::handoff::render_handoff;
use crate::history::{safe_file_component, HistoryEntry, SessionHistory, TaskSessionSummary};
use crate::resources;
use crate::session::{
    ChangeKind, CompletedSession, FileChange, NoteCategory, Session, SessionStatus,
    SessionSummary,
};

/// Completion status recorded when `start` closes a session that was still running.
pub const SUPERSEDED_STATUS: &str = "superseded";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("No active session for task {0}")]
    NotActive(String),
    #[error("Failed to persist session: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    History(#[from] crate::history::HistoryError),
}

/// Everything a tracker needs. Built from project config, then adjusted for tests.
pub struct TrackerSettings {
    pub project_root: PathBuf,
    pub active_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub scanner: FileChecksumScanner,
    pub clock: Arc<dyn Clock>,
    pub vcs: Arc<dyn VcsAdapter>,
    pub scan_interval: Duration,
    pub monitor_join_timeout: Duration,
    pub background_monitor: bool,
}

impl TrackerSettings {
    pub fn for_project(layout: &ProjectLayout, tracking: &TrackingConfig) -> Self {
        Self {
            project_root: layout.root.clone(),
            active_dir: layout.active_sessions_dir(),
            completed_dir: layout.completed_sessions_dir(),
            scanner: FileChecksumScanner::for_project(layout, tracking),
            clock: Arc::new(SystemClock),
            vcs: Arc::new(GitCli::new(&layout.root, tracking.git_timeout())),
            scan_interval: tracking.scan_interval(),
            monitor_join_timeout: tracking.monitor_join_timeout(),
            background_monitor: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VcsAdapter>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Short-lived processes have no use for the periodic monitor.
    pub fn without_monitor(mut self) -> Self {
        self.background_monitor = false;
        self
    }
}

/// Lifecycle manager for per-task work sessions.
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    settings: TrackerSettings,
    history: SessionHistory,
    sessions: Mutex<HashMap<String, Arc<TrackedSession>>>,
    // Serializes start/end/restore so "one active session per task" holds.
    lifecycle: Mutex<()>,
}

struct TrackedSession {
    state: Mutex<Session>,
    monitor: Mutex<Option<MonitorHandle>>,
}

struct MonitorHandle {
    stop: mpsc::Sender<()>,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the monitor and waits at most `timeout` for it to finish.
    fn stop(self, task_id: &str, timeout: Duration) {
        let _ = self.stop.send(());
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.thread.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(task = %task_id, "session monitor did not stop in time; detaching");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        let history = SessionHistory::new(&settings.completed_dir);
        Self {
            inner: Arc::new(TrackerInner {
                settings,
                history,
                sessions: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    pub fn for_project(layout: &ProjectLayout, tracking: &TrackingConfig) -> Self {
        Self::new(TrackerSettings::for_project(layout, tracking))
    }

    pub fn history(&self) -> &SessionHistory {
        &self.inner.history
    }

    /// Starts tracking `task_id`. A session already running for the task is ended first
    /// and archived with status `superseded`.
    pub fn start(&self, task_id: &str) -> Result<Session, TrackerError> {
        let _lifecycle = lock(&self.inner.lifecycle);
        if self.inner.tracked(task_id).is_some() {
            tracing::info!(task = %task_id, "closing previous session before restart");
            self.inner.end_locked(task_id, SUPERSEDED_STATUS, None)?;
        }

        let settings = &self.inner.settings;
        let mut session = Session::new(task_id, settings.clock.now());
        let outcome = settings.scanner.scan();
        if !outcome.errors.is_empty() {
            tracing::debug!(errors = ?outcome.errors, "baseline scan errors");
            session.warn("some monitored files could not be read");
        }
        session.baseline = outcome.files;
        let usage = resources::sample();
        session.record_usage(usage.memory_mb, usage.cpu_seconds);
        self.inner.persist(&session)?;

        let snapshot = session.clone();
        let tracked = Arc::new(TrackedSession {
            state: Mutex::new(session),
            monitor: Mutex::new(None),
        });
        lock(&self.inner.sessions).insert(task_id.to_string(), Arc::clone(&tracked));
        self.inner.spawn_monitor(task_id, &tracked);
        tracing::info!(
            task = %task_id,
            baseline_files = snapshot.baseline.len(),
            "session started"
        );
        Ok(snapshot)
    }

    /// Changes since the previous scan. The session keeps the cumulative view.
    pub fn scan(&self, task_id: &str) -> Result<Vec<FileChange>, TrackerError> {
        let tracked = self
            .inner
            .tracked(task_id)
            .ok_or_else(|| TrackerError::NotActive(task_id.to_string()))?;
        let mut session = lock(&tracked.state);
        if !session.is_active {
            return Err(TrackerError::NotActive(task_id.to_string()));
        }
        let changes = self.inner.scan_session(&mut session);
        self.inner.persist(&session)?;
        Ok(changes)
    }

    /// Returns `false` when there is no active session or it is already paused.
    pub fn pause(&self, task_id: &str) -> Result<bool, TrackerError> {
        self.mutate(task_id, |session, now| session.pause(now))
    }

    /// Returns `false` when there is no active session or it is not paused.
    pub fn resume(&self, task_id: &str) -> Result<bool, TrackerError> {
        self.mutate(task_id, |session, now| session.resume(now))
    }

    /// Returns `false` without error when the task has no active session.
    pub fn add_note(
        &self,
        task_id: &str,
        text: &str,
        category: NoteCategory,
    ) -> Result<bool, TrackerError> {
        self.add_note_with_file(task_id, text, category, None)
    }

    pub fn add_note_with_file(
        &self,
        task_id: &str,
        text: &str,
        category: NoteCategory,
        file_context: Option<String>,
    ) -> Result<bool, TrackerError> {
        self.mutate(task_id, |session, now| {
            session.add_note(text, category, file_context, now);
            true
        })
    }

    /// Ends the session and archives it. With nothing active this returns an empty summary.
    pub fn end(&self, task_id: &str, completion_status: &str) -> Result<SessionSummary, TrackerError> {
        self.end_with_note(task_id, completion_status, None)
    }

    pub fn end_with_note(
        &self,
        task_id: &str,
        completion_status: &str,
        final_note: Option<&str>,
    ) -> Result<SessionSummary, TrackerError> {
        let _lifecycle = lock(&self.inner.lifecycle);
        self.inner.end_locked(task_id, completion_status, final_note)
    }

    /// Re-hydrates sessions left active on disk by a previous process.
    pub fn restore_active_sessions(&self) -> Result<Vec<String>, TrackerError> {
        let _lifecycle = lock(&self.inner.lifecycle);
        let dir = &self.inner.settings.active_dir;
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_active_session_file(path))
            .collect();
        paths.sort();

        let mut restored = Vec::new();
        for path in paths {
            let mut session = match read_session_file(&path) {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "skipping unreadable session file");
                    continue;
                }
            };
            if !session.is_active || self.inner.tracked(&session.task_id).is_some() {
                continue;
            }
            if session.baseline.is_empty() {
                session.baseline = self.inner.settings.scanner.scan().files;
            }
            let task_id = session.task_id.clone();
            let tracked = Arc::new(TrackedSession {
                state: Mutex::new(session),
                monitor: Mutex::new(None),
            });
            lock(&self.inner.sessions).insert(task_id.clone(), Arc::clone(&tracked));
            self.inner.spawn_monitor(&task_id, &tracked);
            tracing::info!(task = %task_id, "restored active session");
            restored.push(task_id);
        }
        Ok(restored)
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.inner.tracked(task_id).is_some()
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A copy of the live session state.
    pub fn session(&self, task_id: &str) -> Option<Session> {
        self.inner
            .tracked(task_id)
            .map(|tracked| lock(&tracked.state).clone())
    }

    pub fn status(&self, task_id: &str) -> Option<SessionStatus> {
        let tracked = self.inner.tracked(task_id)?;
        let mut session = lock(&tracked.state);
        let now = self.inner.settings.clock.now();
        let usage = resources::sample();
        session.record_usage(usage.memory_mb, usage.cpu_seconds);
        Some(SessionStatus {
            task_id: session.task_id.clone(),
            active: session.is_active,
            paused: session.is_paused,
            start_time: session.start_time,
            active_seconds: session.active_seconds(now),
            paused_seconds: session.paused_seconds(now),
            files_changed: session.file_changes.len(),
            git_commits: session.git_commits.len(),
            notes: session.notes.len(),
            current_memory_mb: usage.memory_mb,
            peak_memory_mb: session.peak_memory_mb,
            last_activity: session.last_activity,
            warnings: session.warnings.clone(),
        })
    }

    /// Completed sessions, newest first.
    pub fn list_completed(&self, task_id: Option<&str>) -> Vec<HistoryEntry> {
        self.inner.history.list(task_id)
    }

    /// Totals over the archived sessions of a task plus the live one, if any.
    pub fn task_summary(&self, task_id: &str) -> TaskSessionSummary {
        let active = self.session(task_id);
        self.inner
            .history
            .task_summary(task_id, active.as_ref(), self.inner.settings.clock.now())
    }

    /// Stops every background monitor. Sessions stay active on disk for the next restore.
    pub fn shutdown(&self) {
        let tracked: Vec<(String, Arc<TrackedSession>)> = lock(&self.inner.sessions)
            .iter()
            .map(|(id, tracked)| (id.clone(), Arc::clone(tracked)))
            .collect();
        for (task_id, tracked) in tracked {
            if let Some(handle) = lock(&tracked.monitor).take() {
                handle.stop(&task_id, self.inner.settings.monitor_join_timeout);
            }
        }
    }

    fn mutate<F>(&self, task_id: &str, apply: F) -> Result<bool, TrackerError>
    where
        F: FnOnce(&mut Session, chrono::DateTime<chrono::Utc>) -> bool,
    {
        let Some(tracked) = self.inner.tracked(task_id) else {
            return Ok(false);
        };
        let mut session = lock(&tracked.state);
        if !session.is_active {
            return Ok(false);
        }
        let changed = apply(&mut session, self.inner.settings.clock.now());
        if changed {
            self.inner.persist(&session)?;
        }
        Ok(changed)
    }
}

impl TrackerInner {
    fn tracked(&self, task_id: &str) -> Option<Arc<TrackedSession>> {
        lock(&self.sessions).get(task_id).cloned()
    }

    fn active_file(&self, task_id: &str) -> PathBuf {
        self.settings
            .active_dir
            .join(format!("session_{}.json", safe_file_component(task_id)))
    }

    /// Rewrites the active-session file through a temp file and rename.
    fn persist(&self, session: &Session) -> Result<(), TrackerError> {
        fs::create_dir_all(&self.settings.active_dir)?;
        let path = self.active_file(&session.task_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(session)?;
        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn scan_session(&self, session: &mut Session) -> Vec<FileChange> {
        let now = self.settings.clock.now();
        let outcome = self.settings.scanner.scan();
        if !outcome.errors.is_empty() {
            tracing::debug!(errors = ?outcome.errors, "scan errors");
            session.warn("some monitored files could not be read");
        }

        let diff = diff_snapshots(&session.baseline, &outcome.files);
        let mut changes = Vec::with_capacity(diff.len());
        let kinds = [
            (ChangeKind::Created, &diff.created),
            (ChangeKind::Modified, &diff.modified),
            (ChangeKind::Deleted, &diff.deleted),
        ];
        for (kind, paths) in kinds {
            for path in paths {
                let before = session.baseline.get(path);
                let after = outcome.files.get(path);
                let (lines_added, lines_removed) = line_delta(before, after);
                changes.push(FileChange {
                    path: self.relative_path(path),
                    kind,
                    timestamp: now,
                    size_before: before.map(|snap| snap.size),
                    size_after: after.map(|snap| snap.size),
                    lines_added,
                    lines_removed,
                });
            }
        }
        for change in &changes {
            session.record_change(change.clone());
        }
        session.baseline = outcome.files;

        match self.settings.vcs.commits_since(session.start_time) {
            Ok(commits) => {
                let added = session.record_commits(commits);
                if added > 0 {
                    session.last_activity = Some(now);
                }
            }
            Err(err) => session.warn(format!("git history unavailable: {}", err)),
        }

        let usage = resources::sample();
        session.record_usage(usage.memory_mb, usage.cpu_seconds);
        tracing::debug!(task = %session.task_id, changes = changes.len(), "session scan");
        changes
    }

    fn end_locked(
        &self,
        task_id: &str,
        completion_status: &str,
        final_note: Option<&str>,
    ) -> Result<SessionSummary, TrackerError> {
        let Some(tracked) = lock(&self.sessions).remove(task_id) else {
            tracing::debug!(task = %task_id, "end requested with no active session");
            return Ok(SessionSummary::default());
        };
        if let Some(handle) = lock(&tracked.monitor).take() {
            handle.stop(task_id, self.settings.monitor_join_timeout);
        }

        // Waits for any in-flight scan so the final summary is not torn.
        let mut session = lock(&tracked.state);
        if !session.is_active {
            return Ok(SessionSummary::default());
        }
        self.scan_session(&mut session);
        let now = self.settings.clock.now();
        if let Some(note) = final_note.map(str::trim).filter(|note| !note.is_empty()) {
            session.add_note(note, NoteCategory::Completion, None, now);
        }
        if session.is_paused {
            session.resume(now);
        }
        session.end_time = Some(now);
        session.is_active = false;
        session.baseline.clear();

        let metrics = session.metrics(now);
        let completed = CompletedSession {
            session: session.clone(),
            completion_status: completion_status.to_string(),
            metrics: metrics.clone(),
        };
        let history_file = self.history.archive(&completed)?;

        let mut summary = SessionSummary::from_session(&session, completion_status, now);
        summary.history_file = Some(history_file);
        let handoff = render_handoff(&session, completion_status, &metrics, now);
        match self
            .history
            .write_companion("handoff", &session, "md", &handoff)
        {
            Ok(path) => summary.handoff_file = Some(path),
            Err(err) => {
                tracing::warn!(task = %task_id, error = %err, "failed to write hand-off");
                summary.warnings.push(format!("hand-off not written: {}", err));
            }
        }

        match fs::remove_file(self.active_file(task_id)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(task = %task_id, error = %err, "failed to remove active session file"),
        }
        tracing::info!(
            task = %task_id,
            status = %completion_status,
            duration_seconds = metrics.duration_seconds,
            "session ended"
        );
        Ok(summary)
    }

    fn spawn_monitor(self: &Arc<Self>, task_id: &str, tracked: &Arc<TrackedSession>) {
        if !self.settings.background_monitor {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let weak_inner: Weak<TrackerInner> = Arc::downgrade(self);
        let weak_session = Arc::downgrade(tracked);
        let interval = self.settings.scan_interval;
        let name = format!("bruce-monitor-{}", task_id);

        let spawned = thread::Builder::new().name(name).spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let (Some(inner), Some(tracked)) = (weak_inner.upgrade(), weak_session.upgrade())
                else {
                    break;
                };
                let mut session = lock(&tracked.state);
                if !session.is_active {
                    break;
                }
                if session.is_paused {
                    let usage = resources::sample();
                    session.record_usage(usage.memory_mb, usage.cpu_seconds);
                    continue;
                }
                inner.scan_session(&mut session);
                if let Err(err) = inner.persist(&session) {
                    session.warn(format!("active session not saved: {}", err));
                }
            }
            let _ = done_tx.send(());
        });

        match spawned {
            Ok(thread) => {
                *lock(&tracked.monitor) = Some(MonitorHandle {
                    stop: stop_tx,
                    done: done_rx,
                    thread,
                });
            }
            Err(err) => {
                lock(&tracked.state).warn(format!("background monitor unavailable: {}", err));
            }
        }
    }

    fn relative_path(&self, path: &Path) -> String {
        let relative = path
            .strip_prefix(&self.settings.project_root)
            .unwrap_or(path);
        relative.to_string_lossy().replace('\\', "/")
    }
}

fn is_active_session_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("session_") && name.ends_with(".json"))
            .unwrap_or(false)
}

fn read_session_file(path: &Path) -> Result<Session, TrackerError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
