use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::config::ProjectLayout;
use crate::task::{
    is_phase_file_name, mapping_get, parse_phase_id, phase_file_number, value_to_string, Phase,
    Task, TaskOrigin, TaskStatus, INJECTED_KEYS, LEGACY_PHASE_ID, LEGACY_PHASE_NAME,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to load {}: {message}", .path.display())]
    Load { path: PathBuf, message: String },
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Rejected update to task {task_id}: {message}")]
    InvalidUpdate { task_id: String, message: String },
    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A per-file problem found while loading. Loading continues past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadIssue {
    Malformed {
        path: PathBuf,
        message: String,
    },
    DuplicateId {
        id: String,
        kept: PathBuf,
        dropped: PathBuf,
    },
}

impl LoadIssue {
    pub fn path(&self) -> &Path {
        match self {
            LoadIssue::Malformed { path, .. } => path,
            LoadIssue::DuplicateId { dropped, .. } => dropped,
        }
    }

    pub fn into_error(self) -> StoreError {
        match self {
            LoadIssue::Malformed { path, message } => StoreError::Load { path, message },
            LoadIssue::DuplicateId { id, kept, dropped } => StoreError::Load {
                path: dropped,
                message: format!("duplicate task id {} (already loaded from {})", id, kept.display()),
            },
        }
    }
}

impl fmt::Display for LoadIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadIssue::Malformed { path, message } => {
                write!(f, "{}: {}", path.display(), message)
            }
            LoadIssue::DuplicateId { id, kept, dropped } => write!(
                f,
                "{}: duplicate task id {} ignored (kept from {})",
                dropped.display(),
                id,
                kept.display()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub name: String,
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub blocked: usize,
    pub percentage: f64,
}

impl ProgressSummary {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            total: 0,
            completed: 0,
            in_progress: 0,
            pending: 0,
            blocked: 0,
            percentage: 0.0,
        }
    }

    fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status.progress_key() {
            "completed" => self.completed += 1,
            "in_progress" => self.in_progress += 1,
            "blocked" => self.blocked += 1,
            _ => self.pending += 1,
        }
    }

    fn finish(&mut self) {
        self.percentage = if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        };
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub tasks: Vec<Task>,
    pub phases: BTreeMap<i64, Phase>,
    pub issues: Vec<LoadIssue>,
}

impl LoadReport {
    pub fn find(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn tasks_in_phase(&self, phase: i64) -> Vec<&Task> {
        self.tasks.iter().filter(|task| task.phase == phase).collect()
    }

    /// Fails with the first issue instead of returning partial data.
    pub fn strict(self) -> Result<LoadReport, StoreError> {
        match self.issues.into_iter().next() {
            Some(issue) => Err(issue.into_error()),
            None => Ok(LoadReport {
                tasks: self.tasks,
                phases: self.phases,
                issues: Vec::new(),
            }),
        }
    }

    pub fn phase_progress(&self) -> BTreeMap<i64, ProgressSummary> {
        let mut progress: BTreeMap<i64, ProgressSummary> = self
            .phases
            .iter()
            .map(|(id, phase)| (*id, ProgressSummary::new(&phase.name)))
            .collect();
        for task in &self.tasks {
            progress
                .entry(task.phase)
                .or_insert_with(|| ProgressSummary::new(LEGACY_PHASE_NAME))
                .record(task.status);
        }
        for summary in progress.values_mut() {
            summary.finish();
        }
        progress
    }
}

/// An ordered set of field overwrites applied by [`TaskStore::save_update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    entries: Vec<(String, Value)>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn status(self, status: TaskStatus) -> Self {
        self.set("status", status.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Parses `key=value`; the value is read as a YAML scalar or flow collection.
    pub fn parse_assignment(text: &str) -> Option<(String, Value)> {
        let (key, raw) = text.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        let raw = raw.trim();
        let value = serde_yaml::from_str::<Value>(raw)
            .ok()
            .filter(|value| !value.is_null() || raw == "null" || raw == "~")
            .unwrap_or_else(|| Value::String(raw.to_string()));
        Some((key.to_string(), value))
    }
}

impl FromIterator<(String, Value)> for TaskPatch {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut patch = TaskPatch::new();
        for (key, value) in iter {
            patch.insert(key, value);
        }
        patch
    }
}

/// Aggregates tasks from the legacy file and every phase file, and routes updates back to
/// the file each task came from.
#[derive(Debug)]
pub struct TaskStore {
    tasks_file: PathBuf,
    phases_dir: PathBuf,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl TaskStore {
    pub fn new(tasks_file: impl Into<PathBuf>, phases_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_file: tasks_file.into(),
            phases_dir: phases_dir.into(),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_layout(layout: &ProjectLayout) -> Self {
        Self::new(&layout.tasks_file, &layout.phases_dir)
    }

    pub fn tasks_file(&self) -> &Path {
        &self.tasks_file
    }

    pub fn phases_dir(&self) -> &Path {
        &self.phases_dir
    }

    /// Phase files in file-name order.
    pub fn phase_files(&self) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = match fs::read_dir(&self.phases_dir) {
            Ok(read_dir) => read_dir
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(is_phase_file_name)
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        entries.sort();
        entries
    }

    pub fn load(&self) -> LoadReport {
        let mut report = LoadReport::default();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        if self.tasks_file.is_file() {
            match read_document(&self.tasks_file) {
                Ok(doc) => {
                    for record in task_records(&doc) {
                        match Task::from_value(record) {
                            Ok(mut task) => {
                                task.origin = Some(TaskOrigin::Legacy(self.tasks_file.clone()));
                                push_unique(&mut report, &mut seen, task, &self.tasks_file);
                            }
                            Err(err) => report.issues.push(LoadIssue::Malformed {
                                path: self.tasks_file.clone(),
                                message: err.to_string(),
                            }),
                        }
                    }
                }
                Err(issue) => report.issues.push(issue),
            }
        }
        report
            .phases
            .insert(LEGACY_PHASE_ID, Phase::legacy(0));

        for path in self.phase_files() {
            if let Err(issue) = load_phase_file(&path, &mut report, &mut seen) {
                report.issues.push(issue);
            }
        }

        for task in report.tasks.iter_mut() {
            task.phase_name = report
                .phases
                .get(&task.phase)
                .map(|phase| phase.name.clone())
                .unwrap_or_else(|| LEGACY_PHASE_NAME.to_string());
        }
        let phase_ids: Vec<i64> = report.phases.keys().copied().collect();
        for id in phase_ids {
            let count = report.tasks.iter().filter(|task| task.phase == id).count();
            if let Some(phase) = report.phases.get_mut(&id) {
                phase.task_count = count;
            }
        }

        for issue in &report.issues {
            tracing::warn!(issue = %issue, "task load issue");
        }
        tracing::debug!(
            tasks = report.tasks.len(),
            phases = report.phases.len(),
            issues = report.issues.len(),
            "loaded tasks"
        );
        report
    }

    pub fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        self.load()
            .tasks
            .into_iter()
            .find(|task| task.id == task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    pub fn phase_progress(&self) -> BTreeMap<i64, ProgressSummary> {
        self.load().phase_progress()
    }

    /// Merges `patch` into the task's record and writes it back to its origin file.
    ///
    /// Sibling records keep their order and content. Injected phase metadata is never
    /// written into a phase file, and `id` cannot be patched.
    pub fn save_update(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
        self.modify_record(task_id, |origin, record| {
            for (key, value) in patch.iter() {
                if !patchable_key(origin, key) {
                    tracing::warn!(task = %task_id, key = %key, "ignoring routing key in patch");
                    continue;
                }
                record.insert(Value::String(key.to_string()), value.clone());
            }
        })
    }

    /// Appends a `{timestamp, note}` entry to the task's `notes` list and bumps `updated`.
    pub fn append_note(&self, task_id: &str, note: &str, timestamp: &str) -> Result<Task, StoreError> {
        self.modify_record(task_id, |_, record| {
            let mut entry = Mapping::new();
            entry.insert(Value::from("timestamp"), Value::from(timestamp));
            entry.insert(Value::from("note"), Value::from(note));
            let key = Value::from("notes");
            match record.get_mut(&key) {
                Some(Value::Sequence(items)) => items.push(Value::Mapping(entry)),
                _ => {
                    record.insert(key, Value::Sequence(vec![Value::Mapping(entry)]));
                }
            }
            record.insert(Value::from("updated"), Value::from(timestamp));
        })
    }

    fn modify_record<F>(&self, task_id: &str, apply: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&TaskOrigin, &mut Mapping),
    {
        let report = self.load();
        let task = report
            .find(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let origin = task
            .origin
            .clone()
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let phase = report.phases.get(&task.phase).cloned();
        let path = origin.path().to_path_buf();
        ensure_writable(&path)?;

        let lock = self.file_lock(&path);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _file_lock = FileLockGuard::acquire(&path)?;

        let mut doc = read_document(&path).map_err(LoadIssue::into_error)?;
        let record = find_record_mut(&mut doc, task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if origin.is_phase_file() {
            for key in INJECTED_KEYS {
                record.remove(&Value::from(key));
            }
        } else {
            record.remove(&Value::from("phase_name"));
            record.remove(&Value::from("phase_file"));
        }
        apply(&origin, record);
        // A record that would not load back must never reach the disk.
        let mut updated =
            Task::from_value(&Value::Mapping(record.clone())).map_err(|err| {
                StoreError::InvalidUpdate {
                    task_id: task_id.to_string(),
                    message: err.to_string(),
                }
            })?;
        write_document_atomic(&path, &doc)?;

        if let TaskOrigin::PhaseFile { phase_id, .. } = &origin {
            updated.phase = *phase_id;
        }
        updated.phase_name = phase
            .filter(|phase| phase.id == updated.phase)
            .map(|phase| phase.name)
            .unwrap_or_else(|| LEGACY_PHASE_NAME.to_string());
        updated.origin = Some(origin);
        tracing::info!(task = %task_id, file = %path.display(), "task updated");
        Ok(updated)
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .file_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn load_phase_file(
    path: &Path,
    report: &mut LoadReport,
    seen: &mut HashMap<String, PathBuf>,
) -> Result<(), LoadIssue> {
    let malformed = |message: String| LoadIssue::Malformed {
        path: path.to_path_buf(),
        message,
    };
    let doc = read_document(path)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("")
        .to_string();
    let phase_block = doc.as_mapping().and_then(|map| mapping_get(map, "phase"));
    let phase_map = phase_block.and_then(Value::as_mapping);

    let phase_id = match phase_map.and_then(|map| mapping_get(map, "id")) {
        Some(value) => parse_phase_id(value).map_err(|err| malformed(err.to_string()))?,
        None => phase_file_number(&file_name)
            .ok_or_else(|| malformed("phase block has no id".to_string()))?,
    };
    let text_field = |key: &str| {
        phase_map
            .and_then(|map| mapping_get(map, key))
            .and_then(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let phase_name = text_field("name").unwrap_or_else(|| "Unknown Phase".to_string());
    report.phases.entry(phase_id).or_insert_with(|| Phase {
        id: phase_id,
        name: phase_name.clone(),
        description: text_field("description").unwrap_or_default(),
        file: file_name.clone(),
        task_count: 0,
    });

    for record in task_records(&doc) {
        match Task::from_value(record) {
            Ok(mut task) => {
                task.phase = phase_id;
                task.phase_name = phase_name.clone();
                task.origin = Some(TaskOrigin::PhaseFile {
                    path: path.to_path_buf(),
                    phase_id,
                });
                push_unique(report, seen, task, path);
            }
            Err(err) => report.issues.push(malformed(err.to_string())),
        }
    }
    Ok(())
}

fn push_unique(
    report: &mut LoadReport,
    seen: &mut HashMap<String, PathBuf>,
    task: Task,
    path: &Path,
) {
    if let Some(kept) = seen.get(&task.id) {
        report.issues.push(LoadIssue::DuplicateId {
            id: task.id.clone(),
            kept: kept.clone(),
            dropped: path.to_path_buf(),
        });
        return;
    }
    seen.insert(task.id.clone(), path.to_path_buf());
    report.tasks.push(task);
}

fn read_document(path: &Path) -> Result<Value, LoadIssue> {
    let text = fs::read_to_string(path).map_err(|err| LoadIssue::Malformed {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let doc: Value = serde_yaml::from_str(&text).map_err(|err| LoadIssue::Malformed {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    match &doc {
        Value::Null | Value::Mapping(_) | Value::Sequence(_) => Ok(doc),
        _ => Err(LoadIssue::Malformed {
            path: path.to_path_buf(),
            message: "expected a mapping with a tasks list".to_string(),
        }),
    }
}

/// The task list of a document: the `tasks` key of a mapping, or a bare top-level list.
fn task_records(doc: &Value) -> &[Value] {
    match doc {
        Value::Mapping(map) => match mapping_get(map, "tasks") {
            Some(Value::Sequence(items)) => items,
            _ => &[],
        },
        Value::Sequence(items) => items,
        _ => &[],
    }
}

fn find_record_mut<'a>(doc: &'a mut Value, task_id: &str) -> Option<&'a mut Mapping> {
    let items = match doc {
        Value::Mapping(map) => match map.get_mut(&Value::from("tasks")) {
            Some(Value::Sequence(items)) => items,
            _ => return None,
        },
        Value::Sequence(items) => items,
        _ => return None,
    };
    items.iter_mut().find_map(|item| {
        let map = item.as_mapping_mut()?;
        let matches = mapping_get(map, "id")
            .and_then(value_to_string)
            .map(|id| id.trim() == task_id)
            .unwrap_or(false);
        if matches {
            Some(map)
        } else {
            None
        }
    })
}

fn patchable_key(origin: &TaskOrigin, key: &str) -> bool {
    match key {
        "id" => false,
        "phase" => !origin.is_phase_file(),
        "phase_name" | "phase_file" => false,
        _ => true,
    }
}

fn ensure_writable(path: &Path) -> Result<(), StoreError> {
    let metadata = fs::metadata(path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.permissions().readonly() {
        return Err(StoreError::Write {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "file is read-only"),
        });
    }
    Ok(())
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tasks");
    path.with_file_name(format!(".{}.{}", name, suffix))
}

/// Writes to a sibling temp file and renames it over `path`; the original stays intact
/// if anything fails before the rename.
fn write_document_atomic(path: &Path, doc: &Value) -> Result<(), StoreError> {
    let write_err = |source: io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_yaml::to_string(doc)
        .map_err(|err| write_err(io::Error::new(io::ErrorKind::InvalidData, err.to_string())))?;
    let tmp = sidecar_path(path, "tmp");
    let result = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(err));
    }
    Ok(())
}

/// Advisory cross-process lock held for the duration of one read-modify-write.
///
/// The lock lives on a sidecar because the data file is replaced by rename on every write.
/// The sidecar is never unlinked: a waiter would otherwise end up holding a lock on an
/// orphaned inode while a newcomer locks a fresh one.
struct FileLockGuard {
    file: File,
}

impl FileLockGuard {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let lock_path = sidecar_path(path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StoreError::Write {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| StoreError::Write {
            path: lock_path,
            source,
        })?;
        Ok(Self { file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> TaskStore {
        let phases = temp.path().join("phases");
        fs::create_dir_all(&phases).expect("phases dir");
        TaskStore::new(temp.path().join("tasks.yaml"), phases)
    }

    #[test]
    fn patch_insert_replaces_existing_key() {
        let patch = TaskPatch::new()
            .set("status", "pending")
            .set("output", "x")
            .status(TaskStatus::Completed);
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get("status"), Some(&Value::from("completed")));
    }

    #[test]
    fn parse_assignment_reads_yaml_values() {
        let (key, value) = TaskPatch::parse_assignment("depends_on=[a, b]").expect("parse");
        assert_eq!(key, "depends_on");
        assert_eq!(
            value,
            Value::Sequence(vec![Value::from("a"), Value::from("b")])
        );
        let (_, value) = TaskPatch::parse_assignment("status = in-progress").expect("parse");
        assert_eq!(value, Value::from("in-progress"));
        let (_, value) = TaskPatch::parse_assignment("output=").expect("parse");
        assert_eq!(value, Value::from(""));
        assert!(TaskPatch::parse_assignment("novalue").is_none());
    }

    #[test]
    fn bare_sequence_document_is_accepted() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        fs::write(
            store.tasks_file(),
            "- id: a\n  status: pending\n- id: b\n  status: completed\n",
        )
        .expect("write");
        let report = store.load();
        assert!(report.issues.is_empty());
        assert_eq!(report.tasks.len(), 2);

        store
            .save_update("b", &TaskPatch::new().set("output", "done"))
            .expect("update");
        let reloaded = store.load();
        assert_eq!(reloaded.find("b").and_then(|t| t.output.clone()).as_deref(), Some("done"));
    }

    #[test]
    fn phase_id_falls_back_to_file_name() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        fs::write(
            store.phases_dir().join("phase4_misc.yml"),
            "phase:\n  name: Misc\ntasks:\n  - id: m1\n",
        )
        .expect("write");
        let report = store.load();
        assert_eq!(report.find("m1").map(|t| t.phase), Some(4));
        assert_eq!(report.phases.get(&4).map(|p| p.name.as_str()), Some("Misc"));
    }

    #[test]
    fn lock_and_temp_files_are_not_left_as_phase_files() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        fs::write(
            store.phases_dir().join("phase1_core.yml"),
            "phase:\n  id: 1\n  name: Core\ntasks:\n  - id: c1\n    status: pending\n",
        )
        .expect("write");
        store
            .save_update("c1", &TaskPatch::new().status(TaskStatus::Blocked))
            .expect("update");
        assert_eq!(store.phase_files().len(), 1);
        assert!(!store.phases_dir().join(".phase1_core.yml.tmp").exists());
    }

    #[test]
    fn sidecar_paths_are_hidden_siblings() {
        let path = Path::new("/p/phases/phase1_x.yml");
        assert_eq!(
            sidecar_path(path, "lock"),
            PathBuf::from("/p/phases/.phase1_x.yml.lock")
        );
    }
}
