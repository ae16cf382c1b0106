use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Phase id used for tasks sourced from the flat legacy file.
pub const LEGACY_PHASE_ID: i64 = 0;
pub const LEGACY_PHASE_NAME: &str = "Legacy";

/// Keys injected at load time. They never belong in a phase file's task records.
pub const INJECTED_KEYS: [&str; 3] = ["phase", "phase_name", "phase_file"];

#[derive(Debug, Error)]
pub enum TaskParseError {
    #[error("Task record is not a mapping")]
    NotAMapping,
    #[error("Task record is missing an id")]
    MissingId,
    #[error("Invalid phase id: {0}")]
    InvalidPhase(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Aggregation key used by phase progress (`in-progress` becomes `in_progress`).
    pub fn progress_key(&self) -> &'static str {
        match self {
            TaskStatus::InProgress => "in_progress",
            other => other.as_str(),
        }
    }

    pub fn parse(value: &str) -> Option<TaskStatus> {
        let normalized = value.trim().to_lowercase().replace(&['_', ' '][..], "-");
        match normalized.as_str() {
            "pending" | "todo" | "to-do" => Some(TaskStatus::Pending),
            "in-progress" | "active" => Some(TaskStatus::InProgress),
            "completed" | "done" | "complete" => Some(TaskStatus::Completed),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNote {
    pub timestamp: String,
    pub note: String,
}

/// Which physical file a task was parsed from. Used only to route writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOrigin {
    Legacy(PathBuf),
    PhaseFile { path: PathBuf, phase_id: i64 },
}

impl TaskOrigin {
    pub fn path(&self) -> &Path {
        match self {
            TaskOrigin::Legacy(path) => path,
            TaskOrigin::PhaseFile { path, .. } => path,
        }
    }

    pub fn is_phase_file(&self) -> bool {
        matches!(self, TaskOrigin::PhaseFile { .. })
    }

    pub fn file_name(&self) -> String {
        self.path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub phase: i64,
    pub phase_name: String,
    pub output: Option<String>,
    pub context: Vec<String>,
    pub depends_on: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub notes: Vec<TaskNote>,
    pub updated: Option<String>,
    pub extra: BTreeMap<String, Value>,
    pub origin: Option<TaskOrigin>,
}

const KNOWN_KEYS: [&str; 12] = [
    "id",
    "description",
    "status",
    "phase",
    "phase_name",
    "phase_file",
    "output",
    "context",
    "depends_on",
    "acceptance_criteria",
    "notes",
    "updated",
];

impl Task {
    /// Parses one record of a `tasks` list. Phase fields are left at the legacy defaults;
    /// the store annotates them according to the file the record came from.
    pub fn from_value(value: &Value) -> Result<Task, TaskParseError> {
        let map = value.as_mapping().ok_or(TaskParseError::NotAMapping)?;
        let id = mapping_get(map, "id")
            .and_then(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(TaskParseError::MissingId)?;

        let status_raw = mapping_get(map, "status")
            .and_then(value_to_string)
            .unwrap_or_default();
        let status = if status_raw.trim().is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::parse(&status_raw).unwrap_or_else(|| {
                tracing::warn!(task = %id, status = %status_raw, "unknown status, treating as pending");
                TaskStatus::Pending
            })
        };

        let phase = match mapping_get(map, "phase") {
            None | Some(Value::Null) => LEGACY_PHASE_ID,
            Some(value) => parse_phase_id(value)?,
        };

        let mut extra = BTreeMap::new();
        for (key, value) in map {
            if let Some(key) = value_to_string(key) {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    extra.insert(key, value.clone());
                }
            }
        }

        Ok(Task {
            id,
            description: optional_string(map, "description").unwrap_or_default(),
            status,
            phase,
            phase_name: LEGACY_PHASE_NAME.to_string(),
            output: optional_string(map, "output"),
            context: parse_list_value(mapping_get(map, "context")),
            depends_on: parse_list_value(mapping_get(map, "depends_on")),
            acceptance_criteria: parse_list_value(mapping_get(map, "acceptance_criteria")),
            notes: parse_notes(mapping_get(map, "notes")),
            updated: optional_string(map, "updated"),
            extra,
            origin: None,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn origin_path(&self) -> Option<&Path> {
        self.origin.as_ref().map(|origin| origin.path())
    }

    pub fn summary_line(&self) -> String {
        let description = if self.description.trim().is_empty() {
            "(no description)"
        } else {
            self.description.trim()
        };
        format!(
            "{} | {} | phase {} | {}",
            self.id, self.status, self.phase, description
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// File name of the backing phase file; empty for the synthetic legacy phase.
    pub file: String,
    pub task_count: usize,
}

impl Phase {
    pub fn legacy(task_count: usize) -> Self {
        Phase {
            id: LEGACY_PHASE_ID,
            name: LEGACY_PHASE_NAME.to_string(),
            description: "Tasks from the legacy task file".to_string(),
            file: String::new(),
            task_count,
        }
    }
}

/// Returns the phase number encoded in a `phase<N>_<slug>.<yml|yaml>` file name.
pub fn phase_file_number(file_name: &str) -> Option<i64> {
    let re = Regex::new(r"^phase(\d+)_.+\.ya?ml$").expect("regex");
    re.captures(file_name)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

pub fn is_phase_file_name(file_name: &str) -> bool {
    phase_file_number(file_name).is_some()
}

pub fn parse_phase_id(value: &Value) -> Result<i64, TaskParseError> {
    match value {
        Value::Number(num) => num
            .as_i64()
            .ok_or_else(|| TaskParseError::InvalidPhase(num.to_string())),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| TaskParseError::InvalidPhase(text.clone())),
        other => Err(TaskParseError::InvalidPhase(
            value_to_string(other).unwrap_or_default(),
        )),
    }
}

pub fn mapping_get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::String(key.to_string()))
}

pub fn parse_list_value(value: Option<&Value>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(value_to_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(other) => value_to_string(other)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(|s| vec![s])
            .unwrap_or_default(),
    }
}

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(val) => Some(val.clone()),
        Value::Number(num) => Some(num.to_string()),
        Value::Bool(val) => Some(val.to_string()),
        Value::Null => None,
        _ => serde_yaml::to_string(value).ok().map(|s| s.trim().to_string()),
    }
}

fn optional_string(map: &Mapping, key: &str) -> Option<String> {
    mapping_get(map, key)
        .and_then(value_to_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_notes(value: Option<&Value>) -> Vec<TaskNote> {
    let Some(Value::Sequence(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Mapping(map) => Some(TaskNote {
                timestamp: optional_string(map, "timestamp").unwrap_or_default(),
                note: optional_string(map, "note")?,
            }),
            other => value_to_string(other).map(|note| TaskNote {
                timestamp: String::new(),
                note,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).expect("yaml")
    }

    #[test]
    fn from_value_reads_known_fields() {
        let value = record(
            "id: t1\n\
             description: Build the engine\n\
             status: in-progress\n\
             output: engine.rs\n\
             context: [docs/arch.md]\n\
             depends_on: [t0]\n\
             acceptance_criteria:\n  - compiles\n  - tested\n\
             notes:\n  - timestamp: '2026-01-01T10:00:00'\n    note: started\n",
        );
        let task = Task::from_value(&value).expect("parse");
        assert_eq!(task.id, "t1");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.phase, LEGACY_PHASE_ID);
        assert_eq!(task.output.as_deref(), Some("engine.rs"));
        assert_eq!(task.context, vec!["docs/arch.md"]);
        assert_eq!(task.depends_on, vec!["t0"]);
        assert_eq!(task.acceptance_criteria, vec!["compiles", "tested"]);
        assert_eq!(task.notes.len(), 1);
        assert_eq!(task.notes[0].note, "started");
        assert!(task.extra.is_empty());
    }

    #[test]
    fn from_value_keeps_unknown_fields() {
        let value = record("id: t2\nstatus: pending\nowner: sam\nestimate: 3\n");
        let task = Task::from_value(&value).expect("parse");
        assert_eq!(task.extra.len(), 2);
        assert_eq!(task.extra.get("owner"), Some(&Value::String("sam".into())));
    }

    #[test]
    fn from_value_requires_id() {
        let value = record("description: orphan\n");
        assert!(matches!(
            Task::from_value(&value),
            Err(TaskParseError::MissingId)
        ));
    }

    #[test]
    fn explicit_phase_on_legacy_record_is_kept() {
        let value = record("id: t3\nphase: 2\n");
        let task = Task::from_value(&value).expect("parse");
        assert_eq!(task.phase, 2);
    }

    #[test]
    fn status_parse_accepts_variants() {
        assert_eq!(TaskStatus::parse("in_progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse("Done"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse("blocked"), Some(TaskStatus::Blocked));
        assert_eq!(TaskStatus::parse("someday"), None);
        assert_eq!(TaskStatus::InProgress.progress_key(), "in_progress");
    }

    #[test]
    fn phase_file_names_follow_convention() {
        assert_eq!(phase_file_number("phase1_setup.yml"), Some(1));
        assert_eq!(phase_file_number("phase12_trading-ui.yaml"), Some(12));
        assert_eq!(phase_file_number("phase_setup.yml"), None);
        assert_eq!(phase_file_number("phase1.yml"), None);
        assert_eq!(phase_file_number(".phase1_x.yml.lock"), None);
    }
}
