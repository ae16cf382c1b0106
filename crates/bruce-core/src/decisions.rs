//! Pulls decision lines out of a task's context notes.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::ProjectLayout;
use crate::task::Task;

const DECISION_MARKERS: [&str; 8] = [
    "decision:",
    "decided to",
    "chose",
    "approach:",
    "strategy:",
    "because",
    "rationale:",
    "reason:",
];

const MIN_DECISION_LEN: usize = 10;

/// Context notes for a task: `contexts/phase<N>/context_<id>.md`, falling back to
/// `.task_context_<id>.md` at the project root.
pub fn context_notes_path(layout: &ProjectLayout, task: &Task) -> Option<PathBuf> {
    let primary = layout.task_context_file(task.phase, &task.id);
    if primary.is_file() {
        return Some(primary);
    }
    let fallback = layout.root.join(format!(".task_context_{}.md", task.id));
    if fallback.is_file() {
        return Some(fallback);
    }
    None
}

pub fn extract_decisions(text: &str) -> Vec<String> {
    let bullet = Regex::new(r"^[-*#]+\s*").expect("regex");
    text.lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            DECISION_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(|line| bullet.replace(line, "").trim().to_string())
        .filter(|line| line.chars().count() > MIN_DECISION_LEN)
        .collect()
}

/// Decisions recorded for `task`. A missing or unreadable file yields none.
pub fn decisions_for_task(layout: &ProjectLayout, task: &Task) -> Vec<String> {
    let Some(path) = context_notes_path(layout, task) else {
        return Vec::new();
    };
    read_decisions(&path)
}

fn read_decisions(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(text) => extract_decisions(&text),
        Err(err) => {
            tracing::warn!(file = %path.display(), error = %err, "failed to read context notes");
            Vec::new()
        }
    }
}
