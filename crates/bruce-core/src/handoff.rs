//! Markdown hand-off written when a session ends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::session::{format_duration, NoteCategory, Session, SessionMetrics};

const RECENT_COMMITS: usize = 5;

pub fn render_handoff(
    session: &Session,
    completion_status: &str,
    metrics: &SessionMetrics,
    generated_at: DateTime<Utc>,
) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# Session Handoff: {}", session.task_id));
    lines.push(String::new());
    lines.push(format!(
        "Completed: {}",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    lines.push(format!("Status: {}", completion_status.to_uppercase()));
    lines.push(format!(
        "Active time: {}",
        format_duration(metrics.duration_seconds)
    ));
    if metrics.paused_seconds > 0.0 {
        lines.push(format!("Paused: {}", format_duration(metrics.paused_seconds)));
    }
    lines.push(String::new());

    lines.push("## Metrics".to_string());
    lines.push(format!("- Files created: {}", metrics.files_created));
    lines.push(format!("- Files modified: {}", metrics.files_modified));
    lines.push(format!("- Files deleted: {}", metrics.files_deleted));
    lines.push(format!("- Lines added: {}", metrics.total_lines_added));
    lines.push(format!("- Lines removed: {}", metrics.total_lines_removed));
    lines.push(format!("- Git commits: {}", metrics.git_commits));
    lines.push(format!("- Peak memory: {:.1} MB", metrics.memory_peak_mb));
    lines.push(format!("- CPU time: {:.2}s", metrics.cpu_seconds));
    lines.push(String::new());

    lines.push("## File Changes".to_string());
    let totals = per_file_totals(session);
    if totals.is_empty() {
        lines.push("- No file changes detected".to_string());
    } else {
        for (label, set) in [
            ("Created", &session.files_created),
            ("Modified", &session.files_modified),
            ("Deleted", &session.files_deleted),
        ] {
            if set.is_empty() {
                continue;
            }
            lines.push(format!("**{}:**", label));
            for path in set {
                let (added, removed) = totals.get(path.as_str()).copied().unwrap_or((0, 0));
                lines.push(format!("- `{}` (+{}/-{} lines)", path, added, removed));
            }
        }
    }
    lines.push(String::new());

    if !session.git_commits.is_empty() {
        lines.push(format!("## Git Commits ({})", session.git_commits.len()));
        let skip = session.git_commits.len().saturating_sub(RECENT_COMMITS);
        for commit in session.git_commits.iter().skip(skip) {
            lines.push(format!("- `{}`: {}", commit.hash, commit.message));
        }
        lines.push(String::new());
    }

    if !session.notes.is_empty() {
        lines.push(format!("## Session Notes ({})", session.notes.len()));
        let mut grouped: BTreeMap<NoteCategory, Vec<_>> = BTreeMap::new();
        for note in &session.notes {
            grouped.entry(note.category).or_default().push(note);
        }
        for (category, notes) in grouped {
            lines.push(format!("**{} Notes:**", category.title()));
            for note in notes {
                lines.push(format!("- [{}] {}", note.timestamp.format("%H:%M"), note.note));
                if let Some(file) = note.file_context.as_deref() {
                    lines.push(format!("  - Context: `{}`", file));
                }
            }
        }
        lines.push(String::new());
    }

    let decisions: Vec<_> = session.notes_in(NoteCategory::Decision).collect();
    if !decisions.is_empty() {
        lines.push("## Key Decisions".to_string());
        for note in decisions {
            lines.push(format!("- {}", note.note));
        }
        lines.push(String::new());
    }

    let problems: Vec<_> = session.notes_in(NoteCategory::Problem).collect();
    if !problems.is_empty() {
        lines.push("## Problems Encountered".to_string());
        for note in problems {
            lines.push(format!("- {}", note.note));
        }
        lines.push(String::new());
    }

    if !session.warnings.is_empty() {
        lines.push("## Warnings".to_string());
        for warning in &session.warnings {
            lines.push(format!("- {}", warning));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn per_file_totals(session: &Session) -> BTreeMap<&str, (usize, usize)> {
    let mut totals: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for change in &session.file_changes {
        let entry = totals.entry(change.path.as_str()).or_insert((0, 0));
        entry.0 += change.lines_added;
        entry.1 += change.lines_removed;
    }
    totals
}
