//! Hand-off context for a task: metadata, past sessions, related work and decisions.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;

use crate::config::ProjectLayout;
use crate::decisions::decisions_for_task;
use crate::history::TaskSessionSummary;
use crate::relevance::find_related;
use crate::session::format_duration;
use crate::store::LoadReport;
use crate::task::Task;

pub const RELATED_DECISIONS: usize = 2;
pub const PHASE_DECISIONS: usize = 5;

/// Turns a task's context reference (`path` or `path#symbol`) into text.
pub trait ContextResolver {
    fn resolve(&self, reference: &str) -> Option<String>;
}

/// Looks a reference up under the project root, the docs dir, `src/`, then as given.
#[derive(Debug, Clone)]
pub struct FsContextResolver {
    root: PathBuf,
    docs_dir: PathBuf,
}

impl FsContextResolver {
    pub fn new(root: impl Into<PathBuf>, docs_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            docs_dir: docs_dir.into(),
        }
    }

    pub fn for_layout(layout: &ProjectLayout) -> Self {
        Self::new(&layout.root, &layout.docs_dir)
    }

    fn candidates(&self, path: &str) -> [PathBuf; 4] {
        [
            self.root.join(path),
            self.docs_dir.join(path),
            self.root.join("src").join(path),
            PathBuf::from(path),
        ]
    }
}

impl ContextResolver for FsContextResolver {
    fn resolve(&self, reference: &str) -> Option<String> {
        let (path, symbol) = match reference.split_once('#') {
            Some((path, symbol)) => (path, Some(symbol)),
            None => (reference, None),
        };
        let found = self
            .candidates(path)
            .into_iter()
            .find(|candidate| candidate.is_file())?;
        let content = match fs::read_to_string(&found) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(file = %found.display(), error = %err, "failed to read context file");
                return None;
            }
        };
        match symbol.filter(|s| !s.trim().is_empty()) {
            Some(symbol) => Some(extract_symbol(&content, symbol.trim()).unwrap_or(content)),
            None => Some(content),
        }
    }
}

/// The block that defines `symbol` (`def`, `class`, `fn`, `struct`, `enum`, `trait`, `impl`).
///
/// The block ends at the next non-blank line indented no deeper than the definition; a
/// closing brace at that level is kept.
pub fn extract_symbol(content: &str, symbol: &str) -> Option<String> {
    let pattern = format!(
        r"\b(def|class|fn|struct|enum|trait|impl)\s+{}\b",
        regex::escape(symbol)
    );
    let re = Regex::new(&pattern).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.iter().position(|line| re.is_match(line))?;
    let base_indent = indent_of(lines[start]);

    let mut block = vec![lines[start]];
    for line in &lines[start + 1..] {
        if line.trim().is_empty() {
            block.push(line);
            continue;
        }
        if indent_of(line) <= base_indent {
            let trimmed = line.trim_start();
            if trimmed.starts_with('}') || trimmed.starts_with(')') {
                block.push(line);
            }
            break;
        }
        block.push(line);
    }
    while block.last().map(|line| line.trim().is_empty()).unwrap_or(false) {
        block.pop();
    }
    Some(block.join("\n"))
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextFile {
    pub reference: String,
    /// `None` when no candidate location had the file.
    pub content: Option<String>,
}

pub fn resolve_context_files(resolver: &dyn ContextResolver, references: &[String]) -> Vec<ContextFile> {
    references
        .iter()
        .map(|reference| {
            let content = resolver.resolve(reference);
            if content.is_none() {
                tracing::warn!(reference = %reference, "context file not found");
            }
            ContextFile {
                reference: reference.clone(),
                content,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskBlock {
    pub id: String,
    pub description: String,
    pub status: String,
    pub phase: i64,
    pub phase_name: String,
    pub output: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub depends_on: Vec<String>,
}

impl TaskBlock {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            status: task.status.to_string(),
            phase: task.phase,
            phase_name: task.phase_name.clone(),
            output: task.output.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            depends_on: task.depends_on.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedTask {
    pub id: String,
    pub description: String,
    pub status: String,
    pub output: Option<String>,
    pub decisions: Vec<String>,
}

impl RelatedTask {
    pub fn new(task: &Task, decisions: Vec<String>) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            status: task.status.to_string(),
            output: task.output.clone(),
            decisions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseDecision {
    pub task_id: String,
    pub text: String,
}

/// Everything `build` composes. Gathering it is the caller's job.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs {
    pub project_name: Option<String>,
    pub related: Vec<RelatedTask>,
    pub sessions: TaskSessionSummary,
    pub phase_decisions: Vec<PhaseDecision>,
    pub context_files: Vec<ContextFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextDocument {
    pub project_name: Option<String>,
    pub task: TaskBlock,
    /// Omitted when the task has no recorded sessions.
    pub sessions: Option<TaskSessionSummary>,
    pub related: Vec<RelatedTask>,
    pub phase_decisions: Vec<PhaseDecision>,
    pub context_files: Vec<ContextFile>,
}

/// Composes the document. No I/O.
pub fn build(task: &Task, inputs: ContextInputs) -> ContextDocument {
    let related = inputs
        .related
        .into_iter()
        .map(|mut related| {
            related.decisions.truncate(RELATED_DECISIONS);
            related
        })
        .collect();
    let mut phase_decisions = inputs.phase_decisions;
    phase_decisions.truncate(PHASE_DECISIONS);
    ContextDocument {
        project_name: inputs.project_name,
        task: TaskBlock::from_task(task),
        sessions: Some(inputs.sessions).filter(|summary| summary.total_sessions > 0),
        related,
        phase_decisions,
        context_files: inputs.context_files,
    }
}

/// Gathers inputs from the loaded tasks, session history and context notes, then builds.
pub fn assemble(
    layout: &ProjectLayout,
    report: &LoadReport,
    task: &Task,
    sessions: TaskSessionSummary,
    resolver: &dyn ContextResolver,
    project_name: Option<String>,
    related_limit: usize,
) -> ContextDocument {
    let related = find_related(&report.tasks, &task.id, related_limit)
        .into_iter()
        .map(|related| RelatedTask::new(related, decisions_for_task(layout, related)))
        .collect();
    let phase_decisions = report
        .tasks
        .iter()
        .filter(|other| other.phase == task.phase && other.is_completed())
        .flat_map(|other| {
            decisions_for_task(layout, other)
                .into_iter()
                .map(move |text| PhaseDecision {
                    task_id: other.id.clone(),
                    text,
                })
        })
        .take(PHASE_DECISIONS)
        .collect();
    let context_files = resolve_context_files(resolver, &task.context);
    build(
        task,
        ContextInputs {
            project_name,
            related,
            sessions,
            phase_decisions,
            context_files,
        },
    )
}

impl ContextDocument {
    pub fn render_markdown(&self) -> String {
        let task = &self.task;
        let mut lines = Vec::new();
        lines.push(format!("# Context for Task: {}", task.id));
        lines.push(String::new());
        if let Some(name) = self.project_name.as_deref() {
            lines.push(format!("**Project:** {}", name));
        }
        lines.push(format!("**Phase:** {} - {}", task.phase, task.phase_name));
        lines.push(format!("**Status:** {}", task.status));
        lines.push(format!("**Description:** {}", task.description));
        lines.push(format!(
            "**Expected Output:** {}",
            task.output.as_deref().unwrap_or("Not specified")
        ));
        lines.push(String::new());
        if !task.acceptance_criteria.is_empty() {
            lines.push("**Acceptance Criteria:**".to_string());
            for criterion in &task.acceptance_criteria {
                lines.push(format!("- {}", criterion));
            }
            lines.push(String::new());
        }
        if !task.depends_on.is_empty() {
            lines.push(format!("**Dependencies:** {}", task.depends_on.join(", ")));
            lines.push(String::new());
        }

        if let Some(sessions) = &self.sessions {
            lines.push("## Previous Work Sessions".to_string());
            lines.push(String::new());
            lines.push(format!("**Total Sessions:** {}", sessions.total_sessions));
            lines.push(format!(
                "**Total Time Spent:** {}",
                format_duration(sessions.total_duration_seconds)
            ));
            lines.push(format!(
                "**Files Modified:** {}",
                sessions.total_files_modified()
            ));
            lines.push(format!("**Commits Made:** {}", sessions.total_commits));
            if let Some(last) = &sessions.last_session {
                lines.push(String::new());
                lines.push("**Last Session:**".to_string());
                lines.push(format!(
                    "- Started: {}",
                    last.start_time.format("%Y-%m-%d %H:%M:%S")
                ));
                if last.end_time.is_some() {
                    lines.push(format!(
                        "- Duration: {}",
                        format_duration(last.duration_seconds)
                    ));
                }
            }
            lines.push(String::new());
        }

        if !self.related.is_empty() {
            lines.push("## Related Completed Tasks".to_string());
            lines.push(String::new());
            for related in &self.related {
                lines.push(format!("### {}: {}", related.id, related.description));
                lines.push(format!(
                    "- **Output:** {}",
                    related.output.as_deref().unwrap_or("Not specified")
                ));
                lines.push(format!("- **Status:** {}", related.status));
                if !related.decisions.is_empty() {
                    lines.push("- **Key Decisions:**".to_string());
                    for decision in &related.decisions {
                        lines.push(format!("  - {}", decision));
                    }
                }
                lines.push(String::new());
            }
        }

        lines.push("## Decision History".to_string());
        lines.push(String::new());
        if self.phase_decisions.is_empty() {
            lines.push("- No previous decisions found in this phase".to_string());
        } else {
            for decision in &self.phase_decisions {
                lines.push(format!("- **{}:** {}", decision.task_id, decision.text));
            }
        }
        lines.push(String::new());

        lines.push("## Context Documentation".to_string());
        lines.push(String::new());
        if self.context_files.is_empty() {
            lines.push("No additional context files specified.".to_string());
        }
        for file in &self.context_files {
            match &file.content {
                Some(content) => {
                    lines.push(format!("=== {} ===", file.reference));
                    lines.push(content.trim_end().to_string());
                }
                None => lines.push(format!("=== {} (NOT FOUND) ===", file.reference)),
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    /// Writes the rendered document to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render_markdown())
    }
}
