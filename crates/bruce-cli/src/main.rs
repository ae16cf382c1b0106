use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use bruce_core::clock::{Clock, SystemClock};
use bruce_core::config::{
    config_path, find_config_root, resolve_config_with_source, write_config, BruceConfig,
    ProjectLayout,
};
use bruce_core::context::{assemble, ContextDocument, FsContextResolver};
use bruce_core::relevance::{score_candidates, DEFAULT_LIMIT};
use bruce_core::session::{format_duration, NoteCategory, SessionSummary};
use bruce_core::store::{StoreError, TaskPatch, TaskStore};
use bruce_core::task::{Task, TaskStatus};
use bruce_core::tracker::{SessionTracker, TrackerSettings};

#[derive(Parser)]
#[command(name = "bruce", version, about = "Phase-file task tracking with work sessions")]
struct Cli {
    /// Project root (defaults to the nearest directory with a bruce config)
    #[arg(long, global = true, env = "BRUCE_ROOT", default_value = ".")]
    root: PathBuf,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a bruce.toml and create the task, phase and session directories
    Init {
        #[arg(long)]
        name: Option<String>,
        /// Overwrite an existing bruce.toml
        #[arg(long)]
        force: bool,
    },
    /// List tasks from the legacy file and every phase file
    List {
        #[arg(long)]
        phase: Option<i64>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Progress per phase
    Phases,
    /// Start a work session and write the task's context document
    Start {
        task_id: String,
        /// Skip writing the context document
        #[arg(long)]
        no_context: bool,
    },
    /// Report file changes since the last scan
    Scan { task_id: String },
    Pause { task_id: String },
    Resume { task_id: String },
    /// Attach a note to the active session
    Note {
        task_id: String,
        text: String,
        #[arg(long, default_value = "context")]
        category: String,
        /// File the note refers to
        #[arg(long)]
        file: Option<String>,
    },
    /// End the session, archive it and write the hand-off
    End {
        task_id: String,
        #[arg(long, default_value = "completed")]
        status: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Live status of a session
    Status { task_id: String },
    /// Completed sessions, newest first
    Sessions { task_id: Option<String> },
    /// Completed tasks related to a task
    Related {
        task_id: String,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Print the hand-off context for a task
    Context {
        task_id: String,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
    /// Set task fields: `bruce update T1 status=completed output="engine.rs"`
    Update {
        task_id: String,
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

struct App {
    config: BruceConfig,
    layout: ProjectLayout,
    store: TaskStore,
    tracker: SessionTracker,
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    if let Command::Init { name, force } = &command {
        return cmd_init(&cli.root, name.as_deref(), *force, cli.json);
    }

    let app = App::open(&cli.root, cli.json)?;
    match command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::List { phase, status } => app.cmd_list(phase, status.as_deref()),
        Command::Phases => app.cmd_phases(),
        Command::Start {
            task_id,
            no_context,
        } => app.cmd_start(&task_id, !no_context),
        Command::Scan { task_id } => app.cmd_scan(&task_id),
        Command::Pause { task_id } => app.cmd_toggle(&task_id, true),
        Command::Resume { task_id } => app.cmd_toggle(&task_id, false),
        Command::Note {
            task_id,
            text,
            category,
            file,
        } => app.cmd_note(&task_id, &text, &category, file),
        Command::End {
            task_id,
            status,
            note,
        } => app.cmd_end(&task_id, &status, note.as_deref()),
        Command::Status { task_id } => app.cmd_status(&task_id),
        Command::Sessions { task_id } => app.cmd_sessions(task_id.as_deref()),
        Command::Related { task_id, limit } => app.cmd_related(&task_id, limit),
        Command::Context { task_id, limit } => app.cmd_context(&task_id, limit),
        Command::Update {
            task_id,
            assignments,
        } => app.cmd_update(&task_id, &assignments),
    }
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_env("BRUCE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_root(root: &Path) -> PathBuf {
    find_config_root(root).unwrap_or_else(|| root.to_path_buf())
}

fn cmd_init(root: &Path, name: Option<&str>, force: bool, json: bool) -> Result<()> {
    fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
    let path = config_path(root);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = BruceConfig::default();
    if let Some(name) = name {
        config.project.name = name.to_string();
    }
    let written = write_config(root, &config).context("write config")?;
    let layout = ProjectLayout::new(root, &config.paths);
    for dir in [
        layout.phases_dir.clone(),
        layout.contexts_dir.clone(),
        layout.active_sessions_dir(),
        layout.completed_sessions_dir(),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if json {
        print_json(&json!({"ok": true, "config": written}))?;
    } else {
        println!("Initialized {}", written.display());
    }
    Ok(())
}

impl App {
    fn open(root: &Path, json: bool) -> Result<Self> {
        let root = resolve_root(root);
        let (config, source) = resolve_config_with_source(&root);
        tracing::debug!(root = %root.display(), source, "resolved config");
        let layout = ProjectLayout::new(&root, &config.paths);
        let store = TaskStore::from_layout(&layout);
        let tracker = SessionTracker::new(
            TrackerSettings::for_project(&layout, &config.tracking).without_monitor(),
        );
        let restored = tracker
            .restore_active_sessions()
            .context("restore active sessions")?;
        if !restored.is_empty() {
            tracing::debug!(sessions = ?restored, "restored sessions");
        }
        Ok(Self {
            config,
            layout,
            store,
            tracker,
            json,
        })
    }

    fn find_task(&self, task_id: &str) -> Result<Task> {
        match self.store.get(task_id) {
            Ok(task) => Ok(task),
            Err(StoreError::NotFound(_)) => bail!("Task '{}' not found", task_id),
            Err(err) => Err(err.into()),
        }
    }

    fn cmd_list(&self, phase: Option<i64>, status: Option<&str>) -> Result<()> {
        let status = match status {
            Some(raw) => Some(
                TaskStatus::parse(raw).ok_or_else(|| anyhow!("unknown status '{}'", raw))?,
            ),
            None => None,
        };
        let report = self.store.load();
        let tasks: Vec<&Task> = report
            .tasks
            .iter()
            .filter(|task| phase.map(|p| task.phase == p).unwrap_or(true))
            .filter(|task| status.map(|s| task.status == s).unwrap_or(true))
            .collect();
        if self.json {
            let issues: Vec<String> = report.issues.iter().map(|i| i.to_string()).collect();
            return print_json(&json!({
                "tasks": tasks.iter().map(|t| task_json(t)).collect::<Vec<_>>(),
                "issues": issues,
            }));
        }
        for issue in &report.issues {
            eprintln!("warning: {}", issue);
        }
        if tasks.is_empty() {
            println!("No tasks found.");
        }
        for task in tasks {
            println!("{}", task.summary_line());
        }
        Ok(())
    }

    fn cmd_phases(&self) -> Result<()> {
        let report = self.store.load();
        let progress = report.phase_progress();
        if self.json {
            return print_json(&json!({ "phases": progress }));
        }
        for (id, summary) in &progress {
            println!(
                "Phase {} | {} | {}/{} completed ({:.0}%) | {} in progress | {} blocked",
                id,
                summary.name,
                summary.completed,
                summary.total,
                summary.percentage,
                summary.in_progress,
                summary.blocked
            );
        }
        Ok(())
    }

    fn cmd_start(&self, task_id: &str, write_context: bool) -> Result<()> {
        let task = self.find_task(task_id)?;
        // Task bookkeeping lands before the baseline so the session does not see it.
        let timestamp = SystemClock.now().to_rfc3339();
        self.store
            .save_update(task_id, &TaskPatch::new().status(TaskStatus::InProgress))
            .context("mark task in progress")?;
        self.store
            .append_note(task_id, "Task started with session tracking", &timestamp)
            .context("record start note")?;
        let session = self.tracker.start(task_id).context("start session")?;

        let context_file = if write_context {
            let document = self.context_document(&task, DEFAULT_LIMIT);
            let path = self.layout.task_context_file(task.phase, &task.id);
            document
                .write_to(&path)
                .with_context(|| format!("write {}", path.display()))?;
            Some(path)
        } else {
            None
        };

        if self.json {
            return print_json(&json!({
                "task_id": task_id,
                "start_time": session.start_time,
                "baseline_files": session.baseline.len(),
                "context_file": context_file,
            }));
        }
        println!("Started {} at {}", task_id, session.start_time.format("%H:%M:%S"));
        println!("Baseline: {} files", session.baseline.len());
        if let Some(path) = context_file {
            println!("Context: {}", path.display());
        }
        Ok(())
    }

    fn cmd_scan(&self, task_id: &str) -> Result<()> {
        let changes = self.tracker.scan(task_id)?;
        if self.json {
            return print_json(&json!({ "task_id": task_id, "changes": changes }));
        }
        if changes.is_empty() {
            println!("No changes.");
        }
        for change in changes {
            println!(
                "{:<8} {} (+{}/-{})",
                change.kind.as_str(),
                change.path, change.lines_added, change.lines_removed
            );
        }
        Ok(())
    }

    fn cmd_toggle(&self, task_id: &str, pause: bool) -> Result<()> {
        let changed = if pause {
            self.tracker.pause(task_id)?
        } else {
            self.tracker.resume(task_id)?
        };
        let action = if pause { "paused" } else { "resumed" };
        if self.json {
            return print_json(&json!({
                "task_id": task_id,
                "action": action,
                "changed": changed,
            }));
        }
        if changed {
            println!("Session {} for {}", action, task_id);
        } else {
            let state = if pause { "running" } else { "paused" };
            println!("Nothing to do: session for {} was not {}", task_id, state);
        }
        Ok(())
    }

    fn cmd_note(
        &self,
        task_id: &str,
        text: &str,
        category: &str,
        file: Option<String>,
    ) -> Result<()> {
        let category = NoteCategory::parse(category);
        let recorded = self
            .tracker
            .add_note_with_file(task_id, text, category, file)?;
        if self.json {
            return print_json(&json!({
                "task_id": task_id,
                "recorded": recorded,
                "category": category,
            }));
        }
        if recorded {
            println!("Note recorded [{}]", category.as_str());
        } else {
            println!("No active session for {}; note not recorded", task_id);
        }
        Ok(())
    }

    fn cmd_end(&self, task_id: &str, status: &str, note: Option<&str>) -> Result<()> {
        let summary = self
            .tracker
            .end_with_note(task_id, status, note)
            .context("end session")?;
        if !summary.is_empty() {
            if let Some(task_status) = TaskStatus::parse(status) {
                let timestamp = summary
                    .metrics
                    .end_time
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default();
                let patch = TaskPatch::new()
                    .status(task_status)
                    .set("updated", timestamp);
                if let Err(err) = self.store.save_update(task_id, &patch) {
                    tracing::warn!(task = %task_id, error = %err, "session ended but task status not updated");
                }
            }
        }
        if self.json {
            return print_json(&serde_json::to_value(&summary)?);
        }
        print_summary(task_id, &summary);
        Ok(())
    }

    fn cmd_status(&self, task_id: &str) -> Result<()> {
        let status = self.tracker.status(task_id);
        if self.json {
            return print_json(&json!({ "task_id": task_id, "session": status }));
        }
        let Some(status) = status else {
            println!("No active session for {}", task_id);
            return Ok(());
        };
        println!(
            "{} | {} | active {} | paused {}",
            status.task_id,
            if status.paused { "paused" } else { "active" },
            format_duration(status.active_seconds),
            format_duration(status.paused_seconds)
        );
        println!(
            "Files changed: {} | Commits: {} | Notes: {}",
            status.files_changed, status.git_commits, status.notes
        );
        if let Some(memory) = status.current_memory_mb {
            println!("Memory: {:.1} MB (peak {:.1} MB)", memory, status.peak_memory_mb);
        }
        for warning in &status.warnings {
            println!("warning: {}", warning);
        }
        Ok(())
    }

    fn cmd_sessions(&self, task_id: Option<&str>) -> Result<()> {
        let entries = self.tracker.list_completed(task_id);
        if self.json {
            return print_json(&json!({ "sessions": entries }));
        }
        if entries.is_empty() {
            println!("No completed sessions.");
        }
        for entry in entries {
            println!(
                "{} | {} | {} | {} | {}",
                entry.task_id,
                entry.start_time.format("%Y-%m-%d %H:%M"),
                format_duration(entry.duration_seconds),
                entry.completion_status,
                entry.session_file
            );
        }
        Ok(())
    }

    fn cmd_related(&self, task_id: &str, limit: usize) -> Result<()> {
        let report = self.store.load();
        let target = report
            .find(task_id)
            .ok_or_else(|| anyhow!("Task '{}' not found", task_id))?;
        let related: Vec<_> = score_candidates(&report.tasks, target)
            .into_iter()
            .take(limit)
            .collect();
        if self.json {
            let items: Vec<Value> = related
                .iter()
                .map(|scored| json!({ "score": scored.score, "task": task_json(scored.task) }))
                .collect();
            return print_json(&json!({ "task_id": task_id, "related": items }));
        }
        if related.is_empty() {
            println!("No related completed tasks.");
        }
        for scored in related {
            println!("{:>3}  {}", scored.score, scored.task.summary_line());
        }
        Ok(())
    }

    fn cmd_context(&self, task_id: &str, limit: usize) -> Result<()> {
        let task = self.find_task(task_id)?;
        let document = self.context_document(&task, limit);
        if self.json {
            return print_json(&serde_json::to_value(&document)?);
        }
        println!("{}", document.render_markdown());
        Ok(())
    }

    fn cmd_update(&self, task_id: &str, assignments: &[String]) -> Result<()> {
        let mut patch = TaskPatch::new();
        for assignment in assignments {
            let (key, value) = TaskPatch::parse_assignment(assignment)
                .ok_or_else(|| anyhow!("expected key=value, got '{}'", assignment))?;
            if key == "status" {
                let raw = value.as_str().unwrap_or_default();
                let status = TaskStatus::parse(raw)
                    .ok_or_else(|| anyhow!("unknown status '{}'", raw))?;
                patch = patch.status(status);
            } else {
                patch.insert(key, value);
            }
        }
        let task = match self.store.save_update(task_id, &patch) {
            Err(StoreError::NotFound(_)) => bail!("Task '{}' not found", task_id),
            other => other?,
        };
        if self.json {
            return print_json(&task_json(&task));
        }
        println!("Updated {}", task.summary_line());
        Ok(())
    }

    fn context_document(&self, task: &Task, limit: usize) -> ContextDocument {
        let report = self.store.load();
        let resolver = FsContextResolver::for_layout(&self.layout);
        assemble(
            &self.layout,
            &report,
            task,
            self.tracker.task_summary(&task.id),
            &resolver,
            Some(self.config.project.name.clone()),
            limit,
        )
    }
}

fn task_json(task: &Task) -> Value {
    json!({
        "id": task.id,
        "description": task.description,
        "status": task.status.as_str(),
        "phase": task.phase,
        "phase_name": task.phase_name,
        "output": task.output,
        "context": task.context,
        "depends_on": task.depends_on,
        "acceptance_criteria": task.acceptance_criteria,
        "notes": task.notes,
        "updated": task.updated,
        "file": task.origin.as_ref().map(|origin| origin.file_name()),
    })
}

fn print_summary(task_id: &str, summary: &SessionSummary) {
    if summary.is_empty() {
        println!("No active session for {}", task_id);
        return;
    }
    let metrics = &summary.metrics;
    println!(
        "Ended {} ({}) after {}",
        summary.task_id,
        summary.completion_status,
        format_duration(metrics.duration_seconds)
    );
    println!(
        "Files: +{} ~{} -{} | Lines: +{} -{} | Commits: {} | Notes: {}",
        metrics.files_created,
        metrics.files_modified,
        metrics.files_deleted,
        metrics.total_lines_added,
        metrics.total_lines_removed,
        metrics.git_commits,
        metrics.notes_captured
    );
    if let Some(path) = &summary.history_file {
        println!("Session: {}", path.display());
    }
    if let Some(path) = &summary.handoff_file {
        println!("Hand-off: {}", path.display());
    }
    for warning in &summary.warnings {
        println!("warning: {}", warning);
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
