use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const PHASE_FILE: &str = "phase:
  id: 1
  name: Core
tasks:
  - id: A
    description: design task schema
    status: completed
  - id: B
    description: implement task schema loader
    status: pending
    depends_on: [A]
";

struct Project {
    root: TempDir,
    home: TempDir,
}

impl Project {
    fn new() -> Self {
        let project = Self {
            root: TempDir::new().expect("root"),
            home: TempDir::new().expect("home"),
        };
        let init = project.run(&["init", "--name", "Demo"]);
        assert!(init.status.success(), "init failed: {}", stderr(&init));
        std::fs::write(
            project.path().join("phases/phase1_core.yaml"),
            PHASE_FILE,
        )
        .expect("phase file");
        project
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_bruce"))
            .env("BRUCE_HOME", self.home.path())
            .env_remove("BRUCE_ROOT")
            .arg("--root")
            .arg(self.root.path())
            .args(args)
            .output()
            .expect("run bruce")
    }

    fn json(&self, args: &[&str]) -> Value {
        let mut full = args.to_vec();
        full.push("--json");
        let output = self.run(&full);
        assert!(
            output.status.success(),
            "{:?} failed: {}",
            args,
            stderr(&output)
        );
        serde_json::from_slice(&output.stdout).expect("json")
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn ids(tasks: &Value) -> Vec<String> {
    tasks
        .as_array()
        .expect("array")
        .iter()
        .map(|task| task["id"].as_str().expect("id").to_string())
        .collect()
}

#[test]
fn init_writes_config_and_directories() {
    let project = Project::new();
    assert!(project.path().join("bruce.toml").is_file());
    assert!(project.path().join("phases").is_dir());
    assert!(project.path().join("docs/sessions/active").is_dir());

    let again = project.run(&["init"]);
    assert!(!again.status.success());
}

#[test]
fn list_filters_by_phase_and_status() {
    let project = Project::new();
    let all = project.json(&["list"]);
    assert_eq!(ids(&all["tasks"]), vec!["A", "B"]);
    assert_eq!(all["tasks"][1]["phase_name"], "Core");
    assert_eq!(all["tasks"][1]["file"], "phase1_core.yaml");

    let pending = project.json(&["list", "--status", "pending"]);
    assert_eq!(ids(&pending["tasks"]), vec!["B"]);
    let legacy = project.json(&["list", "--phase", "0"]);
    assert!(legacy["tasks"].as_array().expect("array").is_empty());

    let phases = project.json(&["phases"]);
    assert_eq!(phases["phases"]["1"]["total"], 2);
    assert_eq!(phases["phases"]["1"]["completed"], 1);
}

#[test]
fn session_lifecycle_across_invocations() {
    let project = Project::new();

    let started = project.json(&["start", "B"]);
    let context_file = started["context_file"].as_str().expect("context file");
    let context = std::fs::read_to_string(context_file).expect("context");
    assert!(context.contains("# Context for Task: B"));
    assert!(context.contains("### A: design task schema"));

    let listed = project.json(&["list", "--status", "in-progress"]);
    assert_eq!(ids(&listed["tasks"]), vec!["B"]);

    std::fs::create_dir_all(project.path().join("src")).expect("src");
    std::fs::write(project.path().join("src/loader.rs"), "fn load() {}\n").expect("write");
    let scanned = project.json(&["scan", "B"]);
    let paths: Vec<&str> = scanned["changes"]
        .as_array()
        .expect("changes")
        .iter()
        .filter_map(|change| change["path"].as_str())
        .collect();
    assert_eq!(paths, vec!["src/loader.rs"]);

    let note = project.json(&[
        "note",
        "B",
        "Decision: parse phases lazily",
        "--category",
        "decision",
    ]);
    assert_eq!(note["recorded"], true);

    let paused = project.json(&["pause", "B"]);
    assert_eq!(paused["changed"], true);
    let status = project.json(&["status", "B"]);
    assert_eq!(status["session"]["paused"], true);

    let ended = project.json(&["end", "B", "--note", "loader done"]);
    assert_eq!(ended["task_id"], "B");
    assert_eq!(ended["completion_status"], "completed");
    assert_eq!(ended["metrics"]["files_created"], 1);
    assert_eq!(ended["metrics"]["files_modified"], 0);
    assert_eq!(ended["notes"].as_array().expect("notes").len(), 2);
    let handoff = ended["handoff_file"].as_str().expect("handoff");
    assert!(Path::new(handoff).is_file());

    let done = project.json(&["list", "--status", "completed"]);
    assert_eq!(ids(&done["tasks"]), vec!["A", "B"]);

    let sessions = project.json(&["sessions", "B"]);
    assert_eq!(sessions["sessions"].as_array().expect("sessions").len(), 1);

    let again = project.json(&["end", "B"]);
    assert_eq!(again["task_id"], "");
    let idle = project.json(&["status", "B"]);
    assert!(idle["session"].is_null());
}

#[test]
fn update_and_related_report_task_fields() {
    let project = Project::new();
    let updated = project.json(&["update", "B", "output=src/loader.rs", "status=blocked"]);
    assert_eq!(updated["output"], "src/loader.rs");
    assert_eq!(updated["status"], "blocked");

    let related = project.json(&["related", "B"]);
    let items = related["related"].as_array().expect("related");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["task"]["id"], "A");
    // same phase, shared "task" and "schema", direct dependency
    assert_eq!(items[0]["score"], 10 + 4 + 15);

    let missing = project.run(&["update", "ghost", "output=x"]);
    assert!(!missing.status.success());
    assert!(stderr(&missing).contains("ghost"));

    let bad_status = project.run(&["update", "B", "status=someday"]);
    assert!(!bad_status.status.success());
}

#[test]
fn commands_on_idle_task_are_harmless() {
    let project = Project::new();
    let note = project.json(&["note", "A", "just a thought"]);
    assert_eq!(note["recorded"], false);
    let paused = project.json(&["pause", "A"]);
    assert_eq!(paused["changed"], false);
    let scan = project.run(&["scan", "A"]);
    assert!(!scan.status.success());
}
