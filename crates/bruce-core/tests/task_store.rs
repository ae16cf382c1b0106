use std::fs;
use std::sync::Arc;
use std::thread;

use bruce_core::store::{LoadIssue, StoreError, TaskPatch, TaskStore};
use bruce_core::task::{TaskStatus, LEGACY_PHASE_ID};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn store(temp: &TempDir) -> TaskStore {
    let phases = temp.path().join("phases");
    fs::create_dir_all(&phases).expect("phases dir");
    TaskStore::new(temp.path().join("tasks.yaml"), phases)
}

#[test]
fn legacy_and_phase_files_merge_into_one_view() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    fs::write(
        store.tasks_file(),
        "tasks:\n  - id: t1\n    description: bootstrap repo\n    status: completed\n",
    )
    .expect("legacy");
    fs::write(
        store.phases_dir().join("phase1_core.yaml"),
        "phase:\n  id: 1\n  name: Core\ntasks:\n  - id: t2\n    description: parse config\n    status: pending\n    depends_on: [t1]\n",
    )
    .expect("phase");

    let report = store.load();
    assert!(report.issues.is_empty());
    assert_eq!(
        report.tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
        vec!["t1", "t2"]
    );
    let t1 = report.find("t1").expect("t1");
    assert_eq!(t1.phase, LEGACY_PHASE_ID);
    let t2 = report.find("t2").expect("t2");
    assert_eq!(t2.phase, 1);
    assert_eq!(t2.phase_name, "Core");
    assert_eq!(t2.depends_on, vec!["t1".to_string()]);

    let progress = report.phase_progress();
    assert_eq!(progress[&0].total, 1);
    assert_eq!(progress[&0].completed, 1);
    assert_eq!(progress[&0].percentage, 100.0);
    assert_eq!(progress[&1].total, 1);
    assert_eq!(progress[&1].pending, 1);
    assert_eq!(progress[&1].percentage, 0.0);
}

#[test]
fn phase_without_tasks_reports_zero_percent() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    fs::write(
        store.phases_dir().join("phase2_empty.yaml"),
        "phase:\n  id: 2\n  name: Empty\ntasks: []\n",
    )
    .expect("phase");
    let progress = store.phase_progress();
    let empty = &progress[&2];
    assert_eq!(empty.name, "Empty");
    assert_eq!(empty.total, 0);
    assert_eq!(empty.percentage, 0.0);
}

#[test]
fn update_keeps_siblings_and_unknown_keys() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let path = store.phases_dir().join("phase1_core.yaml");
    fs::write(
        &path,
        "phase:\n  id: 1\n  name: Core\n  owner: infra\ntasks:\n  - id: a\n    status: pending\n    estimate: 3\n  - id: b\n    status: pending\n",
    )
    .expect("phase");

    let updated = store
        .save_update("a", &TaskPatch::new().status(TaskStatus::Completed).set("output", "src/a.rs"))
        .expect("update");
    assert_eq!(updated.status, TaskStatus::Completed);
    assert_eq!(updated.output.as_deref(), Some("src/a.rs"));

    let text = fs::read_to_string(&path).expect("read");
    assert!(text.contains("owner: infra"));
    assert!(text.contains("estimate: 3"));
    assert!(!text.contains("phase_name"));

    let report = store.load();
    assert_eq!(report.find("b").map(|t| t.status), Some(TaskStatus::Pending));
    assert_eq!(report.find("a").map(|t| t.status), Some(TaskStatus::Completed));
    assert_eq!(
        report
            .find("a")
            .and_then(|t| t.extra.get("estimate").and_then(|v| v.as_i64())),
        Some(3)
    );
}

#[test]
fn duplicate_ids_keep_first_and_report_the_rest() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    fs::write(
        store.tasks_file(),
        "tasks:\n  - id: dup\n    description: legacy copy\n",
    )
    .expect("legacy");
    fs::write(
        store.phases_dir().join("phase1_core.yaml"),
        "phase:\n  id: 1\n  name: Core\ntasks:\n  - id: dup\n    description: phase copy\n",
    )
    .expect("phase");

    let report = store.load();
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].description, "legacy copy");
    assert!(matches!(report.issues.as_slice(), [LoadIssue::DuplicateId { .. }]));
    assert!(report.strict().is_err());
}

#[test]
fn malformed_phase_file_does_not_hide_other_phases() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    fs::write(store.phases_dir().join("phase1_bad.yaml"), "tasks: [unclosed\n").expect("bad");
    fs::write(
        store.phases_dir().join("phase2_ok.yaml"),
        "phase:\n  id: 2\n  name: Ok\ntasks:\n  - id: ok\n",
    )
    .expect("ok");
    let report = store.load();
    assert_eq!(report.issues.len(), 1);
    assert!(report.issues[0].path().ends_with("phase1_bad.yaml"));
    assert!(report.find("ok").is_some());
}

#[test]
fn concurrent_updates_to_one_file_are_all_kept() {
    let temp = TempDir::new().expect("tempdir");
    let store = Arc::new(store(&temp));
    let mut body = String::from("phase:\n  id: 1\n  name: Core\ntasks:\n");
    for i in 0..8 {
        body.push_str(&format!("  - id: c{}\n    status: pending\n", i));
    }
    fs::write(store.phases_dir().join("phase1_core.yaml"), body).expect("phase");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .save_update(
                        &format!("c{}", i),
                        &TaskPatch::new().status(TaskStatus::Completed),
                    )
                    .expect("update");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    let report = store.load();
    assert!(report
        .tasks
        .iter()
        .all(|task| task.status == TaskStatus::Completed));
    assert_eq!(report.tasks.len(), 8);
}

#[test]
fn unknown_task_update_is_not_found() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let err = store
        .save_update("ghost", &TaskPatch::new().set("output", "x"))
        .expect_err("missing");
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn notes_are_appended_with_timestamp() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    fs::write(store.tasks_file(), "tasks:\n  - id: n1\n").expect("legacy");
    store
        .append_note("n1", "first", "2026-06-01T09:00:00+00:00")
        .expect("note");
    let task = store
        .append_note("n1", "second", "2026-06-01T10:00:00+00:00")
        .expect("note");
    assert_eq!(
        task.notes.iter().map(|n| n.note.as_str()).collect::<Vec<_>>(),
        vec!["first", "second"]
    );
}

#[test]
fn rejected_update_leaves_task_on_disk() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let original = "tasks:\n  - id: t1\n    description: first\n  - id: t2\n    description: second\n";
    fs::write(store.tasks_file(), original).expect("legacy");

    let err = store
        .save_update("t1", &TaskPatch::new().set("phase", "abc"))
        .expect_err("invalid phase");
    assert!(matches!(err, StoreError::InvalidUpdate { ref task_id, .. } if task_id == "t1"));
    assert_eq!(fs::read_to_string(store.tasks_file()).expect("read"), original);

    let report = store.load();
    assert!(report.issues.is_empty());
    assert_eq!(
        report.tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
        vec!["t1", "t2"]
    );
}

#[test]
fn read_only_origin_fails_with_write_error_and_stays_intact() {
    let temp = TempDir::new().expect("tempdir");
    let store = store(&temp);
    let original = "tasks:\n  - id: r1\n    status: pending\n";
    fs::write(store.tasks_file(), original).expect("legacy");
    let mut permissions = fs::metadata(store.tasks_file()).expect("meta").permissions();
    permissions.set_readonly(true);
    fs::set_permissions(store.tasks_file(), permissions).expect("read-only");

    let err = store
        .save_update("r1", &TaskPatch::new().status(TaskStatus::Completed))
        .expect_err("read-only");
    assert!(matches!(err, StoreError::Write { .. }));
    assert_eq!(fs::read_to_string(store.tasks_file()).expect("read"), original);
    assert_eq!(
        store.load().find("r1").map(|t| t.status),
        Some(TaskStatus::Pending)
    );
}

#[test]
fn separate_store_handles_serialize_through_the_file_lock() {
    let temp = TempDir::new().expect("tempdir");
    let path = {
        let store = store(&temp);
        let mut body = String::from("tasks:\n");
        for i in 0..6 {
            body.push_str(&format!("  - id: s{}\n    status: pending\n", i));
        }
        fs::write(store.tasks_file(), body).expect("legacy");
        store.tasks_file().to_path_buf()
    };

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = TaskStore::new(path.clone(), temp.path().join("phases"));
            thread::spawn(move || {
                store
                    .save_update(&format!("s{}", i), &TaskPatch::new().status(TaskStatus::Blocked))
                    .expect("update");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    let report = store(&temp).load();
    assert_eq!(report.tasks.len(), 6);
    assert!(report.tasks.iter().all(|task| task.status == TaskStatus::Blocked));
    let leftovers: Vec<String> = fs::read_dir(temp.path())
        .expect("dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}
