use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub author: String,
}

impl Default for ProjectInfo {
    fn default() -> Self {
        Self {
            name: "Bruce Project".to_string(),
            description: "AI-assisted project management".to_string(),
            kind: "general".to_string(),
            author: "Bruce User".to_string(),
        }
    }
}

/// Locations of task, phase, context and session data, relative to the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub tasks_file: String,
    pub phases_dir: String,
    pub contexts_dir: String,
    pub docs_dir: String,
    pub sessions_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tasks_file: "tasks.yaml".to_string(),
            phases_dir: "phases".to_string(),
            contexts_dir: "contexts".to_string(),
            docs_dir: "docs".to_string(),
            sessions_dir: "docs/sessions".to_string(),
        }
    }
}

/// Session monitoring settings.
///
/// `monitored_dirs` bounds the cost of every checksum walk; directories that do not exist
/// are skipped silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub monitored_dirs: Vec<String>,
    pub extensions: Vec<String>,
    pub text_extensions: Vec<String>,
    pub ignore: Vec<String>,
    pub scan_interval_secs: u64,
    pub git_timeout_secs: u64,
    pub monitor_join_timeout_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            monitored_dirs: to_strings(&[
                "src",
                "cli",
                "templates",
                "phases",
                "tests",
                "docs",
                "configs",
            ]),
            extensions: to_strings(&["py", "rs", "yaml", "yml", "md", "txt", "toml", "json"]),
            text_extensions: to_strings(&["py", "rs", "yaml", "yml", "md", "txt", "toml"]),
            ignore: to_strings(&[
                "__pycache__",
                ".git",
                "node_modules",
                "target",
                ".DS_Store",
                ".pytest_cache",
            ]),
            scan_interval_secs: 30,
            git_timeout_secs: 10,
            monitor_join_timeout_ms: 2000,
        }
    }
}

impl TrackingConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs.max(1))
    }

    pub fn monitor_join_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_join_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BruceConfig {
    pub project: ProjectInfo,
    pub paths: PathsConfig,
    pub tracking: TrackingConfig,
}

/// Absolute paths derived from a [`BruceConfig`] for one project root.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub tasks_file: PathBuf,
    pub phases_dir: PathBuf,
    pub contexts_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: &Path, paths: &PathsConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            tasks_file: root.join(&paths.tasks_file),
            phases_dir: root.join(&paths.phases_dir),
            contexts_dir: root.join(&paths.contexts_dir),
            docs_dir: root.join(&paths.docs_dir),
            sessions_dir: root.join(&paths.sessions_dir),
        }
    }

    pub fn active_sessions_dir(&self) -> PathBuf {
        self.sessions_dir.join("active")
    }

    pub fn completed_sessions_dir(&self) -> PathBuf {
        self.sessions_dir.join("completed")
    }

    pub fn phase_context_dir(&self, phase: i64) -> PathBuf {
        self.contexts_dir.join(format!("phase{}", phase))
    }

    pub fn task_context_file(&self, phase: i64, task_id: &str) -> PathBuf {
        self.phase_context_dir(phase)
            .join(format!("context_{}.md", task_id))
    }

    pub fn monitored_roots(&self, tracking: &TrackingConfig) -> Vec<PathBuf> {
        tracking
            .monitored_dirs
            .iter()
            .map(|dir| self.root.join(dir))
            .collect()
    }
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    ["bruce.toml", ".bruce/config.toml"]
}

pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join("bruce.toml")
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        let trimmed = profile.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    None
}

pub fn resolve_bruce_home_dir() -> Option<PathBuf> {
    if let Ok(value) = std::env::var("BRUCE_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    resolve_user_home_dir().map(|home| home.join(".bruce"))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_bruce_home_dir().map(|home| home.join("config.toml"))
}

pub fn find_config_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    for candidate in start.ancestors() {
        for name in config_filename_candidates() {
            if candidate.join(name).is_file() {
                return Some(candidate.to_path_buf());
            }
        }
    }
    None
}

fn read_config_file(path: &Path) -> Option<BruceConfig> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unable to read config");
            return None;
        }
    };
    match toml::from_str::<BruceConfig>(&text) {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "invalid config, using defaults");
            None
        }
    }
}

pub fn load_config(project_root: &Path) -> Option<BruceConfig> {
    for name in config_filename_candidates() {
        let path = project_root.join(name);
        if path.is_file() {
            if let Some(config) = read_config_file(&path) {
                return Some(config);
            }
        }
    }
    None
}

pub fn load_global_config() -> Option<BruceConfig> {
    let path = global_config_path()?;
    if !path.is_file() {
        return None;
    }
    read_config_file(&path)
}

/// Project config, then global config, then built-in defaults.
pub fn resolve_config_with_source(project_root: &Path) -> (BruceConfig, &'static str) {
    if let Some(config) = load_config(project_root) {
        return (config, "project");
    }
    if let Some(config) = load_global_config() {
        return (config, "global");
    }
    (BruceConfig::default(), "default")
}

pub fn resolve_config(project_root: &Path) -> BruceConfig {
    resolve_config_with_source(project_root).0
}

pub fn write_config(project_root: &Path, config: &BruceConfig) -> Result<PathBuf, ConfigError> {
    let path = config_path(project_root);
    let body = toml::to_string_pretty(config)?;
    fs::write(&path, body)?;
    Ok(path)
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use tempfile::TempDir;

    fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
        let _guard = crate::test_env::lock();
        f()
    }

    struct EnvGuard {
        bruce_home: Option<OsString>,
    }

    impl EnvGuard {
        fn capture() -> Self {
            Self {
                bruce_home: std::env::var_os("BRUCE_HOME"),
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = self.bruce_home.as_ref() {
                std::env::set_var("BRUCE_HOME", value);
            } else {
                std::env::remove_var("BRUCE_HOME");
            }
        }
    }

    #[test]
    fn write_and_read_config() {
        let temp = TempDir::new().expect("tempdir");
        let mut config = BruceConfig::default();
        config.project.name = "Trading".to_string();
        config.tracking.monitored_dirs = vec!["engine".to_string()];
        write_config(temp.path(), &config).expect("write config");
        let loaded = load_config(temp.path()).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(
            temp.path().join("bruce.toml"),
            "[project]\nname = \"Alpha\"\n\n[tracking]\nscan_interval_secs = 5\n",
        )
        .expect("write");
        let loaded = load_config(temp.path()).expect("load config");
        assert_eq!(loaded.project.name, "Alpha");
        assert_eq!(loaded.project.kind, "general");
        assert_eq!(loaded.tracking.scan_interval_secs, 5);
        assert_eq!(loaded.paths.tasks_file, "tasks.yaml");
    }

    #[test]
    fn invalid_config_is_ignored() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join("bruce.toml"), "project = [").expect("write");
        assert!(load_config(temp.path()).is_none());
    }

    #[test]
    fn dot_bruce_directory_is_a_candidate() {
        let temp = TempDir::new().expect("tempdir");
        fs::create_dir_all(temp.path().join(".bruce")).expect("dir");
        fs::write(
            temp.path().join(".bruce").join("config.toml"),
            "[paths]\nphases_dir = \"plan\"\n",
        )
        .expect("write");
        let loaded = load_config(temp.path()).expect("load config");
        assert_eq!(loaded.paths.phases_dir, "plan");
        assert!(find_config_root(temp.path()).is_some());
    }

    #[test]
    fn layout_resolves_against_root() {
        let root = Path::new("/work/project");
        let layout = ProjectLayout::new(root, &PathsConfig::default());
        assert_eq!(layout.tasks_file, root.join("tasks.yaml"));
        assert_eq!(
            layout.task_context_file(2, "t-9"),
            root.join("contexts").join("phase2").join("context_t-9.md")
        );
        assert_eq!(
            layout.completed_sessions_dir(),
            root.join("docs").join("sessions").join("completed")
        );
    }

    #[test]
    fn resolve_config_prefers_project_over_global_then_default() {
        with_env_lock(|| {
            let _env = EnvGuard::capture();
            let repo = TempDir::new().expect("repo tempdir");
            let home = TempDir::new().expect("home tempdir");
            std::env::set_var("BRUCE_HOME", home.path());

            let (config, source) = resolve_config_with_source(repo.path());
            assert_eq!(config, BruceConfig::default());
            assert_eq!(source, "default");

            fs::write(
                home.path().join("config.toml"),
                "[project]\nname = \"Global\"\n",
            )
            .expect("global config");
            let (config, source) = resolve_config_with_source(repo.path());
            assert_eq!(config.project.name, "Global");
            assert_eq!(source, "global");

            fs::write(
                repo.path().join("bruce.toml"),
                "[project]\nname = \"Local\"\n",
            )
            .expect("project config");
            let (config, source) = resolve_config_with_source(repo.path());
            assert_eq!(config.project.name, "Local");
            assert_eq!(source, "project");
        });
    }
}
