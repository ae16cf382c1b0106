//! Version-control adapter. Only "commits since a timestamp" is needed.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::GitCommit;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git executable not found")]
    Unavailable,
    #[error("git timed out after {0:?}")]
    Timeout(Duration),
    #[error("git failed: {0}")]
    Failed(String),
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

pub trait VcsAdapter: Send + Sync {
    /// Commits authored after `since`, newest first. A directory that is not a repository
    /// yields an empty list.
    fn commits_since(&self, since: DateTime<Utc>) -> Result<Vec<GitCommit>, VcsError>;
}

/// Adapter for projects without version control.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVcs;

impl VcsAdapter for NoVcs {
    fn commits_since(&self, _since: DateTime<Utc>) -> Result<Vec<GitCommit>, VcsError> {
        Ok(Vec::new())
    }
}

/// Runs the `git` binary under `repo_root` with a hard timeout.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn run(&self, args: &[String]) -> Result<String, VcsError> {
        let binary = which::which("git").map_err(|_| VcsError::Unavailable)?;
        let mut child = Command::new(binary)
            .arg("-C")
            .arg(&self.repo_root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(VcsError::Timeout(self.timeout));
                }
                None => thread::sleep(Duration::from_millis(20)),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        if status.success() {
            Ok(stdout)
        } else {
            Err(VcsError::Failed(stderr.trim().to_string()))
        }
    }
}

impl VcsAdapter for GitCli {
    fn commits_since(&self, since: DateTime<Utc>) -> Result<Vec<GitCommit>, VcsError> {
        let args = vec![
            "log".to_string(),
            "--format=%h%x09%s".to_string(),
            format!("--since={}", since.to_rfc3339()),
        ];
        match self.run(&args) {
            Ok(stdout) => Ok(parse_log(&stdout)),
            Err(VcsError::Failed(message)) if is_not_a_repository(&message) => {
                tracing::debug!(root = %self.repo_root.display(), "not a git repository");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

fn is_not_a_repository(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not a git repository")
        || lower.contains("does not have any commits yet")
        || lower.contains("bad default revision")
}

/// Parses `<hash>\t<subject>` lines.
pub fn parse_log(output: &str) -> Vec<GitCommit> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            if line.is_empty() {
                return None;
            }
            let (hash, message) = line.split_once('\t').unwrap_or((line, ""));
            let hash = hash.trim();
            if hash.is_empty() {
                return None;
            }
            Some(GitCommit {
                hash: hash.to_string(),
                message: message.trim().to_string(),
            })
        })
        .collect()
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_log_splits_hash_and_subject() {
        let commits = parse_log("abc123\tAdd engine\n\ndef456\tFix: tabs\tinside\nfff\n");
        assert_eq!(
            commits,
            vec![
                GitCommit {
                    hash: "abc123".into(),
                    message: "Add engine".into()
                },
                GitCommit {
                    hash: "def456".into(),
                    message: "Fix: tabs\tinside".into()
                },
                GitCommit {
                    hash: "fff".into(),
                    message: String::new()
                },
            ]
        );
    }

    #[test]
    fn not_a_repository_is_empty_not_error() {
        let temp = tempfile::TempDir::new().expect("tempdir");
        let git = GitCli::new(temp.path(), Duration::from_secs(5));
        match git.commits_since(Utc::now()) {
            Ok(commits) => assert!(commits.is_empty()),
            // No git binary on this machine.
            Err(VcsError::Unavailable) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_vcs_reports_nothing() {
        assert!(NoVcs.commits_since(Utc::now()).expect("ok").is_empty());
    }
}
