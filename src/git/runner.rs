//! The one place that spawns git
//!
//! Everything else talks to [`GitRunner`]. The CLI implementation runs
//! non-interactively (`GIT_EDITOR=true`, no terminal prompts, C locale for
//! stable messages) and kills the child when the timeout fires.

use crate::error::GitError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

/// Captured output of a successful git invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }

    /// NUL-separated paths from a `-z` listing, kept verbatim
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.stdout.split('\0').filter(|p| !p.is_empty())
    }
}

/// Runs git commands in one repository
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>`; a non-zero exit is `GitError::Failed`
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError>;

    fn repo_root(&self) -> &Path;
}

/// Runs the `git` executable
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
    program: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            program: PathBuf::from("git"),
        }
    }

    /// Use a specific git binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl GitRunner for GitCli {
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        let command = args.join(" ");
        debug!(%command, "git");

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&self.repo_root)
            .env("GIT_EDITOR", "true")
            .env("GIT_SEQUENCE_EDITOR", "true")
            .env("GIT_MERGE_AUTOEDIT", "no")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(GitError::Timeout { command, timeout }),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        trace!(%command, code = ?output.status.code(), "git finished");

        if output.status.success() {
            Ok(GitOutput { stdout, stderr })
        } else {
            Err(GitError::Failed {
                command,
                code: output.status.code(),
                stdout,
                stderr: stderr.trim().to_string(),
            })
        }
    }

    fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}
