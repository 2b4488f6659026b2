//! Typed git operations over a [`GitRunner`]

use super::runner::{GitOutput, GitRunner};
use super::status::{parse_porcelain, WorkingTreeStatus};
use crate::error::GitError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How an interrupted integration is paused, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integration {
    None,
    Rebase,
    Merge,
}

/// A git working tree plus the timeouts to apply to it
#[derive(Clone)]
pub struct Repo {
    runner: Arc<dyn GitRunner>,
    command_timeout: Duration,
    network_timeout: Duration,
}

impl Repo {
    pub fn new(runner: Arc<dyn GitRunner>, command_timeout: Duration, network_timeout: Duration) -> Self {
        Self {
            runner,
            command_timeout,
            network_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        self.runner.repo_root()
    }

    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        self.runner.run(args, self.command_timeout).await
    }

    async fn run_network(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        self.runner.run(args, self.network_timeout).await
    }

    pub async fn status(&self) -> Result<WorkingTreeStatus, GitError> {
        let out = self
            .run(&["status", "--porcelain=v1", "-z", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain(&out.stdout))
    }

    pub async fn add(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--all", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args).await.map(drop)
    }

    pub async fn commit(&self, message: &str) -> Result<(), GitError> {
        self.run(&["commit", "-m", message]).await.map(drop)
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<GitOutput, GitError> {
        let refspec = format!("HEAD:{branch}");
        self.run_network(&["push", remote, &refspec]).await
    }

    pub async fn pull(&self, remote: &str, branch: &str, rebase: bool) -> Result<GitOutput, GitError> {
        let mode = if rebase { "--rebase" } else { "--no-rebase" };
        self.run_network(&["pull", mode, "--autostash", remote, branch]).await
    }

    pub async fn fetch(&self, remote: &str) -> Result<(), GitError> {
        self.run_network(&["fetch", remote]).await.map(drop)
    }

    pub async fn head(&self) -> Result<String, GitError> {
        Ok(self.run(&["rev-parse", "HEAD"]).await?.stdout.trim().to_string())
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .run(&["branch", "--show-current"])
            .await?
            .stdout
            .trim()
            .to_string())
    }

    /// Paths that differ between two commits
    pub async fn changed_between(&self, from: &str, to: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["diff", "--name-only", "-z", from, to]).await?;
        Ok(out.paths().map(str::to_string).collect())
    }

    /// `(ahead, behind)` of HEAD relative to `upstream`
    pub async fn ahead_behind(&self, upstream: &str) -> Result<(usize, usize), GitError> {
        let range = format!("HEAD...{upstream}");
        let out = self.run(&["rev-list", "--left-right", "--count", &range]).await?;
        let mut counts = out.stdout.split_whitespace().map(|n| n.parse::<usize>().unwrap_or(0));
        Ok((counts.next().unwrap_or(0), counts.next().unwrap_or(0)))
    }

    /// Paths with unresolved merge conflicts
    pub async fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["diff", "--name-only", "-z", "--diff-filter=U"]).await?;
        let mut files: Vec<String> = out.paths().map(str::to_string).collect();
        files.dedup();
        Ok(files)
    }

    /// Content of `path` at `rev`, or `None` if it does not exist there.
    ///
    /// Any other failure (timeout, bad object, spawn error) is an error, not
    /// an absent file.
    pub async fn show(&self, rev: &str, path: &str) -> Result<Option<String>, GitError> {
        let spec = format!("{rev}:{path}");
        match self.run(&["show", &spec]).await {
            Ok(out) => Ok(Some(out.stdout)),
            Err(e) if is_missing_path(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn checkout_theirs(&self, path: &str) -> Result<(), GitError> {
        self.run(&["checkout", "--theirs", "--", path]).await.map(drop)
    }

    pub async fn remove(&self, path: &str) -> Result<(), GitError> {
        self.run(&["rm", "--quiet", "--ignore-unmatch", "--", path]).await.map(drop)
    }

    pub async fn rebase_continue(&self) -> Result<(), GitError> {
        self.run(&["rebase", "--continue"]).await.map(drop)
    }

    pub async fn rebase_skip(&self) -> Result<(), GitError> {
        self.run(&["rebase", "--skip"]).await.map(drop)
    }

    pub async fn commit_no_edit(&self) -> Result<(), GitError> {
        self.run(&["commit", "--no-edit"]).await.map(drop)
    }

    pub async fn git_dir(&self) -> Result<PathBuf, GitError> {
        let out = self.run(&["rev-parse", "--git-dir"]).await?;
        let dir = PathBuf::from(out.stdout.trim());
        Ok(if dir.is_absolute() { dir } else { self.root().join(dir) })
    }

    pub async fn integration(&self) -> Result<Integration, GitError> {
        let dir = self.git_dir().await?;
        if dir.join("rebase-merge").exists() || dir.join("rebase-apply").exists() {
            Ok(Integration::Rebase)
        } else if dir.join("MERGE_HEAD").exists() {
            Ok(Integration::Merge)
        } else {
            Ok(Integration::None)
        }
    }

    /// The ref naming the incoming side of a paused integration
    pub async fn incoming_ref(&self) -> Result<&'static str, GitError> {
        let dir = self.git_dir().await?;
        Ok(if dir.join("REBASE_HEAD").exists() {
            "REBASE_HEAD"
        } else if dir.join("MERGE_HEAD").exists() {
            "MERGE_HEAD"
        } else if dir.join("rebase-merge").exists() {
            "REBASE_HEAD"
        } else {
            "MERGE_HEAD"
        })
    }

    /// Commits reachable from `rev` that changed `path`, oldest first
    pub async fn commits_touching(&self, rev: &str, path: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["log", "--reverse", "--format=%H", rev, "--", path]).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        match self.run(&["merge-base", "--is-ancestor", ancestor, descendant]).await {
            Ok(_) => Ok(true),
            Err(GitError::Failed { code: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn config_get(&self, key: &str) -> Option<String> {
        let out = self.run(&["config", "--get", key]).await.ok()?;
        let value = out.stdout.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), GitError> {
        self.run(&["config", key, value]).await.map(drop)
    }
}

/// `git show rev:path` failures that only mean the path is absent at `rev`
fn is_missing_path(err: &GitError) -> bool {
    match err {
        GitError::Failed { stderr, .. } => {
            stderr.contains("does not exist") || stderr.contains("exists on disk, but not in")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> GitError {
        GitError::Failed {
            command: "show".into(),
            code: Some(128),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_only_absent_paths_count_as_missing() {
        assert!(is_missing_path(&failed("fatal: path 'data/x.json' does not exist in 'HEAD'")));
        assert!(is_missing_path(&failed("fatal: path 'data/x.json' exists on disk, but not in 'REBASE_HEAD'")));
        assert!(!is_missing_path(&failed("fatal: bad object REBASE_HEAD")));
        assert!(!is_missing_path(&GitError::Timeout {
            command: "show".into(),
            timeout: Duration::from_secs(5),
        }));
    }
}
