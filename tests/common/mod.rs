//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use hypernet_store::git::{GitOutput, GitRunner};
use hypernet_store::{Address, GitError, LockSettings, Store};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

/// A repository directory with the store at `<repo>/data`
pub fn repo_with_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("data"), LockSettings::default()).unwrap();
    (dir, Arc::new(store))
}

pub fn ok(stdout: &str) -> Result<GitOutput, GitError> {
    Ok(GitOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn fail(stderr: &str) -> Result<GitOutput, GitError> {
    Err(GitError::Failed {
        command: "scripted".to_string(),
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

type Handler = dyn Fn(&[&str]) -> Result<GitOutput, GitError> + Send + Sync;

/// A git runner that answers from a closure and records every call
pub struct ScriptedGit {
    root: PathBuf,
    handler: Box<Handler>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedGit {
    pub fn new(
        root: &Path,
        handler: impl Fn(&[&str]) -> Result<GitOutput, GitError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Calls whose leading arguments equal `prefix`
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b))
            .count()
    }
}

#[async_trait]
impl GitRunner for ScriptedGit {
    async fn run(&self, args: &[&str], _timeout: Duration) -> Result<GitOutput, GitError> {
        self.calls.lock().push(args.iter().map(|a| a.to_string()).collect());
        (self.handler)(args)
    }

    fn repo_root(&self) -> &Path {
        &self.root
    }
}
