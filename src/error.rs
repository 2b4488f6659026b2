//! Error types for hypernet-store

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Address parsing and construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address cannot be empty")]
    Empty,

    #[error("Address part {index} is empty in {input:?}")]
    EmptyPart { input: String, index: usize },

    #[error("Resource segment {index} is empty in {input:?}")]
    EmptyResource { input: String, index: usize },

    #[error("Address part {part:?} contains forbidden character {ch:?}")]
    ForbiddenChar { part: String, ch: char },

    #[error("No instance numbers left under {prefix}")]
    InstanceSpaceExhausted { prefix: String },
}

/// Lock acquisition errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Lock IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store-level errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Invalid link: {0}")]
    InvalidLink(String),

    #[error("Invalid contributor id: {0:?}")]
    InvalidContributor(String),

    #[error("Corrupt file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    /// Lock contention is the only error a caller should simply retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Lock(LockError::Timeout { .. }))
    }
}

/// Errors from the git command wrapper
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git {command} failed (exit {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),
}

impl GitError {
    /// Combined stderr/stdout text used for outcome classification
    pub fn output(&self) -> String {
        match self {
            GitError::Failed { stdout, stderr, .. } => format!("{stderr}\n{stdout}"),
            other => other.to_string(),
        }
    }

    pub fn mentions_conflict(&self) -> bool {
        self.output().to_lowercase().contains("conflict")
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
