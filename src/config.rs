//! Configuration for hypernet-store

use crate::error::ConfigError;
use crate::locks::LockSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hypernet")
        .join("data")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub contributor: ContributorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root of the entity store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How long ordinary locks are waited for
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Age after which an ordinary lock may be broken
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,

    /// How long the git lock is waited for
    #[serde(default = "default_git_lock_wait_ms")]
    pub git_lock_wait_ms: u64,

    /// Age after which the git lock may be broken
    #[serde(default = "default_git_stale_lock_secs")]
    pub git_stale_lock_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Repository working tree; defaults to the data dir's parent
    #[serde(default)]
    pub repo_root: Option<PathBuf>,

    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Pull with `--rebase` instead of merging
    #[serde(default = "default_true")]
    pub auto_rebase: bool,

    /// Files committed per push; the rest wait for the next batch
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,

    /// Paths passed to one `git add`
    #[serde(default = "default_stage_batch_size")]
    pub stage_batch_size: usize,

    /// Push attempts after a rejection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Timeout for push and pull
    #[serde(default = "default_push_timeout_secs")]
    pub push_timeout_secs: u64,

    /// Age after which an active task claim stops blocking others
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,

    /// Daemon sync period
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContributorConfig {
    /// Contributor id; generated from hostname and user when absent
    #[serde(default)]
    pub id: Option<String>,
}

fn default_lock_wait_ms() -> u64 {
    10_000
}

fn default_stale_lock_secs() -> u64 {
    60
}

fn default_git_lock_wait_ms() -> u64 {
    120_000
}

fn default_git_stale_lock_secs() -> u64 {
    600
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_batch_files() -> usize {
    500
}

fn default_stage_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_commit_prefix() -> String {
    "[hypernet]".to_string()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_push_timeout_secs() -> u64 {
    180
}

fn default_stale_claim_secs() -> u64 {
    3_600
}

fn default_sync_interval_secs() -> u64 {
    300
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_wait_ms: default_lock_wait_ms(),
            stale_lock_secs: default_stale_lock_secs(),
            git_lock_wait_ms: default_git_lock_wait_ms(),
            git_stale_lock_secs: default_git_stale_lock_secs(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_root: None,
            remote: default_remote(),
            branch: default_branch(),
            auto_rebase: true,
            max_batch_files: default_max_batch_files(),
            stage_batch_size: default_stage_batch_size(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            commit_prefix: default_commit_prefix(),
            command_timeout_secs: default_command_timeout_secs(),
            push_timeout_secs: default_push_timeout_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            wait: Duration::from_millis(self.lock_wait_ms),
            stale_after: Duration::from_secs(self.stale_lock_secs),
            git_wait: Duration::from_millis(self.git_lock_wait_ms),
            git_stale_after: Duration::from_secs(self.git_stale_lock_secs),
        }
    }
}

impl GitConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn upstream(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let git = &self.git;
        if git.max_retries == 0 {
            return Err(ConfigError::Invalid("git.max_retries must be at least 1".into()));
        }
        if git.max_batch_files == 0 || git.stage_batch_size == 0 {
            return Err(ConfigError::Invalid("git batch sizes must be at least 1".into()));
        }
        if git.base_retry_delay_ms > git.max_retry_delay_ms {
            return Err(ConfigError::Invalid(
                "git.base_retry_delay_ms exceeds git.max_retry_delay_ms".into(),
            ));
        }
        if git.remote.trim().is_empty() || git.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("git.remote and git.branch are required".into()));
        }
        Ok(())
    }

    /// The git working tree: `git.repo_root`, else the data dir's parent
    pub fn repo_root(&self) -> PathBuf {
        self.git.repo_root.clone().unwrap_or_else(|| {
            self.store
                .data_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.store.data_dir.clone())
        })
    }
}
