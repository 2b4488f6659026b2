//! Named lock scopes
//!
//! ```text
//! .locks/
//!   node-1_1_7.lock        one per entity address
//!   index.lock             all derived-index writes
//!   links.lock             link file creation and removal
//!   git.lock               the whole pull/push cycle
//!   address-allocation.lock
//!   task-claim.lock
//!   conflict-queue.lock
//! ```

use super::file_lock::{FileLock, LockGuard};
use crate::address::Address;
use crate::error::LockError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Timeouts for lock acquisition and staleness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub wait: Duration,
    pub stale_after: Duration,
    /// Git operations are slow, so the git scope waits and expires later
    pub git_wait: Duration,
    pub git_stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            git_wait: Duration::from_secs(120),
            git_stale_after: Duration::from_secs(600),
        }
    }
}

/// A lockable resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockScope {
    Node(Address),
    Index,
    Links,
    Git,
    AddressAllocation,
    TaskClaim,
    ConflictQueue,
}

impl LockScope {
    /// Lock file stem, safe as a single path component
    pub fn key(&self) -> String {
        match self {
            LockScope::Node(address) => format!("node-{}", address.to_key()),
            LockScope::Index => "index".to_string(),
            LockScope::Links => "links".to_string(),
            LockScope::Git => "git".to_string(),
            LockScope::AddressAllocation => "address-allocation".to_string(),
            LockScope::TaskClaim => "task-claim".to_string(),
            LockScope::ConflictQueue => "conflict-queue".to_string(),
        }
    }
}

/// Issues scoped locks under one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, settings: LockSettings) -> Self {
        Self {
            dir: dir.into(),
            settings,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// The lock object for a scope, without acquiring it
    pub fn lock_for(&self, scope: &LockScope) -> FileLock {
        let stale_after = match scope {
            LockScope::Git => self.settings.git_stale_after,
            _ => self.settings.stale_after,
        };
        FileLock::new(self.dir.join(format!("{}.lock", scope.key())), stale_after)
    }

    /// Acquire a scope with its default timeout
    pub fn acquire(&self, scope: &LockScope) -> Result<LockGuard, LockError> {
        let wait = match scope {
            LockScope::Git => self.settings.git_wait,
            _ => self.settings.wait,
        };
        self.acquire_within(scope, wait)
    }

    pub fn acquire_within(&self, scope: &LockScope, max_wait: Duration) -> Result<LockGuard, LockError> {
        let guard = self.lock_for(scope).acquire(max_wait)?;
        debug!(scope = %scope.key(), "Acquired lock");
        Ok(guard)
    }

    pub fn node(&self, address: &Address) -> Result<LockGuard, LockError> {
        self.acquire(&LockScope::Node(address.clone()))
    }

    pub fn index(&self) -> Result<LockGuard, LockError> {
        self.acquire(&LockScope::Index)
    }

    pub fn links(&self) -> Result<LockGuard, LockError> {
        self.acquire(&LockScope::Links)
    }

    pub fn git(&self) -> Result<LockGuard, LockError> {
        self.acquire(&LockScope::Git)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scopes_are_independent() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), LockSettings::default());
        let a = Address::parse("1.1").unwrap();
        let b = Address::parse("1.2").unwrap();

        let _node_a = locks.node(&a).unwrap();
        let _node_b = locks.acquire_within(&LockScope::Node(b), Duration::ZERO).unwrap();
        let _index = locks.acquire_within(&LockScope::Index, Duration::ZERO).unwrap();
        let _links = locks.acquire_within(&LockScope::Links, Duration::ZERO).unwrap();

        let again = locks.acquire_within(&LockScope::Node(a), Duration::from_millis(30));
        assert!(matches!(again, Err(LockError::Timeout { .. })));
    }

    #[test]
    fn test_lock_file_names() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), LockSettings::default());
        let scope = LockScope::Node(Address::parse("2.1.17:Entry.md").unwrap());
        assert_eq!(
            locks.lock_for(&scope).path(),
            dir.path().join("node-2_1_17_Entry_md.lock")
        );
        assert_eq!(locks.lock_for(&LockScope::Git).path(), dir.path().join("git.lock"));
    }
}
