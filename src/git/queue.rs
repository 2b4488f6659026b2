//! Persistent queue of conflicts that need a human
//!
//! Stored at `<data>/.conflicts/queue.json`, which is never committed. The
//! queue survives restarts and is only mutated under the conflict-queue lock.

use super::conflict::{ConflictEntry, ConflictKind, Strategy};
use crate::error::Result;
use crate::locks::{LockManager, LockScope};
use crate::store::fs::{read_json, write_json_atomic};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const QUEUE_FILE: &str = "queue.json";

/// A conflict waiting for manual resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedConflict {
    pub filepath: String,
    pub conflict_type: ConflictKind,
    pub strategy: Strategy,
    pub detail: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_detail: Option<String>,
}

/// The queue file is a bare JSON list
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct QueueFile {
    conflicts: Vec<QueuedConflict>,
}

#[derive(Debug, Clone)]
pub struct ManualResolutionQueue {
    path: PathBuf,
    locks: LockManager,
}

impl ManualResolutionQueue {
    pub fn new(store: &Store) -> Self {
        Self {
            path: store.conflicts_dir().join(QUEUE_FILE),
            locks: store.locks().clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an unresolved conflict; a pending entry for the same path is replaced
    pub fn add(&self, entry: &ConflictEntry) -> Result<()> {
        self.mutate(|file| {
            file.conflicts.retain(|c| c.resolved || c.filepath != entry.filepath);
            file.conflicts.push(QueuedConflict {
                filepath: entry.filepath.clone(),
                conflict_type: entry.conflict_type,
                strategy: entry.strategy,
                detail: entry.detail.clone(),
                added_at: Utc::now(),
                resolved: false,
                resolved_at: None,
                resolution_detail: None,
            });
        })?;
        info!(path = %entry.filepath, "Queued conflict for manual resolution");
        Ok(())
    }

    pub fn list_pending(&self) -> Result<Vec<QueuedConflict>> {
        Ok(self.load()?.conflicts.into_iter().filter(|c| !c.resolved).collect())
    }

    pub fn list_all(&self) -> Result<Vec<QueuedConflict>> {
        Ok(self.load()?.conflicts)
    }

    /// Mark the pending entry for `filepath` resolved; false if there is none
    pub fn resolve(&self, filepath: &str, resolution: &str) -> Result<bool> {
        self.mutate(|file| {
            let Some(entry) = file
                .conflicts
                .iter_mut()
                .find(|c| !c.resolved && c.filepath == filepath)
            else {
                return false;
            };
            entry.resolved = true;
            entry.resolved_at = Some(Utc::now());
            entry.resolution_detail = Some(resolution.to_string());
            true
        })
    }

    /// Drop resolved entries; returns how many were removed
    pub fn clear_resolved(&self) -> Result<usize> {
        self.mutate(|file| {
            let before = file.conflicts.len();
            file.conflicts.retain(|c| !c.resolved);
            before - file.conflicts.len()
        })
    }

    fn load(&self) -> Result<QueueFile> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut QueueFile) -> T) -> Result<T> {
        let guard = self.locks.acquire(&LockScope::ConflictQueue)?;
        let mut file = self.load()?;
        let out = f(&mut file);
        write_json_atomic(&self.path, &file)?;
        guard.release()?;
        Ok(out)
    }
}
