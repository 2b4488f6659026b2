//! Git batch coordinator
//!
//! Serializes every pull and push on this machine behind the git lock and
//! turns many small local writes into one commit per push:
//!
//! ```text
//! sync:  pull ──> resolve conflicts ──> rebuild indexes
//!          └────> stage changed files (excluding derived/local ones)
//!                   └─> commit ──> push ──rejected──> backoff ──> pull --rebase ──┐
//!                                    ^─────────────────────────────────────────────┘
//!        then report address collisions and double task claims
//! ```
//!
//! Operations never return `Err`; every failure is reported through the
//! status of the returned result.

use super::arbiter::arbitrate_by_push_order;
use super::conflict::{ConflictEntry, ConflictResolver};
use super::repo::{Integration, Repo};
use super::runner::GitRunner;
use super::status::{is_stageable, BatchSummary};
use crate::allocator::{AddressAllocator, AddressCollision};
use crate::claims::{ClaimConflict, TaskClaimer};
use crate::config::GitConfig;
use crate::contributor::ContributorId;
use crate::error::{GitError, LockError, StoreError};
use crate::locks::LockGuard;
use crate::rebuild::{IndexRebuilder, RebuildStats, ValidationIssue};
use crate::store::fs::to_slash;
use crate::store::Store;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Success,
    NothingToPush,
    /// Still rejected after every retry, or conflicts need a human
    Conflict,
    AuthFailure,
    /// Another process holds the git lock
    Busy,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    Success,
    /// Integration paused on conflicts that need a human
    Conflict,
    Busy,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushResult {
    pub status: PushStatus,
    pub files_pushed: usize,
    pub retries: u32,
    pub conflicts_resolved: usize,
    pub commit: Option<String>,
    pub message: String,
    pub duration: Duration,
}

impl PushResult {
    fn new(status: PushStatus, message: impl Into<String>, start: Instant) -> Self {
        Self {
            status,
            files_pushed: 0,
            retries: 0,
            conflicts_resolved: 0,
            commit: None,
            message: message.into(),
            duration: start.elapsed(),
        }
    }

    fn attempts(mut self, retries: u32, conflicts_resolved: usize) -> Self {
        self.retries = retries;
        self.conflicts_resolved = conflicts_resolved;
        self
    }

    /// Pushed, or nothing needed pushing
    pub fn success(&self) -> bool {
        matches!(self.status, PushStatus::Success | PushStatus::NothingToPush)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PullResult {
    pub status: PullStatus,
    pub files_updated: usize,
    pub indexes_rebuilt: bool,
    pub index_stats: Option<RebuildStats>,
    pub validation_issues: Vec<ValidationIssue>,
    pub conflicts: Vec<ConflictEntry>,
    pub message: String,
    pub duration: Duration,
}

impl PullResult {
    fn new(status: PullStatus, message: impl Into<String>, start: Instant) -> Self {
        Self {
            status,
            files_updated: 0,
            indexes_rebuilt: false,
            index_stats: None,
            validation_issues: Vec::new(),
            conflicts: Vec::new(),
            message: message.into(),
            duration: start.elapsed(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == PullStatus::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub pull: PullResult,
    /// `None` when the pull left nothing safe to push on top of
    pub push: Option<PushResult>,
    pub address_collisions: Vec<AddressCollision>,
    pub claim_conflicts: Vec<ClaimConflict>,
}

impl SyncResult {
    pub fn success(&self) -> bool {
        self.pull.success() && self.push.as_ref().is_some_and(PushResult::success)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub contributor: ContributorId,
    pub branch: String,
    pub remote: String,
    pub ahead: usize,
    pub behind: usize,
    pub pending_changes: usize,
    pub stageable_changes: usize,
    pub conflicted_files: usize,
    pub queued_conflicts: usize,
    pub active_claims: usize,
    pub integration_paused: bool,
}

/// Why a push failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushFailure {
    /// The remote moved on; integrate and retry
    Rejected,
    Auth,
    Other,
}

pub(crate) fn classify_push_failure(e: &GitError) -> PushFailure {
    let out = e.output().to_lowercase();
    const AUTH: &[&str] = &[
        "authentication failed",
        "permission denied",
        "error: 403",
        "returned error: 403",
        "could not read username",
        "invalid credentials",
    ];
    const REJECTED: &[&str] = &["rejected", "non-fast-forward", "fetch first", "failed to push some refs"];
    if AUTH.iter().any(|m| out.contains(m)) {
        PushFailure::Auth
    } else if REJECTED.iter().any(|m| out.contains(m)) {
        PushFailure::Rejected
    } else {
        PushFailure::Other
    }
}

/// Coordinates pull, push and sync for one contributor
pub struct GitBatchCoordinator {
    store: Arc<Store>,
    repo: Repo,
    resolver: ConflictResolver,
    config: GitConfig,
    contributor: ContributorId,
}

impl GitBatchCoordinator {
    pub fn new(store: Arc<Store>, runner: Arc<dyn GitRunner>, config: GitConfig, contributor: ContributorId) -> Self {
        let repo = Repo::new(runner, config.command_timeout(), config.push_timeout());
        let resolver = ConflictResolver::new(repo.clone(), Arc::clone(&store));
        Self {
            store,
            repo,
            resolver,
            config,
            contributor,
        }
    }

    /// The configured id, or one derived from hostname and user
    pub fn resolve_contributor(configured: Option<&str>) -> Result<ContributorId, StoreError> {
        match configured {
            Some(id) => ContributorId::new(id),
            None => Ok(ContributorId::generate()),
        }
    }

    pub fn contributor(&self) -> &ContributorId {
        &self.contributor
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn allocator(&self) -> AddressAllocator {
        AddressAllocator::new(&self.store, self.contributor.clone())
    }

    pub fn claimer(&self) -> TaskClaimer {
        TaskClaimer::new(&self.store, self.contributor.clone()).with_stale_after(self.config.stale_claim_after())
    }

    /// Adopt the checked-out branch and make sure commits have an author.
    ///
    /// Returns the branch in use.
    pub async fn setup_contributor(&mut self) -> Result<String, GitError> {
        let current = self.repo.current_branch().await?;
        if !current.is_empty() && current != self.config.branch {
            info!(configured = %self.config.branch, current = %current, "Using checked-out branch");
            self.config.branch = current;
        }

        if self.repo.config_get("user.name").await.is_none() {
            self.repo
                .config_set("user.name", &format!("hypernet-{}", self.contributor))
                .await?;
        }
        if self.repo.config_get("user.email").await.is_none() {
            self.repo
                .config_set("user.email", &format!("{}@hypernet.local", self.contributor))
                .await?;
        }

        info!(contributor = %self.contributor, branch = %self.config.branch, "Contributor ready");
        Ok(self.config.branch.clone())
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Integrate upstream changes, resolve conflicts, rebuild indexes
    pub async fn pull(&self) -> PullResult {
        let start = Instant::now();
        let guard = match self.lock_git().await {
            Ok(guard) => guard,
            Err(LockError::Timeout { .. }) => {
                return PullResult::new(PullStatus::Busy, "Another process holds the git lock", start)
            }
            Err(e) => return PullResult::new(PullStatus::Error, e.to_string(), start),
        };

        let result = self.pull_locked(start).await;
        release(guard);
        info!(
            status = ?result.status,
            files_updated = result.files_updated,
            conflicts = result.conflicts.len(),
            "Pull finished"
        );
        result
    }

    async fn pull_locked(&self, start: Instant) -> PullResult {
        let before = self.repo.head().await.ok();
        let mut conflicts = Vec::new();
        let mut message = "Pulled".to_string();

        match self
            .repo
            .pull(&self.config.remote, &self.config.branch, self.config.auto_rebase)
            .await
        {
            Ok(_) => {}
            Err(e) if e.mentions_conflict() => {
                info!("Pull stopped on conflicts; resolving");
                let report = match self.resolver.resolve_all().await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "Conflict resolution failed");
                        return PullResult::new(PullStatus::Error, e.to_string(), start);
                    }
                };
                let resolved = report.resolved_count();
                if !report.is_clean() {
                    let unresolved = report.unresolved().count();
                    let mut result = PullResult::new(
                        PullStatus::Conflict,
                        format!("{unresolved} conflicts need manual resolution"),
                        start,
                    );
                    result.conflicts = report.entries;
                    return result;
                }
                message = format!("Pulled; resolved {resolved} conflicts");
                conflicts = report.entries;
            }
            Err(e) => {
                error!(error = %e, "Pull failed");
                return PullResult::new(PullStatus::Error, e.to_string(), start);
            }
        }

        let files_updated = match (before, self.repo.head().await.ok()) {
            (Some(before), Some(after)) if before != after => self
                .repo
                .changed_between(&before, &after)
                .await
                .map(|files| files.len())
                .unwrap_or(0),
            _ => 0,
        };

        let mut result = PullResult::new(PullStatus::Success, message, start);
        result.files_updated = files_updated;
        result.conflicts = conflicts;
        match self.rebuild_indexes().await {
            Ok((stats, issues)) => {
                result.indexes_rebuilt = true;
                result.index_stats = Some(stats);
                result.validation_issues = issues;
            }
            Err(e) => {
                error!(error = %e, "Index rebuild after pull failed");
                result.message = format!("{}; index rebuild failed: {e}", result.message);
            }
        }
        result.duration = start.elapsed();
        result
    }

    async fn rebuild_indexes(&self) -> Result<(RebuildStats, Vec<ValidationIssue>), StoreError> {
        self.blocking(|store| {
            let rebuilder = IndexRebuilder::new(store);
            let stats = rebuilder.rebuild_all()?;
            let issues = rebuilder.validate()?;
            for issue in &issues {
                warn!(%issue, "Index validation issue");
            }
            Ok((stats, issues))
        })
        .await
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Stage, commit and push pending changes.
    ///
    /// `paths` limits the batch to those repository-relative paths; without
    /// it every stageable change is included. `message` replaces the
    /// generated summary after the commit prefix.
    pub async fn push_batch(&self, message: Option<&str>, paths: Option<&[String]>) -> PushResult {
        let start = Instant::now();
        let guard = match self.lock_git().await {
            Ok(guard) => guard,
            Err(LockError::Timeout { .. }) => {
                return PushResult::new(PushStatus::Busy, "Another process holds the git lock", start)
            }
            Err(e) => return PushResult::new(PushStatus::Error, e.to_string(), start),
        };

        let result = self.push_locked(message, paths, start).await;
        release(guard);
        info!(
            status = ?result.status,
            files = result.files_pushed,
            retries = result.retries,
            "Push finished"
        );
        result
    }

    async fn push_locked(&self, message: Option<&str>, paths: Option<&[String]>, start: Instant) -> PushResult {
        let status = match self.repo.status().await {
            Ok(status) => status,
            Err(e) => return PushResult::new(PushStatus::Error, e.to_string(), start),
        };

        let mut batch: Vec<String> = match paths {
            Some(paths) => {
                let changed = status.changed_paths();
                paths
                    .iter()
                    .filter(|p| changed.contains(p.as_str()) && is_stageable(p))
                    .cloned()
                    .collect()
            }
            None => status.stageable(),
        };

        if batch.len() > self.config.max_batch_files {
            info!(
                deferred = batch.len() - self.config.max_batch_files,
                "Batch limit reached; remaining files wait for the next push"
            );
            batch.truncate(self.config.max_batch_files);
        }

        let mut commit = None;
        if batch.is_empty() {
            let ahead = self
                .repo
                .ahead_behind(&self.config.upstream())
                .await
                .map(|(ahead, _)| ahead)
                .unwrap_or(0);
            if ahead == 0 {
                return PushResult::new(PushStatus::NothingToPush, "No changes to push", start);
            }
            debug!(ahead, "Pushing earlier unpushed commits");
        } else {
            for chunk in batch.chunks(self.config.stage_batch_size) {
                if let Err(e) = self.repo.add(chunk).await {
                    error!(error = %e, "Staging failed");
                    return PushResult::new(PushStatus::Error, e.to_string(), start);
                }
            }

            let summary = BatchSummary::of(&batch);
            let body = message
                .map(str::to_string)
                .unwrap_or_else(|| summary.message(self.contributor.as_str()));
            let full = format!("{} {}", self.config.commit_prefix, body);
            match self.repo.commit(&full).await {
                Ok(()) => {}
                Err(e) if e.output().to_lowercase().contains("nothing to commit") => {
                    return PushResult::new(PushStatus::NothingToPush, "Nothing to commit", start);
                }
                Err(e) => {
                    error!(error = %e, "Commit failed");
                    return PushResult::new(PushStatus::Error, e.to_string(), start);
                }
            }
            commit = self.repo.head().await.ok();
            debug!(commit = ?commit, files = batch.len(), "Committed batch");
        }

        let mut result = self.push_with_retry(start).await;
        result.files_pushed = batch.len();
        result.commit = commit;
        if result.status == PushStatus::Success && result.retries > 0 {
            if let Err(e) = self.rebuild_indexes().await {
                warn!(error = %e, "Index rebuild after integrating upstream failed");
            }
        }
        result.duration = start.elapsed();
        result
    }

    async fn push_with_retry(&self, start: Instant) -> PushResult {
        let mut retries = 0;
        let mut resolved = 0;
        let mut delay = self.config.base_retry_delay();

        loop {
            let err = match self.repo.push(&self.config.remote, &self.config.branch).await {
                Ok(_) => return PushResult::new(PushStatus::Success, "Pushed", start).attempts(retries, resolved),
                Err(e) => e,
            };

            match classify_push_failure(&err) {
                PushFailure::Auth => {
                    error!(error = %err, "Push rejected for authentication");
                    return PushResult::new(PushStatus::AuthFailure, err.to_string(), start).attempts(retries, resolved);
                }
                PushFailure::Other => {
                    error!(error = %err, "Push failed");
                    return PushResult::new(PushStatus::Error, err.to_string(), start).attempts(retries, resolved);
                }
                PushFailure::Rejected if retries >= self.config.max_retries => {
                    warn!(retries, "Giving up on push");
                    let message = format!("Push still rejected after {retries} retries");
                    return PushResult::new(PushStatus::Conflict, message, start).attempts(retries, resolved);
                }
                PushFailure::Rejected => {}
            }

            retries += 1;
            warn!(attempt = retries, delay_ms = delay.as_millis() as u64, "Push rejected; integrating upstream");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.max_retry_delay());

            match self.repo.pull(&self.config.remote, &self.config.branch, true).await {
                Ok(_) => {}
                Err(e) if e.mentions_conflict() => match self.resolver.resolve_all().await {
                    Ok(report) => {
                        resolved += report.resolved_count();
                        if !report.is_clean() {
                            let message = format!(
                                "{} conflicts need manual resolution",
                                report.unresolved().count()
                            );
                            return PushResult::new(PushStatus::Conflict, message, start).attempts(retries, resolved);
                        }
                    }
                    Err(e) => {
                        return PushResult::new(PushStatus::Error, e.to_string(), start).attempts(retries, resolved)
                    }
                },
                Err(e) => {
                    error!(error = %e, "Rebase onto upstream failed");
                    return PushResult::new(PushStatus::Error, e.to_string(), start).attempts(retries, resolved);
                }
            }
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Pull, push, then report collisions and double claims
    pub async fn sync(&self) -> SyncResult {
        let pull = self.pull().await;
        let push = match pull.status {
            PullStatus::Conflict | PullStatus::Busy => None,
            PullStatus::Success | PullStatus::Error => Some(self.push_batch(None, None).await),
        };

        let address_collisions = match self.blocking_allocator().await {
            Ok(collisions) => collisions,
            Err(e) => {
                warn!(error = %e, "Collision detection failed");
                Vec::new()
            }
        };
        let claim_conflicts = self.claim_conflicts().await;

        SyncResult {
            pull,
            push,
            address_collisions,
            claim_conflicts,
        }
    }

    async fn blocking_allocator(&self) -> Result<Vec<AddressCollision>, StoreError> {
        let allocator = self.allocator();
        let collisions = tokio::task::spawn_blocking(move || allocator.detect_collisions())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        for c in &collisions {
            warn!(
                prefix = %c.prefix,
                first = %c.first.contributor_id,
                second = %c.second.contributor_id,
                start = c.overlap_start,
                end = c.overlap_end,
                affected = c.affected.len(),
                "Address ranges overlap"
            );
        }
        Ok(collisions)
    }

    async fn claim_conflicts(&self) -> Vec<ClaimConflict> {
        let claimer = self.claimer();
        let local = match tokio::task::spawn_blocking(move || claimer.detect_conflicts()).await {
            Ok(Ok(conflicts)) => conflicts,
            Ok(Err(e)) => {
                warn!(error = %e, "Claim conflict detection failed");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Claim conflict detection task failed");
                return Vec::new();
            }
        };
        if local.is_empty() {
            return local;
        }

        let Some(prefix) = self.data_prefix() else {
            warn!("Data directory is outside the repository; claim order stays provisional");
            return local;
        };
        match arbitrate_by_push_order(&self.repo, &self.config.upstream(), &prefix, local.clone()).await {
            Ok(ranked) => {
                for c in &ranked {
                    warn!(
                        task = %c.task_address,
                        winner = %c.winner.contributor_id,
                        losers = c.losers.len(),
                        authority = ?c.authority,
                        "Task claimed by several contributors"
                    );
                }
                ranked
            }
            Err(e) => {
                warn!(error = %e, "Push-order arbitration failed; claim order stays provisional");
                local
            }
        }
    }

    /// The data dir relative to the repository root
    fn data_prefix(&self) -> Option<String> {
        let canonical = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
        let root = canonical(self.repo.root());
        let data = canonical(self.store.root());
        data.strip_prefix(&root).ok().map(to_slash)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> Result<CoordinatorStatus, GitError> {
        let tree = self.repo.status().await?;
        let (ahead, behind) = self
            .repo
            .ahead_behind(&self.config.upstream())
            .await
            .unwrap_or((0, 0));
        let integration_paused = self.repo.integration().await? != Integration::None;

        let queue = self.resolver.queue().clone();
        let queued_conflicts = match tokio::task::spawn_blocking(move || queue.list_pending()).await {
            Ok(Ok(pending)) => pending.len(),
            _ => 0,
        };
        let claimer = self.claimer();
        let active_claims = match tokio::task::spawn_blocking(move || claimer.get_my_active_claims()).await {
            Ok(Ok(claims)) => claims.len(),
            _ => 0,
        };

        Ok(CoordinatorStatus {
            contributor: self.contributor.clone(),
            branch: self.config.branch.clone(),
            remote: self.config.remote.clone(),
            ahead,
            behind,
            pending_changes: tree.changed_paths().len(),
            stageable_changes: tree.stageable().len(),
            conflicted_files: tree.conflicted.len(),
            queued_conflicts,
            active_claims,
            integration_paused,
        })
    }

    async fn lock_git(&self) -> Result<LockGuard, LockError> {
        let locks = self.store.locks().clone();
        tokio::task::spawn_blocking(move || locks.git())
            .await
            .map_err(|e| LockError::Io(std::io::Error::other(e)))?
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn release(guard: LockGuard) {
    if let Err(e) = guard.release() {
        warn!(error = %e, "Failed to release git lock");
    }
}
