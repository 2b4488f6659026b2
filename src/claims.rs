//! Task claims
//!
//! Optimistic locking for "who is working on what". Each contributor appends
//! claims to its own `.claims/tasks/<contributor>.json`; claim files are
//! merged only at read time. Two contributors can both claim a task inside
//! one unsynchronized window. That double claim is detected after sync and
//! resolved deterministically rather than prevented.

use crate::address::Address;
use crate::contributor::{ContributorId, ContributorLedger, LedgerFile};
use crate::error::Result;
use crate::locks::{LockManager, LockScope};
use crate::store::Store;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

/// Subdirectory of the claims dir holding task claim files
pub const TASKS_DIR: &str = "tasks";

/// Default age after which an active claim is considered abandoned
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Active,
    Completed,
    Released,
}

impl ClaimStatus {
    /// How far along the lifecycle a claim is; later states supersede earlier ones
    pub fn rank(self) -> u8 {
        match self {
            ClaimStatus::Active => 0,
            ClaimStatus::Released => 1,
            ClaimStatus::Completed => 2,
        }
    }
}

/// One contributor's claim on one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_address: Address,
    pub contributor_id: ContributorId,
    /// `None` when the recorded timestamp could not be parsed; such claims
    /// count as stale and lose every tie.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub status: ClaimStatus,
}

impl TaskClaim {
    pub fn is_active(&self) -> bool {
        self.status == ClaimStatus::Active
    }

    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        match self.claimed_at {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Sort key for "earliest claim wins"
    pub fn precedence(&self) -> (bool, Option<DateTime<Utc>>, &ContributorId) {
        (self.claimed_at.is_none(), self.claimed_at, &self.contributor_id)
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f").map(|t| Utc.from_utc_datetime(&t))
            })
            .ok()
    }))
}

/// On-disk shape of `.claims/tasks/<contributor>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimFile {
    pub contributor_id: ContributorId,
    #[serde(default)]
    pub claims: Vec<TaskClaim>,
}

impl LedgerFile for ClaimFile {
    type Entry = TaskClaim;

    fn empty(owner: &ContributorId) -> Self {
        Self {
            contributor_id: owner.clone(),
            claims: Vec::new(),
        }
    }

    fn entries(&self) -> &[TaskClaim] {
        &self.claims
    }

    fn entries_mut(&mut self) -> &mut Vec<TaskClaim> {
        &mut self.claims
    }
}

/// Which rule picked the winner of a claim conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    /// Local ordering by `claimed_at`; provisional until the claims are pushed
    ClaimedAt,
    /// Order in which the claims landed on the shared remote
    PushOrder,
}

/// Several contributors holding active claims on the same task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimConflict {
    pub task_address: Address,
    pub winner: TaskClaim,
    pub losers: Vec<TaskClaim>,
    pub authority: Authority,
}

impl ClaimConflict {
    pub fn contestants(&self) -> impl Iterator<Item = &TaskClaim> {
        std::iter::once(&self.winner).chain(self.losers.iter())
    }
}

/// Claims tasks on behalf of one contributor
#[derive(Debug, Clone)]
pub struct TaskClaimer {
    ledger: ContributorLedger<ClaimFile>,
    locks: LockManager,
    stale_after: Duration,
}

impl TaskClaimer {
    pub fn new(store: &Store, contributor: ContributorId) -> Self {
        Self {
            ledger: ContributorLedger::new(store.claims_dir().join(TASKS_DIR), contributor),
            locks: store.locks().clone(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Claims older than this no longer block other contributors
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn contributor(&self) -> &ContributorId {
        self.ledger.owner()
    }

    /// Path of a contributor's claim file, relative to the data dir
    pub fn relative_file(contributor: &ContributorId) -> String {
        format!("{}/{TASKS_DIR}/{contributor}.json", crate::store::CLAIMS_DIR)
    }

    /// Claim a task; `None` if another contributor holds a live active claim.
    ///
    /// Claiming a task this contributor already holds returns the existing claim.
    pub fn claim(&self, task: &Address) -> Result<Option<TaskClaim>> {
        let guard = self.locks.acquire(&LockScope::TaskClaim)?;
        let now = Utc::now();
        let me = self.ledger.owner();

        let active = self.active_claims_for(task)?;
        if let Some(mine) = active.iter().find(|c| &c.contributor_id == me) {
            return Ok(Some(mine.clone()));
        }
        if let Some(holder) = active.iter().find(|c| !c.is_stale(self.stale_after, now)) {
            debug!(%task, holder = %holder.contributor_id, "Task already claimed");
            return Ok(None);
        }

        let claim = TaskClaim {
            task_address: task.clone(),
            contributor_id: me.clone(),
            claimed_at: Some(now),
            status: ClaimStatus::Active,
        };
        self.ledger.update_own(|file| file.claims.push(claim.clone()))?;
        guard.release()?;

        info!(%task, contributor = %me, "Claimed task");
        Ok(Some(claim))
    }

    /// Give up this contributor's active claim on a task
    pub fn release(&self, task: &Address) -> Result<bool> {
        self.finish(task, ClaimStatus::Released)
    }

    /// Mark this contributor's active claim on a task as done
    pub fn complete(&self, task: &Address) -> Result<bool> {
        self.finish(task, ClaimStatus::Completed)
    }

    fn finish(&self, task: &Address, status: ClaimStatus) -> Result<bool> {
        let guard = self.locks.acquire(&LockScope::TaskClaim)?;
        let changed = self.ledger.update_own(|file| {
            let mut changed = false;
            for claim in file.claims.iter_mut() {
                if &claim.task_address == task && claim.is_active() {
                    claim.status = status;
                    changed = true;
                }
            }
            changed
        })?;
        guard.release()?;
        if changed {
            info!(%task, ?status, "Updated task claim");
        }
        Ok(changed)
    }

    /// The authoritative active claim on a task (earliest wins)
    pub fn get_claim(&self, task: &Address) -> Result<Option<TaskClaim>> {
        let mut active = self.active_claims_for(task)?;
        active.sort_by(|a, b| a.precedence().cmp(&b.precedence()));
        Ok(active.into_iter().next())
    }

    pub fn get_my_active_claims(&self) -> Result<Vec<TaskClaim>> {
        Ok(self
            .ledger
            .load_own()?
            .claims
            .into_iter()
            .filter(TaskClaim::is_active)
            .collect())
    }

    /// Tasks with active claims from more than one contributor, earliest
    /// `claimed_at` as the provisional winner
    pub fn detect_conflicts(&self) -> Result<Vec<ClaimConflict>> {
        let mut by_task: BTreeMap<Address, Vec<TaskClaim>> = BTreeMap::new();
        for claim in self.ledger.all_entries()? {
            if claim.is_active() {
                by_task.entry(claim.task_address.clone()).or_default().push(claim);
            }
        }

        let mut conflicts = Vec::new();
        for (task_address, mut claims) in by_task {
            claims.sort_by(|a, b| a.precedence().cmp(&b.precedence()));
            let mut seen = BTreeSet::new();
            claims.retain(|c| seen.insert(c.contributor_id.clone()));
            if claims.len() < 2 {
                continue;
            }
            let winner = claims.remove(0);
            conflicts.push(ClaimConflict {
                task_address,
                winner,
                losers: claims,
                authority: Authority::ClaimedAt,
            });
        }
        Ok(conflicts)
    }

    /// Active claims (any contributor) older than `stale_after` or with an
    /// unreadable timestamp
    pub fn get_stale_claims(&self, stale_after: Duration) -> Result<Vec<TaskClaim>> {
        let now = Utc::now();
        Ok(self
            .ledger
            .all_entries()?
            .into_iter()
            .filter(|c| c.is_active() && c.is_stale(stale_after, now))
            .collect())
    }

    /// Release this contributor's own stale active claims
    pub fn expire_stale_claims(&self, stale_after: Duration) -> Result<Vec<TaskClaim>> {
        let guard = self.locks.acquire(&LockScope::TaskClaim)?;
        let now = Utc::now();
        let expired = self.ledger.update_own(|file| {
            let mut expired = Vec::new();
            for claim in file.claims.iter_mut() {
                if claim.is_active() && claim.is_stale(stale_after, now) {
                    claim.status = ClaimStatus::Released;
                    expired.push(claim.clone());
                }
            }
            expired
        })?;
        guard.release()?;
        if !expired.is_empty() {
            info!(count = expired.len(), "Released stale task claims");
        }
        Ok(expired)
    }

    fn active_claims_for(&self, task: &Address) -> Result<Vec<TaskClaim>> {
        Ok(self
            .ledger
            .all_entries()?
            .into_iter()
            .filter(|c| &c.task_address == task && c.is_active())
            .collect())
    }
}

/// Merge two versions of one contributor's claim file.
///
/// Claims are keyed by task address; when both sides hold a task, the earlier
/// `claimed_at` wins, and on equal timestamps the further-progressed status.
pub fn merge_claim_lists(ours: &[TaskClaim], theirs: &[TaskClaim]) -> Vec<TaskClaim> {
    let mut merged: BTreeMap<Address, TaskClaim> = BTreeMap::new();
    for claim in ours.iter().chain(theirs.iter()) {
        match merged.get(&claim.task_address) {
            None => {
                merged.insert(claim.task_address.clone(), claim.clone());
            }
            Some(kept) => {
                let earlier = claim.precedence().cmp(&kept.precedence()).is_lt();
                let same_time = claim.claimed_at == kept.claimed_at;
                if earlier || (same_time && claim.status.rank() > kept.status.rank()) {
                    merged.insert(claim.task_address.clone(), claim.clone());
                }
            }
        }
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockSettings;
    use tempfile::TempDir;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn setup() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), LockSettings::default()).unwrap();
        (store, dir)
    }

    fn claimer(store: &Store, who: &str) -> TaskClaimer {
        TaskClaimer::new(store, ContributorId::new(who).unwrap())
    }

    fn raw_claim(task: &str, who: &str, at: &str) -> TaskClaim {
        TaskClaim {
            task_address: addr(task),
            contributor_id: ContributorId::new(who).unwrap(),
            claimed_at: Some(DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc)),
            status: ClaimStatus::Active,
        }
    }

    #[test]
    fn test_claim_blocks_other_contributor() {
        let (store, _dir) = setup();
        let task = addr("0.7.1.00001");
        let alice = claimer(&store, "alice");
        let bob = claimer(&store, "bob");

        assert!(alice.claim(&task).unwrap().is_some());
        assert!(bob.claim(&task).unwrap().is_none());
        assert!(bob.get_my_active_claims().unwrap().is_empty());
        assert_eq!(alice.claim(&task).unwrap().unwrap().contributor_id.as_str(), "alice");
        assert_eq!(alice.get_my_active_claims().unwrap().len(), 1);
    }

    #[test]
    fn test_release_and_complete() {
        let (store, _dir) = setup();
        let task = addr("0.7.1.00002");
        let alice = claimer(&store, "alice");
        let bob = claimer(&store, "bob");

        alice.claim(&task).unwrap();
        assert!(alice.release(&task).unwrap());
        assert!(!alice.release(&task).unwrap());
        assert!(bob.claim(&task).unwrap().is_some());
        assert!(bob.complete(&task).unwrap());
        assert!(alice.get_claim(&task).unwrap().is_none());
    }

    #[test]
    fn test_stale_claim_does_not_block() {
        let (store, _dir) = setup();
        let task = addr("0.7.1.00003");
        let alice = claimer(&store, "alice");
        alice
            .ledger
            .update_own(|f| f.claims.push(raw_claim("0.7.1.00003", "alice", "2020-01-01T00:00:00Z")))
            .unwrap();

        assert_eq!(alice.get_stale_claims(Duration::from_secs(60)).unwrap().len(), 1);
        assert!(claimer(&store, "bob").claim(&task).unwrap().is_some());
        assert_eq!(alice.expire_stale_claims(Duration::from_secs(60)).unwrap().len(), 1);
    }

    #[test]
    fn test_unparsable_timestamp_is_stale() {
        let (store, _dir) = setup();
        let path = store.claims_dir().join("tasks/carol.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"contributor_id":"carol","claims":[{"task_address":"0.7.1.00009","contributor_id":"carol","claimed_at":"yesterday","status":"active"}]}"#,
        )
        .unwrap();

        let stale = claimer(&store, "alice").get_stale_claims(Duration::from_secs(3600)).unwrap();
        assert_eq!(stale.len(), 1);
        assert!(stale[0].claimed_at.is_none());
    }

    #[test]
    fn test_detect_conflicts_earliest_wins() {
        let (store, _dir) = setup();
        let alice = claimer(&store, "alice");
        let bob = claimer(&store, "bob");
        bob.ledger
            .update_own(|f| f.claims.push(raw_claim("0.7.1.00004", "bob", "2026-03-01T10:00:00Z")))
            .unwrap();
        alice
            .ledger
            .update_own(|f| f.claims.push(raw_claim("0.7.1.00004", "alice", "2026-03-01T10:00:05Z")))
            .unwrap();

        let conflicts = alice.detect_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].winner.contributor_id.as_str(), "bob");
        assert_eq!(conflicts[0].losers.len(), 1);
        assert_eq!(conflicts[0].authority, Authority::ClaimedAt);
    }

    #[test]
    fn test_merge_claim_lists() {
        let early = raw_claim("1.1.5", "alice", "2026-01-01T00:00:00Z");
        let late = raw_claim("1.1.5", "alice", "2026-01-02T00:00:00Z");
        let other = raw_claim("1.1.6", "alice", "2026-01-03T00:00:00Z");
        let mut done = early.clone();
        done.status = ClaimStatus::Completed;

        let merged = merge_claim_lists(&[late, other.clone()], &[early.clone()]);
        assert_eq!(merged, vec![early.clone(), other]);

        let merged = merge_claim_lists(&[early], &[done.clone()]);
        assert_eq!(merged, vec![done]);
    }
}
