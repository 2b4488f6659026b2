//! Automatic merge-conflict resolution
//!
//! Conflicted files are classified by path and resolved per kind:
//!
//! | kind                | strategy                                        |
//! |---------------------|-------------------------------------------------|
//! | node                | newest `updated_at` wins, loser kept in history |
//! | link                | richer (larger) side wins                       |
//! | index               | take incoming; indexes are rebuilt after pull   |
//! | task claim          | merge claim lists                               |
//! | address reservation | union of reservations                           |
//! | history             | keep incoming, re-append the other snapshot     |
//! | anything else       | manual queue                                    |
//!
//! Nothing is silently discarded: every losing entity payload ends up in the
//! entity's history with source `conflict_resolution`.

use super::queue::ManualResolutionQueue;
use super::repo::{Integration, Repo};
use crate::address::Address;
use crate::allocator::{AddressReservation, ReservationFile};
use crate::claims::{merge_claim_lists, ClaimFile};
use crate::error::{GitError, StoreError};
use crate::store::fs::{write_atomic, write_json_atomic};
use crate::store::history::{Snapshot, CONFLICT_SOURCE};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolve/continue cycles attempted before giving up
pub const DEFAULT_MAX_ROUNDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Node,
    Link,
    Index,
    TaskClaim,
    AddressReservation,
    History,
    Other,
}

impl ConflictKind {
    pub fn strategy(self) -> Strategy {
        match self {
            ConflictKind::Node => Strategy::LatestWins,
            ConflictKind::Link => Strategy::KeepRicher,
            ConflictKind::Index => Strategy::TakeIncoming,
            ConflictKind::TaskClaim => Strategy::MergeClaims,
            ConflictKind::AddressReservation => Strategy::UnionReservations,
            ConflictKind::History => Strategy::KeepBoth,
            ConflictKind::Other => Strategy::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LatestWins,
    KeepRicher,
    TakeIncoming,
    MergeClaims,
    UnionReservations,
    KeepBoth,
    Manual,
}

/// Which side of a conflict survived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The current `HEAD`
    Ours,
    /// The commit being integrated (`REBASE_HEAD` or `MERGE_HEAD`)
    Theirs,
    Merged,
}

/// Classify a repository-relative path. Pure; the only place paths are mapped to kinds.
pub fn classify(path: &str) -> ConflictKind {
    let normalized = path.replace('\\', "/");
    let segments: Vec<&str> = normalized.split('/').collect();
    let Some((file, dirs)) = segments.split_last() else {
        return ConflictKind::Other;
    };
    let has = |name: &str| dirs.contains(&name);
    let follows = |parent: &str, child: &str| dirs.windows(2).any(|w| w[0] == parent && w[1] == child);
    let json = file.ends_with(".json");

    if has("indexes") {
        ConflictKind::Index
    } else if json && follows(".claims", "tasks") {
        ConflictKind::TaskClaim
    } else if json && follows(".claims", "addresses") {
        ConflictKind::AddressReservation
    } else if json && has("history") {
        ConflictKind::History
    } else if *file == crate::store::NODE_FILE && has("nodes") {
        ConflictKind::Node
    } else if json && has("links") {
        ConflictKind::Link
    } else {
        ConflictKind::Other
    }
}

/// Outcome for one conflicted file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub filepath: String,
    pub conflict_type: ConflictKind,
    pub strategy: Strategy,
    pub resolved: bool,
    pub winner: Option<Side>,
    pub detail: String,
}

impl ConflictEntry {
    pub fn resolved(filepath: &str, kind: ConflictKind, winner: Side, detail: impl Into<String>) -> Self {
        Self {
            filepath: filepath.to_string(),
            conflict_type: kind,
            strategy: kind.strategy(),
            resolved: true,
            winner: Some(winner),
            detail: detail.into(),
        }
    }

    pub fn unresolved(filepath: &str, kind: ConflictKind, detail: impl Into<String>) -> Self {
        Self {
            filepath: filepath.to_string(),
            conflict_type: kind,
            strategy: kind.strategy(),
            resolved: false,
            winner: None,
            detail: detail.into(),
        }
    }
}

/// Pick between two entity payloads: newer `updated_at` wins, ties go to theirs
pub fn pick_entity_winner(ours: &Value, theirs: &Value) -> Side {
    if updated_at(theirs) >= updated_at(ours) {
        Side::Theirs
    } else {
        Side::Ours
    }
}

/// Pick between two link payloads: the larger serialization wins, ties go to theirs
pub fn pick_link_winner(ours: &Value, theirs: &Value) -> Side {
    let size = |v: &Value| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0);
    if size(theirs) >= size(ours) {
        Side::Theirs
    } else {
        Side::Ours
    }
}

fn updated_at(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Union of two reservation lists, one entry per `(prefix, range_start)`
pub fn union_reservations(ours: &[AddressReservation], theirs: &[AddressReservation]) -> Vec<AddressReservation> {
    let mut merged: BTreeMap<(Address, u64), AddressReservation> = BTreeMap::new();
    for r in ours.iter().chain(theirs) {
        let key = (r.prefix.clone(), r.range_start);
        match merged.get(&key) {
            Some(kept) if kept.reserved_at <= r.reserved_at => {}
            _ => {
                merged.insert(key, r.clone());
            }
        }
    }
    merged.into_values().collect()
}

/// Where a resolution pass left the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No conflicts and no paused integration
    Clean,
    /// Every conflict resolved and the integration finished
    Completed,
    /// Some files need a human; the integration is left paused
    Paused,
    /// Still conflicting after the maximum number of rounds
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionReport {
    pub outcome: Outcome,
    pub rounds: usize,
    pub entries: Vec<ConflictEntry>,
}

impl ResolutionReport {
    pub fn is_clean(&self) -> bool {
        matches!(self.outcome, Outcome::Clean | Outcome::Completed)
    }

    pub fn resolved_count(&self) -> usize {
        self.entries.iter().filter(|e| e.resolved).count()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictEntry> {
        self.entries.iter().filter(|e| !e.resolved)
    }
}

/// The winning payload of a two-sided conflict plus the loser to preserve
struct Choice {
    side: Side,
    winner: Option<String>,
    loser: Option<String>,
}

/// Resolves conflicts left by a paused rebase or merge
#[derive(Clone)]
pub struct ConflictResolver {
    repo: Repo,
    store: Arc<Store>,
    queue: ManualResolutionQueue,
    max_rounds: usize,
}

impl ConflictResolver {
    pub fn new(repo: Repo, store: Arc<Store>) -> Self {
        let queue = ManualResolutionQueue::new(&store);
        Self {
            repo,
            store,
            queue,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn queue(&self) -> &ManualResolutionQueue {
        &self.queue
    }

    /// Resolve every conflicted file, continue the integration, and repeat
    /// while later commits conflict too.
    pub async fn resolve_all(&self) -> Result<ResolutionReport, GitError> {
        let mut report = ResolutionReport {
            outcome: Outcome::Clean,
            rounds: 0,
            entries: Vec::new(),
        };

        while report.rounds < self.max_rounds {
            let files = self.repo.conflicted_files().await?;
            let integration = self.repo.integration().await?;
            if files.is_empty() && integration == Integration::None {
                return Ok(report);
            }
            report.rounds += 1;

            let mut all_resolved = true;
            for path in &files {
                let entry = self.resolve_file(path).await;
                if entry.resolved {
                    debug!(path = %entry.filepath, strategy = ?entry.strategy, "Resolved conflict");
                } else {
                    all_resolved = false;
                    warn!(path = %entry.filepath, detail = %entry.detail, "Conflict needs manual resolution");
                    let queue = self.queue.clone();
                    let queued = entry.clone();
                    match tokio::task::spawn_blocking(move || queue.add(&queued)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Failed to queue conflict"),
                        Err(e) => warn!(error = %e, "Conflict queue task failed"),
                    }
                }
                report.entries.push(entry);
            }

            if !all_resolved {
                report.outcome = Outcome::Paused;
                return Ok(report);
            }

            self.continue_integration(integration).await?;
            report.outcome = Outcome::Completed;
        }

        if !self.repo.conflicted_files().await?.is_empty()
            || self.repo.integration().await? != Integration::None
        {
            warn!(rounds = report.rounds, "Gave up resolving conflicts");
            report.outcome = Outcome::Exhausted;
        }
        Ok(report)
    }

    /// Continue a paused rebase or merge. Stopping again on a later
    /// conflicting commit is not an error; the next round picks it up.
    async fn continue_integration(&self, integration: Integration) -> Result<(), GitError> {
        match integration {
            Integration::None => Ok(()),
            Integration::Merge => self.repo.commit_no_edit().await,
            Integration::Rebase => match self.repo.rebase_continue().await {
                Ok(()) => Ok(()),
                Err(e) if e.mentions_conflict() => Ok(()),
                Err(e) if is_empty_commit(&e) => {
                    debug!("Resolved commit is empty; skipping it");
                    match self.repo.rebase_skip().await {
                        Err(e) if !e.mentions_conflict() => Err(e),
                        _ => Ok(()),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn resolve_file(&self, path: &str) -> ConflictEntry {
        let kind = classify(path);
        let result = match kind {
            ConflictKind::Index => self.take_incoming(path).await,
            ConflictKind::Node => self.resolve_node(path).await,
            ConflictKind::Link => self.resolve_link(path).await,
            ConflictKind::TaskClaim => self.resolve_claims(path).await,
            ConflictKind::AddressReservation => self.resolve_reservations(path).await,
            ConflictKind::History => self.resolve_history(path).await,
            ConflictKind::Other => Err("no automatic strategy for this file".to_string()),
        };
        match result {
            Ok((side, detail)) => ConflictEntry::resolved(path, kind, side, detail),
            Err(detail) => ConflictEntry::unresolved(path, kind, detail),
        }
    }

    async fn take_incoming(&self, path: &str) -> Result<(Side, String), String> {
        if let Err(e) = self.repo.checkout_theirs(path).await {
            // Deleted on the incoming side
            debug!(path, error = %e, "No incoming version; removing");
            self.repo.remove(path).await.map_err(|e| e.to_string())?;
            return Ok((Side::Theirs, "removed; rebuilt after pull".to_string()));
        }
        self.stage(path).await?;
        Ok((Side::Theirs, "took incoming; rebuilt after pull".to_string()))
    }

    async fn resolve_node(&self, path: &str) -> Result<(Side, String), String> {
        let choice = self.choose(path, pick_entity_winner).await?;
        if let Some(loser) = &choice.loser {
            let address = entity_address(choice.winner.as_deref())
                .or_else(|| entity_address(Some(loser)))
                .ok_or_else(|| "cannot determine entity address".to_string())?;
            let snapshot = self.preserve(address, loser.clone()).await?;
            self.apply(path, &choice).await?;
            return Ok((
                choice.side,
                format!("latest wins; other side preserved as v{}", snapshot.version),
            ));
        }
        self.apply(path, &choice).await?;
        Ok((choice.side, "kept the only surviving side".to_string()))
    }

    async fn resolve_link(&self, path: &str) -> Result<(Side, String), String> {
        let choice = self.choose(path, pick_link_winner).await?;
        self.apply(path, &choice).await?;
        Ok((choice.side, "kept the richer link".to_string()))
    }

    async fn resolve_claims(&self, path: &str) -> Result<(Side, String), String> {
        let (ours, theirs) = self.both_sides::<ClaimFile>(path).await?;
        let owner = theirs
            .as_ref()
            .or(ours.as_ref())
            .map(|f| f.contributor_id.clone())
            .ok_or_else(|| "claim file missing on both sides".to_string())?;
        let claims = merge_claim_lists(
            ours.as_ref().map(|f| f.claims.as_slice()).unwrap_or_default(),
            theirs.as_ref().map(|f| f.claims.as_slice()).unwrap_or_default(),
        );
        let count = claims.len();
        self.write_merged(path, &ClaimFile { contributor_id: owner, claims }).await?;
        Ok((Side::Merged, format!("merged {count} claims")))
    }

    async fn resolve_reservations(&self, path: &str) -> Result<(Side, String), String> {
        let (ours, theirs) = self.both_sides::<ReservationFile>(path).await?;
        let owner = theirs
            .as_ref()
            .or(ours.as_ref())
            .map(|f| f.contributor_id.clone())
            .ok_or_else(|| "reservation file missing on both sides".to_string())?;
        let reservations = union_reservations(
            ours.as_ref().map(|f| f.reservations.as_slice()).unwrap_or_default(),
            theirs.as_ref().map(|f| f.reservations.as_slice()).unwrap_or_default(),
        );
        let count = reservations.len();
        self.write_merged(path, &ReservationFile { contributor_id: owner, reservations })
            .await?;
        Ok((Side::Merged, format!("union of {count} reservations")))
    }

    /// Two contributors wrote the same version number: keep the incoming
    /// snapshot in place and re-append ours as a newer version
    async fn resolve_history(&self, path: &str) -> Result<(Side, String), String> {
        let (Some(ours), Some(theirs)) = self.sides(path).await? else {
            let choice = self.choose(path, |_, _| Side::Theirs).await?;
            self.apply(path, &choice).await?;
            return Ok((choice.side, "kept the only surviving snapshot".to_string()));
        };
        let snapshot: Snapshot = serde_json::from_str(&ours).map_err(|e| format!("unreadable snapshot: {e}"))?;
        let address = entity_address(Some(&snapshot.node.to_string()))
            .ok_or_else(|| "snapshot has no entity address".to_string())?;

        self.apply(path, &Choice { side: Side::Theirs, winner: Some(theirs), loser: None })
            .await?;
        let payload = serde_json::to_string(&snapshot.node).map_err(|e| e.to_string())?;
        let appended = self.preserve(address, payload).await?;
        Ok((Side::Merged, format!("kept both; ours re-appended as v{}", appended.version)))
    }

    /// Both versions of `path`; `None` only where the side lacks the file.
    /// A failed read leaves the file for manual resolution.
    async fn sides(&self, path: &str) -> Result<(Option<String>, Option<String>), String> {
        let incoming_ref = self.repo.incoming_ref().await.map_err(|e| e.to_string())?;
        let ours = self
            .repo
            .show("HEAD", path)
            .await
            .map_err(|e| format!("cannot read our side: {e}"))?;
        let theirs = self
            .repo
            .show(incoming_ref, path)
            .await
            .map_err(|e| format!("cannot read incoming side: {e}"))?;
        Ok((ours, theirs))
    }

    async fn choose(&self, path: &str, pick: fn(&Value, &Value) -> Side) -> Result<Choice, String> {
        match self.sides(path).await? {
            (None, None) => Ok(Choice { side: Side::Theirs, winner: None, loser: None }),
            (Some(ours), None) => Ok(Choice { side: Side::Ours, winner: Some(ours), loser: None }),
            (None, Some(theirs)) => Ok(Choice { side: Side::Theirs, winner: Some(theirs), loser: None }),
            (Some(ours), Some(theirs)) => {
                let parsed = (
                    serde_json::from_str::<Value>(&ours),
                    serde_json::from_str::<Value>(&theirs),
                );
                let side = match parsed {
                    (Ok(o), Ok(t)) => pick(&o, &t),
                    (Ok(_), Err(_)) => Side::Ours,
                    (Err(_), Ok(_)) => Side::Theirs,
                    (Err(_), Err(_)) => return Err("neither side is valid JSON".to_string()),
                };
                Ok(match side {
                    Side::Ours => Choice { side, winner: Some(ours), loser: Some(theirs) },
                    _ => Choice { side, winner: Some(theirs), loser: Some(ours) },
                })
            }
        }
    }

    async fn both_sides<F: serde::de::DeserializeOwned>(&self, path: &str) -> Result<(Option<F>, Option<F>), String> {
        let parse = |raw: Option<String>| -> Result<Option<F>, String> {
            raw.map(|r| serde_json::from_str(&r).map_err(|e| format!("unreadable side: {e}")))
                .transpose()
        };
        let (ours, theirs) = self.sides(path).await?;
        Ok((parse(ours)?, parse(theirs)?))
    }

    async fn apply(&self, path: &str, choice: &Choice) -> Result<(), String> {
        match &choice.winner {
            Some(content) => {
                write_atomic(&self.absolute(path), content.as_bytes()).map_err(|e| e.to_string())?;
                self.stage(path).await
            }
            None => self.repo.remove(path).await.map_err(|e| e.to_string()),
        }
    }

    async fn write_merged<T: Serialize>(&self, path: &str, value: &T) -> Result<(), String> {
        write_json_atomic(&self.absolute(path), value).map_err(|e| e.to_string())?;
        self.stage(path).await
    }

    async fn stage(&self, path: &str) -> Result<(), String> {
        self.repo.add(&[path.to_string()]).await.map_err(|e| e.to_string())
    }

    async fn preserve(&self, address: Address, payload: String) -> Result<Snapshot, String> {
        let store = Arc::clone(&self.store);
        let snapshot = tokio::task::spawn_blocking(move || {
            store.preserve_version(&address, &payload, CONFLICT_SOURCE)
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e: StoreError| e.to_string())?;
        info!(version = snapshot.version, "Preserved losing side of conflict");
        Ok(snapshot)
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.repo.root().join(path)
    }
}

fn entity_address(raw: Option<&str>) -> Option<Address> {
    let value: Value = serde_json::from_str(raw?).ok()?;
    Address::parse(value.get("address")?.as_str()?).ok()
}

fn is_empty_commit(e: &GitError) -> bool {
    let out = e.output().to_lowercase();
    out.contains("nothing to commit") || out.contains("no changes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        assert_eq!(classify("data/nodes/1/1/node.json"), ConflictKind::Node);
        assert_eq!(classify("nodes/0/7/1/00001/node.json"), ConflictKind::Node);
        assert_eq!(classify("data/links/0123456789abcdef.json"), ConflictKind::Link);
        assert_eq!(classify("data/indexes/node_index.json"), ConflictKind::Index);
        assert_eq!(classify("data/.claims/tasks/alice.json"), ConflictKind::TaskClaim);
        assert_eq!(classify("data/.claims/addresses/alice.json"), ConflictKind::AddressReservation);
        assert_eq!(classify("data/history/1/1/v0002.json"), ConflictKind::History);
        assert_eq!(classify("README.md"), ConflictKind::Other);
        assert_eq!(classify("data/nodes/1/1/notes.txt"), ConflictKind::Other);
    }

    #[test]
    fn test_entity_winner_by_updated_at() {
        let older = json!({"address": "1.1", "updated_at": "2026-01-01T00:00:00Z"});
        let newer = json!({"address": "1.1", "updated_at": "2026-01-02T00:00:00Z"});
        assert_eq!(pick_entity_winner(&older, &newer), Side::Theirs);
        assert_eq!(pick_entity_winner(&newer, &older), Side::Ours);
        assert_eq!(pick_entity_winner(&newer, &newer), Side::Theirs);
        assert_eq!(pick_entity_winner(&json!({}), &older), Side::Theirs);
        assert_eq!(pick_entity_winner(&older, &json!({})), Side::Ours);
    }

    #[test]
    fn test_link_winner_by_size() {
        let small = json!({"relationship": "a"});
        let rich = json!({"relationship": "a", "data": {"note": "details"}});
        assert_eq!(pick_link_winner(&small, &rich), Side::Theirs);
        assert_eq!(pick_link_winner(&rich, &small), Side::Ours);
        assert_eq!(pick_link_winner(&small, &small), Side::Theirs);
    }

    #[test]
    fn test_union_reservations_dedups_by_start() {
        let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
        let r = |start: u64, when: &str| AddressReservation {
            contributor_id: crate::contributor::ContributorId::new("alice").unwrap(),
            prefix: Address::parse("0.7.1").unwrap(),
            range_start: start,
            range_end: start + 100,
            reserved_at: at(when),
        };
        let ours = vec![r(1, "2026-01-01T00:00:00Z"), r(101, "2026-01-03T00:00:00Z")];
        let theirs = vec![r(101, "2026-01-02T00:00:00Z"), r(201, "2026-01-04T00:00:00Z")];
        let merged = union_reservations(&ours, &theirs);
        assert_eq!(merged.iter().map(|r| r.range_start).collect::<Vec<_>>(), vec![1, 101, 201]);
        assert_eq!(merged[1].reserved_at, at("2026-01-02T00:00:00Z"));
    }

    #[test]
    fn test_entity_address_from_payload() {
        assert_eq!(entity_address(Some(r#"{"address":"2.1.3"}"#)), Address::parse("2.1.3").ok());
        assert_eq!(entity_address(Some("<<<<<<< HEAD")), None);
        assert_eq!(entity_address(None), None);
    }
}
