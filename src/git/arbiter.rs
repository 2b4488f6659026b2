//! Push-order arbitration of double claims
//!
//! `claimed_at` comes from each contributor's own clock, so it can only give a
//! provisional answer. Once claims have reached the shared remote, the order in
//! which the claiming commits landed there is authoritative: the claim whose
//! commit is an ancestor of the others was pushed first.
//!
//! The claiming commit is the oldest one whose version of the contributor's
//! ledger holds that exact claim (same task, same `claimed_at`). Earlier claims
//! on the task that were since released do not count.

use super::repo::Repo;
use crate::claims::{Authority, ClaimConflict, ClaimFile, TaskClaim, TaskClaimer};
use crate::error::GitError;
use tracing::{debug, info, trace};

/// Re-rank `conflicts` by push order on `rev` (usually `<remote>/<branch>`).
///
/// `data_prefix` is the data directory relative to the repository root.
/// Conflicts where no contestant has been pushed keep their provisional winner.
pub async fn arbitrate_by_push_order(
    repo: &Repo,
    rev: &str,
    data_prefix: &str,
    conflicts: Vec<ClaimConflict>,
) -> Result<Vec<ClaimConflict>, GitError> {
    let mut ranked = Vec::with_capacity(conflicts.len());
    for conflict in conflicts {
        ranked.push(arbitrate_one(repo, rev, data_prefix, conflict).await?);
    }
    Ok(ranked)
}

async fn arbitrate_one(
    repo: &Repo,
    rev: &str,
    data_prefix: &str,
    conflict: ClaimConflict,
) -> Result<ClaimConflict, GitError> {
    let task = conflict.task_address.to_string();

    let mut pushed: Vec<(TaskClaim, String)> = Vec::new();
    let mut unpushed: Vec<TaskClaim> = Vec::new();
    for claim in conflict.contestants() {
        let file = join_prefix(data_prefix, &TaskClaimer::relative_file(&claim.contributor_id));
        match claiming_commit(repo, rev, &file, claim).await? {
            Some(commit) => pushed.push((claim.clone(), commit)),
            None => unpushed.push(claim.clone()),
        }
    }

    if pushed.is_empty() {
        debug!(%task, "No contested claim has been pushed yet");
        return Ok(conflict);
    }

    let mut first = 0;
    for i in 1..pushed.len() {
        if pushed[i].1 != pushed[first].1 && repo.is_ancestor(&pushed[i].1, &pushed[first].1).await? {
            first = i;
        }
    }

    let (winner, _) = pushed.remove(first);
    let mut losers: Vec<TaskClaim> = pushed.into_iter().map(|(claim, _)| claim).collect();
    losers.sort_by(|a, b| a.precedence().cmp(&b.precedence()));
    unpushed.sort_by(|a, b| a.precedence().cmp(&b.precedence()));
    losers.extend(unpushed);

    if winner.contributor_id != conflict.winner.contributor_id {
        info!(
            %task,
            winner = %winner.contributor_id,
            provisional = %conflict.winner.contributor_id,
            "Push order overrides claim timestamps"
        );
    }

    Ok(ClaimConflict {
        task_address: conflict.task_address,
        winner,
        losers,
        authority: Authority::PushOrder,
    })
}

/// Oldest commit on `rev` whose copy of `file` carries `claim`
async fn claiming_commit(repo: &Repo, rev: &str, file: &str, claim: &TaskClaim) -> Result<Option<String>, GitError> {
    for commit in repo.commits_touching(rev, file).await? {
        let Some(raw) = repo.show(&commit, file).await? else {
            continue;
        };
        let ledger: ClaimFile = match serde_json::from_str(&raw) {
            Ok(ledger) => ledger,
            Err(e) => {
                trace!(%commit, file, error = %e, "Skipping unreadable ledger revision");
                continue;
            }
        };
        if ledger.claims.iter().any(|c| same_claim(c, claim)) {
            return Ok(Some(commit));
        }
    }
    Ok(None)
}

fn same_claim(a: &TaskClaim, b: &TaskClaim) -> bool {
    a.task_address == b.task_address && a.contributor_id == b.contributor_id && a.claimed_at == b.claimed_at
}

fn join_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() || prefix == "." {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}
