//! End-to-end sync between two clones of a bare repository
//!
//! Uses the real `git` binary; every test returns early when it is missing.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::addr;
use hypernet_store::config::GitConfig;
use hypernet_store::git::{PullStatus, PushStatus};
use hypernet_store::{ContributorId, GitBatchCoordinator, GitCli, LockSettings, Node, Store};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(["-c", "user.name=setup", "-c", "user.email=setup@example.org", "-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A bare remote with one commit on `main` and two clones, `alice` and `bob`
fn remote_with_clones() -> TempDir {
    let dir = TempDir::new().unwrap();
    let seed = dir.path().join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    git(&seed, &["init", "--quiet", "--initial-branch=main"]);
    std::fs::write(seed.join("README.md"), "shared hypernet data\n").unwrap();
    git(&seed, &["add", "README.md"]);
    git(&seed, &["commit", "--quiet", "-m", "seed"]);
    git(dir.path(), &["clone", "--quiet", "--bare", "seed", "remote.git"]);
    for who in ["alice", "bob"] {
        git(dir.path(), &["clone", "--quiet", "remote.git", who]);
        let clone = dir.path().join(who);
        git(&clone, &["config", "commit.gpgsign", "false"]);
        git(&clone, &["config", "user.name", who]);
        git(&clone, &["config", "user.email", &format!("{who}@example.org")]);
    }
    dir
}

async fn contributor(root: &Path, who: &str) -> GitBatchCoordinator {
    let clone = root.join(who);
    let store = Arc::new(Store::open(clone.join("data"), LockSettings::default()).unwrap());
    let config = GitConfig {
        base_retry_delay_ms: 10,
        max_retry_delay_ms: 100,
        ..GitConfig::default()
    };
    let mut coordinator = GitBatchCoordinator::new(
        store,
        Arc::new(GitCli::new(&clone)),
        config,
        ContributorId::new(who).unwrap(),
    );
    assert_eq!(coordinator.setup_contributor().await.unwrap(), "main");
    coordinator
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn test_unrelated_edits_reach_both_clones() {
    if !git_available() {
        return;
    }
    let dir = remote_with_clones();
    let alice = contributor(dir.path(), "alice").await;
    let bob = contributor(dir.path(), "bob").await;

    alice.store().put(&Node::new(addr("1.1")).set("name", "Alice")).unwrap();
    let first = alice.sync().await;
    assert!(first.success(), "alice: {} / {:?}", first.pull.message, first.push.map(|p| p.message));

    bob.store().put(&Node::new(addr("2.1")).set("name", "Bob")).unwrap();
    let second = bob.sync().await;
    assert!(second.success(), "bob: {}", second.pull.message);
    assert!(second.pull.files_updated >= 1);
    assert!(bob.store().get(&addr("1.1")).unwrap().is_some());
    assert!(bob.store().indexes().node_index.contains_key("1.1"));

    let third = alice.sync().await;
    assert!(third.success());
    assert_eq!(third.push.as_ref().map(|p| p.status), Some(PushStatus::NothingToPush));
    assert_eq!(alice.store().get(&addr("2.1")).unwrap().unwrap().data["name"], "Bob");
    assert!(alice.store().indexes().node_index.contains_key("2.1"));

    let status = alice.status().await.unwrap();
    assert_eq!((status.ahead, status.behind), (0, 0));
    assert!(!status.integration_paused);
}

#[tokio::test]
async fn test_stale_push_is_rebased_and_retried() {
    if !git_available() {
        return;
    }
    let dir = remote_with_clones();
    let alice = contributor(dir.path(), "alice").await;
    let bob = contributor(dir.path(), "bob").await;

    alice.store().put(&Node::new(addr("1.2"))).unwrap();
    assert_eq!(alice.push_batch(None, None).await.status, PushStatus::Success);

    // Bob pushes without pulling first
    bob.store().put(&Node::new(addr("2.2"))).unwrap();
    let result = bob.push_batch(None, None).await;
    assert_eq!(result.status, PushStatus::Success, "{}", result.message);
    assert_eq!(result.retries, 1);
    assert_eq!(result.files_pushed, 1);
    assert!(bob.store().get(&addr("1.2")).unwrap().is_some());

    let pull = alice.pull().await;
    assert_eq!(pull.status, PullStatus::Success);
    assert!(alice.store().get(&addr("2.2")).unwrap().is_some());
}

#[tokio::test]
async fn test_same_entity_edited_twice_keeps_latest_and_history() {
    if !git_available() {
        return;
    }
    let dir = remote_with_clones();
    let alice = contributor(dir.path(), "alice").await;
    let bob = contributor(dir.path(), "bob").await;
    let address = addr("3.1");
    let t1 = Utc::now();

    let mut from_alice = Node::new(address.clone()).set("title", "alice's version");
    from_alice.updated_at = t1;
    alice.store().put(&from_alice).unwrap();
    assert_eq!(alice.push_batch(None, None).await.status, PushStatus::Success);

    let mut from_bob = Node::new(address.clone()).set("title", "bob's version");
    from_bob.updated_at = t1 + ChronoDuration::seconds(30);
    bob.store().put(&from_bob).unwrap();

    let result = bob.push_batch(None, None).await;
    assert_eq!(result.status, PushStatus::Success, "{}", result.message);
    assert_eq!(result.retries, 1);
    assert_eq!(result.conflicts_resolved, 1);

    let kept = bob.store().get(&address).unwrap().unwrap();
    assert_eq!(kept.data["title"], "bob's version");
    let history = bob.store().get_history(&address).unwrap();
    assert!(history
        .iter()
        .any(|s| s.source.as_deref() == Some("conflict_resolution") && s.node["data"]["title"] == "alice's version"));

    // The preserved snapshot travels with the next batch
    assert_eq!(bob.push_batch(None, None).await.status, PushStatus::Success);
    alice.pull().await;
    assert_eq!(alice.store().get(&address).unwrap().unwrap().data["title"], "bob's version");
    assert!(!alice.store().get_history(&address).unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_on_non_ascii_address_is_resolved() {
    if !git_available() {
        return;
    }
    let dir = remote_with_clones();
    let alice = contributor(dir.path(), "alice").await;
    let bob = contributor(dir.path(), "bob").await;
    let address = addr("3.café");
    let t1 = Utc::now();

    let mut from_alice = Node::new(address.clone()).set("title", "première");
    from_alice.updated_at = t1;
    alice.store().put(&from_alice).unwrap();
    assert_eq!(alice.push_batch(None, None).await.status, PushStatus::Success);

    let mut from_bob = Node::new(address.clone()).set("title", "seconde");
    from_bob.updated_at = t1 + ChronoDuration::seconds(30);
    bob.store().put(&from_bob).unwrap();

    let result = bob.push_batch(None, None).await;
    assert_eq!(result.status, PushStatus::Success, "{}", result.message);
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(bob.store().get(&address).unwrap().unwrap().data["title"], "seconde");
    assert!(!bob.status().await.unwrap().integration_paused);

    alice.pull().await;
    assert_eq!(alice.store().get(&address).unwrap().unwrap().data["title"], "seconde");
}
