//! Address reservation and task claim tests across contributors
//!
//! Both contributors share one data directory here, which is what each of
//! them sees after a sync.

mod common;

use common::addr;
use hypernet_store::{AddressAllocator, Authority, ContributorId, LockSettings, Node, Store, TaskClaimer};
use std::time::Duration;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Store {
    Store::open(dir.path(), LockSettings::default()).unwrap()
}

fn id(who: &str) -> ContributorId {
    ContributorId::new(who).unwrap()
}

// =============================================================================
// Address ranges
// =============================================================================

#[test]
fn test_sequential_reservations_do_not_collide() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let prefix = addr("0.7.1");
    let alice = AddressAllocator::new(&store, id("alice"));
    let bob = AddressAllocator::new(&store, id("bob"));

    let a = alice.reserve_range(&prefix).unwrap();
    let b = bob.reserve_range(&prefix).unwrap();

    assert_eq!((a.range_start, a.last()), (1, 100));
    assert_eq!((b.range_start, b.last()), (101, 200));
    assert!(alice.detect_collisions().unwrap().is_empty());
    assert!(bob.detect_collisions().unwrap().is_empty());

    let reservations = alice.reservations_for(&prefix).unwrap();
    assert_eq!(reservations.len(), 2);
    assert_eq!(reservations[0].contributor_id.as_str(), "alice");
    assert_eq!(reservations[1].contributor_id.as_str(), "bob");
}

#[test]
fn test_allocations_stay_inside_own_block() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let prefix = addr("2.4.1");
    let alice = AddressAllocator::new(&store, id("alice"));
    let bob = AddressAllocator::new(&store, id("bob"));

    let from_alice = alice.next_address(&prefix).unwrap();
    store.put(&Node::new(from_alice.clone())).unwrap();
    let from_bob = bob.next_address(&prefix).unwrap();
    store.put(&Node::new(from_bob.clone())).unwrap();

    assert_eq!(from_alice.to_string(), "2.4.1.00001");
    assert_eq!(from_bob.to_string(), "2.4.1.00101");
    assert_eq!(alice.next_address(&prefix).unwrap().to_string(), "2.4.1.00002");
}

#[test]
fn test_offline_overlap_is_reported_with_affected_entities() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let prefix = addr("0.7.1");
    let alice = AddressAllocator::new(&store, id("alice"));
    alice.reserve_range(&prefix).unwrap();

    // Bob picked 51..150 without having seen Alice's reservation
    let bob_file = store.claims_dir().join("addresses").join("bob.json");
    std::fs::write(
        &bob_file,
        serde_json::json!({
            "contributor_id": "bob",
            "reservations": [{
                "contributor_id": "bob",
                "prefix": "0.7.1",
                "range_start": 51,
                "range_end": 151,
                "reserved_at": "2026-01-01T00:00:00Z"
            }]
        })
        .to_string(),
    )
    .unwrap();
    store.put(&Node::new(addr("0.7.1.00003"))).unwrap();
    store.put(&Node::new(addr("0.7.1.00060"))).unwrap();
    store.put(&Node::new(addr("0.7.1.00120"))).unwrap();

    let collisions = alice.detect_collisions().unwrap();
    assert_eq!(collisions.len(), 1);
    let collision = &collisions[0];
    assert_eq!(collision.prefix, prefix);
    assert_eq!((collision.overlap_start, collision.overlap_end), (51, 101));
    assert_eq!(collision.affected, vec![addr("0.7.1.00060")]);

    // New blocks go past every known range
    let next = alice.reserve_range(&prefix).unwrap();
    assert_eq!(next.range_start, 151);
}

// =============================================================================
// Task claims
// =============================================================================

#[test]
fn test_claim_is_exclusive_until_released() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let task = addr("0.7.1.00001");
    let alice = TaskClaimer::new(&store, id("alice"));
    let bob = TaskClaimer::new(&store, id("bob"));

    let claim = alice.claim(&task).unwrap().unwrap();
    assert_eq!(claim.contributor_id.as_str(), "alice");
    assert!(bob.claim(&task).unwrap().is_none());
    assert_eq!(bob.get_claim(&task).unwrap().unwrap().contributor_id.as_str(), "alice");

    assert!(alice.release(&task).unwrap());
    assert!(bob.claim(&task).unwrap().is_some());
    assert!(alice.detect_conflicts().unwrap().is_empty());
}

#[test]
fn test_concurrent_offline_claims_are_detected() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let task = addr("0.7.1.00002");

    // Both contributors claimed while disconnected; the files met on pull
    for (who, at) in [("alice", "2026-02-01T09:00:10Z"), ("bob", "2026-02-01T09:00:00Z")] {
        let path = store.claims_dir().join("tasks").join(format!("{who}.json"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::json!({
                "contributor_id": who,
                "claims": [{
                    "task_address": task.to_string(),
                    "contributor_id": who,
                    "claimed_at": at,
                    "status": "active"
                }]
            })
            .to_string(),
        )
        .unwrap();
    }

    let conflicts = TaskClaimer::new(&store, id("alice")).detect_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].task_address, task);
    assert_eq!(conflicts[0].winner.contributor_id.as_str(), "bob");
    assert_eq!(conflicts[0].losers[0].contributor_id.as_str(), "alice");
    assert_eq!(conflicts[0].authority, Authority::ClaimedAt);
    assert_eq!(conflicts[0].contestants().count(), 2);
}

#[test]
fn test_stale_claim_can_be_taken_over() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let task = addr("0.7.1.00003");
    let alice = TaskClaimer::new(&store, id("alice")).with_stale_after(Duration::from_millis(20));
    let bob = TaskClaimer::new(&store, id("bob")).with_stale_after(Duration::from_millis(20));

    alice.claim(&task).unwrap().unwrap();
    assert!(bob.claim(&task).unwrap().is_none());

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(bob.get_stale_claims(Duration::from_millis(20)).unwrap().len(), 1);
    assert!(bob.claim(&task).unwrap().is_some());

    let expired = alice.expire_stale_claims(Duration::from_millis(20)).unwrap();
    assert_eq!(expired.len(), 1);
    assert!(alice.get_my_active_claims().unwrap().is_empty());
}
