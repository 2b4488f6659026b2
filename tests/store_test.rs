//! Store, locking and index rebuild integration tests
//!
//! Covers:
//! - Lock contention and stale lock recovery
//! - History snapshots on overwrite
//! - Links with identical endpoints at different times
//! - Rebuild idempotence on a populated store

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::addr;
use hypernet_store::link::link_types;
use hypernet_store::locks::FileLock;
use hypernet_store::{IndexRebuilder, Link, LockScope, LockSettings, Node, NodeFilter, Store};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Store {
    Store::open(dir.path(), LockSettings::default()).unwrap()
}

// =============================================================================
// Locks
// =============================================================================

#[test]
fn test_lock_contention_times_out_then_succeeds() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let scope = LockScope::Node(addr("1.1"));

    let held = store.locks().acquire(&scope).unwrap();

    let start = Instant::now();
    let err = store
        .locks()
        .acquire_within(&scope, Duration::from_millis(100))
        .unwrap_err();
    let waited = start.elapsed();
    assert!(matches!(err, hypernet_store::LockError::Timeout { .. }));
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(2), "timeout took {waited:?}");

    held.release().unwrap();

    let start = Instant::now();
    let again = store
        .locks()
        .acquire_within(&scope, Duration::from_millis(100))
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    again.release().unwrap();
}

#[test]
fn test_lock_timeout_surfaces_as_retryable_store_error() {
    let dir = TempDir::new().unwrap();
    let settings = LockSettings {
        wait: Duration::from_millis(50),
        ..LockSettings::default()
    };
    let store = Store::open(dir.path(), settings).unwrap();
    let _held = store.locks().node(&addr("1.2")).unwrap();

    let err = store.put(&Node::new(addr("1.2"))).unwrap_err();
    assert!(err.is_retryable());
    assert!(store.get(&addr("1.2")).unwrap().is_none());
}

#[test]
fn test_stale_lock_from_dead_process_is_broken() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".locks").join("node-1_1.lock");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let now = Utc::now();
    std::fs::write(&path, format!("999999999:{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())).unwrap();

    let lock = FileLock::new(&path, Duration::from_secs(60));
    let start = Instant::now();
    let guard = lock.acquire(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(lock.holder().unwrap().unwrap().pid, std::process::id());
    guard.release().unwrap();
    assert!(!path.exists());
}

// =============================================================================
// Entities & history
// =============================================================================

#[test]
fn test_second_write_snapshots_first() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let address = addr("1.1.2.1.00001");

    let first = Node::new(address.clone()).set("title", "draft");
    store.put(&first).unwrap();
    let first_bytes = std::fs::read_to_string(store.node_path(&address)).unwrap();

    let second = Node::new(address.clone()).set("title", "final");
    store.put(&second).unwrap();

    let history = store.get_history(&address).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(
        history[0].node,
        serde_json::from_str::<serde_json::Value>(&first_bytes).unwrap()
    );
    assert_eq!(store.get(&address).unwrap().unwrap().data["title"], "final");
    assert_eq!(store.get_version(&address, 1).unwrap().unwrap().data["title"], "draft");
    assert!(store.get_version(&address, 2).unwrap().is_none());
    assert!(store.get_version(&address, 0).unwrap().is_none());
}

#[test]
fn test_soft_and_hard_delete() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store.put(&Node::new(addr("2.1")).with_type(addr("0.5.2"))).unwrap();
    store.put(&Node::new(addr("2.2")).with_type(addr("0.5.2"))).unwrap();

    assert!(store.delete(&addr("2.1"), false).unwrap());
    assert!(store.get(&addr("2.1")).unwrap().unwrap().is_deleted());
    assert_eq!(store.get_history(&addr("2.1")).unwrap().len(), 1);
    let visible = store.list(&NodeFilter::default().of_type(addr("0.5.2"))).unwrap();
    assert_eq!(visible.len(), 1);
    let all = store
        .list(&NodeFilter::default().of_type(addr("0.5.2")).include_deleted())
        .unwrap();
    assert_eq!(all.len(), 2);

    assert!(store.delete(&addr("2.2"), true).unwrap());
    assert!(store.get(&addr("2.2")).unwrap().is_none());
    assert!(store.get_history(&addr("2.2")).unwrap().is_empty());
    assert!(!store.indexes().node_index.contains_key("2.2"));
    assert!(!store.delete(&addr("2.2"), true).unwrap());
}

#[test]
fn test_next_address_is_advisory_successor() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let prefix = addr("3.1.2");
    assert_eq!(store.next_address(&prefix).unwrap().to_string(), "3.1.2.00001");

    store.put(&Node::new(addr("3.1.2.00001"))).unwrap();
    store.put(&Node::new(addr("3.1.2.00007"))).unwrap();
    assert_eq!(store.next_address(&prefix).unwrap().to_string(), "3.1.2.00008");
    assert_eq!(store.count_instances(&prefix), 2);
}

// =============================================================================
// Links
// =============================================================================

#[test]
fn test_same_endpoints_different_times_are_distinct_links() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let from = addr("1.1");
    let to = addr("2.1");
    let t0 = Utc::now();

    let a = Link::new(from.clone(), to.clone(), link_types::PERSON_TO_OBJECT, "authored")
        .unwrap()
        .created_at(t0);
    let b = Link::new(from.clone(), to.clone(), link_types::PERSON_TO_OBJECT, "authored")
        .unwrap()
        .created_at(t0 + ChronoDuration::seconds(5));

    let id_a = store.put_link(&a).unwrap();
    let id_b = store.put_link(&b).unwrap();
    assert_ne!(id_a, id_b);
    assert!(store.get_link(&id_a).unwrap().is_some());
    assert!(store.get_link(&id_b).unwrap().is_some());

    let outgoing = store.links_from(&from, Some("authored")).unwrap();
    assert_eq!(outgoing.len(), 2);
    assert_eq!(store.links_to(&to, None).unwrap().len(), 2);

    assert!(store.remove_link(&id_a).unwrap());
    assert_eq!(store.links_from(&from, None).unwrap().len(), 1);
}

#[test]
fn test_neighbors_follow_bidirectional_links() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store
        .put_link(&Link::new(addr("1.1"), addr("1.2"), link_types::PERSON_TO_PERSON, "knows").unwrap().bidirectional())
        .unwrap();
    store
        .put_link(&Link::new(addr("1.3"), addr("1.1"), link_types::PERSON_TO_PERSON, "follows").unwrap())
        .unwrap();

    assert_eq!(store.get_neighbors(&addr("1.1"), None).unwrap(), vec![addr("1.2")]);
    assert_eq!(store.get_neighbors(&addr("1.2"), None).unwrap(), vec![addr("1.1")]);
}

// =============================================================================
// Index rebuild
// =============================================================================

#[test]
fn test_rebuild_twice_is_identical() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    for i in 1..=50u64 {
        let node = Node::new(addr(&format!("2.1.{i:05}")))
            .with_type(addr(&format!("0.5.{}", i % 4 + 1)))
            .set("n", i);
        store.put(&node).unwrap();
    }
    let base = Utc::now();
    for i in 0..80u64 {
        let from = addr(&format!("2.1.{:05}", i % 50 + 1));
        let to = addr(&format!("2.1.{:05}", (i * 7) % 50 + 1));
        let to = if to == from { addr("1.1") } else { to };
        let link = Link::new(from, to, link_types::OBJECT_TO_OBJECT, "relates")
            .unwrap()
            .created_at(base + ChronoDuration::milliseconds(i as i64));
        store.put_link(&link).unwrap();
    }

    let rebuilder = IndexRebuilder::new(&store);
    let first = rebuilder.rebuild_all().unwrap();
    let snapshot = store.indexes();
    let files: Vec<Vec<u8>> = index_files(&store);

    let second = rebuilder.rebuild_all().unwrap();
    assert_eq!(store.indexes(), snapshot);
    assert_eq!(index_files(&store), files);

    assert_eq!((first.entities_indexed, first.links_indexed), (50, 80));
    assert_eq!((second.entities_indexed, second.links_indexed), (50, 80));
    assert!(rebuilder.validate().unwrap().is_empty());
    assert_eq!(store.stats().nodes, 50);
    assert_eq!(store.stats().links, 80);
}

fn index_files(store: &Store) -> Vec<Vec<u8>> {
    let mut paths: Vec<_> = std::fs::read_dir(store.indexes_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    paths.iter().map(|p| std::fs::read(p).unwrap()).collect()
}
