//! File-backed graph store
//!
//! The data directory is the database. Entities and links are individual JSON
//! files; indexes are derived caches; history is append-only.
//!
//! ```text
//! data/
//! ├── nodes/1/1/1/1/00001/node.json   entity at 1.1.1.1.00001
//! ├── links/<id>.json                 one file per link
//! ├── indexes/*.json                  derived, rebuilt, never committed
//! ├── history/1/1/v0001.json          prior versions of 1.1
//! ├── .locks/                         advisory lock files, never committed
//! ├── .claims/{addresses,tasks}/      per-contributor ledgers
//! └── .conflicts/queue.json           manual resolution queue (local)
//! ```
//!
//! ## Locking
//!
//! Writers take the per-entity (or link-wide) lock for the file write, release
//! it, and only then take the index lock to update the in-memory cache and
//! persist index files. The two are never held together.

pub mod fs;
pub mod history;
pub mod index;

use crate::address::Address;
use crate::error::{Result, StoreError};
use crate::link::{Link, LinkStatus};
use crate::locks::{LockManager, LockSettings};
use crate::node::Node;
use history::{History, Snapshot};
use index::Indexes;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use fs::{write_atomic, write_json_atomic};

pub const NODES_DIR: &str = "nodes";
pub const LINKS_DIR: &str = "links";
pub const INDEXES_DIR: &str = "indexes";
pub const HISTORY_DIR: &str = "history";
pub const LOCKS_DIR: &str = ".locks";
pub const CLAIMS_DIR: &str = ".claims";
pub const CONFLICTS_DIR: &str = ".conflicts";
pub const NODE_FILE: &str = "node.json";

/// Filter for [`Store::list`]
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// The prefix itself and everything beneath it
    pub prefix: Option<Address>,
    pub type_address: Option<Address>,
    pub owner: Option<Address>,
    pub include_deleted: bool,
}

impl NodeFilter {
    pub fn prefix(mut self, prefix: Address) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn of_type(mut self, type_address: Address) -> Self {
        self.type_address = Some(type_address);
        self
    }

    pub fn owned_by(mut self, owner: Address) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    fn admits_address(&self, address: &Address) -> bool {
        match &self.prefix {
            Some(prefix) => prefix == address || prefix.is_ancestor_of(address),
            None => true,
        }
    }
}

/// Counts over the index cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub links: usize,
    pub types: usize,
    pub owners: usize,
}

/// File-backed storage for nodes and links
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    locks: LockManager,
    history: History,
    /// Cache of the derived indexes; mutated only under the index lock
    indexes: RwLock<Indexes>,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>, lock_settings: LockSettings) -> Result<Self> {
        let root = root.into();
        for dir in [NODES_DIR, LINKS_DIR, INDEXES_DIR, HISTORY_DIR, LOCKS_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        let indexes = Indexes::load(&root.join(INDEXES_DIR))?;
        info!(
            path = %root.display(),
            nodes = indexes.node_count(),
            "Opened store"
        );

        Ok(Self {
            locks: LockManager::new(root.join(LOCKS_DIR), lock_settings),
            history: History::new(root.join(HISTORY_DIR)),
            indexes: RwLock::new(indexes),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join(NODES_DIR)
    }

    pub fn links_dir(&self) -> PathBuf {
        self.root.join(LINKS_DIR)
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join(INDEXES_DIR)
    }

    pub fn claims_dir(&self) -> PathBuf {
        self.root.join(CLAIMS_DIR)
    }

    pub fn conflicts_dir(&self) -> PathBuf {
        self.root.join(CONFLICTS_DIR)
    }

    pub fn history_store(&self) -> &History {
        &self.history
    }

    pub fn node_path(&self, address: &Address) -> PathBuf {
        self.nodes_dir().join(address.to_path()).join(NODE_FILE)
    }

    pub fn link_path(&self, id: &str) -> PathBuf {
        self.links_dir().join(format!("{id}.json"))
    }

    /// Entity path relative to the data dir, as recorded in the node index
    pub fn relative_node_path(address: &Address) -> String {
        let mut path = PathBuf::from(NODES_DIR);
        path.push(address.to_path());
        path.push(NODE_FILE);
        fs::to_slash(&path)
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Create or overwrite an entity, snapshotting any prior state to history
    pub fn put(&self, node: &Node) -> Result<()> {
        let path = self.node_path(&node.address);
        let mut bytes = serde_json::to_vec_pretty(node)?;
        bytes.push(b'\n');

        let guard = self.locks.node(&node.address)?;
        if let Some(prior) = fs::read_optional(&path)? {
            self.history.append(&node.address, &prior, None)?;
        }
        fs::write_atomic(&path, &bytes)?;
        guard.release()?;

        self.with_indexes(|idx| idx.index_node(node, Self::relative_node_path(&node.address)))?;
        debug!(address = %node.address, "Stored node");
        Ok(())
    }

    pub fn get(&self, address: &Address) -> Result<Option<Node>> {
        fs::read_json(&self.node_path(address))
    }

    /// Merge attributes into an existing entity
    pub fn update(&self, address: &Address, attrs: Map<String, Value>) -> Result<Option<Node>> {
        let Some(mut node) = self.get(address)? else {
            return Ok(None);
        };
        node.merge_data(attrs);
        self.put(&node)?;
        Ok(Some(node))
    }

    /// Soft-delete through `put` (keeping history), or hard-delete the file.
    ///
    /// Returns false if there was nothing to delete.
    pub fn delete(&self, address: &Address, hard: bool) -> Result<bool> {
        if !hard {
            let Some(mut node) = self.get(address)? else {
                return Ok(false);
            };
            node.soft_delete();
            self.put(&node)?;
            return Ok(true);
        }

        let guard = self.locks.node(address)?;
        let removed = match std::fs::remove_file(self.node_path(address)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        guard.release()?;

        self.with_indexes(|idx| {
            idx.unindex_node(address);
        })?;
        if removed {
            info!(%address, "Hard-deleted node");
        }
        Ok(removed)
    }

    /// Entities matching `filter`, sorted by address. Unreadable files are skipped.
    pub fn list(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let candidates: Vec<String> = {
            let idx = self.indexes.read();
            let by_type = filter.type_address.as_ref().map(|t| idx.addresses_of_type(t));
            let by_owner = filter.owner.as_ref().map(|o| idx.addresses_owned_by(o));
            match (by_type, by_owner) {
                (Some(t), Some(o)) => t.intersection(&o).cloned().collect(),
                (Some(t), None) => t.into_iter().collect(),
                (None, Some(o)) => o.into_iter().collect(),
                (None, None) => idx.node_index.keys().cloned().collect(),
            }
        };

        let mut addresses: Vec<Address> = candidates
            .iter()
            .filter_map(|s| Address::parse(s).ok())
            .filter(|a| filter.admits_address(a))
            .collect();
        addresses.sort();

        let mut nodes = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.get(&address) {
                Ok(Some(node)) if filter.include_deleted || !node.is_deleted() => nodes.push(node),
                Ok(_) => {}
                Err(StoreError::Corrupt { path, reason }) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable node");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(nodes)
    }

    /// Instance entities anywhere beneath `prefix`
    pub fn count_instances(&self, prefix: &Address) -> usize {
        self.indexes
            .read()
            .node_index
            .keys()
            .filter_map(|s| Address::parse(s).ok())
            .filter(|a| prefix.is_ancestor_of(a) && a.is_instance())
            .count()
    }

    /// Successor of the highest instance directly under `prefix`.
    ///
    /// Reads the cache without locking, so the result is advisory; the
    /// address allocator is what keeps contributors apart.
    pub fn next_address(&self, prefix: &Address) -> Result<Address> {
        let max = self
            .indexes
            .read()
            .node_index
            .keys()
            .filter_map(|s| Address::parse(s).ok())
            .filter(|a| a.is_folder() && a.depth() == prefix.depth() + 1 && prefix.is_ancestor_of(a))
            .filter_map(|a| a.instance_number())
            .max()
            .unwrap_or(0);
        Ok(prefix.next_instance(max)?)
    }

    // =========================================================================
    // History
    // =========================================================================

    pub fn get_history(&self, address: &Address) -> Result<Vec<Snapshot>> {
        self.history.list(address)
    }

    /// A prior version as an entity; `None` when `version` is out of range
    pub fn get_version(&self, address: &Address, version: u32) -> Result<Option<Node>> {
        let Some(snapshot) = self.history.get(address, version)? else {
            return Ok(None);
        };
        snapshot.to_node().map(Some).map_err(|e| StoreError::Corrupt {
            path: self.history.dir_for(address),
            reason: e.to_string(),
        })
    }

    /// Append an externally obtained payload (e.g. the losing side of a merge
    /// conflict) to an entity's history without touching the current file
    pub fn preserve_version(&self, address: &Address, payload: &str, source: &str) -> Result<Snapshot> {
        let guard = self.locks.node(address)?;
        let snapshot = self.history.append(address, payload, Some(source))?;
        guard.release()?;
        Ok(snapshot)
    }

    // =========================================================================
    // Links
    // =========================================================================

    /// Store a link and return its id
    pub fn put_link(&self, link: &Link) -> Result<String> {
        let link = link.clone().normalize()?;
        let id = link.id();

        let guard = self.locks.links()?;
        fs::write_json_atomic(&self.link_path(&id), &link)?;
        guard.release()?;

        self.with_indexes(|idx| idx.index_link(&id, &link))?;
        debug!(%id, from = %link.from_address, to = %link.to_address, "Stored link");
        Ok(id)
    }

    pub fn get_link(&self, id: &str) -> Result<Option<Link>> {
        if !is_link_id(id) {
            return Ok(None);
        }
        fs::read_json(&self.link_path(id))
    }

    /// Flip a link's status to removed; the file stays
    pub fn remove_link(&self, id: &str) -> Result<bool> {
        if !is_link_id(id) {
            return Ok(false);
        }
        let guard = self.locks.links()?;
        let path = self.link_path(id);
        let Some(mut link) = fs::read_json::<Link>(&path)? else {
            return Ok(false);
        };
        if link.status == LinkStatus::Removed {
            return Ok(false);
        }
        link.status = LinkStatus::Removed;
        fs::write_json_atomic(&path, &link)?;
        guard.release()?;
        Ok(true)
    }

    /// Active outgoing links
    pub fn links_from(&self, address: &Address, relationship: Option<&str>) -> Result<Vec<Link>> {
        let ids = self.link_ids(address, true);
        self.load_links(ids, relationship)
    }

    /// Active incoming links
    pub fn links_to(&self, address: &Address, relationship: Option<&str>) -> Result<Vec<Link>> {
        let ids = self.link_ids(address, false);
        self.load_links(ids, relationship)
    }

    /// Outgoing targets plus sources of bidirectional incoming links
    pub fn get_neighbors(&self, address: &Address, relationship: Option<&str>) -> Result<Vec<Address>> {
        let mut neighbors: Vec<Address> = self
            .links_from(address, relationship)?
            .into_iter()
            .map(|l| l.to_address)
            .collect();
        neighbors.extend(
            self.links_to(address, relationship)?
                .into_iter()
                .filter(|l| l.bidirectional)
                .map(|l| l.from_address),
        );
        Ok(neighbors)
    }

    fn link_ids(&self, address: &Address, outgoing: bool) -> Vec<String> {
        let idx = self.indexes.read();
        let postings = if outgoing { &idx.links_from } else { &idx.links_to };
        postings
            .get(&address.to_string())
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn load_links(&self, ids: Vec<String>, relationship: Option<&str>) -> Result<Vec<Link>> {
        let mut links = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_link(&id) {
                Ok(Some(link)) => {
                    if link.is_active() && relationship.map_or(true, |r| link.relationship == r) {
                        links.push(link);
                    }
                }
                Ok(None) => debug!(%id, "Indexed link file is missing"),
                Err(StoreError::Corrupt { path, reason }) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable link");
                }
                Err(e) => return Err(e),
            }
        }
        links.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(links)
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Copy of the current index cache
    pub fn indexes(&self) -> Indexes {
        self.indexes.read().clone()
    }

    pub fn stats(&self) -> StoreStats {
        let idx = self.indexes.read();
        StoreStats {
            nodes: idx.node_count(),
            links: idx.link_count(),
            types: idx.type_index.len(),
            owners: idx.owner_index.len(),
        }
    }

    /// Replace the cache with what the index files currently hold
    pub fn reload_indexes(&self) -> Result<()> {
        let guard = self.locks.index()?;
        let loaded = Indexes::load(&self.indexes_dir())?;
        *self.indexes.write() = loaded;
        guard.release()?;
        Ok(())
    }

    /// Build a replacement index set and install it, holding the index lock
    /// from before `build` runs until the new files are persisted. Writers
    /// that index a change in the meantime wait and apply it on top.
    pub(crate) fn replace_indexes<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce() -> Result<(Indexes, T)>,
    {
        let guard = self.locks.index()?;
        let (fresh, extra) = build()?;
        {
            let mut idx = self.indexes.write();
            *idx = fresh;
            idx.save(&self.indexes_dir())?;
        }
        guard.release()?;
        Ok(extra)
    }

    /// Mutate the cache and persist every index file, under the index lock
    fn with_indexes<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Indexes),
    {
        let guard = self.locks.index()?;
        {
            let mut idx = self.indexes.write();
            mutate(&mut idx);
            idx.save(&self.indexes_dir())?;
        }
        guard.release()?;
        Ok(())
    }
}

/// Link ids are lowercase hex; anything else cannot name a link file
fn is_link_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_types;
    use serde_json::json;
    use tempfile::TempDir;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn open() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), LockSettings::default()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_put_get() {
        let (store, _dir) = open();
        let node = Node::new(addr("1.1.1.1.00001")).set("title", "First photo");
        store.put(&node).unwrap();

        let loaded = store.get(&node.address).unwrap().unwrap();
        assert_eq!(loaded, node);
        assert!(store.node_path(&node.address).ends_with("nodes/1/1/1/1/00001/node.json"));
        assert!(store.get(&addr("9.9")).unwrap().is_none());
    }

    #[test]
    fn test_second_write_snapshots_first() {
        let (store, _dir) = open();
        let first = Node::new(addr("4.2")).set("v", 1);
        store.put(&first).unwrap();
        let second = first.clone().set("v", 2);
        store.put(&second).unwrap();

        let history = store.get_history(&first.address).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].node, serde_json::to_value(&first).unwrap());
        assert_eq!(store.get(&first.address).unwrap().unwrap(), second);
        assert_eq!(store.get_version(&first.address, 1).unwrap().unwrap(), first);
        assert!(store.get_version(&first.address, 2).unwrap().is_none());
    }

    #[test]
    fn test_soft_and_hard_delete() {
        let (store, _dir) = open();
        let node = Node::new(addr("2.1.5"));
        store.put(&node).unwrap();

        assert!(store.delete(&node.address, false).unwrap());
        assert!(store.list(&NodeFilter::default()).unwrap().is_empty());
        assert_eq!(store.list(&NodeFilter::default().include_deleted()).unwrap().len(), 1);
        assert_eq!(store.get_history(&node.address).unwrap().len(), 1);

        assert!(store.delete(&node.address, true).unwrap());
        assert!(store.get(&node.address).unwrap().is_none());
        assert_eq!(store.get_history(&node.address).unwrap().len(), 1);
        assert_eq!(store.stats().nodes, 0);
        assert!(!store.delete(&node.address, true).unwrap());
    }

    #[test]
    fn test_list_filters() {
        let (store, _dir) = open();
        let doc = addr("0.5.4");
        store.put(&Node::new(addr("1.1.2")).with_type(doc.clone())).unwrap();
        store.put(&Node::new(addr("1.2.1")).with_type(doc.clone())).unwrap();
        store.put(&Node::new(addr("1.1.3"))).unwrap();

        let typed = store.list(&NodeFilter::default().of_type(doc.clone())).unwrap();
        assert_eq!(typed.len(), 2);
        let owned = store.list(&NodeFilter::default().owned_by(addr("1.1"))).unwrap();
        assert_eq!(owned.len(), 2);
        let both = store
            .list(&NodeFilter::default().of_type(doc).owned_by(addr("1.1")))
            .unwrap();
        assert_eq!(both.len(), 1);
        let under = store.list(&NodeFilter::default().prefix(addr("1.2"))).unwrap();
        assert_eq!(under[0].address, addr("1.2.1"));
    }

    #[test]
    fn test_links_with_same_endpoints_coexist() {
        let (store, _dir) = open();
        let a = Link::new(addr("1.1"), addr("4.2"), link_types::PERSON_TO_OBJECT, "edited").unwrap();
        let mut b = a.clone();
        b.created_at = a.created_at + chrono::Duration::seconds(1);

        let id_a = store.put_link(&a).unwrap();
        let id_b = store.put_link(&b).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(store.links_from(&addr("1.1"), None).unwrap().len(), 2);
        assert_eq!(store.links_to(&addr("4.2"), Some("edited")).unwrap().len(), 2);
        assert!(store.links_from(&addr("1.1"), Some("other")).unwrap().is_empty());
        assert_eq!(store.get_link(&id_a).unwrap().unwrap(), a);
    }

    #[test]
    fn test_remove_link_keeps_file() {
        let (store, _dir) = open();
        let link = Link::new(addr("1.1"), addr("1.2"), link_types::PERSON_TO_PERSON, "knows")
            .unwrap()
            .bidirectional();
        let id = store.put_link(&link).unwrap();
        assert_eq!(store.get_neighbors(&addr("1.2"), None).unwrap(), vec![addr("1.1")]);

        assert!(store.remove_link(&id).unwrap());
        assert!(!store.remove_link(&id).unwrap());
        assert!(store.links_from(&addr("1.1"), None).unwrap().is_empty());
        assert_eq!(store.get_link(&id).unwrap().unwrap().status, LinkStatus::Removed);
        assert!(store.get_link("../escape").unwrap().is_none());
    }

    #[test]
    fn test_next_address_and_update() {
        let (store, _dir) = open();
        let prefix = addr("1.1.1.1");
        assert_eq!(store.next_address(&prefix).unwrap().to_string(), "1.1.1.1.00001");
        store.put(&Node::new(addr("1.1.1.1.00007"))).unwrap();
        store.put(&Node::new(addr("1.1.1.1.00007.00100"))).unwrap();
        assert_eq!(store.next_address(&prefix).unwrap().to_string(), "1.1.1.1.00008");
        assert_eq!(store.count_instances(&prefix), 2);

        let mut attrs = Map::new();
        attrs.insert("caption".into(), json!("sunset"));
        let updated = store.update(&addr("1.1.1.1.00007"), attrs).unwrap().unwrap();
        assert_eq!(updated.data["caption"], json!("sunset"));
        assert!(store.update(&addr("1.9"), Map::new()).unwrap().is_none());
    }

    #[test]
    fn test_reopen_loads_indexes() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), LockSettings::default()).unwrap();
            store.put(&Node::new(addr("3.1"))).unwrap();
        }
        let store = Store::open(dir.path(), LockSettings::default()).unwrap();
        assert_eq!(store.stats().nodes, 1);
        assert_eq!(store.stats().owners, 1);
    }
}
