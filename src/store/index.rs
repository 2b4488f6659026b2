//! Derived indexes
//!
//! Everything here is computed from entity and link files and can be thrown
//! away at any time. Index files are never committed and never merged; after
//! upstream changes arrive they are rebuilt from scratch.
//!
//! Maps and sets are ordered so that the same source files always serialize
//! to byte-identical index files.

use crate::address::Address;
use crate::error::StoreError;
use crate::link::Link;
use crate::node::Node;
use crate::store::fs::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

pub const NODE_INDEX_FILE: &str = "node_index.json";
pub const TYPE_INDEX_FILE: &str = "type_index.json";
pub const OWNER_INDEX_FILE: &str = "owner_index.json";
pub const LINKS_FROM_FILE: &str = "links_from.json";
pub const LINKS_TO_FILE: &str = "links_to.json";

type Postings = BTreeMap<String, BTreeSet<String>>;

/// In-memory cache of every derived index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexes {
    /// address -> entity file path, relative to the data dir
    pub node_index: BTreeMap<String, String>,
    /// type address -> entity addresses
    pub type_index: Postings,
    /// owner address -> entity addresses
    pub owner_index: Postings,
    /// from address -> link ids
    pub links_from: Postings,
    /// to address -> link ids
    pub links_to: Postings,
}

impl Indexes {
    pub fn is_empty(&self) -> bool {
        self.node_index.is_empty() && self.links_from.is_empty() && self.links_to.is_empty()
    }

    /// Record an entity, replacing whatever was indexed for its address
    pub fn index_node(&mut self, node: &Node, relative_path: String) {
        let address = node.address.to_string();
        self.unindex_node(&node.address);
        self.node_index.insert(address.clone(), relative_path);

        if let Some(type_address) = &node.type_address {
            self.type_index
                .entry(type_address.to_string())
                .or_default()
                .insert(address.clone());
        }
        if let Some(owner) = node.owner() {
            self.owner_index
                .entry(owner.to_string())
                .or_default()
                .insert(address);
        }
    }

    pub fn unindex_node(&mut self, address: &Address) -> bool {
        let key = address.to_string();
        let existed = self.node_index.remove(&key).is_some();
        remove_posting(&mut self.type_index, &key);
        remove_posting(&mut self.owner_index, &key);
        existed
    }

    pub fn index_link(&mut self, id: &str, link: &Link) {
        self.links_from
            .entry(link.from_address.to_string())
            .or_default()
            .insert(id.to_string());
        self.links_to
            .entry(link.to_address.to_string())
            .or_default()
            .insert(id.to_string());
    }

    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    /// Distinct link ids across the adjacency index
    pub fn link_count(&self) -> usize {
        self.link_ids().len()
    }

    pub fn link_ids(&self) -> BTreeSet<&str> {
        self.links_from
            .values()
            .chain(self.links_to.values())
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn addresses_of_type(&self, type_address: &Address) -> BTreeSet<String> {
        self.type_index
            .get(&type_address.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub fn addresses_owned_by(&self, owner: &Address) -> BTreeSet<String> {
        self.owner_index
            .get(&owner.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Persist every index file atomically. Caller holds the index lock.
    pub fn save(&self, dir: &Path) -> Result<(), StoreError> {
        write_json_atomic(&dir.join(NODE_INDEX_FILE), &self.node_index)?;
        write_json_atomic(&dir.join(TYPE_INDEX_FILE), &self.type_index)?;
        write_json_atomic(&dir.join(OWNER_INDEX_FILE), &self.owner_index)?;
        write_json_atomic(&dir.join(LINKS_FROM_FILE), &self.links_from)?;
        write_json_atomic(&dir.join(LINKS_TO_FILE), &self.links_to)?;
        Ok(())
    }

    /// Load index files; missing or corrupt files load as empty
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            node_index: load_one(dir, NODE_INDEX_FILE)?,
            type_index: load_one(dir, TYPE_INDEX_FILE)?,
            owner_index: load_one(dir, OWNER_INDEX_FILE)?,
            links_from: load_one(dir, LINKS_FROM_FILE)?,
            links_to: load_one(dir, LINKS_TO_FILE)?,
        })
    }
}

fn remove_posting(postings: &mut Postings, address: &str) {
    postings.retain(|_, members| {
        members.remove(address);
        !members.is_empty()
    });
}

fn load_one<T>(dir: &Path, name: &str) -> Result<T, StoreError>
where
    T: Default + serde::de::DeserializeOwned,
{
    match read_json(&dir.join(name)) {
        Ok(value) => Ok(value.unwrap_or_default()),
        Err(StoreError::Corrupt { path, reason }) => {
            warn!(path = %path.display(), %reason, "Ignoring corrupt index file");
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_types;
    use tempfile::TempDir;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_reindex_replaces_type() {
        let mut idx = Indexes::default();
        let node = Node::new(addr("1.1.3")).with_type(addr("0.5.1"));
        idx.index_node(&node, "nodes/1/1/3/node.json".into());
        let node = node.with_type(addr("0.5.2"));
        idx.index_node(&node, "nodes/1/1/3/node.json".into());

        assert!(idx.addresses_of_type(&addr("0.5.1")).is_empty());
        assert_eq!(idx.addresses_of_type(&addr("0.5.2")).len(), 1);
        assert_eq!(idx.addresses_owned_by(&addr("1.1")).len(), 1);
    }

    #[test]
    fn test_unindex_drops_empty_postings() {
        let mut idx = Indexes::default();
        let node = Node::new(addr("2.1.9")).with_type(addr("0.5.1"));
        idx.index_node(&node, "nodes/2/1/9/node.json".into());
        assert!(idx.unindex_node(&node.address));
        assert!(idx.type_index.is_empty());
        assert!(idx.owner_index.is_empty());
        assert!(!idx.unindex_node(&node.address));
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let mut idx = Indexes::default();
        let link = Link::new(addr("1.1"), addr("4.2"), link_types::PERSON_TO_OBJECT, "wrote").unwrap();
        idx.index_link(&link.id(), &link);
        idx.index_node(&Node::new(addr("4.2")), "nodes/4/2/node.json".into());
        idx.save(dir.path()).unwrap();

        assert_eq!(Indexes::load(dir.path()).unwrap(), idx);
        assert_eq!(idx.link_count(), 1);
    }

    #[test]
    fn test_corrupt_index_loads_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(NODE_INDEX_FILE), "[[[").unwrap();
        let idx = Indexes::load(dir.path()).unwrap();
        assert!(idx.node_index.is_empty());
    }
}
