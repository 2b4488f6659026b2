//! Index rebuilding
//!
//! Entity and link files are the source of truth. After upstream changes are
//! pulled, every derived index is discarded and recomputed from those files,
//! which is why index files never need merging: two contributors creating
//! unrelated entities can never produce an index conflict.

use crate::error::{Result, StoreError};
use crate::link::Link;
use crate::node::Node;
use crate::store::fs::{find_files, read_json};
use crate::store::index::Indexes;
use crate::store::{Store, NODE_FILE};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of a full rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub entities_indexed: usize,
    pub links_indexed: usize,
    /// Unreadable or misplaced files left out of the indexes
    pub skipped_files: usize,
    pub duration: Duration,
}

/// A discrepancy between indexes and files on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// Indexed entity whose file is gone
    MissingFile { address: String, path: String },
    /// Entity file not present in the node index
    Unindexed { address: String },
    /// Entity file stored under a path that does not match its address
    Misplaced { address: String, path: PathBuf },
    /// Indexed link id with no link file
    DanglingLink { id: String },
    /// Link file not present in the adjacency indexes
    UnindexedLink { id: String },
    /// File that could not be parsed
    Unreadable { path: PathBuf, reason: String },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingFile { address, path } => {
                write!(f, "indexed node {address} has no file at {path}")
            }
            ValidationIssue::Unindexed { address } => write!(f, "node {address} is not indexed"),
            ValidationIssue::Misplaced { address, path } => {
                write!(f, "node {address} stored at unexpected path {}", path.display())
            }
            ValidationIssue::DanglingLink { id } => write!(f, "indexed link {id} has no file"),
            ValidationIssue::UnindexedLink { id } => write!(f, "link {id} is not indexed"),
            ValidationIssue::Unreadable { path, reason } => {
                write!(f, "unreadable file {}: {reason}", path.display())
            }
        }
    }
}

/// Rebuilds and validates a store's derived indexes
pub struct IndexRebuilder<'a> {
    store: &'a Store,
}

impl<'a> IndexRebuilder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Discard every index and recompute it from entity and link files
    pub fn rebuild_all(&self) -> Result<RebuildStats> {
        let start = Instant::now();
        let (entities_indexed, links_indexed, skipped) = self.store.replace_indexes(|| self.build())?;

        let stats = RebuildStats {
            entities_indexed,
            links_indexed,
            skipped_files: skipped,
            duration: start.elapsed(),
        };
        info!(
            entities = stats.entities_indexed,
            links = stats.links_indexed,
            skipped = stats.skipped_files,
            duration_ms = stats.duration.as_millis() as u64,
            "Rebuilt indexes"
        );
        Ok(stats)
    }

    /// Fresh indexes from the files on disk, with entity, link and skip counts
    fn build(&self) -> Result<(Indexes, (usize, usize, usize))> {
        let mut fresh = Indexes::default();
        let mut skipped = 0;

        let scan = self.scan()?;
        for entry in &scan.nodes {
            match entry {
                Scanned::Ok(node, path) => {
                    if *path != self.store.node_path(&node.address) {
                        warn!(address = %node.address, path = %path.display(), "Skipping misplaced node file");
                        skipped += 1;
                        continue;
                    }
                    fresh.index_node(node, Store::relative_node_path(&node.address));
                }
                Scanned::Bad(path, reason) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable node file");
                    skipped += 1;
                }
            }
        }

        let mut links_indexed = 0;
        for entry in &scan.links {
            match entry {
                Scanned::Ok((id, link), _) => {
                    fresh.index_link(id, link);
                    links_indexed += 1;
                }
                Scanned::Bad(path, reason) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable link file");
                    skipped += 1;
                }
            }
        }

        let entities_indexed = fresh.node_count();
        Ok((fresh, (entities_indexed, links_indexed, skipped)))
    }

    /// Cross-check indexes against disk without mutating anything.
    ///
    /// An empty list means healthy.
    pub fn validate(&self) -> Result<Vec<ValidationIssue>> {
        let indexes = self.store.indexes();
        let root = self.store.root();
        let mut issues = Vec::new();

        for (address, path) in &indexes.node_index {
            if !root.join(path).is_file() {
                issues.push(ValidationIssue::MissingFile {
                    address: address.clone(),
                    path: path.clone(),
                });
            }
        }

        let scan = self.scan()?;
        for entry in scan.nodes {
            match entry {
                Scanned::Ok(node, path) => {
                    let address = node.address.to_string();
                    if path != self.store.node_path(&node.address) {
                        issues.push(ValidationIssue::Misplaced { address, path });
                    } else if !indexes.node_index.contains_key(&address) {
                        issues.push(ValidationIssue::Unindexed { address });
                    }
                }
                Scanned::Bad(path, reason) => issues.push(ValidationIssue::Unreadable { path, reason }),
            }
        }

        let indexed_links = indexes.link_ids();
        let mut on_disk = BTreeSet::new();
        for entry in scan.links {
            match entry {
                Scanned::Ok((id, _), _) => {
                    if !indexed_links.contains(id.as_str()) {
                        issues.push(ValidationIssue::UnindexedLink { id: id.clone() });
                    }
                    on_disk.insert(id);
                }
                Scanned::Bad(path, reason) => issues.push(ValidationIssue::Unreadable { path, reason }),
            }
        }
        for id in indexed_links {
            if !on_disk.contains(id) && !self.store.link_path(id).is_file() {
                issues.push(ValidationIssue::DanglingLink { id: id.to_string() });
            }
        }

        Ok(issues)
    }

    fn scan(&self) -> Result<Scan> {
        let nodes = find_files(&self.store.nodes_dir(), &|name| name == NODE_FILE)?
            .into_iter()
            .map(|path| match read_json::<Node>(&path) {
                Ok(Some(node)) => Scanned::Ok(node, path),
                Ok(None) => Scanned::Bad(path, "vanished during scan".to_string()),
                Err(e) => Scanned::Bad(path, reason(e)),
            })
            .collect();

        let links = find_files(&self.store.links_dir(), &|name| name.ends_with(".json"))?
            .into_iter()
            .map(|path| load_link(&path))
            .collect();

        Ok(Scan { nodes, links })
    }
}

enum Scanned<T> {
    Ok(T, PathBuf),
    Bad(PathBuf, String),
}

struct Scan {
    nodes: Vec<Scanned<Node>>,
    links: Vec<Scanned<(String, Link)>>,
}

/// The file stem is the id `get_link` resolves, so it is what gets indexed
fn load_link(path: &Path) -> Scanned<(String, Link)> {
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match read_json::<Link>(path) {
        Ok(Some(link)) => match link.normalize() {
            Ok(link) => {
                if link.id() != id {
                    warn!(path = %path.display(), expected = %link.id(), "Link file name does not match its identity");
                }
                Scanned::Ok((id, link), path.to_path_buf())
            }
            Err(e) => Scanned::Bad(path.to_path_buf(), reason(e)),
        },
        Ok(None) => Scanned::Bad(path.to_path_buf(), "vanished during scan".to_string()),
        Err(e) => Scanned::Bad(path.to_path_buf(), reason(e)),
    }
}

fn reason(e: StoreError) -> String {
    match e {
        StoreError::Corrupt { reason, .. } => reason,
        other => other.to_string(),
    }
}
