//! Append-only version history
//!
//! Every overwrite of an existing entity first copies the prior file into
//! `history/<address path>/vNNNN.json`. Snapshots are never rewritten.

use crate::address::Address;
use crate::error::StoreError;
use crate::node::Node;
use crate::store::fs::{find_files, read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Hex characters kept from the SHA-256 content hash
pub const CONTENT_HASH_LEN: usize = 16;

/// Snapshot source tag for versions preserved while resolving merge conflicts
pub const CONFLICT_SOURCE: &str = "conflict_resolution";

/// One preserved prior state of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub content_hash: String,
    pub snapshot_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// The full prior entity payload
    pub node: Value,
}

impl Snapshot {
    pub fn to_node(&self) -> Result<Node, serde_json::Error> {
        serde_json::from_value(self.node.clone())
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))[..CONTENT_HASH_LEN].to_string()
}

/// History directory accessor
#[derive(Debug, Clone)]
pub struct History {
    root: PathBuf,
}

impl History {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, address: &Address) -> PathBuf {
        self.root.join(address.to_path())
    }

    /// Existing version numbers and their files, ascending
    fn versions(&self, address: &Address) -> Result<Vec<(u32, PathBuf)>, StoreError> {
        let dir = self.dir_for(address);
        let mut versions: Vec<(u32, PathBuf)> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter_map(|entry| {
                    let name = entry.file_name();
                    parse_version(&name.to_string_lossy()).map(|v| (v, entry.path()))
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        versions.sort_by_key(|(v, _)| *v);
        Ok(versions)
    }

    /// Snapshot `content` (the prior serialized entity) into the next version
    /// slot. Caller holds the entity lock.
    pub fn append(
        &self,
        address: &Address,
        content: &str,
        source: Option<&str>,
    ) -> Result<Snapshot, StoreError> {
        let next = self
            .versions(address)?
            .last()
            .map(|(v, _)| v + 1)
            .unwrap_or(1);

        let node = serde_json::from_str(content).unwrap_or_else(|e| {
            warn!(%address, error = %e, "Prior entity content is not JSON; preserving raw text");
            Value::String(content.to_string())
        });

        let snapshot = Snapshot {
            version: next,
            content_hash: content_hash(content.as_bytes()),
            snapshot_at: Utc::now(),
            source: source.map(str::to_string),
            node,
        };
        let path = self.dir_for(address).join(version_file_name(next));
        write_json_atomic(&path, &snapshot)?;
        debug!(%address, version = next, ?source, "Wrote history snapshot");
        Ok(snapshot)
    }

    /// All snapshots ordered by version; unreadable snapshots are skipped
    pub fn list(&self, address: &Address) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots = Vec::new();
        for (version, path) in self.versions(address)? {
            match read_json::<Snapshot>(&path) {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(StoreError::Corrupt { path, reason }) => {
                    warn!(path = %path.display(), version, %reason, "Skipping corrupt snapshot");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }

    pub fn get(&self, address: &Address, version: u32) -> Result<Option<Snapshot>, StoreError> {
        if version == 0 {
            return Ok(None);
        }
        read_json(&self.dir_for(address).join(version_file_name(version)))
    }

    /// Every snapshot file under the history root
    pub fn all_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(find_files(&self.root, &|name| parse_version(name).is_some())?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn version_file_name(version: u32) -> String {
    format!("v{version:04}.json")
}

fn parse_version(name: &str) -> Option<u32> {
    name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
}
