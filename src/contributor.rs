//! Contributors and the files they own
//!
//! Each contributor writes only `<contributor_id>.json` inside a ledger
//! directory; everyone may read every file. Because no two contributors ever
//! write the same file, these ledgers cannot produce merge conflicts between
//! contributors. [`ContributorLedger`] takes the owner once at construction,
//! and its only write path targets the owner's own file.

use crate::error::{Result, StoreError};
use crate::store::fs::{find_files, read_json, write_json_atomic};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

const MAX_ID_LEN: usize = 64;

/// Hex characters in a generated contributor id
pub const GENERATED_ID_LEN: usize = 12;

/// Identifier of one independent writer; safe to use as a file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContributorId(String);

impl ContributorId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && !id.starts_with('.')
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if valid {
            Ok(Self(id))
        } else {
            Err(StoreError::InvalidContributor(id))
        }
    }

    /// Stable id for this machine and user: sha256 of `hostname:user`
    pub fn generate() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self::derive(&host, &user)
    }

    pub fn derive(host: &str, user: &str) -> Self {
        let digest = Sha256::digest(format!("{host}:{user}").as_bytes());
        Self(hex::encode(digest)[..GENERATED_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContributorId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        ContributorId::new(value)
    }
}

impl From<ContributorId> for String {
    fn from(id: ContributorId) -> Self {
        id.0
    }
}

/// Shape of a per-contributor file: an owner plus a list of entries
pub trait LedgerFile: Serialize + DeserializeOwned {
    type Entry;

    fn empty(owner: &ContributorId) -> Self;
    fn entries(&self) -> &[Self::Entry];
    fn entries_mut(&mut self) -> &mut Vec<Self::Entry>;
}

/// A directory of per-contributor files, opened on behalf of one owner
#[derive(Debug, Clone)]
pub struct ContributorLedger<F> {
    dir: PathBuf,
    owner: ContributorId,
    _file: PhantomData<fn() -> F>,
}

impl<F: LedgerFile> ContributorLedger<F> {
    pub fn new(dir: impl Into<PathBuf>, owner: ContributorId) -> Self {
        Self {
            dir: dir.into(),
            owner,
            _file: PhantomData,
        }
    }

    pub fn owner(&self) -> &ContributorId {
        &self.owner
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn own_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.owner))
    }

    /// The owner's file; empty if it does not exist yet.
    ///
    /// A corrupt own file is an error, since rewriting it would drop entries.
    pub fn load_own(&self) -> Result<F> {
        Ok(read_json(&self.own_path())?.unwrap_or_else(|| F::empty(&self.owner)))
    }

    /// Load, mutate and atomically rewrite the owner's file
    pub fn update_own<T>(&self, mutate: impl FnOnce(&mut F) -> T) -> Result<T> {
        let mut file = self.load_own()?;
        let out = mutate(&mut file);
        write_json_atomic(&self.own_path(), &file)?;
        Ok(out)
    }

    /// Every contributor's file; unreadable files are skipped
    pub fn load_all(&self) -> Result<Vec<F>> {
        let mut files = Vec::new();
        for path in find_files(&self.dir, &|name| name.ends_with(".json"))? {
            // Nested directories are not ledger files
            if path.parent() != Some(self.dir.as_path()) {
                continue;
            }
            match read_json::<F>(&path) {
                Ok(Some(file)) => files.push(file),
                Ok(None) => {}
                Err(StoreError::Corrupt { path, reason }) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable contributor file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }

    /// Every entry across all contributors
    pub fn all_entries(&self) -> Result<Vec<F::Entry>>
    where
        F::Entry: Clone,
    {
        Ok(self
            .load_all()?
            .iter()
            .flat_map(|f| f.entries().iter().cloned())
            .collect())
    }
}
