//! Hierarchical addresses
//!
//! Every record in the store is keyed by an [`Address`] instead of a UUID.
//!
//! ```text
//! 1.1.1.1.00001                 node (folder)
//! 1.1.1.1.00001:photo.jpg       file within the node
//! 1.1.1.1.00001:photo.jpg:exif  subsection within the file
//! ```
//!
//! Node parts are dot-separated and become directories on disk; the first
//! resource segment becomes a filename. Addresses are immutable: every
//! "child" operation returns a new value.

use crate::error::AddressError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of zero-padded instance numbers
pub const INSTANCE_WIDTH: usize = 5;

/// A semantic, hierarchical address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    // Field order drives the derived ordering: node parts first, then resource.
    parts: Vec<String>,
    resource: Vec<String>,
}

impl Address {
    /// Build an address from node parts and resource segments
    pub fn new<P, R>(parts: P, resource: R) -> Result<Self, AddressError>
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        let resource: Vec<String> = resource.into_iter().map(Into::into).collect();
        let address = Self { parts, resource };
        address.check()?;
        Ok(address)
    }

    /// Parse `1.2.3` or `1.2.3:file.md:section`
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let (node, resource) = match trimmed.split_once(':') {
            Some((node, resource)) => (node, Some(resource)),
            None => (trimmed, None),
        };

        let parts: Vec<String> = node.split('.').map(str::to_string).collect();
        if let Some(index) = parts.iter().position(String::is_empty) {
            return Err(AddressError::EmptyPart {
                input: trimmed.to_string(),
                index,
            });
        }

        let resource: Vec<String> = match resource {
            Some(r) => r.split(':').map(str::to_string).collect(),
            None => Vec::new(),
        };
        if let Some(index) = resource.iter().position(String::is_empty) {
            return Err(AddressError::EmptyResource {
                input: trimmed.to_string(),
                index,
            });
        }

        let address = Self { parts, resource };
        address.check()?;
        Ok(address)
    }

    fn check(&self) -> Result<(), AddressError> {
        if self.parts.is_empty() {
            return Err(AddressError::Empty);
        }
        for (index, part) in self.parts.iter().enumerate() {
            if part.is_empty() {
                return Err(AddressError::EmptyPart {
                    input: self.to_string(),
                    index,
                });
            }
            if let Some(ch) = part.chars().find(|c| matches!(c, '.' | ':' | '/' | '\\')) {
                return Err(AddressError::ForbiddenChar {
                    part: part.clone(),
                    ch,
                });
            }
        }
        for (index, segment) in self.resource.iter().enumerate() {
            if segment.is_empty() {
                return Err(AddressError::EmptyResource {
                    input: self.to_string(),
                    index,
                });
            }
            if let Some(ch) = segment.chars().find(|c| matches!(c, ':' | '/' | '\\')) {
                return Err(AddressError::ForbiddenChar {
                    part: segment.clone(),
                    ch,
                });
            }
        }
        Ok(())
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn resource(&self) -> &[String] {
        &self.resource
    }

    /// Root category (`0` system, `1` people, `2` AI, `3` business, `4` knowledge)
    pub fn category(&self) -> &str {
        &self.parts[0]
    }

    /// Number of node parts
    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    pub fn is_folder(&self) -> bool {
        self.resource.is_empty()
    }

    pub fn root(&self) -> Address {
        Self {
            parts: vec![self.parts[0].clone()],
            resource: Vec::new(),
        }
    }

    /// The node address without any resource path
    pub fn node_address(&self) -> Address {
        Self {
            parts: self.parts.clone(),
            resource: Vec::new(),
        }
    }

    /// One level up.
    ///
    /// Resource addresses strip their last resource segment first and fall
    /// back to the folder; node addresses strip their last part. A single-part
    /// folder address has no parent.
    pub fn parent(&self) -> Option<Address> {
        if !self.resource.is_empty() {
            let mut resource = self.resource.clone();
            resource.pop();
            return Some(Self {
                parts: self.parts.clone(),
                resource,
            });
        }
        if self.parts.len() <= 1 {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
            resource: Vec::new(),
        })
    }

    /// Owning entity for people/AI/business/knowledge addresses (`1.1.7` -> `1.1`)
    pub fn owner(&self) -> Option<Address> {
        let owned_category = matches!(self.category(), "1" | "2" | "3" | "4");
        if owned_category && self.parts.len() >= 2 {
            Some(Self {
                parts: self.parts[..2].to_vec(),
                resource: Vec::new(),
            })
        } else {
            None
        }
    }

    /// True if the last node part is a zero-padded instance number
    pub fn is_instance(&self) -> bool {
        self.instance_number().is_some()
    }

    /// The numeric value of the last part, when it is an instance number
    pub fn instance_number(&self) -> Option<u64> {
        let last = self.parts.last()?;
        if last.len() >= INSTANCE_WIDTH && last.bytes().all(|b| b.is_ascii_digit()) {
            last.parse().ok()
        } else {
            None
        }
    }

    /// Strict ancestry by segment-prefix comparison; an address is not its own ancestor.
    pub fn is_ancestor_of(&self, other: &Address) -> bool {
        if !self.resource.is_empty() {
            return self.parts == other.parts
                && self.resource.len() < other.resource.len()
                && other.resource.starts_with(&self.resource);
        }
        if self.parts.len() > other.parts.len() || !other.parts.starts_with(&self.parts) {
            return false;
        }
        self.parts.len() < other.parts.len() || !other.resource.is_empty()
    }

    pub fn is_descendant_of(&self, other: &Address) -> bool {
        other.is_ancestor_of(self)
    }

    /// Append a node part
    pub fn child(&self, part: impl Into<String>) -> Result<Address, AddressError> {
        let mut parts = self.parts.clone();
        parts.push(part.into());
        Address::new(parts, Vec::<String>::new())
    }

    /// Point at a resource within this node
    pub fn with_resource<R>(&self, segments: R) -> Result<Address, AddressError>
    where
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Address::new(self.parts.clone(), segments)
    }

    /// The instance address following `current_max` under this prefix
    pub fn next_instance(&self, current_max: u64) -> Result<Address, AddressError> {
        let next = current_max
            .checked_add(1)
            .ok_or_else(|| AddressError::InstanceSpaceExhausted { prefix: self.to_string() })?;
        let mut parts = self.parts.clone();
        parts.push(format!("{next:0width$}", width = INSTANCE_WIDTH));
        Ok(Self {
            parts,
            resource: Vec::new(),
        })
    }

    /// Relative filesystem path: parts as directories, first resource segment as filename
    pub fn to_path(&self) -> std::path::PathBuf {
        let mut path: std::path::PathBuf = self.parts.iter().collect();
        if let Some(file) = self.resource.first() {
            path.push(file);
        }
        path
    }

    /// Filesystem-safe single-component key, used for lock names
    pub fn to_key(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| match c {
                '.' | ':' | '/' | '\\' => '_',
                other => other,
            })
            .collect()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("."))?;
        if !self.resource.is_empty() {
            write!(f, ":{}", self.resource.join(":"))?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}
