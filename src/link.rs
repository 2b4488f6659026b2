//! Directed edges between addresses
//!
//! Links are append-only. Two links with the same endpoints and relationship
//! but different creation times are distinct records, because the identity
//! hash includes the creation timestamp.

use crate::address::Address;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Link type categories (addresses under `0.6`)
pub mod link_types {
    pub const PERSON_TO_PERSON: &str = "0.6.1";
    pub const PERSON_TO_OBJECT: &str = "0.6.2";
    pub const OBJECT_TO_OBJECT: &str = "0.6.3";
    pub const TEMPORAL: &str = "0.6.4";
    pub const SPATIAL: &str = "0.6.5";
}

/// Length of a link id in hex characters
pub const LINK_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    #[default]
    Active,
    Removed,
}

/// A directed, optionally bidirectional edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub from_address: Address,
    pub to_address: Address,
    pub link_type: String,
    pub relationship: String,

    /// The link's own address, when it is modelled as an entity too
    #[serde(default)]
    pub address: Option<Address>,

    /// Confidence/weight in [0, 1]
    #[serde(default = "default_strength")]
    pub strength: f64,

    #[serde(default)]
    pub bidirectional: bool,

    #[serde(default)]
    pub data: Map<String, Value>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub sort_order: Option<i64>,

    #[serde(default)]
    pub status: LinkStatus,
}

fn default_strength() -> f64 {
    1.0
}

impl Link {
    /// Create a link; self-loops are rejected
    pub fn new(
        from: Address,
        to: Address,
        link_type: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Result<Self, StoreError> {
        if from == to {
            return Err(StoreError::InvalidLink(format!(
                "self-link on {from} is not allowed"
            )));
        }
        Ok(Self {
            from_address: from,
            to_address: to,
            link_type: link_type.into(),
            relationship: relationship.into(),
            address: None,
            strength: 1.0,
            bidirectional: false,
            data: Map::new(),
            created_at: Utc::now(),
            sort_order: None,
            status: LinkStatus::Active,
        })
    }

    /// Set the weight, clamped to [0, 1]
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = clamp_strength(strength);
        self
    }

    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Deterministic identity over (from, to, relationship, created_at)
    pub fn id(&self) -> String {
        let key = format!(
            "{}:{}:{}:{}",
            self.from_address,
            self.to_address,
            self.relationship,
            self.created_at.to_rfc3339()
        );
        let digest = Sha256::digest(key.as_bytes());
        hex::encode(digest)[..LINK_ID_LEN].to_string()
    }

    pub fn is_active(&self) -> bool {
        self.status == LinkStatus::Active
    }

    /// True if the link can be traversed from `address`
    pub fn connects(&self, address: &Address) -> bool {
        &self.from_address == address || (self.bidirectional && &self.to_address == address)
    }

    /// The endpoint opposite to `address`, if traversable from it
    pub fn other_end(&self, address: &Address) -> Option<&Address> {
        if &self.from_address == address {
            Some(&self.to_address)
        } else if self.bidirectional && &self.to_address == address {
            Some(&self.from_address)
        } else {
            None
        }
    }

    /// Re-check invariants on a record read from disk
    pub(crate) fn normalize(mut self) -> Result<Self, StoreError> {
        if self.from_address == self.to_address {
            return Err(StoreError::InvalidLink(format!(
                "self-link on {}",
                self.from_address
            )));
        }
        self.strength = clamp_strength(self.strength);
        Ok(self)
    }
}

fn clamp_strength(strength: f64) -> f64 {
    if strength.is_nan() {
        0.0
    } else {
        strength.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_self_link_rejected() {
        let err = Link::new(addr("1.1"), addr("1.1"), link_types::PERSON_TO_PERSON, "knows");
        assert!(matches!(err, Err(StoreError::InvalidLink(_))));
    }

    #[test]
    fn test_strength_clamped() {
        let link = Link::new(addr("1.1"), addr("1.2"), link_types::PERSON_TO_PERSON, "knows")
            .unwrap()
            .with_strength(3.5);
        assert_eq!(link.strength, 1.0);
        let link = link.with_strength(-0.2);
        assert_eq!(link.strength, 0.0);
    }

    #[test]
    fn test_id_depends_on_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap();
        let a = Link::new(addr("1.1"), addr("4.2"), link_types::PERSON_TO_OBJECT, "authored")
            .unwrap()
            .created_at(t1);
        let b = a.clone().created_at(t2);
        assert_eq!(a.id().len(), LINK_ID_LEN);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn test_traversal() {
        let link = Link::new(addr("1.1"), addr("1.2"), link_types::PERSON_TO_PERSON, "knows")
            .unwrap()
            .bidirectional();
        assert_eq!(link.other_end(&addr("1.2")), Some(&addr("1.1")));
        assert!(link.connects(&addr("1.2")));
        assert!(link.other_end(&addr("1.3")).is_none());
    }
}
