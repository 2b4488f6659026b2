//! Entity records
//!
//! A [`Node`] is any addressable object in the graph: a person, a document,
//! a task. It carries a free-form attribute map plus standard metadata.

use crate::address::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// 2D layout hint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position2d {
    pub x: f64,
    pub y: f64,
}

/// 3D layout hint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// An addressable entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Primary key; never changes after creation
    pub address: Address,

    /// Reference to the type-definition entity
    #[serde(default)]
    pub type_address: Option<Address>,

    /// Free-form attributes
    #[serde(default)]
    pub data: Map<String, Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Tombstone for soft deletes
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Where the record was imported from, if anywhere
    #[serde(default)]
    pub source_type: Option<String>,

    #[serde(default)]
    pub source_id: Option<String>,

    #[serde(default)]
    pub creator: Option<Address>,

    #[serde(default)]
    pub position_2d: Option<Position2d>,

    #[serde(default)]
    pub position_3d: Option<Position3d>,

    /// Flag addresses (under `0.8`)
    #[serde(default)]
    pub flags: BTreeSet<Address>,

    #[serde(default)]
    pub is_instance: bool,
}

impl Node {
    pub fn new(address: Address) -> Self {
        let now = Utc::now();
        let is_instance = address.is_instance();
        Self {
            address,
            type_address: None,
            data: Map::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            source_type: None,
            source_id: None,
            creator: None,
            position_2d: None,
            position_3d: None,
            flags: BTreeSet::new(),
            is_instance,
        }
    }

    pub fn with_type(mut self, type_address: Address) -> Self {
        self.type_address = Some(type_address);
        self
    }

    pub fn with_creator(mut self, creator: Address) -> Self {
        self.creator = Some(creator);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Owner derived from the address (`1.1.x.y` is owned by `1.1`)
    pub fn owner(&self) -> Option<Address> {
        self.address.owner()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Merge attributes into the record and bump `updated_at`
    pub fn merge_data(&mut self, attrs: Map<String, Value>) {
        for (key, value) in attrs {
            self.data.insert(key, value);
        }
        self.touch();
    }

    pub fn soft_delete(&mut self) {
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    pub fn restore(&mut self) {
        self.deleted_at = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
