//! Full image of the store
//!
//! Serialized flat: every collection, keyed map and the tombstone list sit at
//! the top level next to `lastUpdate` and `lastSync`. This is exactly the
//! layout of the local data file, which is rewritten wholesale on every flush.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{Registry, BINS, USERS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Strictly increases on every mutation
    #[serde(default = "Utc::now")]
    pub last_update: DateTime<Utc>,

    /// When the snapshot last reached its flush target
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub data: BTreeMap<String, Value>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            last_update: Utc::now(),
            last_sync: None,
            data: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    /// Empty snapshot with every registered key present
    pub fn empty(registry: &Registry) -> Self {
        let mut snapshot = Self::default();
        snapshot.fill_missing(registry);
        snapshot
    }

    /// Snapshot for a fresh local store: default users and bins
    pub fn seeded(registry: &Registry) -> Self {
        let mut snapshot = Self::empty(registry);
        snapshot.data.insert(USERS.to_string(), default_users());
        snapshot.data.insert(BINS.to_string(), default_bins());
        snapshot
    }

    /// Add empty values for registered keys the snapshot lacks
    pub fn fill_missing(&mut self, registry: &Registry) {
        for spec in registry.specs() {
            self.data
                .entry(spec.name.clone())
                .or_insert_with(|| spec.empty_value());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Store a value and advance `last_update`
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
        self.touch();
    }

    /// Advance `last_update`, even if the wall clock has not moved
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_update = if now > self.last_update {
            now
        } else {
            self.last_update + Duration::milliseconds(1)
        };
    }

    pub fn to_json_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

fn default_users() -> Value {
    json!([
        {
            "id": "admin",
            "username": "admin",
            "name": "Administrator",
            "role": "admin",
            "status": "active"
        }
    ])
}

fn default_bins() -> Value {
    json!([
        {
            "id": "BIN-001",
            "location": "Central Square",
            "lat": 25.2048,
            "lng": 55.2708,
            "fillLevel": 0,
            "status": "active"
        },
        {
            "id": "BIN-002",
            "location": "Harbour Road",
            "lat": 25.2285,
            "lng": 55.2867,
            "fillLevel": 0,
            "status": "active"
        }
    ])
}
