//! Data model
//!
//! Records are open bags of fields (`serde_json::Map`). The only thing checked
//! at the boundary is the reconciliation key of each collection; everything
//! else passes through untouched so unknown fields survive round trips.
//!
//! Every top-level key of the store is described by a [`KeySpec`]:
//! - **Collection**: ordered records sharing one reconciliation key
//! - **KeyedMap**: string key to arbitrary value
//! - **Tombstones**: ids of logically deleted bins
//! - **Value**: anything else, stored as-is

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// A single entity: any JSON object
pub type Record = serde_json::Map<String, Value>;

/// Key holding the tombstone list
pub const DELETED_BINS: &str = "deletedBins";

pub const USERS: &str = "users";
pub const BINS: &str = "bins";
pub const ROUTES: &str = "routes";
pub const SENSORS: &str = "sensors";
pub const DRIVER_LOCATIONS: &str = "driverLocations";
pub const DRIVER_MESSAGES: &str = "driverMessages";
pub const CHAT_AUDIT: &str = "chatHistoryAudit";
pub const CLIENT_ERRORS: &str = "clientErrorLogs";

/// How a full-collection write reconciles with what is already stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Records absent from the new list are deleted
    Replace,
    /// Records are upserted by key; absent records are kept
    Merge,
}

/// How soon a write reaches the downstream flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Flush right after the write
    Immediate,
    /// Flush after the debounce window
    Debounced,
}

/// Shape of the value stored under a top-level key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Collection {
        key_field: String,
        policy: WritePolicy,
    },
    KeyedMap,
    Tombstones,
    Value,
}

/// Registration of one top-level key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub name: String,
    pub kind: KeyKind,
    pub durability: Durability,
}

impl KeySpec {
    fn collection(name: &str, key_field: &str, policy: WritePolicy, durability: Durability) -> Self {
        Self {
            name: name.to_string(),
            kind: KeyKind::Collection {
                key_field: key_field.to_string(),
                policy,
            },
            durability,
        }
    }

    fn keyed_map(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: KeyKind::KeyedMap,
            durability: Durability::Debounced,
        }
    }

    /// Reconciliation key field, for collections
    pub fn key_field(&self) -> Option<&str> {
        match &self.kind {
            KeyKind::Collection { key_field, .. } => Some(key_field),
            _ => None,
        }
    }

    /// Empty value of the right shape for this key
    pub fn empty_value(&self) -> Value {
        match self.kind {
            KeyKind::Collection { .. } | KeyKind::Tombstones => Value::Array(Vec::new()),
            KeyKind::KeyedMap => Value::Object(Record::new()),
            KeyKind::Value => Value::Null,
        }
    }
}

/// Per-collection override read from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOverride {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub policy: Option<WritePolicy>,
    #[serde(default)]
    pub durability: Option<Durability>,
}

/// All known top-level keys
#[derive(Debug, Clone)]
pub struct Registry {
    specs: BTreeMap<String, KeySpec>,
}

impl Default for Registry {
    fn default() -> Self {
        use Durability::{Debounced, Immediate};
        use WritePolicy::{Merge, Replace};

        let mut specs = vec![
            KeySpec::collection(USERS, "id", Replace, Immediate),
            KeySpec::collection(BINS, "id", Replace, Immediate),
            KeySpec::collection(ROUTES, "id", Replace, Immediate),
            KeySpec::collection("collections", "id", Replace, Immediate),
            KeySpec::collection("vehicles", "id", Replace, Immediate),
            KeySpec::collection(SENSORS, "imei", Merge, Immediate),
            KeySpec::collection("complaints", "id", Replace, Debounced),
            KeySpec::collection("alerts", "id", Replace, Debounced),
            KeySpec::collection("systemLogs", "id", Replace, Debounced),
            KeySpec::collection("pendingRegistrations", "id", Replace, Debounced),
            KeySpec::collection(CHAT_AUDIT, "id", Replace, Debounced),
            KeySpec::collection(CLIENT_ERRORS, "id", Replace, Debounced),
            KeySpec::keyed_map(DRIVER_LOCATIONS),
            KeySpec::keyed_map("analytics"),
            KeySpec::keyed_map("settings"),
            KeySpec::keyed_map(DRIVER_MESSAGES),
        ];
        specs.push(KeySpec {
            name: DELETED_BINS.to_string(),
            kind: KeyKind::Tombstones,
            durability: Immediate,
        });

        Self {
            specs: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }
}

impl Registry {
    /// Default registrations with configuration overrides applied
    ///
    /// An override for an unregistered name registers a new collection.
    pub fn with_overrides(overrides: &BTreeMap<String, CollectionOverride>) -> Self {
        let mut registry = Self::default();
        for (name, ov) in overrides {
            let spec = registry.specs.entry(name.clone()).or_insert_with(|| {
                KeySpec::collection(name, "id", WritePolicy::Replace, Durability::Debounced)
            });
            if let KeyKind::Collection { key_field, policy } = &mut spec.kind {
                if let Some(key) = &ov.key {
                    *key_field = key.clone();
                }
                if let Some(p) = ov.policy {
                    *policy = p;
                }
            }
            if let Some(d) = ov.durability {
                spec.durability = d;
            }
        }
        registry
    }

    /// Registration of a key; unknown keys are plain debounced values
    pub fn resolve(&self, name: &str) -> KeySpec {
        self.specs.get(name).cloned().unwrap_or_else(|| KeySpec {
            name: name.to_string(),
            kind: KeyKind::Value,
            durability: Durability::Debounced,
        })
    }

    pub fn specs(&self) -> impl Iterator<Item = &KeySpec> {
        self.specs.values()
    }

    pub fn collections(&self) -> impl Iterator<Item = (&str, &str)> {
        self.specs
            .values()
            .filter_map(|s| s.key_field().map(|k| (s.name.as_str(), k)))
    }
}

/// Normalize an id to its string form
///
/// Strings are taken as-is and numbers use their decimal form, so `7` and
/// `"7"` name the same entity.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reconciliation key of a record, normalized
pub fn record_key(record: &Record, key_field: &str) -> Option<String> {
    record.get(key_field).and_then(key_string)
}

/// Check a collection value and turn it into records
///
/// Every element must be an object carrying `key_field`. Repeated keys
/// collapse into one record: the later value wins, the first position is kept.
pub fn validate_collection(collection: &str, key_field: &str, value: Value) -> StoreResult<Vec<Record>> {
    let Value::Array(items) = value else {
        return Err(StoreError::invalid(collection, "expected an array of records"));
    };

    let mut records: Vec<Record> = Vec::with_capacity(items.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(record) = item else {
            return Err(StoreError::invalid(
                collection,
                format!("element {} is not an object", index),
            ));
        };
        let Some(key) = record_key(&record, key_field) else {
            return Err(StoreError::MissingKeyField {
                collection: collection.to_string(),
                field: key_field.to_string(),
                index,
            });
        };
        match positions.get(&key) {
            Some(&pos) => records[pos] = record,
            None => {
                positions.insert(key, records.len());
                records.push(record);
            }
        }
    }

    Ok(records)
}

/// Merge `updates` into `existing` by reconciliation key
///
/// Matching records get the update's fields laid over their own; new keys are
/// appended in order. Records not mentioned are kept unchanged.
pub fn merge_by_key(existing: Vec<Record>, updates: Vec<Record>, key_field: &str) -> Vec<Record> {
    let mut merged = existing;
    let mut positions: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(i, r)| record_key(r, key_field).map(|k| (k, i)))
        .collect();

    for update in updates {
        let Some(key) = record_key(&update, key_field) else {
            continue;
        };
        match positions.get(&key) {
            Some(&pos) => merged[pos].extend(update),
            None => {
                positions.insert(key, merged.len());
                merged.push(update);
            }
        }
    }

    merged
}

/// Normalize a list of ids into unique strings, keeping first-seen order
pub fn normalize_ids<'a>(ids: impl IntoIterator<Item = &'a Value>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter_map(key_string)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Records of a collection value, skipping anything that is not an object
pub fn records_of(value: &Value) -> Vec<Record> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_default_registry() {
        let registry = Registry::default();

        let sensors = registry.resolve(SENSORS);
        assert_eq!(sensors.key_field(), Some("imei"));
        assert!(matches!(
            sensors.kind,
            KeyKind::Collection { policy: WritePolicy::Merge, .. }
        ));

        assert_eq!(registry.resolve(BINS).durability, Durability::Immediate);
        assert_eq!(registry.resolve("complaints").durability, Durability::Debounced);
        assert_eq!(registry.resolve(DRIVER_LOCATIONS).kind, KeyKind::KeyedMap);
        assert_eq!(registry.resolve(DELETED_BINS).kind, KeyKind::Tombstones);
    }

    #[test]
    fn test_unknown_key_resolves_to_value() {
        let spec = Registry::default().resolve("featureFlags");
        assert_eq!(spec.kind, KeyKind::Value);
        assert_eq!(spec.durability, Durability::Debounced);
        assert_eq!(spec.empty_value(), Value::Null);
    }

    #[test]
    fn test_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "alerts".to_string(),
            CollectionOverride {
                durability: Some(Durability::Immediate),
                ..Default::default()
            },
        );
        overrides.insert(
            "depots".to_string(),
            CollectionOverride {
                key: Some("code".to_string()),
                policy: Some(WritePolicy::Merge),
                durability: None,
            },
        );

        let registry = Registry::with_overrides(&overrides);
        assert_eq!(registry.resolve("alerts").durability, Durability::Immediate);

        let depots = registry.resolve("depots");
        assert_eq!(depots.key_field(), Some("code"));
        assert_eq!(depots.durability, Durability::Debounced);
    }

    #[test]
    fn test_key_string_normalizes_numbers() {
        assert_eq!(key_string(&json!("B-1")), Some("B-1".to_string()));
        assert_eq!(key_string(&json!(42)), Some("42".to_string()));
        assert_eq!(key_string(&json!(null)), None);
        assert_eq!(key_string(&json!({"id": 1})), None);
    }

    #[test]
    fn test_validate_collection_collapses_duplicates() {
        let value = json!([
            {"id": "a", "fill": 10},
            {"id": "b", "fill": 20},
            {"id": "a", "fill": 99}
        ]);
        let records = validate_collection(BINS, "id", value).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], "a");
        assert_eq!(records[0]["fill"], 99);
        assert_eq!(records[1]["id"], "b");
    }

    #[test]
    fn test_validate_collection_requires_key() {
        let err = validate_collection(SENSORS, "imei", json!([{"imei": "1"}, {"fw": 2}])).unwrap_err();
        assert!(matches!(err, StoreError::MissingKeyField { index: 1, .. }));

        let err = validate_collection(BINS, "id", json!({"id": "a"})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn test_merge_by_key() {
        let existing = vec![rec(json!({"imei": "1", "fw": 1, "site": "north"}))];
        let updates = vec![
            rec(json!({"imei": "2", "fw": 2})),
            rec(json!({"imei": "1", "fw": 3})),
        ];

        let merged = merge_by_key(existing, updates, "imei");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["fw"], 3);
        assert_eq!(merged[0]["site"], "north");
        assert_eq!(merged[1]["imei"], "2");
    }

    #[test]
    fn test_normalize_ids() {
        let ids = [json!("x"), json!(5), json!("x"), json!("5"), json!(true)];
        assert_eq!(normalize_ids(&ids), vec!["x".to_string(), "5".to_string()]);
    }
}
