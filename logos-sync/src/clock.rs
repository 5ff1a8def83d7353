//! Per-field logical clocks and the field-level deep merge.
//!
//! A document's clock maps each state field to an integer counter. Local
//! writes tick the counter; merges keep the per-field maximum, so counters
//! never decrease.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Logical clock keyed by document field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldClock(BTreeMap<String, u64>);

impl FieldClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter for `field` (0 if never written).
    pub fn get(&self, field: &str) -> u64 {
        self.0.get(field).copied().unwrap_or(0)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Advance `field` by one and return the new counter.
    pub fn tick(&mut self, field: &str) -> u64 {
        let counter = self.0.entry(field.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raise `field` to `value` if it is ahead of the local counter.
    pub fn observe(&mut self, field: &str, value: u64) {
        let counter = self.0.entry(field.to_string()).or_insert(0);
        if value > *counter {
            *counter = value;
        }
    }

    /// Per-field maximum of both clocks.
    pub fn merged(&self, other: &FieldClock) -> FieldClock {
        let mut out = self.clone();
        for (field, value) in &other.0 {
            out.observe(field, *value);
        }
        out
    }

    /// Union of the field names of both clocks, sorted.
    pub fn fields_with<'a>(&'a self, other: &'a FieldClock) -> Vec<&'a str> {
        let mut fields: Vec<&str> = self.0.keys().chain(other.0.keys()).map(String::as_str).collect();
        fields.sort_unstable();
        fields.dedup();
        fields
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for FieldClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Which side a field-level comparison picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Strictly greater remote clock wins; ties keep the local value.
pub fn pick_winner(local: u64, remote: u64) -> Winner {
    if remote > local {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Apply a winning remote value on top of the local one.
///
/// Objects merge key by key into a freshly built map: keys only the local
/// side has survive, remote keys overwrite (an explicit remote `null`
/// overwrites with `null`), and nested objects recurse. Any other
/// combination is a plain replacement by the remote value. Keys are
/// copied as data, so names like `__proto__` carry no special meaning.
pub fn merge_value(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(local), Value::Object(remote)) => Value::Object(merge_objects(local, remote)),
        (_, remote) => remote.clone(),
    }
}

fn merge_objects(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in local {
        out.insert(key.clone(), value.clone());
    }
    for (key, remote_value) in remote {
        let merged = match out.get(key) {
            Some(local_value) => merge_value(local_value, remote_value),
            None => remote_value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}
