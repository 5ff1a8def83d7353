//! Presence tracking for cursors, selections and other ephemeral state.
//!
//! ## Architecture
//!
//! ```text
//! presence envelope (cursor move)
//!       │
//!       ▼
//! PresenceTracker::update_presence()
//!       │  (debounced per (user, doc): dropped if too soon)
//!       ▼
//! PresenceStore::set()        ──►  broadcast to the document room
//! ```
//!
//! Dropped updates are not queued or merged; the next update after the
//! window simply goes through.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::now_millis;

/// Default debounce window (roughly 20 updates per second).
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

// ───────────────────────────────────────────────────────────────────
// Records and storage
// ───────────────────────────────────────────────────────────────────

/// Key of a presence record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresenceKey {
    pub user_id: String,
    pub doc_id: String,
}

impl PresenceKey {
    pub fn new(user_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            doc_id: doc_id.into(),
        }
    }
}

/// Last accepted presence payload of a user in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub doc_id: String,
    pub payload: Value,
    pub last_update_ms: u64,
}

impl PresenceRecord {
    pub fn key(&self) -> PresenceKey {
        PresenceKey::new(self.user_id.clone(), self.doc_id.clone())
    }
}

/// Ephemeral key-value store backing the tracker.
pub trait PresenceStore: Send + Sync {
    fn get(&self, key: &PresenceKey) -> Option<PresenceRecord>;
    fn set(&self, record: PresenceRecord);
    fn remove(&self, key: &PresenceKey) -> Option<PresenceRecord>;
    /// All records for one document.
    fn list(&self, doc_id: &str) -> Vec<PresenceRecord>;
    /// Remove every record of a user, returning what was removed.
    fn remove_user(&self, user_id: &str) -> Vec<PresenceRecord>;
}

impl<S: PresenceStore + ?Sized> PresenceStore for std::sync::Arc<S> {
    fn get(&self, key: &PresenceKey) -> Option<PresenceRecord> {
        (**self).get(key)
    }

    fn set(&self, record: PresenceRecord) {
        (**self).set(record)
    }

    fn remove(&self, key: &PresenceKey) -> Option<PresenceRecord> {
        (**self).remove(key)
    }

    fn list(&self, doc_id: &str) -> Vec<PresenceRecord> {
        (**self).list(doc_id)
    }

    fn remove_user(&self, user_id: &str) -> Vec<PresenceRecord> {
        (**self).remove_user(user_id)
    }
}

/// In-process presence store.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    records: Mutex<HashMap<PresenceKey, PresenceRecord>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn get(&self, key: &PresenceKey) -> Option<PresenceRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn set(&self, record: PresenceRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.key(), record);
    }

    fn remove(&self, key: &PresenceKey) -> Option<PresenceRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    fn list(&self, doc_id: &str) -> Vec<PresenceRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<PresenceRecord> = records.values().filter(|r| r.doc_id == doc_id).cloned().collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    fn remove_user(&self, user_id: &str) -> Vec<PresenceRecord> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<PresenceKey> = records.keys().filter(|k| k.user_id == user_id).cloned().collect();
        keys.iter().filter_map(|k| records.remove(k)).collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Debounced writer in front of a [`PresenceStore`].
pub struct PresenceTracker<S: PresenceStore = MemoryPresenceStore> {
    store: S,
    debounce: Duration,
    /// Serializes check-and-set so two racing updates cannot both pass.
    gate: Mutex<()>,
}

impl PresenceTracker<MemoryPresenceStore> {
    pub fn in_memory(debounce: Duration) -> Self {
        Self::new(MemoryPresenceStore::new(), debounce)
    }
}

impl<S: PresenceStore> PresenceTracker<S> {
    pub fn new(store: S, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            gate: Mutex::new(()),
        }
    }

    /// Record presence now. Returns `false` if the update was debounced.
    pub fn update_presence(&self, user_id: &str, doc_id: &str, payload: Value) -> bool {
        self.update_presence_at(user_id, doc_id, payload, now_millis())
    }

    /// Record presence as of `now_ms` (milliseconds since the Unix epoch).
    pub fn update_presence_at(&self, user_id: &str, doc_id: &str, payload: Value, now_ms: u64) -> bool {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let key = PresenceKey::new(user_id, doc_id);

        if let Some(prev) = self.store.get(&key) {
            let elapsed = now_ms.saturating_sub(prev.last_update_ms);
            if u128::from(elapsed) < self.debounce.as_millis() {
                log::trace!("Presence update from {user_id} in {doc_id} debounced ({elapsed}ms)");
                return false;
            }
        }

        self.store.set(PresenceRecord {
            user_id: user_id.to_string(),
            doc_id: doc_id.to_string(),
            payload,
            last_update_ms: now_ms,
        });
        true
    }

    pub fn get(&self, user_id: &str, doc_id: &str) -> Option<PresenceRecord> {
        self.store.get(&PresenceKey::new(user_id, doc_id))
    }

    pub fn presence_for_document(&self, doc_id: &str) -> Vec<PresenceRecord> {
        self.store.list(doc_id)
    }

    /// Forget a user in one document.
    pub fn leave(&self, user_id: &str, doc_id: &str) -> Option<PresenceRecord> {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.remove(&PresenceKey::new(user_id, doc_id))
    }

    /// Forget a user everywhere (on disconnect).
    pub fn remove_user(&self, user_id: &str) -> Vec<PresenceRecord> {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.remove_user(user_id)
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

// ===================================================================
// Tests
// ===================================================================
