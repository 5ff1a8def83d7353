//! In-process snapshot store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{CompressedSnapshot, SnapshotSink};
use crate::document::DocumentSnapshot;
use crate::error::StorageError;

/// Keeps the latest encoded checkpoint per document.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Encoded size of the stored checkpoint.
    pub fn stored_bytes(&self, doc_id: &str) -> Option<usize> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(doc_id)
            .map(Vec::len)
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotSink for MemorySnapshotStore {
    fn checkpoint(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        let bytes = CompressedSnapshot::compress(snapshot)?.encode()?;
        log::debug!(
            "Checkpoint {} at version {} ({} bytes)",
            snapshot.doc_id,
            snapshot.version,
            bytes.len()
        );
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.doc_id.clone(), bytes);
        Ok(())
    }

    fn load(&self, doc_id: &str) -> Result<Option<DocumentSnapshot>, StorageError> {
        let snapshots = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        match snapshots.get(doc_id) {
            Some(bytes) => Ok(Some(CompressedSnapshot::decode(bytes)?.decompress()?)),
            None => Ok(None),
        }
    }
}
