//! Checkpoint collaborator for document snapshots.
//!
//! ```text
//! ┌─────────────┐  every N ops /   ┌──────────────┐
//! │ DocumentHub │ ───────────────► │ SnapshotSink │
//! │ (sessions)  │  room empties    └──────┬───────┘
//! └──────┬──────┘                         │
//!        │ first join of a room           ▼
//!        └──────── load ◄──────── CompressedSnapshot
//!                                 (bincode header + LZ4 JSON body)
//! ```
//!
//! The core never writes per operation; durable storage lives behind the
//! trait and is someone else's concern.

pub mod memory;
pub mod snapshot;

pub use memory::MemorySnapshotStore;
pub use snapshot::CompressedSnapshot;

use crate::document::DocumentSnapshot;
use crate::error::StorageError;

/// Receives document checkpoints and hands them back on reload.
pub trait SnapshotSink: Send + Sync {
    /// Persist the latest full state of a document, replacing any older one.
    fn checkpoint(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError>;

    /// Latest checkpoint for `doc_id`, if any.
    fn load(&self, doc_id: &str) -> Result<Option<DocumentSnapshot>, StorageError>;
}

/// Sink that drops every checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn checkpoint(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError> {
        log::trace!("Discarding checkpoint of {} at version {}", snapshot.doc_id, snapshot.version);
        Ok(())
    }

    fn load(&self, _doc_id: &str) -> Result<Option<DocumentSnapshot>, StorageError> {
        Ok(None)
    }
}
