//! # logos-sync: Real-time document synchronization core
//!
//! Keeps many clients editing the same documents in agreement: operations
//! are rebased by operational transform, whole states are reconciled by a
//! per-field clock merge, and everything travels over a small versioned
//! JSON protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per user)  │   JSON envelopes    │   ConnectionManager (rooms)  │
//! └─────────────┘                     │   DocumentHub                │
//!                                     │     └─ DocumentSession/doc   │
//!                                     │          Document + log      │
//!                                     │          UndoManager         │
//!                                     │   PresenceTracker            │
//!                                     └──────────────┬───────────────┘
//!                                                    │ checkpoints
//!                                                    ▼
//!                                              SnapshotSink
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: per-field clocks and the field-level deep merge
//! - [`operation`]: insert/delete/format operations and their wire shape
//! - [`document`]: document state, apply, merge and the bounded log
//! - [`transform`]: operational transform and compose
//! - [`undo`]: per-user undo/redo stacks
//! - [`presence`]: debounced cursor/selection state
//! - [`connection`]: connection registry, rooms, backoff
//! - [`protocol`]: versioned message envelope
//! - [`hub`]: per-document sessions and message dispatch
//! - [`storage`]: snapshot checkpoints
//! - [`server`] / [`client`]: WebSocket endpoints

pub mod clock;
pub mod client;
pub mod connection;
pub mod document;
pub mod error;
pub mod hub;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transform;
pub mod undo;

// Re-exports for convenience
pub use clock::{merge_value, pick_winner, FieldClock, Winner};
pub use client::{ConnectionState, OfflineQueue, PendingEdits, SyncClient, SyncEvent, SyncState};
pub use connection::{
    reconnect_delay, ChannelTransport, CloseReason, ConnectionManager, Outbound, OutboundRx, ReconnectPolicy,
    Transport,
};
pub use document::{apply_operation, merge_states, Document, DocumentSnapshot, OperationLog, State};
pub use error::{ConnectionError, ProtocolError, StorageError, SyncError, SyncResult, ValidationError};
pub use hub::{DocumentHub, HubConfig};
pub use operation::{OpKind, Operation};
pub use presence::{MemoryPresenceStore, PresenceStore, PresenceTracker};
pub use protocol::{create_message, parse_message, Envelope, MessageType, CURRENT_VERSION};
pub use server::{ServerConfig, SyncServer};
pub use storage::{CompressedSnapshot, MemorySnapshotStore, SnapshotSink};
pub use transform::{compose, transform, transform_sequences};
pub use undo::{Edit, UndoManager};
