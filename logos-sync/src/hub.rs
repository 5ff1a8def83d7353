//! Per-document sessions and message dispatch.
//!
//! ```text
//! frame ──► parse_message ──► handle_message(conn, envelope)
//!                                   │
//!             ┌─────────────────────┼──────────────────────┐
//!             ▼                     ▼                      ▼
//!        join / leave      operation / undo / redo     presence
//!             │                     │                      │
//!             │        DocumentSession (tokio Mutex)        │
//!             │        transform → validate → apply          │
//!             │        → log → undo record                   │
//!             │                     │                        │
//!             │        outbox lock taken, session released   │
//!             │                     │                        │
//!             └────────► ConnectionManager::send/broadcast ◄─┘
//! ```
//!
//! One mutex per document gives every document a single total order of
//! applied operations. A second per-document lock, the outbox, is taken
//! before the session lock is released and held until the resulting
//! messages are queued, so every member hears about changes in revision
//! order. Teardown of members whose send failed waits until both are free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::connection::{CloseReason, ConnectionManager, Disconnected, Transport};
use crate::document::{Document, DocumentSnapshot, DEFAULT_LOG_CAPACITY};
use crate::error::{ConnectionError, ProtocolError, SyncResult, ValidationError};
use crate::operation::Operation;
use crate::presence::{MemoryPresenceStore, PresenceStore, PresenceTracker, DEFAULT_DEBOUNCE};
use crate::protocol::{
    parse_message, AppliedPayload, DocRef, Envelope, JoinPayload, MergePayload, MessageType, OperationPayload,
    PresencePayload, CURRENT_VERSION,
};
use crate::storage::SnapshotSink;
use crate::transform::transform_sequences;
use crate::undo::{Edit, UndoManager, DEFAULT_UNDO_DEPTH};

/// Tuning knobs for [`DocumentHub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Operations kept per document for rebasing late submissions
    pub op_log_capacity: usize,
    /// Accepted operations between checkpoints (0 = only when a room empties)
    pub checkpoint_interval: u64,
    /// Undo entries kept per user per document
    pub undo_depth: usize,
    /// Minimum gap between accepted presence updates of one user
    pub presence_debounce: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            op_log_capacity: DEFAULT_LOG_CAPACITY,
            checkpoint_interval: 100,
            undo_depth: DEFAULT_UNDO_DEPTH,
            presence_debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Live state of one document.
struct DocumentSession {
    document: Document,
    undo: UndoManager,
    ops_since_checkpoint: u64,
    /// Set when the session is unloaded. A handler that locks it afterwards
    /// looks the document up again.
    closed: bool,
}

impl DocumentSession {
    fn new(document: Document, undo_depth: usize) -> Self {
        Self {
            document,
            undo: UndoManager::new(undo_depth),
            ops_since_checkpoint: 0,
            closed: false,
        }
    }

    /// Validate and apply a rebased sequence as one unit.
    fn apply_validated(&mut self, ops: &[Operation]) -> Result<Vec<Operation>, ValidationError> {
        if let [op] = ops {
            op.validate_against(self.document.text_len())?;
            return Ok(vec![self.document.apply(op)?]);
        }
        let mut scratch = self.document.clone();
        let mut recorded = Vec::with_capacity(ops.len());
        for op in ops {
            op.validate_against(scratch.text_len())?;
            recorded.push(scratch.apply(op)?);
        }
        self.document = scratch;
        Ok(recorded)
    }

    /// Rebase `ops`, computed against revision `base`, over everything
    /// applied since, then apply them.
    fn rebase_and_apply(&mut self, base: u64, ops: &[Operation]) -> Result<Vec<Operation>, ValidationError> {
        let current = self.document.revision();
        let concurrent = self.document.log().since(base, current)?;
        let (_, rebased) = transform_sequences(&concurrent, ops);
        if !concurrent.is_empty() {
            log::debug!(
                "Rebased {} op(s) over {} concurrent op(s) in {}",
                ops.len(),
                concurrent.len(),
                self.document.id()
            );
        }
        self.apply_validated(&rebased)
    }

    /// Count applied operations; returns a snapshot when a checkpoint is due.
    fn note_applied(&mut self, count: usize, interval: u64) -> Option<DocumentSnapshot> {
        self.ops_since_checkpoint += count as u64;
        if interval == 0 || self.ops_since_checkpoint < interval {
            return None;
        }
        self.ops_since_checkpoint = 0;
        Some(self.document.snapshot())
    }
}

/// A loaded document.
#[derive(Clone)]
struct SessionHandle {
    state: Arc<Mutex<DocumentSession>>,
    /// Orders the messages produced by state changes.
    outbox: Arc<Mutex<()>>,
}

type SessionGuard = OwnedMutexGuard<DocumentSession>;

/// Members to tear down once the outbox is released.
#[derive(Default)]
struct Fallout {
    failed: Vec<Uuid>,
    dropped: Vec<Disconnected>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryStep {
    Undo,
    Redo,
}

/// Routes protocol messages to document sessions and fans results out to
/// the document's room.
pub struct DocumentHub {
    config: HubConfig,
    connections: Arc<ConnectionManager>,
    presence: PresenceTracker<Arc<dyn PresenceStore>>,
    sink: Arc<dyn SnapshotSink>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl DocumentHub {
    pub fn new(config: HubConfig, connections: Arc<ConnectionManager>, sink: Arc<dyn SnapshotSink>) -> Self {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        Self::with_presence_store(config, connections, sink, store)
    }

    pub fn with_presence_store(
        config: HubConfig,
        connections: Arc<ConnectionManager>,
        sink: Arc<dyn SnapshotSink>,
        presence_store: Arc<dyn PresenceStore>,
    ) -> Self {
        let presence = PresenceTracker::new(presence_store, config.presence_debounce);
        Self {
            config,
            connections,
            presence,
            sink,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn presence(&self) -> &PresenceTracker<Arc<dyn PresenceStore>> {
        &self.presence
    }

    /// Admit a connection.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<Uuid, ConnectionError> {
        self.connections.register(transport).await
    }

    /// Tear a connection down and clean up after it.
    pub async fn disconnect(&self, conn_id: Uuid, reason: CloseReason) {
        if let Some(gone) = self.connections.disconnect(conn_id, reason).await {
            self.cleanup(vec![gone]).await;
        }
    }

    /// Handle one raw text frame. Failures are answered with an `error`
    /// envelope to the sender.
    pub async fn handle_frame(&self, conn_id: Uuid, raw: &str) {
        self.connections.heartbeat(conn_id).await;
        let result = match parse_message(raw) {
            Ok(envelope) => self.handle_message(conn_id, envelope).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            log::debug!("Rejected message from {conn_id}: {e}");
            self.reply(conn_id, Envelope::error(e.code(), e.to_string())).await;
        }
    }

    /// Dispatch a parsed envelope.
    pub async fn handle_message(&self, conn_id: Uuid, envelope: Envelope) -> SyncResult<()> {
        if !envelope.is_current_version() {
            log::debug!(
                "Connection {conn_id} sent protocol v{} (current v{CURRENT_VERSION})",
                envelope.version
            );
        }
        let Some(kind) = envelope.kind() else {
            return Err(ProtocolError::InvalidPayload {
                msg_type: envelope.msg_type,
                reason: "unknown message type".to_string(),
            }
            .into());
        };

        match kind {
            MessageType::Join => self.on_join(conn_id, envelope.payload_as()?).await,
            MessageType::Leave => self.on_leave(conn_id, envelope.payload_as::<DocRef>()?.doc_id).await,
            MessageType::Operation => self.on_operation(conn_id, envelope.operation_payload()?).await,
            MessageType::Undo => {
                let doc = envelope.payload_as::<DocRef>()?;
                self.on_history(conn_id, &doc.doc_id, HistoryStep::Undo).await
            }
            MessageType::Redo => {
                let doc = envelope.payload_as::<DocRef>()?;
                self.on_history(conn_id, &doc.doc_id, HistoryStep::Redo).await
            }
            MessageType::Merge => self.on_merge(conn_id, envelope.payload_as()?).await,
            MessageType::SyncRequest => {
                let doc = envelope.payload_as::<DocRef>()?;
                self.on_sync_request(conn_id, &doc.doc_id).await
            }
            MessageType::Presence => self.on_presence(conn_id, envelope.payload_as()?).await,
            MessageType::Ping => {
                self.reply(conn_id, Envelope::pong()).await;
                Ok(())
            }
            MessageType::Pong => Ok(()),
            MessageType::Ack
            | MessageType::Snapshot
            | MessageType::PeerJoined
            | MessageType::PeerLeft
            | MessageType::Error => {
                log::debug!("Ignoring server-bound '{}' from {conn_id}", envelope.msg_type);
                Ok(())
            }
        }
    }

    /// Disconnect silent connections, then ping everyone left.
    pub async fn heartbeat_tick(&self, timeout: Duration) {
        let stale = self.connections.sweep_stale(timeout).await;
        if !stale.is_empty() {
            log::info!("Heartbeat sweep closed {} stale connection(s)", stale.len());
            self.cleanup(stale).await;
        }
        let ping = Envelope::ping();
        for conn_id in self.connections.connection_ids().await {
            self.reply(conn_id, ping.clone()).await;
        }
    }

    /// Close every connection and checkpoint every loaded document.
    pub async fn shutdown(&self) {
        for conn_id in self.connections.connection_ids().await {
            self.disconnect(conn_id, CloseReason::Shutdown).await;
        }
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for handle in handles {
            let mut session = handle.state.lock().await;
            if session.closed {
                continue;
            }
            session.closed = true;
            self.checkpoint(&session.document.snapshot());
        }
    }

    /// Current state of a loaded document.
    pub async fn document_snapshot(&self, doc_id: &str) -> Option<DocumentSnapshot> {
        let handle = self.sessions.read().await.get(doc_id).cloned()?;
        let snapshot = handle.state.lock().await.document.snapshot();
        Some(snapshot)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ── handlers ──────────────────────────────────────────────────

    async fn on_join(&self, conn_id: Uuid, join: JoinPayload) -> SyncResult<()> {
        self.connections.set_user(conn_id, &join.user_id).await?;
        let (session, outbox) = self.lock_session(&join.doc_id).await?;
        // Joining under the session lock keeps an emptying room from
        // unloading the document in between.
        let newly_joined = self.connections.join_room(conn_id, &join.doc_id).await?;

        let current = session.document.revision();
        let greeting = match join.since_revision.map(|since| (since, session.document.log().since(since, current))) {
            Some((since, Ok(operations))) => {
                log::debug!(
                    "Catching {conn_id} up on {} from revision {since} ({} op(s))",
                    join.doc_id,
                    operations.len()
                );
                Envelope::applied(
                    MessageType::Operation,
                    &AppliedPayload {
                        doc_id: join.doc_id.clone(),
                        revision: current,
                        user_id: String::new(),
                        operations,
                    },
                )?
            }
            Some((since, Err(e))) => {
                log::debug!("Cannot catch {conn_id} up from revision {since}: {e}");
                Envelope::snapshot(&session.document.snapshot())?
            }
            None => Envelope::snapshot(&session.document.snapshot())?,
        };

        let order = Self::hand_over(session, outbox).await;
        let mut fallout = Fallout::default();
        self.send_ordered(&mut fallout, conn_id, &greeting).await;
        drop(order);
        self.settle(fallout).await;

        for record in self.presence.presence_for_document(&join.doc_id) {
            if record.user_id == join.user_id {
                continue;
            }
            let envelope = Envelope::presence(&PresencePayload {
                doc_id: join.doc_id.clone(),
                user_id: Some(record.user_id),
                state: record.payload,
            })?;
            self.reply(conn_id, envelope).await;
        }

        if newly_joined {
            log::info!("User {} joined {} on {conn_id}", join.user_id, join.doc_id);
            let announce = Envelope::peer_joined(&join.doc_id, &join.user_id)?;
            self.broadcast(&join.doc_id, &announce, Some(conn_id)).await;
        }
        Ok(())
    }

    async fn on_leave(&self, conn_id: Uuid, doc_id: String) -> SyncResult<()> {
        let user_id = self.connections.user_of(conn_id).await;
        if !self.connections.leave_room(conn_id, &doc_id).await {
            return Err(ConnectionError::NotJoined(conn_id).into());
        }
        log::info!("Connection {conn_id} left {doc_id}");
        let dropped = self.depart(&doc_id, user_id.as_deref()).await;
        self.cleanup(dropped).await;
        Ok(())
    }

    async fn on_operation(&self, conn_id: Uuid, submit: OperationPayload) -> SyncResult<()> {
        let user_id = self.member(conn_id, &submit.doc_id).await?;
        let op = Operation {
            user_id: Some(user_id.clone()),
            ..submit.operation
        };

        let (mut session, outbox) = self.lock_session(&submit.doc_id).await?;
        let applied = session.rebase_and_apply(submit.base_revision, std::slice::from_ref(&op))?;
        let revision = session.document.revision();
        if !applied.is_empty() {
            // A split delete is still one undo step.
            session.undo.record(&user_id, Edit::new(applied.clone(), revision));
        }
        let due = session.note_applied(applied.len(), self.config.checkpoint_interval);

        let order = Self::hand_over(session, outbox).await;
        if let Some(snapshot) = due {
            self.checkpoint(&snapshot);
        }
        let payload = AppliedPayload {
            doc_id: submit.doc_id.clone(),
            revision,
            user_id,
            operations: applied,
        };
        let ack = Envelope::applied(MessageType::Ack, &payload)?;
        let fan_out = Envelope::applied(MessageType::Operation, &payload)?;
        let mut fallout = Fallout::default();
        self.send_ordered(&mut fallout, conn_id, &ack).await;
        self.broadcast_ordered(&mut fallout, &submit.doc_id, &fan_out, Some(conn_id))
            .await;
        drop(order);
        self.settle(fallout).await;
        Ok(())
    }

    /// Undo or redo the user's latest edit, rebased over everything that
    /// landed after it. The result goes to the whole room, the requester
    /// included, as an ordinary `operation` message.
    async fn on_history(&self, conn_id: Uuid, doc_id: &str, step: HistoryStep) -> SyncResult<()> {
        let user_id = self.member(conn_id, doc_id).await?;
        let (mut session, outbox) = self.lock_session(doc_id).await?;

        let entry = match step {
            HistoryStep::Undo => session.undo.take_undo(&user_id),
            HistoryStep::Redo => session.undo.take_redo(&user_id),
        };
        let Some(edit) = entry else {
            drop(session);
            let code = match step {
                HistoryStep::Undo => "nothing_to_undo",
                HistoryStep::Redo => "nothing_to_redo",
            };
            self.reply(conn_id, Envelope::error(code, format!("no history for {user_id} in {doc_id}")))
                .await;
            return Ok(());
        };

        // An entry that can no longer be rebased stays dropped.
        let applied = session.rebase_and_apply(edit.revision, &edit.inverse())?;
        let revision = session.document.revision();
        let counterpart = Edit::new(applied.clone(), revision);
        match step {
            HistoryStep::Undo => session.undo.push_redo(&user_id, counterpart),
            HistoryStep::Redo => session.undo.push_undo(&user_id, counterpart),
        }
        let due = session.note_applied(applied.len(), self.config.checkpoint_interval);

        let order = Self::hand_over(session, outbox).await;
        if let Some(snapshot) = due {
            self.checkpoint(&snapshot);
        }
        let fan_out = Envelope::applied(
            MessageType::Operation,
            &AppliedPayload {
                doc_id: doc_id.to_string(),
                revision,
                user_id,
                operations: applied,
            },
        )?;
        let mut fallout = Fallout::default();
        self.broadcast_ordered(&mut fallout, doc_id, &fan_out, None).await;
        drop(order);
        self.settle(fallout).await;
        Ok(())
    }

    async fn on_merge(&self, conn_id: Uuid, merge: MergePayload) -> SyncResult<()> {
        let user_id = self.member(conn_id, &merge.doc_id).await?;
        let (mut session, outbox) = self.lock_session(&merge.doc_id).await?;

        let before = session.document.revision();
        session.document.merge(&merge.state, &merge.clock);
        let changed = session.document.revision() != before;
        if changed {
            // Positions recorded before the merge no longer line up.
            session.ops_since_checkpoint = 0;
            session.undo.clear();
        }
        let snapshot = session.document.snapshot();
        let envelope = Envelope::snapshot(&snapshot)?;

        let order = Self::hand_over(session, outbox).await;
        let mut fallout = Fallout::default();
        if changed {
            // The log was reset; every member needs the new base.
            log::info!("Merged state from {user_id} into {} (revision {})", merge.doc_id, snapshot.version);
            self.checkpoint(&snapshot);
            self.broadcast_ordered(&mut fallout, &merge.doc_id, &envelope, None).await;
        } else {
            self.send_ordered(&mut fallout, conn_id, &envelope).await;
        }
        drop(order);
        self.settle(fallout).await;
        Ok(())
    }

    async fn on_sync_request(&self, conn_id: Uuid, doc_id: &str) -> SyncResult<()> {
        self.member(conn_id, doc_id).await?;
        let (session, outbox) = self.lock_session(doc_id).await?;
        let envelope = Envelope::snapshot(&session.document.snapshot())?;

        let order = Self::hand_over(session, outbox).await;
        let mut fallout = Fallout::default();
        self.send_ordered(&mut fallout, conn_id, &envelope).await;
        drop(order);
        self.settle(fallout).await;
        Ok(())
    }

    async fn on_presence(&self, conn_id: Uuid, update: PresencePayload) -> SyncResult<()> {
        let user_id = self.member(conn_id, &update.doc_id).await?;
        if !self.presence.update_presence(&user_id, &update.doc_id, update.state.clone()) {
            return Ok(());
        }
        let envelope = Envelope::presence(&PresencePayload {
            doc_id: update.doc_id.clone(),
            user_id: Some(user_id),
            state: update.state,
        })?;
        self.broadcast(&update.doc_id, &envelope, Some(conn_id)).await;
        Ok(())
    }

    // ── plumbing ──────────────────────────────────────────────────

    /// User bound to `conn_id`, provided it is a member of `doc_id`.
    async fn member(&self, conn_id: Uuid, doc_id: &str) -> Result<String, ConnectionError> {
        let user_id = self
            .connections
            .user_of(conn_id)
            .await
            .ok_or(ConnectionError::NotJoined(conn_id))?;
        if !self.connections.is_member(conn_id, doc_id).await {
            return Err(ConnectionError::NotJoined(conn_id));
        }
        Ok(user_id)
    }

    async fn session(&self, doc_id: &str) -> SyncResult<SessionHandle> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(doc_id) {
                return Ok(handle.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(doc_id) {
            return Ok(handle.clone());
        }

        let document = match self.sink.load(doc_id)? {
            Some(snapshot) => {
                log::info!("Restored {doc_id} from checkpoint at revision {}", snapshot.version);
                Document::from_snapshot(snapshot, self.config.op_log_capacity)
            }
            None => Document::with_log_capacity(doc_id, self.config.op_log_capacity),
        };
        let handle = SessionHandle {
            state: Arc::new(Mutex::new(DocumentSession::new(document, self.config.undo_depth))),
            outbox: Arc::new(Mutex::new(())),
        };
        sessions.insert(doc_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Lock the live session of `doc_id`, loading it if needed.
    async fn lock_session(&self, doc_id: &str) -> SyncResult<(SessionGuard, Arc<Mutex<()>>)> {
        loop {
            let handle = self.session(doc_id).await?;
            let session = handle.state.lock_owned().await;
            if !session.closed {
                return Ok((session, handle.outbox));
            }
            log::debug!("Session {doc_id} was unloaded while waiting; reloading");
        }
    }

    /// Trade the session lock for the outbox lock.
    async fn hand_over(session: SessionGuard, outbox: Arc<Mutex<()>>) -> OwnedMutexGuard<()> {
        let order = outbox.lock_owned().await;
        drop(session);
        order
    }

    async fn send_ordered(&self, fallout: &mut Fallout, conn_id: Uuid, envelope: &Envelope) {
        match self.connections.send_to(conn_id, envelope).await {
            Ok(()) | Err(ConnectionError::UnknownConnection(_)) => {}
            Err(_) => fallout.failed.push(conn_id),
        }
    }

    async fn broadcast_ordered(&self, fallout: &mut Fallout, room: &str, envelope: &Envelope, exclude: Option<Uuid>) {
        match self.connections.broadcast(room, envelope, exclude).await {
            Ok(report) => fallout.dropped.extend(report.dropped),
            Err(e) => log::error!("Failed to encode '{}' for {room}: {e}", envelope.msg_type),
        }
    }

    async fn settle(&self, fallout: Fallout) {
        for conn_id in fallout.failed {
            self.disconnect(conn_id, CloseReason::TransportError).await;
        }
        self.cleanup(fallout.dropped).await;
    }

    async fn reply(&self, conn_id: Uuid, envelope: Envelope) {
        match self.connections.send_to(conn_id, &envelope).await {
            Ok(()) | Err(ConnectionError::UnknownConnection(_)) => {}
            Err(_) => self.disconnect(conn_id, CloseReason::TransportError).await,
        }
    }

    async fn broadcast(&self, room: &str, envelope: &Envelope, exclude: Option<Uuid>) {
        match self.connections.broadcast(room, envelope, exclude).await {
            Ok(report) => self.cleanup(report.dropped).await,
            Err(e) => log::error!("Failed to encode '{}' for {room}: {e}", envelope.msg_type),
        }
    }

    /// Room-level cleanup for torn-down connections. Connections dropped
    /// while announcing a departure are queued behind it.
    async fn cleanup(&self, mut pending: Vec<Disconnected>) {
        while let Some(gone) = pending.pop() {
            for room in &gone.rooms {
                pending.extend(self.depart(room, gone.user_id.as_deref()).await);
            }
        }
    }

    /// A connection of `user_id` left `room`. Returns members dropped while
    /// announcing it.
    async fn depart(&self, room: &str, user_id: Option<&str>) -> Vec<Disconnected> {
        let mut dropped = Vec::new();
        if let Some(user_id) = user_id {
            if !self.connections.room_has_user(room, user_id).await {
                self.presence.leave(user_id, room);
                match Envelope::peer_left(room, user_id) {
                    Ok(envelope) => match self.connections.broadcast(room, &envelope, None).await {
                        Ok(report) => dropped = report.dropped,
                        Err(e) => log::error!("Failed to announce departure from {room}: {e}"),
                    },
                    Err(e) => log::error!("Failed to build peer_left for {room}: {e}"),
                }
            }
        }
        if self.connections.room_size(room).await == 0 {
            self.close_session(room).await;
        }
        dropped
    }

    /// Checkpoint and unload a document whose room emptied.
    async fn close_session(&self, doc_id: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.get(doc_id).cloned() else {
            return;
        };
        let mut session = handle.state.lock().await;
        // Someone may have joined since the room was seen empty.
        if self.connections.room_size(doc_id).await > 0 {
            return;
        }
        session.closed = true;
        sessions.remove(doc_id);
        let snapshot = session.document.snapshot();
        self.checkpoint(&snapshot);
        log::info!("Room {doc_id} empty, unloaded at revision {}", snapshot.version);
    }

    fn checkpoint(&self, snapshot: &DocumentSnapshot) {
        if let Err(e) = self.sink.checkpoint(snapshot) {
            log::error!("Checkpoint of {} failed: {e}", snapshot.doc_id);
        }
    }
}
