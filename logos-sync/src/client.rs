//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Local edit tracking: one submission in flight, the rest buffered
//! - Presence updates
//! - Offline buffering with catch-up on reconnect
//!
//! ```text
//!                 submit                     ack
//!  Synchronized ─────────► AwaitingConfirm ─────────► Synchronized
//!                              │      ▲
//!                       submit │      │ ack (send next from buffer)
//!                              ▼      │
//!                        AwaitingWithBuffer
//! ```
//!
//! Each submission is sent against the revision its predecessor was
//! acknowledged at, so the server never rebases a user's edit over that
//! user's own earlier edit. Remote operations are transformed past whatever
//! is still unconfirmed before they are handed to the application.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::clock::FieldClock;
use crate::connection::ReconnectPolicy;
use crate::document::{DocumentSnapshot, State};
use crate::error::ProtocolError;
use crate::operation::Operation;
use crate::protocol::{
    parse_message, AppliedPayload, Envelope, ErrorPayload, JoinPayload, MessageType, PresencePayload,
};
use crate::transform::transform_sequences;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Full document state (after join, sync request or a merge)
    Snapshot(DocumentSnapshot),
    /// Our own operation was accepted
    Ack(AppliedPayload),
    /// Accepted operations to apply locally, already transformed past our
    /// unconfirmed edits. Undo and redo results arrive here too.
    RemoteOperations(AppliedPayload),
    /// Local edits that will never reach the server. The application
    /// should reload from the accompanying snapshot.
    Discarded(Vec<Operation>),
    /// Another user's presence
    Presence(PresencePayload),
    PeerJoined(String),
    PeerLeft(String),
    /// The server rejected something we sent
    Error(ErrorPayload),
}

/// Local edits not yet sent, oldest first.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation. Returns `false` if the queue is full.
    pub fn enqueue(&mut self, operation: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(operation);
        true
    }

    pub fn pop_front(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    /// Put operations back at the head, ahead of everything queued.
    pub fn requeue_front(&mut self, operations: Vec<Operation>) {
        for op in operations.into_iter().rev() {
            self.queue.push_front(op);
        }
    }

    /// Transform the queue past `remote`, returning `remote` transformed
    /// past the queue.
    pub fn rebase(&mut self, remote: &[Operation]) -> Vec<Operation> {
        if self.queue.is_empty() {
            return remote.to_vec();
        }
        let pending: Vec<Operation> = self.queue.drain(..).collect();
        let (remote_after, pending_after) = transform_sequences(remote, &pending);
        self.queue = pending_after.into();
        remote_after
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total chars covered by queued operations.
    pub fn total_chars(&self) -> usize {
        self.queue.iter().map(Operation::len).sum()
    }
}

/// Where local edits stand relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Every local edit is confirmed
    Synchronized,
    /// One submission is waiting for its ack
    AwaitingConfirm,
    /// Edits are buffered behind a submission, or behind a connection
    AwaitingWithBuffer,
}

/// A submission ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub base_revision: u64,
    pub operation: Operation,
}

/// What an incoming `operation` message means locally.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Operations to apply locally, and the next submission if one is due.
    Apply {
        operations: Vec<Operation>,
        next: Option<Outgoing>,
    },
    /// Already reflected in the local revision.
    Stale,
    /// Revisions between `have` and `from` never arrived.
    Gap { have: u64, from: u64 },
}

/// A request of ours the server refused.
#[derive(Debug, Clone, PartialEq)]
pub struct Refusal {
    /// Local edits dropped along with it
    pub discarded: Vec<Operation>,
    /// Whether a fresh snapshot is needed
    pub resync: bool,
}

/// Requests that get exactly one answer, in the order they were sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Submit,
    History,
}

/// Error codes that answer a submission or an undo/redo.
const REFUSAL_CODES: &[&str] = &[
    "out_of_bounds",
    "future_revision",
    "resync_required",
    "negative_value",
    "unknown_operation_type",
    "missing_field",
    "nothing_to_undo",
    "nothing_to_redo",
];

/// Client half of the revision protocol.
///
/// At most one submission is in flight. Edits made meanwhile, or while
/// offline, wait in the buffer and go out one at a time. Remote operations
/// transform the in-flight submission and the buffer, and are transformed
/// past them in turn.
#[derive(Debug)]
pub struct PendingEdits {
    user_id: String,
    revision: u64,
    /// `revision` came from the server
    synced: bool,
    connected: bool,
    /// Joined, but the snapshot or catch-up has not arrived yet
    awaiting_base: bool,
    /// Sent and unacknowledged. A concurrent insert can split it in two.
    in_flight: Vec<Operation>,
    buffer: OfflineQueue,
    outstanding: VecDeque<Request>,
    last_stamp: u64,
    /// Bumped on every join, so a stale reader cannot mark a newer
    /// connection as lost.
    epoch: u64,
}

impl PendingEdits {
    pub fn new(user_id: impl Into<String>, max_buffer: usize) -> Self {
        Self {
            user_id: user_id.into(),
            revision: 0,
            synced: false,
            connected: false,
            awaiting_base: false,
            in_flight: Vec::new(),
            buffer: OfflineQueue::new(max_buffer),
            outstanding: VecDeque::new(),
            last_stamp: 0,
            epoch: 0,
        }
    }

    /// Latest revision seen from the server.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> SyncState {
        match (self.in_flight.is_empty(), self.buffer.is_empty()) {
            (true, true) => SyncState::Synchronized,
            (false, true) => SyncState::AwaitingConfirm,
            _ => SyncState::AwaitingWithBuffer,
        }
    }

    /// Local edits not yet acknowledged.
    pub fn pending_len(&self) -> usize {
        self.in_flight.len() + self.buffer.len()
    }

    /// Revision to rejoin from, when there is something to catch up.
    pub fn resume_from(&self) -> Option<u64> {
        (self.synced || self.pending_len() > 0).then_some(self.revision)
    }

    /// A join was sent on a fresh connection. Returns its epoch.
    pub fn connected(&mut self) -> u64 {
        self.epoch += 1;
        self.connected = true;
        self.awaiting_base = true;
        self.outstanding.clear();
        self.epoch
    }

    /// The reader of connection `epoch` ended. Returns `false` if a newer
    /// connection has taken over since.
    pub fn connection_lost(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.disconnected();
        true
    }

    /// The connection is gone. Whatever was in flight stays unconfirmed
    /// until the next catch-up shows whether it landed.
    pub fn disconnected(&mut self) {
        self.connected = false;
        self.awaiting_base = false;
        self.outstanding.clear();
    }

    /// Take a local edit, stamping it with our identity. Returns it ready
    /// for the wire when nothing else is unconfirmed.
    pub fn submit(&mut self, mut operation: Operation) -> Result<Option<Outgoing>, ProtocolError> {
        operation.user_id = Some(self.user_id.clone());
        // Strictly increasing per client, so an applied submission can be
        // recognised in a catch-up.
        operation.timestamp = operation.timestamp.max(self.last_stamp + 1);
        self.last_stamp = operation.timestamp;

        if !self.buffer.enqueue(operation) {
            return Err(ProtocolError::QueueFull(self.buffer.len()));
        }
        Ok(self.next_outgoing())
    }

    /// An undo or redo request was sent.
    pub fn history_requested(&mut self) {
        self.outstanding.push_back(Request::History);
    }

    /// Our submission was accepted; the document is now at `revision`.
    pub fn acknowledged(&mut self, revision: u64) -> Option<Outgoing> {
        if self.outstanding.front() == Some(&Request::Submit) {
            self.outstanding.pop_front();
        }
        if self.in_flight.is_empty() {
            log::warn!("Ack at revision {revision} with nothing in flight");
        }
        self.in_flight.clear();
        self.revision = revision;
        self.next_outgoing()
    }

    /// Operations accepted by the server, ending at `payload.revision`.
    pub fn remote(&mut self, payload: &AppliedPayload) -> RemoteOutcome {
        let from = payload.revision.saturating_sub(payload.operations.len() as u64);
        if from != self.revision {
            if payload.revision <= self.revision {
                return RemoteOutcome::Stale;
            }
            return RemoteOutcome::Gap {
                have: self.revision,
                from,
            };
        }

        let catching_up = self.awaiting_base;
        if !catching_up
            && payload.user_id == self.user_id
            && self.outstanding.front() == Some(&Request::History)
        {
            self.outstanding.pop_front();
        }

        let own = self.in_flight.first().map(|op| (op.timestamp, op.op_type()));
        let mut confirmed = false;
        let mut operations = Vec::with_capacity(payload.operations.len());
        for op in &payload.operations {
            let is_own = own.is_some_and(|(stamp, kind)| {
                op.user_id.as_deref() == Some(self.user_id.as_str()) && op.timestamp == stamp && op.op_type() == kind
            });
            if is_own {
                // Applied before the connection dropped; this is its ack.
                self.in_flight.clear();
                confirmed = true;
                continue;
            }
            let (past_flight, flight) = transform_sequences(std::slice::from_ref(op), &self.in_flight);
            self.in_flight = flight;
            operations.extend(self.buffer.rebase(&past_flight));
        }

        self.revision = payload.revision;
        self.synced = true;
        let next = if catching_up {
            self.awaiting_base = false;
            self.resume()
        } else if confirmed {
            self.next_outgoing()
        } else {
            None
        };
        RemoteOutcome::Apply { operations, next }
    }

    /// A full snapshot at `version`. Pending edits survive only if the
    /// snapshot is the state they were made against.
    pub fn snapshot(&mut self, version: u64) -> (Vec<Operation>, Option<Outgoing>) {
        let mut discarded = Vec::new();
        if version != self.revision {
            discarded = std::mem::take(&mut self.in_flight);
            discarded.extend(self.buffer.drain());
        }
        self.revision = version;
        self.synced = true;

        let next = if self.awaiting_base {
            self.awaiting_base = false;
            self.resume()
        } else {
            self.next_outgoing()
        };
        (discarded, next)
    }

    /// An `error` from the server. Returns what it refused, if it answers
    /// one of our submissions or undo/redo requests.
    pub fn refused(&mut self, code: &str) -> Option<Refusal> {
        if !REFUSAL_CODES.contains(&code) {
            return None;
        }
        match self.outstanding.pop_front()? {
            Request::Submit => {
                // Everything buffered was built on top of the refused edit.
                let mut discarded = std::mem::take(&mut self.in_flight);
                discarded.extend(self.buffer.drain());
                Some(Refusal { discarded, resync: true })
            }
            Request::History => Some(Refusal {
                discarded: Vec::new(),
                resync: code == "resync_required",
            }),
        }
    }

    fn ready(&self) -> bool {
        self.connected && !self.awaiting_base
    }

    fn next_outgoing(&mut self) -> Option<Outgoing> {
        if !self.in_flight.is_empty() || !self.ready() {
            return None;
        }
        let operation = self.buffer.pop_front()?;
        self.in_flight = vec![operation.clone()];
        self.outstanding.push_back(Request::Submit);
        Some(Outgoing {
            base_revision: self.revision,
            operation,
        })
    }

    /// After a catch-up, resend an in-flight submission that did not land.
    fn resume(&mut self) -> Option<Outgoing> {
        if self.in_flight.is_empty() {
            return self.next_outgoing();
        }
        let mut flight = std::mem::take(&mut self.in_flight).into_iter();
        let first = flight.next()?;
        self.buffer.requeue_front(flight.collect());
        self.in_flight = vec![first.clone()];
        self.outstanding.push_back(Request::Submit);
        log::info!("Resending unconfirmed {} at revision {}", first.op_type(), self.revision);
        Some(Outgoing {
            base_revision: self.revision,
            operation: first,
        })
    }
}

/// The sync client.
///
/// Manages one WebSocket connection, joined to one document as one user.
pub struct SyncClient {
    user_id: String,
    doc_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Also serializes everything that must reach the server in order.
    edits: Arc<Mutex<PendingEdits>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    reconnect: ReconnectPolicy,
}

impl SyncClient {
    pub fn new(user_id: impl Into<String>, doc_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            edits: Arc::new(Mutex::new(PendingEdits::new(user_id.clone(), 10_000))),
            user_id,
            doc_id: doc_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document. After a disconnect the join carries
    /// the last known revision; pending edits go out once the server has
    /// caught us up.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let epoch = {
            let mut edits = self.edits.lock().await;
            let since = edits.resume_from();
            self.send(Envelope::rejoin(&self.doc_id, &self.user_id, since)?).await?;
            if edits.pending_len() > 0 {
                log::info!("Rejoining {} with {} pending operation(s)", self.doc_id, edits.pending_len());
            }
            edits.connected()
        };

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming envelopes
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let edits = self.edits.clone();
        let doc_id = self.doc_id.clone();
        // Weak so that dropping `outgoing_tx` on disconnect still ends the writer.
        let reply_tx = out_tx.downgrade();
        drop(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let envelope = match parse_message(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::warn!("Ignoring malformed server message: {e}");
                        continue;
                    }
                };
                if envelope.kind() == Some(MessageType::Ping) {
                    Self::forward(&reply_tx, Ok(Envelope::pong())).await;
                    continue;
                }
                for event in Self::dispatch(&envelope, &edits, &reply_tx, &doc_id).await {
                    let _ = event_tx.send(event).await;
                }
            }

            // Connection lost
            if edits.lock().await.connection_lost(epoch) {
                *state.write().await = ConnectionState::Disconnected;
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Connect, retrying with exponential backoff until the policy gives up.
    pub async fn connect_with_retry(&mut self) -> Result<(), ProtocolError> {
        let mut attempt = 0;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = self.reconnect.delay_for(attempt) else {
                        log::warn!("Giving up on {} after {} attempts", self.server_url, attempt);
                        return Err(e);
                    };
                    log::info!("Reconnect attempt {attempt} to {} in {delay:?}", self.server_url);
                    *self.state.write().await = ConnectionState::Reconnecting;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Feed one server message through the edit tracker. Anything it
    /// wants sent goes out before the lock is released.
    async fn dispatch(
        envelope: &Envelope,
        edits: &Mutex<PendingEdits>,
        out: &mpsc::WeakSender<String>,
        doc_id: &str,
    ) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        match envelope.kind() {
            Some(MessageType::Snapshot) => {
                let Ok(snapshot) = envelope.payload_as::<DocumentSnapshot>() else {
                    return events;
                };
                let mut edits = edits.lock().await;
                let (discarded, next) = edits.snapshot(snapshot.version);
                Self::submit_next(out, doc_id, next).await;
                drop(edits);
                if !discarded.is_empty() {
                    log::warn!("Dropped {} local edit(s) for snapshot at {}", discarded.len(), snapshot.version);
                }
                events.push(SyncEvent::Snapshot(snapshot));
                if !discarded.is_empty() {
                    events.push(SyncEvent::Discarded(discarded));
                }
            }
            Some(MessageType::Ack) => {
                let Ok(applied) = envelope.payload_as::<AppliedPayload>() else {
                    return events;
                };
                let mut edits = edits.lock().await;
                let next = edits.acknowledged(applied.revision);
                Self::submit_next(out, doc_id, next).await;
                events.push(SyncEvent::Ack(applied));
            }
            Some(MessageType::Operation) => {
                let Ok(applied) = envelope.payload_as::<AppliedPayload>() else {
                    return events;
                };
                let mut edits = edits.lock().await;
                match edits.remote(&applied) {
                    RemoteOutcome::Apply { operations, next } => {
                        Self::submit_next(out, doc_id, next).await;
                        if !operations.is_empty() {
                            events.push(SyncEvent::RemoteOperations(AppliedPayload { operations, ..applied }));
                        }
                    }
                    RemoteOutcome::Stale => {
                        log::debug!("Ignoring stale operations ending at revision {}", applied.revision);
                    }
                    RemoteOutcome::Gap { have, from } => {
                        log::warn!("Missed revisions {have}..{from} of {doc_id}, requesting a snapshot");
                        Self::forward(out, Envelope::sync_request(doc_id)).await;
                    }
                }
            }
            Some(MessageType::Error) => {
                let Ok(error) = envelope.payload_as::<ErrorPayload>() else {
                    return events;
                };
                let mut edits = edits.lock().await;
                let refusal = edits.refused(&error.code);
                if refusal.as_ref().is_some_and(|r| r.resync) {
                    Self::forward(out, Envelope::sync_request(doc_id)).await;
                }
                drop(edits);
                events.push(SyncEvent::Error(error));
                if let Some(refusal) = refusal.filter(|r| !r.discarded.is_empty()) {
                    events.push(SyncEvent::Discarded(refusal.discarded));
                }
            }
            _ => {
                if let Some(event) = Self::to_event(envelope) {
                    events.push(event);
                }
            }
        }
        events
    }

    /// Events that do not touch local edit state.
    fn to_event(envelope: &Envelope) -> Option<SyncEvent> {
        let event = match envelope.kind()? {
            MessageType::Presence => SyncEvent::Presence(envelope.payload_as().ok()?),
            MessageType::PeerJoined => SyncEvent::PeerJoined(envelope.payload_as::<JoinPayload>().ok()?.user_id),
            MessageType::PeerLeft => SyncEvent::PeerLeft(envelope.payload_as::<JoinPayload>().ok()?.user_id),
            _ => return None,
        };
        Some(event)
    }

    async fn submit_next(out: &mpsc::WeakSender<String>, doc_id: &str, next: Option<Outgoing>) {
        if let Some(next) = next {
            Self::forward(out, Envelope::operation(doc_id, next.base_revision, next.operation)).await;
        }
    }

    /// Send from the reader task. A closed connection drops the message;
    /// an unconfirmed submission is resent after the next catch-up.
    async fn forward(out: &mpsc::WeakSender<String>, envelope: Result<Envelope, ProtocolError>) {
        let Some(tx) = out.upgrade() else {
            return;
        };
        match envelope.and_then(|e| e.encode()) {
            Ok(frame) => {
                let _ = tx.send(frame).await;
            }
            Err(e) => log::error!("Dropping outgoing message: {e}"),
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let encoded = envelope.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Submit a local edit.
    ///
    /// It goes out at once if nothing else is unconfirmed; otherwise, and
    /// while offline, it waits in the buffer.
    pub async fn send_operation(&self, operation: Operation) -> Result<(), ProtocolError> {
        let mut edits = self.edits.lock().await;
        let Some(next) = edits.submit(operation)? else {
            return Ok(());
        };
        if let Err(e) = self
            .send(Envelope::operation(&self.doc_id, next.base_revision, next.operation)?)
            .await
        {
            log::debug!("Submission held until reconnect: {e}");
        }
        Ok(())
    }

    /// Send cursor/selection state. Dropped silently while offline.
    pub async fn send_presence(&self, state: Value) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.send(Envelope::presence(&PresencePayload {
            doc_id: self.doc_id.clone(),
            user_id: None,
            state,
        })?)
        .await
    }

    pub async fn undo(&self) -> Result<(), ProtocolError> {
        let mut edits = self.edits.lock().await;
        self.send(Envelope::undo(&self.doc_id)?).await?;
        edits.history_requested();
        Ok(())
    }

    pub async fn redo(&self) -> Result<(), ProtocolError> {
        let mut edits = self.edits.lock().await;
        self.send(Envelope::redo(&self.doc_id)?).await?;
        edits.history_requested();
        Ok(())
    }

    /// Ask for the full document state.
    pub async fn request_sync(&self) -> Result<(), ProtocolError> {
        self.send(Envelope::sync_request(&self.doc_id)?).await
    }

    /// Push a full local state for field-level merge.
    pub async fn send_merge(&self, state: State, clock: FieldClock) -> Result<(), ProtocolError> {
        self.send(Envelope::merge(&self.doc_id, state, clock)?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(Envelope::ping()).await
    }

    /// Leave the document and close the socket. Pending edits are kept
    /// for the next connect.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if self.is_connected().await {
            self.send(Envelope::leave(&self.doc_id)?).await?;
        }
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        self.edits.lock().await.disconnected();
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Latest revision seen from the server.
    pub async fn revision(&self) -> u64 {
        self.edits.lock().await.revision()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.edits.lock().await.state()
    }

    /// Local edits the server has not acknowledged yet.
    pub async fn pending_len(&self) -> usize {
        self.edits.lock().await.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn applied(revision: u64, user: &str, operations: Vec<Operation>) -> AppliedPayload {
        AppliedPayload {
            doc_id: "doc".to_string(),
            revision,
            user_id: user.to_string(),
            operations,
        }
    }

    /// Tracker that joined and received a snapshot at `revision`.
    fn synced_at(revision: u64) -> PendingEdits {
        let mut edits = PendingEdits::new("alice", 100);
        assert_eq!(edits.connected(), 1);
        assert_eq!(edits.snapshot(revision), (vec![], None));
        edits
    }

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("alice", "doc-1", "ws://localhost:9090");
        assert_eq!(client.user_id(), "alice");
        assert_eq!(client.doc_id(), "doc-1");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("alice", "doc-1", "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.revision().await, 0);
        assert_eq!(client.pending_len().await, 0);
        assert_eq!(client.sync_state().await, SyncState::Synchronized);
    }

    #[tokio::test]
    async fn test_send_operation_offline_buffers() {
        let client = SyncClient::new("alice", "doc-1", "ws://localhost:9090");
        client.send_operation(Operation::insert(0, "a")).await.unwrap();
        client.send_operation(Operation::delete(0, 1)).await.unwrap();
        assert_eq!(client.pending_len().await, 2);
        assert_eq!(client.sync_state().await, SyncState::AwaitingWithBuffer);
    }

    #[tokio::test]
    async fn test_presence_offline_noop() {
        let client = SyncClient::new("alice", "doc-1", "ws://localhost:9090");
        client.send_presence(json!({"cursor": 1})).await.unwrap();
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_undo_offline_fails() {
        let client = SyncClient::new("alice", "doc-1", "ws://localhost:9090");
        assert!(matches!(client.undo().await, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new("alice", "doc-1", format!("ws://127.0.0.1:{port}")).with_reconnect_policy(
            ReconnectPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts: Some(2),
            },
        );
        assert!(client.connect_with_retry().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_sequential_edits_wait_for_ack() {
        let mut edits = synced_at(1);

        let first = edits.submit(Operation::insert(0, "a")).unwrap().unwrap();
        assert_eq!(first.base_revision, 1);
        assert_eq!(first.operation.user_id.as_deref(), Some("alice"));
        assert_eq!(edits.submit(Operation::insert(1, "b")).unwrap(), None);
        assert_eq!(edits.state(), SyncState::AwaitingWithBuffer);

        let second = edits.acknowledged(2).unwrap();
        assert_eq!(second.base_revision, 2);
        assert_eq!(second.operation.position, 1);
        assert_eq!(edits.state(), SyncState::AwaitingConfirm);

        assert_eq!(edits.acknowledged(3), None);
        assert_eq!(edits.state(), SyncState::Synchronized);
        assert_eq!(edits.revision(), 3);
    }

    #[test]
    fn test_remote_transformed_past_pending_edits() {
        // Alice has "xyz" at revision 1 and types "a" then "b" at the front.
        let mut edits = synced_at(1);
        edits.submit(Operation::insert(0, "a")).unwrap();
        edits.submit(Operation::insert(1, "b")).unwrap();

        // Bob's insert at 0 landed first on the server.
        let outcome = edits.remote(&applied(2, "bob", vec![Operation::insert(0, "Q").by("bob")]));
        let RemoteOutcome::Apply { operations, next } = outcome else {
            panic!("expected operations to apply, got {outcome:?}");
        };
        assert_eq!(next, None);
        // Locally "abxyz" becomes "abQxyz".
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].position, 2);

        // Server: "Qxyz" + a@0 → "aQxyz"; the buffered b goes out at 1.
        let next = edits.acknowledged(3).unwrap();
        assert_eq!((next.base_revision, next.operation.position), (3, 1));
    }

    #[test]
    fn test_offline_edits_replay_one_at_a_time() {
        let mut edits = synced_at(1);
        edits.disconnected();
        assert_eq!(edits.submit(Operation::insert(0, "a")).unwrap(), None);
        assert_eq!(edits.submit(Operation::insert(1, "b")).unwrap(), None);
        assert_eq!(edits.pending_len(), 2);

        assert_eq!(edits.resume_from(), Some(1));
        edits.connected();
        // Nothing goes out before the catch-up arrives.
        assert_eq!(edits.submit(Operation::insert(2, "c")).unwrap(), None);

        let RemoteOutcome::Apply { operations, next } = edits.remote(&applied(1, "", vec![])) else {
            panic!("expected an empty catch-up to apply");
        };
        assert!(operations.is_empty());
        let first = next.unwrap();
        assert_eq!((first.base_revision, first.operation.content()), (1, Some("a")));

        let second = edits.acknowledged(2).unwrap();
        assert_eq!((second.base_revision, second.operation.content()), (2, Some("b")));
        let third = edits.acknowledged(3).unwrap();
        assert_eq!((third.base_revision, third.operation.content()), (3, Some("c")));
    }

    #[test]
    fn test_catch_up_confirms_submission_that_landed() {
        let mut edits = synced_at(1);
        let sent = edits.submit(Operation::insert(0, "a").at(100)).unwrap().unwrap();
        edits.submit(Operation::insert(1, "b").at(100)).unwrap();
        edits.disconnected();
        edits.connected();

        // Bob's edit, then ours as the server rebased it.
        let catch_up = applied(3, "", vec![Operation::insert(0, "Q").by("bob"), sent.operation.clone()]);
        let RemoteOutcome::Apply { operations, next } = edits.remote(&catch_up) else {
            panic!("expected catch-up to apply");
        };
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].content(), Some("Q"));
        assert_eq!(operations[0].position, 2);
        let next = next.unwrap();
        assert_eq!((next.base_revision, next.operation.content()), (3, Some("b")));
        assert_eq!(next.operation.timestamp, 101);
    }

    #[test]
    fn test_catch_up_resends_submission_that_was_lost() {
        let mut edits = synced_at(1);
        edits.submit(Operation::insert(0, "a")).unwrap().unwrap();
        edits.disconnected();
        edits.connected();

        let RemoteOutcome::Apply { next, .. } = edits.remote(&applied(2, "", vec![Operation::insert(0, "Q").by("bob")]))
        else {
            panic!("expected catch-up to apply");
        };
        let resent = next.unwrap();
        assert_eq!(resent.base_revision, 2);
        assert_eq!(resent.operation.content(), Some("a"));
        assert_eq!(edits.state(), SyncState::AwaitingConfirm);
    }

    #[test]
    fn test_old_reader_cannot_drop_new_connection() {
        let mut edits = synced_at(1);
        let old = 1;
        edits.disconnected();
        let current = edits.connected();
        assert!(!edits.connection_lost(old));
        assert_eq!(edits.resume_from(), Some(1));
        assert!(edits.connection_lost(current));
    }

    #[test]
    fn test_stale_and_missing_revisions() {
        let mut edits = synced_at(4);
        let op = Operation::insert(0, "x").by("bob");
        assert_eq!(edits.remote(&applied(4, "bob", vec![op.clone()])), RemoteOutcome::Stale);
        assert_eq!(
            edits.remote(&applied(7, "bob", vec![op])),
            RemoteOutcome::Gap { have: 4, from: 6 }
        );
        assert_eq!(edits.revision(), 4);
    }

    #[test]
    fn test_snapshot_on_new_base_discards_pending() {
        let mut edits = synced_at(1);
        edits.submit(Operation::insert(0, "a")).unwrap();
        edits.submit(Operation::insert(1, "b")).unwrap();

        let (discarded, next) = edits.snapshot(5);
        assert_eq!(discarded.len(), 2);
        assert_eq!(next, None);
        assert_eq!(edits.state(), SyncState::Synchronized);
        assert_eq!(edits.revision(), 5);
    }

    #[test]
    fn test_refusals_answer_requests_in_order() {
        let mut edits = synced_at(1);
        edits.history_requested();
        edits.submit(Operation::insert(0, "a")).unwrap().unwrap();
        edits.submit(Operation::insert(1, "b")).unwrap();

        assert_eq!(edits.refused("not_joined"), None);
        assert_eq!(
            edits.refused("nothing_to_undo"),
            Some(Refusal {
                discarded: vec![],
                resync: false
            })
        );
        assert_eq!(edits.pending_len(), 2);

        let refusal = edits.refused("out_of_bounds").unwrap();
        assert!(refusal.resync);
        assert_eq!(refusal.discarded.len(), 2);
        assert_eq!(edits.state(), SyncState::Synchronized);
    }

    #[test]
    fn test_history_result_is_remote_for_transform() {
        let mut edits = synced_at(2);
        edits.history_requested();
        edits.submit(Operation::insert(5, "z")).unwrap().unwrap();

        // Our undo landed first and removed two chars in front of the pending insert.
        let undo = Operation::delete(0, 2).by("alice").at(1);
        let RemoteOutcome::Apply { operations, .. } = edits.remote(&applied(3, "alice", vec![undo])) else {
            panic!("expected undo to apply");
        };
        assert_eq!(operations[0].position, 0);
        let next = edits.acknowledged(4);
        assert_eq!(next, None);
        // The history request was answered, so the next error is not ours to map.
        assert_eq!(edits.refused("nothing_to_redo"), None);
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let mut edits = PendingEdits::new("alice", 10);
        edits.submit(Operation::insert(0, "a").at(5)).unwrap();
        edits.submit(Operation::insert(1, "b").at(5)).unwrap();
        let stamps: Vec<u64> = edits.buffer.drain().iter().map(|op| op.timestamp).collect();
        assert_eq!(stamps, vec![5, 6]);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(Operation::insert(0, "abc"));
        queue.enqueue(Operation::delete(0, 4).at(10));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_chars(), 7);

        let first = queue.pop_front().unwrap();
        queue.requeue_front(vec![first.clone()]);
        let drained = queue.drain();
        assert_eq!(drained[0], first);
        assert_eq!(drained[1], Operation::delete(0, 4).at(10));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(Operation::insert(0, "1")));
        assert!(queue.enqueue(Operation::insert(0, "2")));
        assert!(!queue.enqueue(Operation::insert(0, "3")));
        queue.clear();
        assert!(queue.is_empty());

        let mut edits = PendingEdits::new("alice", 1);
        edits.submit(Operation::insert(0, "1")).unwrap();
        assert!(matches!(
            edits.submit(Operation::insert(0, "2")),
            Err(ProtocolError::QueueFull(1))
        ));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("alice", "doc-1", "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
