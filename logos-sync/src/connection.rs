//! Connection registry and room membership.
//!
//! ```text
//!   register ──► Connection { transport, user, rooms, last_heartbeat }
//!                    │
//!   join_room ───────┼──► rooms: doc_id → {conn ids}
//!                    │
//!   broadcast(room) ─┴──► encode once, snapshot members under the read
//!                         lock, send after releasing it
//! ```
//!
//! Every teardown goes through [`ConnectionManager::disconnect`], so a
//! connection never lingers in a room after its transport is gone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ConnectionError, ProtocolError, TransportError};
use crate::protocol::Envelope;

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client went away or asked to close
    Normal,
    /// No message within the heartbeat timeout
    HeartbeatTimeout,
    /// A send to this connection failed
    TransportError,
    /// Rejected at admission
    Capacity,
    /// Server is shutting down
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code (RFC 6455 §7.4).
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::TransportError => 1011,
            CloseReason::HeartbeatTimeout => 4000,
            CloseReason::Capacity => 1013,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::TransportError => "transport error",
            CloseReason::Capacity => "server at capacity",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// Outbound half of a connection.
///
/// Implementations must not block: `send` either queues the frame or fails.
pub trait Transport: Send + Sync {
    fn send(&self, frame: Arc<str>) -> Result<(), TransportError>;
    fn close(&self, reason: CloseReason);
}

/// Item consumed by a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Arc<str>),
    Close(CloseReason),
}

/// [`Transport`] backed by a bounded channel.
///
/// A full buffer counts as a failed send, so one slow reader is dropped
/// instead of stalling the room. The close signal travels on its own
/// channel and is never blocked by queued frames.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    frames: mpsc::Sender<Arc<str>>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, OutboundRx) {
        let (frames_tx, frames) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = watch::channel(None);
        let transport = Self {
            frames: frames_tx,
            close: Arc::new(close_tx),
        };
        let rx = OutboundRx {
            frames,
            close,
            close_open: true,
            finished: false,
        };
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Arc<str>) -> Result<(), TransportError> {
        if self.close.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Send("outbound buffer full".to_string()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self, reason: CloseReason) {
        // First reason wins; the writer may already be gone.
        self.close.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

/// Receiving half of a [`ChannelTransport`].
///
/// A close overtakes any frames still queued and is yielded once; after
/// it the receiver is finished.
#[derive(Debug)]
pub struct OutboundRx {
    frames: mpsc::Receiver<Arc<str>>,
    close: watch::Receiver<Option<CloseReason>>,
    close_open: bool,
    finished: bool,
}

impl OutboundRx {
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            if let Some(item) = self.take_close() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            tokio::select! {
                biased;
                changed = self.close.changed(), if self.close_open => {
                    if changed.is_err() {
                        self.close_open = false;
                    }
                }
                frame = self.frames.recv() => match frame {
                    Some(frame) => return Some(Outbound::Frame(frame)),
                    None => {
                        let last = self.take_close();
                        self.finished = true;
                        return last;
                    }
                },
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Outbound, mpsc::error::TryRecvError> {
        if let Some(item) = self.take_close() {
            return Ok(item);
        }
        if self.finished {
            return Err(mpsc::error::TryRecvError::Disconnected);
        }
        self.frames.try_recv().map(Outbound::Frame)
    }

    fn take_close(&mut self) -> Option<Outbound> {
        if self.finished {
            return None;
        }
        let reason = (*self.close.borrow_and_update())?;
        self.finished = true;
        Some(Outbound::Close(reason))
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

struct Connection {
    transport: Arc<dyn Transport>,
    user_id: Option<String>,
    rooms: HashSet<String>,
    last_heartbeat: Instant,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<Uuid, Connection>,
    rooms: HashMap<String, HashSet<Uuid>>,
}

impl Registry {
    fn remove_member(&mut self, room: &str, conn_id: &Uuid) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(conn_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }
}

/// What was torn down by [`ConnectionManager::disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub conn_id: Uuid,
    pub user_id: Option<String>,
    pub reason: CloseReason,
    /// Rooms the connection was in, sorted.
    pub rooms: Vec<String>,
}

/// Outcome of a room broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Members whose send failed; they have already been disconnected.
    pub dropped: Vec<Disconnected>,
}

/// Registry of live connections and the rooms they joined.
pub struct ConnectionManager {
    registry: RwLock<Registry>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admit a new connection.
    pub async fn register(&self, transport: Arc<dyn Transport>) -> Result<Uuid, ConnectionError> {
        let mut registry = self.registry.write().await;
        if registry.connections.len() >= self.max_connections {
            log::warn!("Rejecting connection: {} connections open", registry.connections.len());
            return Err(ConnectionError::CapacityExceeded {
                max: self.max_connections,
            });
        }
        let conn_id = Uuid::new_v4();
        registry.connections.insert(
            conn_id,
            Connection {
                transport,
                user_id: None,
                rooms: HashSet::new(),
                last_heartbeat: Instant::now(),
            },
        );
        log::debug!("Registered connection {conn_id} ({} open)", registry.connections.len());
        Ok(conn_id)
    }

    /// Bind a user identity to a connection.
    pub async fn set_user(&self, conn_id: Uuid, user_id: &str) -> Result<(), ConnectionError> {
        let mut registry = self.registry.write().await;
        let conn = registry
            .connections
            .get_mut(&conn_id)
            .ok_or(ConnectionError::UnknownConnection(conn_id))?;
        conn.user_id = Some(user_id.to_string());
        Ok(())
    }

    pub async fn user_of(&self, conn_id: Uuid) -> Option<String> {
        self.registry
            .read()
            .await
            .connections
            .get(&conn_id)
            .and_then(|c| c.user_id.clone())
    }

    /// Add a connection to a room. Returns `false` if it was already a member.
    pub async fn join_room(&self, conn_id: Uuid, room: &str) -> Result<bool, ConnectionError> {
        let mut registry = self.registry.write().await;
        let conn = registry
            .connections
            .get_mut(&conn_id)
            .ok_or(ConnectionError::UnknownConnection(conn_id))?;
        if !conn.rooms.insert(room.to_string()) {
            return Ok(false);
        }
        registry.rooms.entry(room.to_string()).or_default().insert(conn_id);
        log::debug!("Connection {conn_id} joined room {room}");
        Ok(true)
    }

    /// Remove a connection from a room. Returns `false` if it was not a member.
    pub async fn leave_room(&self, conn_id: Uuid, room: &str) -> bool {
        let mut registry = self.registry.write().await;
        let was_member = registry
            .connections
            .get_mut(&conn_id)
            .is_some_and(|c| c.rooms.remove(room));
        if was_member {
            registry.remove_member(room, &conn_id);
            log::debug!("Connection {conn_id} left room {room}");
        }
        was_member
    }

    pub async fn is_member(&self, conn_id: Uuid, room: &str) -> bool {
        self.registry
            .read()
            .await
            .rooms
            .get(room)
            .is_some_and(|m| m.contains(&conn_id))
    }

    /// Remove a connection from every room and the registry, then close its
    /// transport. Returns `None` if the connection was already gone.
    pub async fn disconnect(&self, conn_id: Uuid, reason: CloseReason) -> Option<Disconnected> {
        let (conn, rooms) = {
            let mut registry = self.registry.write().await;
            let conn = registry.connections.remove(&conn_id)?;
            let mut rooms: Vec<String> = conn.rooms.iter().cloned().collect();
            rooms.sort();
            for room in &rooms {
                registry.remove_member(room, &conn_id);
            }
            (conn, rooms)
        };

        conn.transport.close(reason);
        log::info!("Connection {conn_id} closed ({}), left {} room(s)", reason.as_str(), rooms.len());

        Some(Disconnected {
            conn_id,
            user_id: conn.user_id,
            reason,
            rooms,
        })
    }

    /// Note liveness of a connection. Returns `false` for unknown ids.
    pub async fn heartbeat(&self, conn_id: Uuid) -> bool {
        let mut registry = self.registry.write().await;
        match registry.connections.get_mut(&conn_id) {
            Some(conn) => {
                conn.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Disconnect every connection silent for longer than `timeout`.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<Disconnected> {
        let stale: Vec<Uuid> = {
            let registry = self.registry.read().await;
            let now = Instant::now();
            registry
                .connections
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_heartbeat) > timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut closed = Vec::with_capacity(stale.len());
        for conn_id in stale {
            if let Some(d) = self.disconnect(conn_id, CloseReason::HeartbeatTimeout).await {
                closed.push(d);
            }
        }
        closed
    }

    /// Send one message to one connection.
    ///
    /// Unlike [`broadcast`](Self::broadcast) a failed send does not
    /// disconnect; the caller owns the teardown.
    pub async fn send_to(&self, conn_id: Uuid, msg: &Envelope) -> Result<(), ConnectionError> {
        let frame: Arc<str> = match msg.encode() {
            Ok(s) => Arc::from(s),
            Err(e) => {
                log::error!("Dropping unencodable '{}' message: {e}", msg.msg_type);
                return Ok(());
            }
        };
        let transport = self
            .registry
            .read()
            .await
            .connections
            .get(&conn_id)
            .map(|c| c.transport.clone())
            .ok_or(ConnectionError::UnknownConnection(conn_id))?;

        transport.send(frame).map_err(|e| {
            log::warn!("Send to {conn_id} failed: {e}");
            e.into()
        })
    }

    /// Send `msg` to every member of `room` except `exclude`.
    ///
    /// The message is encoded once. A member whose send fails is
    /// disconnected and reported; the others still receive the message.
    pub async fn broadcast(
        &self,
        room: &str,
        msg: &Envelope,
        exclude: Option<Uuid>,
    ) -> Result<BroadcastReport, ProtocolError> {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        let targets: Vec<(Uuid, Arc<dyn Transport>)> = {
            let registry = self.registry.read().await;
            let Some(members) = registry.rooms.get(room) else {
                return Ok(BroadcastReport::default());
            };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| registry.connections.get(id).map(|c| (*id, c.transport.clone())))
                .collect()
        };

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (conn_id, transport) in targets {
            match transport.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("Broadcast to {conn_id} in room {room} failed: {e}");
                    failed.push(conn_id);
                }
            }
        }
        for conn_id in failed {
            if let Some(d) = self.disconnect(conn_id, CloseReason::TransportError).await {
                report.dropped.push(d);
            }
        }
        log::trace!("Broadcast '{}' to room {room}: {} delivered", msg.msg_type, report.delivered);
        Ok(report)
    }

    /// Ids of every live connection.
    pub async fn connection_ids(&self) -> Vec<Uuid> {
        self.registry.read().await.connections.keys().copied().collect()
    }

    pub async fn room_members(&self, room: &str) -> Vec<Uuid> {
        self.registry
            .read()
            .await
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any member of `room` is bound to `user_id`.
    pub async fn room_has_user(&self, room: &str, user_id: &str) -> bool {
        let registry = self.registry.read().await;
        registry.rooms.get(room).is_some_and(|members| {
            members.iter().any(|id| {
                registry
                    .connections
                    .get(id)
                    .is_some_and(|c| c.user_id.as_deref() == Some(user_id))
            })
        })
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.registry.read().await.rooms.get(room).map_or(0, HashSet::len)
    }

    pub async fn rooms_of(&self, conn_id: Uuid) -> Vec<String> {
        let registry = self.registry.read().await;
        let mut rooms: Vec<String> = registry
            .connections
            .get(&conn_id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.registry.read().await.rooms.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconnect backoff
// ───────────────────────────────────────────────────────────────────

/// Delay before reconnect attempt `attempt` (1-based): `base · 2^(attempt−1)`.
///
/// Uncapped; saturates at `Duration::MAX` instead of overflowing. Attempt 0
/// is treated as attempt 1.
pub fn reconnect_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    match 2u32.checked_pow(exponent) {
        Some(factor) => base.saturating_mul(factor),
        None => Duration::MAX,
    }
}

/// Client-side reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_attempts: Some(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before `attempt`, or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(reconnect_delay(attempt, self.base_delay)),
        }
    }
}
