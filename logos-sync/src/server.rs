//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── DocumentSession "doc-1"
//!             ├── ConnectionManager ────┤
//! Client B ──┘   (rooms, heartbeats)    └── DocumentSession "doc-2"
//!                        │                        │
//!                        │                        ├── OperationLog (bounded)
//!                        │                        ├── UndoManager
//!                        │                        └── SnapshotSink (checkpoints)
//!                        ▼
//!              per-connection writer task ◄── ChannelTransport
//! ```
//!
//! Each accepted socket gets a reader loop (frames into the hub) and a
//! writer task draining its [`ChannelTransport`]. A background task sweeps
//! connections that stopped talking.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{ChannelTransport, CloseReason, ConnectionManager, Outbound, OutboundRx};
use crate::document::DEFAULT_LOG_CAPACITY;
use crate::error::ConnectionError;
use crate::hub::{DocumentHub, HubConfig};
use crate::presence::DEFAULT_DEBOUNCE;
use crate::protocol::Envelope;
use crate::storage::{MemorySnapshotStore, SnapshotSink};
use crate::undo::DEFAULT_UNDO_DEPTH;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections admitted at once
    pub max_connections: usize,
    /// Frames buffered per connection before it counts as stalled
    pub outbound_buffer: usize,
    /// Seconds between heartbeat sweeps
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence before a connection is closed
    pub heartbeat_timeout_secs: u64,
    /// Minimum gap between presence updates of one user, in milliseconds
    pub presence_debounce_ms: u64,
    /// Operations kept per document for rebasing
    pub op_log_capacity: usize,
    /// Accepted operations between checkpoints
    pub checkpoint_interval: u64,
    /// Undo entries kept per user per document
    pub undo_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections: 1000,
            outbound_buffer: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            presence_debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            op_log_capacity: DEFAULT_LOG_CAPACITY,
            checkpoint_interval: 100,
            undo_depth: DEFAULT_UNDO_DEPTH,
        }
    }
}

impl ServerConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            op_log_capacity: self.op_log_capacity,
            checkpoint_interval: self.checkpoint_interval,
            undo_depth: self.undo_depth,
            presence_debounce: Duration::from_millis(self.presence_debounce_ms),
        }
    }

    /// Defaults overridden by `LOGOS_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Override fields from `lookup(KEY)`. Values that fail to parse are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            let Some(raw) = raw else { return };
            match raw.trim().parse() {
                Ok(value) => *slot = value,
                Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid value"),
            }
        }

        if let Some(addr) = lookup("LOGOS_SYNC_BIND") {
            self.bind_addr = addr;
        }
        parse("LOGOS_SYNC_MAX_CONNECTIONS", lookup("LOGOS_SYNC_MAX_CONNECTIONS"), &mut self.max_connections);
        parse("LOGOS_SYNC_OUTBOUND_BUFFER", lookup("LOGOS_SYNC_OUTBOUND_BUFFER"), &mut self.outbound_buffer);
        parse("LOGOS_SYNC_HEARTBEAT_SECS", lookup("LOGOS_SYNC_HEARTBEAT_SECS"), &mut self.heartbeat_interval_secs);
        parse(
            "LOGOS_SYNC_HEARTBEAT_TIMEOUT_SECS",
            lookup("LOGOS_SYNC_HEARTBEAT_TIMEOUT_SECS"),
            &mut self.heartbeat_timeout_secs,
        );
        parse("LOGOS_SYNC_PRESENCE_DEBOUNCE_MS", lookup("LOGOS_SYNC_PRESENCE_DEBOUNCE_MS"), &mut self.presence_debounce_ms);
        parse("LOGOS_SYNC_OP_LOG_CAPACITY", lookup("LOGOS_SYNC_OP_LOG_CAPACITY"), &mut self.op_log_capacity);
        parse("LOGOS_SYNC_CHECKPOINT_INTERVAL", lookup("LOGOS_SYNC_CHECKPOINT_INTERVAL"), &mut self.checkpoint_interval);
        parse("LOGOS_SYNC_UNDO_DEPTH", lookup("LOGOS_SYNC_UNDO_DEPTH"), &mut self.undo_depth);
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<DocumentHub>,
}

impl SyncServer {
    /// Create a server checkpointing into an in-memory store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_sink(config, Arc::new(MemorySnapshotStore::new()))
    }

    /// Create a server checkpointing into `sink`.
    pub fn with_sink(config: ServerConfig, sink: Arc<dyn SnapshotSink>) -> Self {
        let connections = Arc::new(ConnectionManager::new(config.max_connections));
        let hub = Arc::new(DocumentHub::new(config.hub_config(), connections, sink));
        Self { config, hub }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<DocumentHub> {
        &self.hub
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.hub.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let outbound_buffer = self.config.outbound_buffer;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, outbound_buffer).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        heartbeat.abort();
        result
    }

    async fn heartbeat_loop(hub: Arc<DocumentHub>, interval: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            hub.heartbeat_tick(timeout).await;
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<DocumentHub>,
        outbound_buffer: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (transport, outbound_rx) = ChannelTransport::new(outbound_buffer);
        let conn_id = match hub.connect(Arc::new(transport)).await {
            Ok(id) => id,
            Err(e @ ConnectionError::CapacityExceeded { .. }) => {
                let refusal = Envelope::error("capacity_exceeded", e.to_string()).encode()?;
                ws_sender.send(Message::Text(refusal.into())).await?;
                ws_sender.send(Message::Close(Some(close_frame(CloseReason::Capacity)))).await?;
                log::warn!("Refused {addr}: {e}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        log::info!("WebSocket connection {conn_id} established from {addr}");

        let mut writer = tokio::spawn(Self::write_loop(ws_sender, outbound_rx));
        let mut writer_done = false;

        let reason = loop {
            let message = tokio::select! {
                message = ws_receiver.next() => message,
                _ = &mut writer => {
                    // Closed from our side, or the socket stopped taking writes.
                    writer_done = true;
                    break CloseReason::TransportError;
                }
            };
            match message {
                Some(Ok(Message::Text(text))) => hub.handle_frame(conn_id, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => {
                    // The protocol is text; a binary frame still gets a parse error back.
                    hub.handle_frame(conn_id, &String::from_utf8_lossy(&data)).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // tungstenite answers pings itself; either way the peer is alive.
                    hub.connections().heartbeat(conn_id).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection {conn_id} closed by {addr}");
                    break CloseReason::Normal;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break CloseReason::TransportError;
                }
            }
        };

        // A no-op if the hub already dropped this connection.
        hub.disconnect(conn_id, reason).await;
        if !writer_done {
            // The writer exits after forwarding the close frame.
            let _ = writer.await;
        }
        Ok(())
    }

    async fn write_loop<S>(mut ws_sender: S, mut outbound_rx: OutboundRx)
    where
        S: futures_util::Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        while let Some(item) = outbound_rx.recv().await {
            let result = match item {
                Outbound::Frame(frame) => ws_sender.send(Message::Text(frame.to_string().into())).await,
                Outbound::Close(reason) => {
                    let _ = ws_sender.send(Message::Close(Some(close_frame(reason)))).await;
                    break;
                }
            };
            if let Err(e) = result {
                log::debug!("Writer stopped: {e}");
                break;
            }
        }
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.as_str().to_string().into(),
    }
}
