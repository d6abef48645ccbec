//! WebSocket server hosting live tables and presence channels.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── MemoryBackend ── table "tasks"    ──► change feed
//!             ├── connection session ─┤       │            table "projects" ──► change feed
//! Client B ──┘   (identity, policy)   │       └── RowStore (RocksDB, optional)
//!                                     │
//!                                     └── LocalHub ── room "tasks-presence" ── BroadcastGroup
//! ```
//!
//! Each connection runs one select loop over its socket and an outbound
//! queue. Table subscriptions and channel memberships are forwarded into
//! that queue by their own tasks; requests are answered inline. Every
//! table request goes through [`GuardedPersistence`] with the policy the
//! [`AccessResolver`] gives the connection's identity.
//!
//! The identity comes from the client's `Hello` frame and is not verified.
//! Gating therefore only holds for clients that report who they are
//! honestly; an authenticating proxy in front of the server is assumed.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tasksync_core::{AccessPolicy, Identity, RawRow, RecordId};

use crate::broadcast::LocalHub;
use crate::channel::{ChannelEvent, ChannelHub, ClientKey, PresenceChannel};
use crate::feed::{ChangeFeedSource, FeedSignal, FeedStatus, FeedSubscription};
use crate::memory::{MemoryBackend, MemoryTable};
use crate::persistence::{
    AccessResolver, AllowAllResolver, GuardedPersistence, Persistence, PersistenceError,
    TableActions,
};
use crate::protocol::{
    from_json, row_from_json, to_json, ClientFrame, Reply, ServerFrame, WireChannelEvent, WireError,
};
use crate::storage::{RowStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Tables the server hosts
    pub tables: Vec<String>,
    /// Maximum members per channel (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Change buffer per table
    pub change_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            tables: vec!["tasks".to_string(), "projects".to_string()],
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            change_capacity: 1024,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Small buffers, no storage.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            change_capacity: 256,
            ..Self::default()
        }
    }

    /// Defaults overridden by `TASKSYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TASKSYNC_BIND") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("TASKSYNC_STORAGE").filter(|p| !p.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(tables) = lookup("TASKSYNC_TABLES") {
            let tables: Vec<String> = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if !tables.is_empty() {
                config.tables = tables;
            }
        }
        if let Some(n) = parse_env(&lookup, "TASKSYNC_MAX_PEERS") {
            config.max_peers_per_room = n;
        }
        if let Some(n) = parse_env(&lookup, "TASKSYNC_BROADCAST_CAPACITY") {
            config.broadcast_capacity = n;
        }
        if let Some(n) = parse_env(&lookup, "TASKSYNC_CHANGE_CAPACITY") {
            config.change_capacity = n;
        }
        config
    }
}

fn parse_env(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("Ignoring {key}={raw}: not a number");
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("recovery: {0}")]
    Recovery(#[from] PersistenceError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_requests: u64,
    pub active_rooms: usize,
}

/// Everything a connection needs.
struct Shared {
    backend: Arc<MemoryBackend>,
    hub: Arc<LocalHub>,
    resolver: Arc<dyn AccessResolver>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server. Opens the row store if a storage path is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let backend = match &config.storage_path {
            Some(path) => {
                let store = RowStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                MemoryBackend::with_store(
                    config.tables.iter().cloned(),
                    Arc::new(store),
                    config.change_capacity,
                )
            }
            None => MemoryBackend::new(config.tables.iter().cloned()),
        };
        let hub = LocalHub::new(config.broadcast_capacity).with_max_members(config.max_peers_per_room);

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                backend: Arc::new(backend),
                hub: Arc::new(hub),
                resolver: Arc::new(AllowAllResolver),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            }),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default())
    }

    /// Use `resolver` to decide what each connection may do.
    pub fn with_resolver(self, resolver: Arc<dyn AccessResolver>) -> Self {
        let shared = Shared {
            backend: self.shared.backend.clone(),
            hub: self.shared.hub.clone(),
            resolver,
            stats: self.shared.stats.clone(),
        };
        Self {
            config: self.config,
            shared: Arc::new(shared),
        }
    }

    /// Load persisted rows into the hosted tables.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let recovered = self.shared.backend.recover().await?;
        if recovered > 0 {
            log::info!("Recovery complete: {recovered} rows restored");
        }
        Ok(recovered)
    }

    /// Recover, then accept WebSocket connections forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.recover().await?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "Sync server listening on {} (tables: {})",
            self.config.bind_addr,
            self.config.tables.join(", ")
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4();

        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(256);
        let mut session = Session::new(shared.clone(), out_tx);

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = shared.stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientFrame::decode(&data) {
                                    Ok(frame) => {
                                        if let Some(reply) = session.handle(frame).await {
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {connection_id} closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Feed and channel traffic for this client
                    frame = out_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        session.close().await;
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = shared.hub.rooms().room_count().await;
        }
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.hub.rooms().room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.shared.backend
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.shared.hub
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<RowStore>> {
        self.shared.backend.store()
    }
}

// ───────────────────────────────────────────────────────────────────
// Per-connection session
// ───────────────────────────────────────────────────────────────────

struct JoinedChannel {
    handle: Arc<dyn PresenceChannel>,
    forward: JoinHandle<()>,
}

struct Session {
    shared: Arc<Shared>,
    out: mpsc::Sender<ServerFrame>,
    identity: Identity,
    policy: Arc<dyn AccessPolicy>,
    feeds: HashMap<String, JoinHandle<()>>,
    channels: HashMap<String, JoinedChannel>,
}

impl Session {
    fn new(shared: Arc<Shared>, out: mpsc::Sender<ServerFrame>) -> Self {
        let identity = Identity::anonymous();
        let policy = shared.resolver.resolve(&identity);
        Self {
            shared,
            out,
            identity,
            policy,
            feeds: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    fn table(&self, name: &str) -> Result<GuardedPersistence<Arc<MemoryTable>>, WireError> {
        let table = self.shared.backend.table(name)?;
        Ok(GuardedPersistence::new(
            table,
            self.policy.clone(),
            TableActions::for_table(name),
        ))
    }

    fn channel(&self, name: &str) -> Result<&Arc<dyn PresenceChannel>, WireError> {
        self.channels
            .get(name)
            .map(|c| &c.handle)
            .ok_or_else(|| WireError::Channel(format!("not joined to '{name}'")))
    }

    /// Handle one frame. Returns the frame to send back, if any.
    async fn handle(&mut self, frame: ClientFrame) -> Option<ServerFrame> {
        let request_id = frame.request_id();
        let result = match frame {
            ClientFrame::Hello { identity } => {
                log::info!("Client identified as {}", identity.author());
                self.policy = self.shared.resolver.resolve(&identity);
                self.identity = identity;
                return None;
            }
            ClientFrame::Subscribe { table } => return self.subscribe(table).await,
            ClientFrame::Unsubscribe { table } => {
                if let Some(task) = self.feeds.remove(&table) {
                    task.abort();
                    log::debug!("{} unsubscribed from '{table}'", self.identity.author());
                }
                return None;
            }
            ClientFrame::Ping => return Some(ServerFrame::Pong),

            ClientFrame::Fetch { table, .. } => self.fetch(&table).await,
            ClientFrame::Insert { table, row, .. } => self.insert(&table, &row).await,
            ClientFrame::InsertMany { table, rows, .. } => self.insert_many(&table, &rows).await,
            ClientFrame::Update { table, id, patch, .. } => self.update(&table, &id, &patch).await,
            ClientFrame::Delete { table, id, .. } => self.delete(&table, &id).await,
            ClientFrame::DeleteMany { table, ids, .. } => self.delete_many(&table, &ids).await,

            ClientFrame::JoinChannel {
                channel,
                client_key,
                ..
            } => self.join_channel(channel, client_key).await,
            ClientFrame::LeaveChannel { channel, .. } => {
                self.leave_channel(&channel).await;
                Ok(Reply::Done)
            }
            ClientFrame::Broadcast {
                channel,
                event,
                payload,
                ..
            } => self.broadcast(&channel, &event, &payload).await,
            ClientFrame::Track { channel, entry, .. } => match self.channel(&channel) {
                Ok(handle) => handle.track(entry).await.map(|_| Reply::Done).map_err(WireError::from),
                Err(e) => Err(e),
            },
            ClientFrame::Untrack { channel, .. } => match self.channel(&channel) {
                Ok(handle) => handle.untrack().await.map(|_| Reply::Done).map_err(WireError::from),
                Err(e) => Err(e),
            },
            ClientFrame::PresenceState { channel, .. } => match self.channel(&channel) {
                Ok(handle) => handle
                    .presence_state()
                    .await
                    .map(Reply::Presence)
                    .map_err(WireError::from),
                Err(e) => Err(e),
            },
        };

        if result.is_err() {
            self.shared.stats.write().await.rejected_requests += 1;
        }
        request_id.map(|id| ServerFrame::reply(id, result))
    }

    async fn subscribe(&mut self, table: String) -> Option<ServerFrame> {
        if self.feeds.contains_key(&table) {
            return None;
        }
        let view = TableActions::for_table(&table).view;
        if !self.policy.can_perform(view) {
            log::warn!("{} may not subscribe to '{table}'", self.identity.author());
            return Some(ServerFrame::FeedStatus {
                table,
                status: FeedStatus::Error(format!("not permitted: {view}")),
            });
        }

        match self.shared.backend.subscribe(&table).await {
            Ok(subscription) => {
                let task = tokio::spawn(forward_feed(table.clone(), subscription, self.out.clone()));
                self.feeds.insert(table, task);
                None
            }
            Err(e) => Some(ServerFrame::FeedStatus {
                table,
                status: FeedStatus::Error(e.to_string()),
            }),
        }
    }

    async fn fetch(&self, table: &str) -> Result<Reply, WireError> {
        let rows = self.table(table)?.fetch_all().await?;
        let encoded = rows.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
        Ok(Reply::Rows(encoded))
    }

    async fn insert(&self, table: &str, row: &str) -> Result<Reply, WireError> {
        let row = row_from_json(row)?;
        let committed = self.table(table)?.insert(row).await?;
        Ok(Reply::Row(to_json(&committed)?))
    }

    async fn insert_many(&self, table: &str, rows: &[String]) -> Result<Reply, WireError> {
        let rows = rows
            .iter()
            .map(|r| row_from_json(r))
            .collect::<Result<Vec<RawRow>, _>>()?;
        let n = self.table(table)?.insert_many(rows).await?;
        Ok(Reply::Count(n as u64))
    }

    async fn update(&self, table: &str, id: &RecordId, patch: &str) -> Result<Reply, WireError> {
        let patch = row_from_json(patch)?;
        self.table(table)?.update(id, patch).await?;
        Ok(Reply::Done)
    }

    async fn delete(&self, table: &str, id: &RecordId) -> Result<Reply, WireError> {
        self.table(table)?.delete(id).await?;
        Ok(Reply::Done)
    }

    async fn delete_many(&self, table: &str, ids: &[RecordId]) -> Result<Reply, WireError> {
        let n = self.table(table)?.delete_many(ids).await?;
        Ok(Reply::Count(n as u64))
    }

    async fn broadcast(&self, channel: &str, event: &str, payload: &str) -> Result<Reply, WireError> {
        let payload: serde_json::Value = from_json(payload)?;
        self.channel(channel)?.broadcast(event, payload).await?;
        Ok(Reply::Done)
    }

    async fn join_channel(
        &mut self,
        channel: String,
        client_key: ClientKey,
    ) -> Result<Reply, WireError> {
        if self.channels.contains_key(&channel) {
            return Ok(Reply::Done);
        }
        let (handle, events) = self.shared.hub.join(&channel, &client_key).await?;
        let forward = tokio::spawn(forward_channel(channel.clone(), events, self.out.clone()));
        log::info!("{} ({client_key}) joined channel '{channel}'", self.identity.author());
        self.channels.insert(channel, JoinedChannel { handle, forward });
        Ok(Reply::Done)
    }

    async fn leave_channel(&mut self, channel: &str) {
        if let Some(joined) = self.channels.remove(channel) {
            if let Err(e) = joined.handle.leave().await {
                log::debug!("Leaving '{channel}' failed: {e}");
            }
            joined.forward.abort();
        }
    }

    /// Connection is gone: stop feeds and leave every channel.
    async fn close(&mut self) {
        for (_, task) in self.feeds.drain() {
            task.abort();
        }
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.leave_channel(&name).await;
        }
    }
}

async fn forward_feed(table: String, mut subscription: FeedSubscription, out: mpsc::Sender<ServerFrame>) {
    while let Some(signal) = subscription.recv().await {
        let frame = match signal {
            FeedSignal::Status(status) => ServerFrame::FeedStatus {
                table: table.clone(),
                status,
            },
            FeedSignal::Change(change) => match ServerFrame::change(&table, &change) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode change on '{table}': {e}");
                    continue;
                }
            },
        };
        if out.send(frame).await.is_err() {
            return;
        }
    }
    let _ = out
        .send(ServerFrame::FeedStatus {
            table,
            status: FeedStatus::Closed,
        })
        .await;
}

async fn forward_channel(
    channel: String,
    mut events: mpsc::Receiver<ChannelEvent>,
    out: mpsc::Sender<ServerFrame>,
) {
    while let Some(event) = events.recv().await {
        let wire = match WireChannelEvent::from_event(&event) {
            Ok(wire) => wire,
            Err(e) => {
                log::error!("Failed to encode event on '{channel}': {e}");
                continue;
            }
        };
        let frame = ServerFrame::Channel {
            channel: channel.clone(),
            event: wire,
        };
        if out.send(frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.tables, vec!["tasks", "projects"]);
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TASKSYNC_BIND", "0.0.0.0:8080"),
            ("TASKSYNC_TABLES", "tasks, archive ,"),
            ("TASKSYNC_MAX_PEERS", "5"),
            ("TASKSYNC_BROADCAST_CAPACITY", "lots"),
        ]);
        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.tables, vec!["tasks", "archive"]);
        assert_eq!(config.max_peers_per_room, 5);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults().unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
        assert_eq!(server.backend().table_names(), vec!["projects", "tasks"]);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing("127.0.0.1:0")
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults().unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.rejected_requests, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_server_recovery_empty() {
        let server = SyncServer::with_defaults().unwrap();
        assert_eq!(server.recover().await.unwrap(), 0);
    }
}
