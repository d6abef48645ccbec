//! WebSocket client for the sync server.
//!
//! One connection carries everything a dashboard tab needs:
//! - [`RemoteTable`]: a [`Persistence`] backed by server requests
//! - table change subscriptions ([`ChangeFeedSource`])
//! - presence channels ([`ChannelHub`])
//!
//! ```text
//!  caller ── request(id) ──► outgoing mpsc ──► writer task ──► socket
//!    ▲                                                           │
//!    └── oneshot (pending[id]) ◄── reader task ◄─────────────────┘
//!                                     ├── FeedStatus/Change ──► feed senders
//!                                     └── Channel ──► relay queue ──► channel receiver
//! ```
//!
//! The reader never waits on a consumer. A feed whose buffer is full is
//! cut off, so its owner sees the stream end and resynchronizes; channel
//! events queue up in a per-channel relay instead, since presence cannot
//! be reloaded.
//!
//! When the connection drops every pending request fails, every feed gets
//! a `Closed` status and ends, and every channel gets `Closed`.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use tasksync_core::{Identity, RawChange, RawRow, RecordId};

use crate::channel::{
    ChannelError, ChannelEvent, ChannelHub, ChannelStatus, ClientKey, PresenceChannel,
    PresenceEntry,
};
use crate::feed::{ChangeFeedSource, FeedError, FeedSignal, FeedStatus, FeedSubscription};
use crate::persistence::{Persistence, PersistenceError};
use crate::protocol::{
    from_json, row_from_json, to_json, ClientFrame, ProtocolError, Reply, ServerFrame, WireError,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// How long a request waits for its reply
    pub request_timeout: Duration,
    /// Buffer for each feed and channel
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            request_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(2),
            event_buffer: 64,
        }
    }
}

type PendingReply = oneshot::Sender<Result<Reply, WireError>>;

struct FeedTap {
    id: u64,
    tx: mpsc::Sender<FeedSignal>,
}

struct Inner {
    config: ClientConfig,
    identity: Identity,
    state: RwLock<ConnectionState>,
    /// Channel to the WebSocket writer task
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    next_id: AtomicU64,
    /// Bumped on every connect; a stale reader must not tear down a newer connection
    generation: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    /// Table subscribers; several local feeds may share one server subscription
    feeds: Mutex<HashMap<String, Vec<FeedTap>>>,
    /// Whether the server has confirmed a table subscription
    subscribed: Mutex<HashMap<String, bool>>,
    /// Relay queues, one per joined channel
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<ChannelEvent>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

/// The sync client. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    /// Create a client for `identity`. Nothing happens until [`connect`](Self::connect).
    pub fn new(config: ClientConfig, identity: Identity) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: RwLock::new(None),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                feeds: Mutex::new(HashMap::new()),
                subscribed: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Take the event receiver (can only be called once).
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.inner.event_rx.lock().await.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        *self.inner.state.write().await = ConnectionState::Connecting;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let ws_stream = match tokio_tungstenite::connect_async(self.inner.config.url.as_str()).await
        {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Could not connect to {}: {e}", self.inner.config.url);
                *self.inner.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        *self.inner.outgoing.write().await = Some(out_tx);

        self.send(ClientFrame::Hello {
            identity: self.inner.identity.clone(),
        })
        .await?;

        *self.inner.state.write().await = ConnectionState::Connected;
        let _ = self.inner.event_tx.try_send(SyncEvent::Connected);
        log::info!(
            "Connected to {} as {}",
            self.inner.config.url,
            self.inner.identity.author()
        );

        // Reader task: route incoming frames
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                        Ok(frame) => route(&inner, frame).await,
                        Err(e) => log::warn!("Failed to decode server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            connection_lost(&inner, generation).await;
        });

        Ok(())
    }

    /// Drop the connection. Pending requests fail and feeds end.
    pub async fn disconnect(&self) {
        // Dropping the sender stops the writer task, which closes the socket.
        self.inner.outgoing.write().await.take();
        let generation = self.inner.generation.load(Ordering::SeqCst);
        connection_lost(&self.inner, generation).await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn server_url(&self) -> &str {
        &self.inner.config.url
    }

    /// A [`Persistence`] for `table` on the server.
    pub fn table(&self, table: impl Into<String>) -> RemoteTable {
        RemoteTable {
            client: self.clone(),
            table: table.into(),
        }
    }

    /// Send a keepalive.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientFrame::Ping).await
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ProtocolError> {
        send_frame(&self.inner, frame).await
    }

    /// Send a request and wait for its reply. The outer error is transport,
    /// the inner one is what the server answered.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<Result<Reply, WireError>, ProtocolError> {
        let request_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, tx);

        if let Err(e) = self.send(build(request_id)).await {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                log::warn!("Request {request_id} timed out");
                Err(ProtocolError::Timeout)
            }
        }
    }

    async fn unsubscribe(&self, table: &str, tap_id: u64) {
        let now_empty = {
            let mut feeds = self.inner.feeds.lock().await;
            match feeds.get_mut(table) {
                Some(taps) => {
                    taps.retain(|t| t.id != tap_id);
                    if taps.is_empty() {
                        feeds.remove(table);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if now_empty {
            self.inner.subscribed.lock().await.remove(table);
            let _ = self
                .send(ClientFrame::Unsubscribe {
                    table: table.to_string(),
                })
                .await;
        }
    }
}

async fn route(inner: &Inner, frame: ServerFrame) {
    match frame {
        ServerFrame::Reply { request_id, result } => {
            match inner.pending.lock().await.remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => log::debug!("Reply for unknown request {request_id}"),
            }
        }

        ServerFrame::FeedStatus { table, status } => {
            {
                let mut subscribed = inner.subscribed.lock().await;
                match status {
                    FeedStatus::Subscribed => {
                        subscribed.insert(table.clone(), true);
                    }
                    _ => {
                        subscribed.remove(&table);
                    }
                }
            }
            deliver(inner, &table, FeedSignal::Status(status.clone())).await;
            if status == FeedStatus::Closed {
                inner.feeds.lock().await.remove(&table);
            }
        }

        ServerFrame::Change { table, change } => {
            let change: RawChange = match from_json(&change) {
                Ok(change) => change,
                Err(e) => {
                    log::warn!("Dropping undecodable change on '{table}': {e}");
                    return;
                }
            };
            deliver(inner, &table, FeedSignal::Change(change)).await;
        }

        ServerFrame::Channel { channel, event } => {
            let event = match event.into_event() {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Dropping undecodable event on '{channel}': {e}");
                    return;
                }
            };
            let mut channels = inner.channels.lock().await;
            if let Some(tx) = channels.get(&channel) {
                if tx.send(event).is_err() {
                    channels.remove(&channel);
                }
            }
        }

        ServerFrame::Pong => log::debug!("Pong"),
    }
}

async fn send_frame(inner: &Inner, frame: ClientFrame) -> Result<(), ProtocolError> {
    let encoded = frame.encode()?;
    let tx = inner
        .outgoing
        .read()
        .await
        .clone()
        .ok_or(ProtocolError::ConnectionClosed)?;
    tx.send(encoded)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// Hand `signal` to every tap of `table` without waiting. A tap that is
/// full or gone is dropped; ending its stream makes the owner resync.
async fn deliver(inner: &Inner, table: &str, signal: FeedSignal) {
    let now_empty = {
        let mut feeds = inner.feeds.lock().await;
        let Some(taps) = feeds.get_mut(table) else {
            return;
        };
        taps.retain(|tap| match tap.tx.try_send(signal.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Feed {} on '{table}' fell behind; cutting it off", tap.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if taps.is_empty() {
            feeds.remove(table);
            true
        } else {
            false
        }
    };
    if now_empty {
        inner.subscribed.lock().await.remove(table);
        let _ = send_frame(
            inner,
            ClientFrame::Unsubscribe {
                table: table.to_string(),
            },
        )
        .await;
    }
}

/// Register a channel's relay: events queue without bound and a task
/// moves them into the bounded receiver the caller gets.
async fn register_channel(
    inner: &Inner,
    channel: &str,
    buffer: usize,
) -> mpsc::Receiver<ChannelEvent> {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    tokio::spawn(async move {
        while let Some(event) = relay_rx.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    inner.channels.lock().await.insert(channel.to_string(), relay_tx);
    rx
}

async fn connection_lost(inner: &Inner, generation: u64) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    {
        let mut state = inner.state.write().await;
        if *state == ConnectionState::Disconnected {
            return;
        }
        *state = ConnectionState::Disconnected;
    }
    inner.outgoing.write().await.take();

    // Dropping the reply senders fails every waiting request.
    inner.pending.lock().await.clear();
    inner.subscribed.lock().await.clear();

    let feeds: Vec<FeedTap> = inner
        .feeds
        .lock()
        .await
        .drain()
        .flat_map(|(_, taps)| taps)
        .collect();
    for tap in feeds {
        let _ = tap.tx.try_send(FeedSignal::Status(FeedStatus::Closed));
    }

    let channels: Vec<_> = inner.channels.lock().await.drain().collect();
    for (_, tx) in channels {
        let _ = tx.send(ChannelEvent::Status(ChannelStatus::Closed));
    }

    log::info!("Disconnected from {}", inner.config.url);
    let _ = inner.event_tx.try_send(SyncEvent::Disconnected);
}

fn expect_done(reply: Reply) -> Result<(), ProtocolError> {
    match reply {
        Reply::Done => Ok(()),
        _ => Err(ProtocolError::UnexpectedReply),
    }
}

fn expect_count(reply: Reply) -> Result<usize, ProtocolError> {
    match reply {
        Reply::Count(n) => Ok(n as usize),
        _ => Err(ProtocolError::UnexpectedReply),
    }
}

// ───────────────────────────────────────────────────────────────────
// Tables
// ───────────────────────────────────────────────────────────────────

/// A server-hosted table.
#[derive(Clone)]
pub struct RemoteTable {
    client: SyncClient,
    table: String,
}

#[async_trait]
impl Persistence for RemoteTable {
    fn table(&self) -> &str {
        &self.table
    }

    async fn fetch_all(&self) -> Result<Vec<RawRow>, PersistenceError> {
        let table = self.table.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::Fetch { request_id, table })
            .await??;
        match reply {
            Reply::Rows(rows) => Ok(rows
                .iter()
                .map(|r| row_from_json(r))
                .collect::<Result<Vec<_>, _>>()?),
            _ => Err(ProtocolError::UnexpectedReply.into()),
        }
    }

    async fn insert(&self, row: RawRow) -> Result<RawRow, PersistenceError> {
        let table = self.table.clone();
        let row = to_json(&row)?;
        let reply = self
            .client
            .request(|request_id| ClientFrame::Insert {
                request_id,
                table,
                row,
            })
            .await??;
        match reply {
            Reply::Row(row) => Ok(row_from_json(&row)?),
            _ => Err(ProtocolError::UnexpectedReply.into()),
        }
    }

    async fn insert_many(&self, rows: Vec<RawRow>) -> Result<usize, PersistenceError> {
        let table = self.table.clone();
        let rows = rows.iter().map(to_json).collect::<Result<Vec<_>, _>>()?;
        let reply = self
            .client
            .request(|request_id| ClientFrame::InsertMany {
                request_id,
                table,
                rows,
            })
            .await??;
        Ok(expect_count(reply)?)
    }

    async fn update(&self, id: &RecordId, patch: RawRow) -> Result<(), PersistenceError> {
        let table = self.table.clone();
        let patch = to_json(&patch)?;
        let reply = self
            .client
            .request(|request_id| ClientFrame::Update {
                request_id,
                table,
                id: id.clone(),
                patch,
            })
            .await??;
        Ok(expect_done(reply)?)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), PersistenceError> {
        let table = self.table.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::Delete {
                request_id,
                table,
                id: id.clone(),
            })
            .await??;
        Ok(expect_done(reply)?)
    }

    async fn delete_many(&self, ids: &[RecordId]) -> Result<usize, PersistenceError> {
        let table = self.table.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::DeleteMany {
                request_id,
                table,
                ids: ids.to_vec(),
            })
            .await??;
        Ok(expect_count(reply)?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Change feeds
// ───────────────────────────────────────────────────────────────────

#[async_trait]
impl ChangeFeedSource for SyncClient {
    async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError> {
        if *self.inner.state.read().await != ConnectionState::Connected {
            return Err(FeedError::Transport("not connected".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.inner.config.event_buffer);
        let tap_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut feeds = self.inner.feeds.lock().await;
            let taps = feeds.entry(table.to_string()).or_default();
            taps.push(FeedTap {
                id: tap_id,
                tx: tx.clone(),
            });
            taps.len() == 1
        };

        if first {
            let sent = self
                .send(ClientFrame::Subscribe {
                    table: table.to_string(),
                })
                .await;
            if let Err(e) = sent {
                self.unsubscribe(table, tap_id).await;
                return Err(FeedError::Transport(e.to_string()));
            }
        } else if self.inner.subscribed.lock().await.get(table).copied().unwrap_or(false) {
            // Joining a live server subscription: no status will come for us.
            let _ = tx.try_send(FeedSignal::Status(FeedStatus::Subscribed));
        }

        let client = self.clone();
        let name = table.to_string();
        Ok(FeedSubscription::new(table, rx).on_unsubscribe(move || {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { client.unsubscribe(&name, tap_id).await });
            }
        }))
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence channels
// ───────────────────────────────────────────────────────────────────

/// Membership of a server-side channel. One per channel name per client.
pub struct RemoteChannel {
    client: SyncClient,
    name: String,
    client_key: ClientKey,
    left: AtomicBool,
}

#[async_trait]
impl PresenceChannel for RemoteChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_key(&self) -> &ClientKey {
        &self.client_key
    }

    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        let channel = self.name.clone();
        let event = event.to_string();
        let payload = to_json(&payload)?;
        let reply = self
            .client
            .request(|request_id| ClientFrame::Broadcast {
                request_id,
                channel,
                event,
                payload,
            })
            .await??;
        Ok(expect_done(reply)?)
    }

    async fn track(&self, entry: PresenceEntry) -> Result<(), ChannelError> {
        let channel = self.name.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::Track {
                request_id,
                channel,
                entry,
            })
            .await??;
        Ok(expect_done(reply)?)
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        let channel = self.name.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::Untrack {
                request_id,
                channel,
            })
            .await??;
        Ok(expect_done(reply)?)
    }

    async fn presence_state(&self) -> Result<Vec<PresenceEntry>, ChannelError> {
        let channel = self.name.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::PresenceState {
                request_id,
                channel,
            })
            .await??;
        match reply {
            Reply::Presence(entries) => Ok(entries),
            _ => Err(ProtocolError::UnexpectedReply.into()),
        }
    }

    async fn leave(&self) -> Result<(), ChannelError> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.inner.channels.lock().await.remove(&self.name);
        let channel = self.name.clone();
        let reply = self
            .client
            .request(|request_id| ClientFrame::LeaveChannel {
                request_id,
                channel,
            })
            .await??;
        Ok(expect_done(reply)?)
    }
}

#[async_trait]
impl ChannelHub for SyncClient {
    async fn join(
        &self,
        channel: &str,
        client_key: &ClientKey,
    ) -> Result<(Arc<dyn PresenceChannel>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        // Registered first so the server's Subscribed status has somewhere to go.
        let rx = register_channel(&self.inner, channel, self.inner.config.event_buffer).await;

        let name = channel.to_string();
        let key = client_key.clone();
        let result = self
            .request(|request_id| ClientFrame::JoinChannel {
                request_id,
                channel: name,
                client_key: key,
            })
            .await;
        let joined = match result {
            Ok(Ok(reply)) => expect_done(reply).map_err(ChannelError::from),
            Ok(Err(wire)) => Err(wire.into()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = joined {
            self.inner.channels.lock().await.remove(channel);
            return Err(e);
        }

        let handle = RemoteChannel {
            client: self.clone(),
            name: channel.to_string(),
            client_key: client_key.clone(),
            left: AtomicBool::new(false),
        };
        Ok((Arc::new(handle), rx))
    }
}
