//! Room fan-out for channels, and the in-process [`LocalHub`].
//!
//! Uses tokio broadcast channels for O(1) send to all members.
//! Each member gets an independent receiver that buffers up to `capacity`
//! messages; a member that falls further behind loses the oldest ones and
//! is told how many it missed.
//!
//! ```text
//!  LocalChannel (A) ──publish──► BroadcastGroup ──┬──► forward task (A) ─► events A  (own broadcasts skipped)
//!                                 members, presence├──► forward task (B) ─► events B
//!                                                  └──► forward task (C) ─► events C
//! ```
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{
    ChannelError, ChannelEvent, ChannelHub, ChannelStatus, ClientKey, PresenceChannel,
    PresenceEntry,
};

/// What travels through a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomMessage {
    Broadcast {
        from: ClientKey,
        event: String,
        payload: Value,
    },
    Joined(PresenceEntry),
    Left(PresenceEntry),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
    pub tracked_members: usize,
}

/// Lock-free counters for the publish path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single channel.
///
/// Members are keyed by [`ClientKey`]. A member may or may not have
/// published a presence entry; only tracked members appear in
/// [`presence`](Self::presence).
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomMessage>>,
    /// Joined members and their tracked presence, if any
    members: Arc<RwLock<HashMap<ClientKey, Option<PresenceEntry>>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many messages a member may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a member. Returns its receiver.
    pub async fn add_member(&self, key: ClientKey) -> broadcast::Receiver<Arc<RoomMessage>> {
        let mut members = self.members.write().await;
        members.entry(key).or_insert(None);
        self.sender.subscribe()
    }

    /// Remove a member. Returns its tracked entry, if it had one.
    pub async fn remove_member(&self, key: &ClientKey) -> Option<PresenceEntry> {
        let mut members = self.members.write().await;
        members.remove(key).flatten()
    }

    /// Record a member's presence entry. `false` if the key never joined.
    pub async fn track(&self, key: &ClientKey, entry: PresenceEntry) -> bool {
        let mut members = self.members.write().await;
        match members.get_mut(key) {
            Some(slot) => {
                *slot = Some(entry);
                true
            }
            None => false,
        }
    }

    /// Clear a member's presence entry, returning the old one.
    pub async fn untrack(&self, key: &ClientKey) -> Option<PresenceEntry> {
        let mut members = self.members.write().await;
        members.get_mut(key).and_then(Option::take)
    }

    /// Tracked entries, ordered by client key.
    pub async fn presence(&self) -> Vec<PresenceEntry> {
        let members = self.members.read().await;
        let mut entries: Vec<PresenceEntry> = members.values().flatten().cloned().collect();
        entries.sort_by(|a, b| a.client_key.cmp(&b.client_key));
        entries
    }

    /// Fan a message out to every member (the sender included; filtering
    /// is the receiver's job). Returns the number of receivers.
    pub fn publish(&self, message: RoomMessage) -> usize {
        let count = self.sender.send(Arc::new(message)).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging member lost.
    pub fn record_lag(&self, missed: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, key: &ClientKey) -> bool {
        self.members.read().await.contains_key(key)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
            tracked_members: members.values().filter(|e| e.is_some()).count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps channel names to broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the room for a channel.
    pub async fn get_or_create(&self, name: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(name.to_string(), room.clone());
        log::debug!("Created room '{name}'");
        room
    }

    pub async fn get(&self, name: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Drop a room once its last member has left.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            if room.member_count().await == 0 {
                rooms.remove(name);
                log::debug!("Room '{name}' removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// LocalHub
// ───────────────────────────────────────────────────────────────────

/// In-process [`ChannelHub`]. Also backs the channels the server hosts.
pub struct LocalHub {
    rooms: Arc<RoomManager>,
    /// Buffer of each member's event receiver
    event_buffer: usize,
    /// Members allowed per room (0 = unlimited)
    max_members: usize,
}

impl LocalHub {
    pub fn new(room_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(room_capacity)),
            event_buffer: 256,
            max_members: 0,
        }
    }

    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.max_members = max_members;
        self
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChannelHub for LocalHub {
    async fn join(
        &self,
        channel: &str,
        client_key: &ClientKey,
    ) -> Result<(Arc<dyn PresenceChannel>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let room = self.rooms.get_or_create(channel).await;
        if self.max_members > 0
            && !room.has_member(client_key).await
            && room.member_count().await >= self.max_members
        {
            log::warn!("Refusing {client_key} on '{channel}': room full");
            return Err(ChannelError::Full(channel.to_string()));
        }

        let rx = room.add_member(client_key.clone()).await;
        let (event_tx, event_rx) = mpsc::channel(self.event_buffer);
        let forward = tokio::spawn(forward_room(
            room.clone(),
            rx,
            client_key.clone(),
            event_tx,
        ));

        log::debug!("{client_key} joined '{channel}'");

        let handle = LocalChannel {
            name: channel.to_string(),
            key: client_key.clone(),
            room,
            rooms: self.rooms.clone(),
            forward: Mutex::new(Some(forward)),
            left: AtomicBool::new(false),
        };
        Ok((Arc::new(handle), event_rx))
    }
}

/// Turn room traffic into one member's [`ChannelEvent`]s.
async fn forward_room(
    room: Arc<BroadcastGroup>,
    mut rx: broadcast::Receiver<Arc<RoomMessage>>,
    me: ClientKey,
    events: mpsc::Sender<ChannelEvent>,
) {
    if events
        .send(ChannelEvent::Status(ChannelStatus::Subscribed))
        .await
        .is_err()
    {
        return;
    }

    loop {
        let message = match rx.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("{me} lagged by {n} channel messages");
                room.record_lag(n);
                // Claims are lost for good; membership can be resent.
                let snapshot = room.presence().await;
                if events.send(ChannelEvent::PresenceSync(snapshot)).await.is_err() {
                    break;
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let outgoing: Vec<ChannelEvent> = match message.as_ref() {
            RoomMessage::Broadcast { from, .. } if *from == me => continue,
            RoomMessage::Broadcast { event, payload, .. } => vec![ChannelEvent::Broadcast {
                event: event.clone(),
                payload: payload.clone(),
            }],
            RoomMessage::Joined(entry) => vec![
                ChannelEvent::PresenceJoin(vec![entry.clone()]),
                ChannelEvent::PresenceSync(room.presence().await),
            ],
            RoomMessage::Left(entry) => vec![
                ChannelEvent::PresenceLeave(vec![entry.clone()]),
                ChannelEvent::PresenceSync(room.presence().await),
            ],
        };

        for event in outgoing {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// A member's handle on a [`LocalHub`] room.
struct LocalChannel {
    name: String,
    key: ClientKey,
    room: Arc<BroadcastGroup>,
    rooms: Arc<RoomManager>,
    forward: Mutex<Option<JoinHandle<()>>>,
    left: AtomicBool,
}

impl LocalChannel {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.left.load(Ordering::Acquire) {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresenceChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_key(&self) -> &ClientKey {
        &self.key
    }

    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.room.publish(RoomMessage::Broadcast {
            from: self.key.clone(),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    async fn track(&self, mut entry: PresenceEntry) -> Result<(), ChannelError> {
        self.ensure_open()?;
        entry.client_key = self.key.clone();
        if !self.room.track(&self.key, entry.clone()).await {
            return Err(ChannelError::Closed);
        }
        self.room.publish(RoomMessage::Joined(entry));
        Ok(())
    }

    async fn untrack(&self) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if let Some(entry) = self.room.untrack(&self.key).await {
            self.room.publish(RoomMessage::Left(entry));
        }
        Ok(())
    }

    async fn presence_state(&self) -> Result<Vec<PresenceEntry>, ChannelError> {
        self.ensure_open()?;
        Ok(self.room.presence().await)
    }

    async fn leave(&self) -> Result<(), ChannelError> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(entry) = self.room.remove_member(&self.key).await {
            self.room.publish(RoomMessage::Left(entry));
        }
        if let Some(forward) = self.forward.lock().await.take() {
            forward.abort();
        }
        self.rooms.remove_if_empty(&self.name).await;
        log::debug!("{} left '{}'", self.key, self.name);
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        // Best effort for handles dropped without `leave()`.
        if let Ok(mut forward) = self.forward.try_lock() {
            if let Some(task) = forward.take() {
                task.abort();
            }
        }
    }
}
