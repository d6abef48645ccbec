//! # tasksync-collab: Realtime layer for the task table
//!
//! Keeps every open dashboard's view of the shared `tasks` table current:
//! row changes arrive over a change feed, local edits are applied
//! optimistically and reconciled with the backend, and a presence channel
//! shows who is online and which row each user is editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ChangeFeed    ┌──────────────┐   Persistence   ┌──────────────┐
//! │  LiveTable   │ ◄────────────── │  SyncClient  │ ◄─────────────► │  SyncServer  │
//! │ (Reconciler) │ ──────────────► │ (RemoteTable)│    WebSocket    │ (MemoryBack- │
//! └──────────────┘   mutations     └──────┬───────┘   bincode       │  end, RocksDB│
//!                                         │                         └──────┬───────┘
//! ┌──────────────┐   ChannelHub           │                                │
//! │ PresenceSes- │ ◄──────────────────────┘                         ┌──────┴───────┐
//! │ sion(Tracker)│                                                  │  LocalHub    │
//! └──────────────┘                                                  │ (fan-out)    │
//!                                                                   └──────────────┘
//! ```
//!
//! In a single process the same pieces run without a socket: `MemoryBackend`
//! is both a `Persistence` source and a `ChangeFeedSource`, and `LocalHub`
//! is a `ChannelHub`.
//!
//! ## Modules
//!
//! - [`feed`]: change feed client: connectivity tracking, normalization, resync signals
//! - [`reconciler`]: optimistic record set with rollback and batched writes
//! - [`presence`]: who is online and who is editing which row
//! - [`live`]: reconciler and feed wired together
//! - [`channel`] / [`broadcast`]: channel contract and the in-process hub
//! - [`persistence`] / [`memory`]: table contract, access guard, in-memory tables
//! - [`protocol`] / [`server`] / [`client`]: the WebSocket surface
//! - [`storage`]: RocksDB row store

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod feed;
pub mod live;
pub mod memory;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, LocalHub, RoomManager, RoomMessage};
pub use channel::{
    ChannelError, ChannelEvent, ChannelHub, ChannelStatus, ClientKey, PresenceChannel,
    PresenceEntry,
};
pub use client::{ClientConfig, ConnectionState, RemoteChannel, RemoteTable, SyncClient, SyncEvent};
pub use feed::{
    ChangeFeed, ChangeFeedSource, Connectivity, ConnectivityTracker, FeedConfig, FeedError,
    FeedOutput, FeedSignal, FeedStatus, FeedSubscription, ResyncReason,
};
pub use live::{LiveTable, LiveTableConfig};
pub use memory::{MemoryBackend, MemoryTable, DEFAULT_CHANGE_CAPACITY};
pub use persistence::{
    AccessResolver, AllowAllResolver, GuardedPersistence, Persistence, PersistenceError,
    TableActions, UserDirectory,
};
pub use presence::{
    EditingClaim, EditingUser, PresenceConfig, PresenceSession, PresenceTracker, PresenceView,
    EDITING_EVENT, PRESENCE_CHANNEL,
};
pub use protocol::{ClientFrame, ProtocolError, Reply, ServerFrame, WireError};
pub use reconciler::{ReconcileError, Reconciler, ReconcilerConfig, RecordSet, RecordState};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use storage::{RowStore, StoreConfig, StoreError, StoredRow, TableMetadata};
