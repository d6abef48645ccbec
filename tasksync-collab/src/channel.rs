//! Join-and-broadcast channels with presence.
//!
//! A channel is a named room. Members can broadcast named events to the
//! other members and publish one presence entry each ("I am online").
//!
//! ```text
//!  ChannelHub::join(name, key) ──► (PresenceChannel, Receiver<ChannelEvent>)
//!
//!  ChannelEvent:
//!    Status(Subscribed | Closed | Error)
//!    Broadcast { event, payload }          never echoed to the sender
//!    PresenceSync(entries)                 full membership snapshot
//!    PresenceJoin(entries) / PresenceLeave(entries)
//! ```
//!
//! [`LocalHub`](crate::broadcast::LocalHub) implements this in-process;
//! [`SyncClient`](crate::client::SyncClient) implements it over a socket.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-mount presence key. Two tabs of the same user are two keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `client-<random>-<millis>`, fresh on every call.
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!(
            "client-{}-{}",
            &random[..9],
            chrono::Utc::now().timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// One member's published presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_key: ClientKey,
    pub email: Option<String>,
    pub name: Option<String>,
    pub user_id: Option<String>,
}

impl PresenceEntry {
    pub fn new(client_key: ClientKey) -> Self {
        Self {
            client_key,
            email: None,
            name: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Broadcast { event: String, payload: Value },
    PresenceSync(Vec<PresenceEntry>),
    PresenceJoin(Vec<PresenceEntry>),
    PresenceLeave(Vec<PresenceEntry>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("channel '{0}' is full")]
    Full(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// A joined channel, as seen by one member.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    fn name(&self) -> &str;

    fn client_key(&self) -> &ClientKey;

    /// Send `payload` under `event` to every other member.
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Publish (or replace) our presence entry.
    async fn track(&self, entry: PresenceEntry) -> Result<(), ChannelError>;

    /// Withdraw our presence entry.
    async fn untrack(&self) -> Result<(), ChannelError>;

    /// Current membership snapshot.
    async fn presence_state(&self) -> Result<Vec<PresenceEntry>, ChannelError>;

    /// Leave the channel. Our presence entry is dropped.
    async fn leave(&self) -> Result<(), ChannelError>;
}

/// Something channels can be joined on.
#[async_trait]
pub trait ChannelHub: Send + Sync {
    async fn join(
        &self,
        channel: &str,
        client_key: &ClientKey,
    ) -> Result<(Arc<dyn PresenceChannel>, mpsc::Receiver<ChannelEvent>), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_unique() {
        let a = ClientKey::generate();
        let b = ClientKey::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client-"));
        assert_eq!(a.as_str().split('-').count(), 3);
    }

    #[test]
    fn test_channel_error_display() {
        assert_eq!(ChannelError::Closed.to_string(), "channel is closed");
    }
}
