//! Binary wire protocol between [`SyncClient`](crate::client::SyncClient)
//! and [`SyncServer`](crate::server::SyncServer).
//!
//! Every WebSocket binary message is one bincode-encoded frame:
//! ```text
//! client ──► server   ClientFrame  Hello | Subscribe | Fetch/Insert/.. {request_id}
//!                                  JoinChannel/Track/Broadcast/.. {request_id} | Ping
//! server ──► client   ServerFrame  FeedStatus | Change | Reply {request_id, result}
//!                                  Channel {channel, event} | Pong
//! ```
//!
//! Rows are free-form JSON and bincode cannot carry `serde_json::Value`,
//! so rows, changes and broadcast payloads travel as JSON text inside the
//! binary envelope.
//!
//! Reference: Kleppmann, Chapter 4 — Encoding and Evolution

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tasksync_core::{Identity, Permission, RawChange, RawRow, RecordId};

use crate::channel::{ChannelError, ChannelEvent, ChannelStatus, ClientKey, PresenceEntry};
use crate::feed::FeedStatus;
use crate::persistence::PersistenceError;

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Who is on the other end. Requests before this run as anonymous.
    Hello { identity: Identity },

    Subscribe { table: String },
    Unsubscribe { table: String },

    Fetch { request_id: u64, table: String },
    Insert { request_id: u64, table: String, row: String },
    InsertMany { request_id: u64, table: String, rows: Vec<String> },
    Update { request_id: u64, table: String, id: RecordId, patch: String },
    Delete { request_id: u64, table: String, id: RecordId },
    DeleteMany { request_id: u64, table: String, ids: Vec<RecordId> },

    JoinChannel { request_id: u64, channel: String, client_key: ClientKey },
    LeaveChannel { request_id: u64, channel: String },
    Broadcast { request_id: u64, channel: String, event: String, payload: String },
    Track { request_id: u64, channel: String, entry: PresenceEntry },
    Untrack { request_id: u64, channel: String },
    PresenceState { request_id: u64, channel: String },

    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    FeedStatus { table: String, status: FeedStatus },
    /// JSON-encoded [`RawChange`]
    Change { table: String, change: String },
    Reply { request_id: u64, result: Result<Reply, WireError> },
    Channel { channel: String, event: WireChannelEvent },
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Rows(Vec<String>),
    Row(String),
    Count(u64),
    Presence(Vec<PresenceEntry>),
    Done,
}

/// [`ChannelEvent`] with its payload as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireChannelEvent {
    Status(ChannelStatus),
    Broadcast { event: String, payload: String },
    PresenceSync(Vec<PresenceEntry>),
    PresenceJoin(Vec<PresenceEntry>),
    PresenceLeave(Vec<PresenceEntry>),
}

impl WireChannelEvent {
    pub fn from_event(event: &ChannelEvent) -> Result<Self, ProtocolError> {
        Ok(match event {
            ChannelEvent::Status(s) => Self::Status(s.clone()),
            ChannelEvent::Broadcast { event, payload } => Self::Broadcast {
                event: event.clone(),
                payload: to_json(payload)?,
            },
            ChannelEvent::PresenceSync(e) => Self::PresenceSync(e.clone()),
            ChannelEvent::PresenceJoin(e) => Self::PresenceJoin(e.clone()),
            ChannelEvent::PresenceLeave(e) => Self::PresenceLeave(e.clone()),
        })
    }

    pub fn into_event(self) -> Result<ChannelEvent, ProtocolError> {
        Ok(match self {
            Self::Status(s) => ChannelEvent::Status(s),
            Self::Broadcast { event, payload } => ChannelEvent::Broadcast {
                event,
                payload: from_json(&payload)?,
            },
            Self::PresenceSync(e) => ChannelEvent::PresenceSync(e),
            Self::PresenceJoin(e) => ChannelEvent::PresenceJoin(e),
            Self::PresenceLeave(e) => ChannelEvent::PresenceLeave(e),
        })
    }
}

/// Failure carried back in a [`Reply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum WireError {
    #[error("not permitted: {0}")]
    Forbidden(Permission),

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("channel is full: {0}")]
    ChannelFull(String),
}

impl From<PersistenceError> for WireError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::Forbidden(p) => Self::Forbidden(p),
            PersistenceError::NotFound(id) => Self::NotFound(id),
            PersistenceError::UnknownTable(t) => Self::UnknownTable(t),
            PersistenceError::Rejected(m) => Self::Rejected(m),
            PersistenceError::Storage(m) => Self::Storage(m),
            PersistenceError::Transport(m) => Self::Rejected(m),
            PersistenceError::Normalize(e) => Self::Malformed(e.to_string()),
        }
    }
}

impl From<WireError> for PersistenceError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Forbidden(p) => Self::Forbidden(p),
            WireError::NotFound(id) => Self::NotFound(id),
            WireError::UnknownTable(t) => Self::UnknownTable(t),
            WireError::Storage(m) => Self::Storage(m),
            WireError::Rejected(m) | WireError::Malformed(m) => Self::Rejected(m),
            WireError::Channel(m) | WireError::ChannelFull(m) => Self::Transport(m),
        }
    }
}

impl From<ChannelError> for WireError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Full(name) => Self::ChannelFull(name),
            other => Self::Channel(other.to_string()),
        }
    }
}

impl From<WireError> for ChannelError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ChannelFull(name) => Self::Full(name),
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected reply")]
    UnexpectedReply,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out")]
    Timeout,
}

impl From<ProtocolError> for WireError {
    fn from(e: ProtocolError) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<ProtocolError> for PersistenceError {
    fn from(e: ProtocolError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// The request id, for frames that expect a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Fetch { request_id, .. }
            | Self::Insert { request_id, .. }
            | Self::InsertMany { request_id, .. }
            | Self::Update { request_id, .. }
            | Self::Delete { request_id, .. }
            | Self::DeleteMany { request_id, .. }
            | Self::JoinChannel { request_id, .. }
            | Self::LeaveChannel { request_id, .. }
            | Self::Broadcast { request_id, .. }
            | Self::Track { request_id, .. }
            | Self::Untrack { request_id, .. }
            | Self::PresenceState { request_id, .. } => Some(*request_id),
            Self::Hello { .. } | Self::Subscribe { .. } | Self::Unsubscribe { .. } | Self::Ping => {
                None
            }
        }
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn change(table: &str, change: &RawChange) -> Result<Self, ProtocolError> {
        Ok(Self::Change {
            table: table.to_string(),
            change: to_json(change)?,
        })
    }

    pub fn reply(request_id: u64, result: Result<Reply, WireError>) -> Self {
        Self::Reply { request_id, result }
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Decode a JSON row; anything but an object is an error.
pub fn row_from_json(text: &str) -> Result<RawRow, ProtocolError> {
    match from_json::<Value>(text)? {
        Value::Object(row) => Ok(row),
        other => Err(ProtocolError::Deserialization(format!(
            "expected a row object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_roundtrip() {
        let frame = ClientFrame::Update {
            request_id: 7,
            table: "tasks".into(),
            id: RecordId::from("t1"),
            patch: to_json(&json!({"status": "Done"})).unwrap(),
        };
        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.request_id(), Some(7));
    }

    #[test]
    fn test_hello_carries_identity() {
        let frame = ClientFrame::Hello {
            identity: Identity::new("u1", Some("a@example.com"), Some("Ada")),
        };
        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.request_id(), None);
    }

    #[test]
    fn test_change_frame_keeps_row_json() {
        let row = json!({"id": "t1", "extra_data": {"Sprint": 4}, "due_date": null});
        let change = RawChange::insert(row.as_object().cloned().unwrap());
        let frame = ServerFrame::change("tasks", &change).unwrap();

        match ServerFrame::decode(&frame.encode().unwrap()).unwrap() {
            ServerFrame::Change { table, change: text } => {
                assert_eq!(table, "tasks");
                let parsed: RawChange = from_json(&text).unwrap();
                assert_eq!(parsed, change);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_reply_roundtrip() {
        let frame = ServerFrame::reply(
            3,
            Err(WireError::Forbidden(Permission::LiveTableBulkDelete)),
        );
        let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_channel_event_payload_survives() {
        let event = ChannelEvent::Broadcast {
            event: "editing".into(),
            payload: json!({"clientId": "c1", "rowId": "t1"}),
        };
        let wire = WireChannelEvent::from_event(&event).unwrap();
        let frame = ServerFrame::Channel {
            channel: "tasks-presence".into(),
            event: wire,
        };
        match ServerFrame::decode(&frame.encode().unwrap()).unwrap() {
            ServerFrame::Channel { event: wire, .. } => {
                assert_eq!(wire.into_event().unwrap(), event);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_persistence_error_mapping() {
        let wire: WireError = PersistenceError::NotFound(RecordId::from("t1")).into();
        assert_eq!(wire, WireError::NotFound(RecordId::from("t1")));
        let back: PersistenceError = wire.into();
        assert_eq!(back, PersistenceError::NotFound(RecordId::from("t1")));
    }

    #[test]
    fn test_row_from_json_rejects_non_objects() {
        assert!(row_from_json("[1,2]").is_err());
        assert!(row_from_json("{\"id\":\"t1\"}").is_ok());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerFrame::decode(&garbage).is_err());
    }
}
