//! Row-level change events.
//!
//! A feed delivers [`RawChange`]s: a kind tag plus the new and/or old row
//! image as loose JSON. [`ChangeEvent::from_raw`] turns one into a typed
//! event, or a [`NormalizeError`] when the payload is unusable.
//!
//! Events for one id arrive in commit order. Nothing is promised across ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalize::{self, NormalizeError};
use crate::record::{RawRow, RecordId, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Accepts the upper- or lower-case tags backends use.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Change payload as produced by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn insert(row: RawRow) -> Self {
        Self {
            kind: ChangeKind::Insert,
            new: Some(Value::Object(row)),
            old: None,
        }
    }

    pub fn update(row: RawRow) -> Self {
        Self {
            kind: ChangeKind::Update,
            new: Some(Value::Object(row)),
            old: None,
        }
    }

    pub fn delete(old: RawRow) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new: None,
            old: Some(Value::Object(old)),
        }
    }

    /// A delete carrying only the id column.
    pub fn delete_id(id: &RecordId) -> Self {
        let mut old = RawRow::new();
        old.insert("id".into(), Value::String(id.to_string()));
        Self::delete(old)
    }
}

/// A normalized change to one row.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<R> {
    Insert(R),
    Update(R),
    Delete(RecordId),
}

impl<R: Row> ChangeEvent<R> {
    pub fn from_raw(raw: &RawChange) -> Result<Self, NormalizeError> {
        match raw.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let value = raw
                    .new
                    .as_ref()
                    .filter(|v| !v.is_null())
                    .ok_or(NormalizeError::MissingRow {
                        kind: raw.kind.as_str(),
                    })?;
                let row = R::from_raw(normalize::as_row(value)?)?;
                Ok(if raw.kind == ChangeKind::Insert {
                    Self::Insert(row)
                } else {
                    Self::Update(row)
                })
            }
            ChangeKind::Delete => {
                // Without replica identity the old image may be missing; some
                // backends put the deleted row in `new` instead.
                let value = raw
                    .old
                    .as_ref()
                    .filter(|v| v.as_object().is_some_and(|o| o.contains_key("id")))
                    .or(raw.new.as_ref().filter(|v| !v.is_null()))
                    .ok_or(NormalizeError::MissingRow { kind: "DELETE" })?;
                Ok(Self::Delete(normalize::id_field(normalize::as_row(value)?)?))
            }
        }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            Self::Insert(r) | Self::Update(r) => r.id(),
            Self::Delete(id) => id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }
}
