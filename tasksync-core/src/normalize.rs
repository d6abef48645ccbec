//! Coercion of heterogeneous backend rows into canonical field types.
//!
//! Rows reach the client from two kinds of backend (a relational store
//! that emits text timestamps and JSON columns, and a document store that
//! emits `{seconds, nanoseconds}` timestamp objects), from CSV imports that
//! stringify everything, and from hand-written test fixtures. The helpers
//! below accept all of those shapes and never panic.
//!
//! Only a missing or unusable `id` is fatal for a row; every other field
//! degrades to "absent" with a `log::warn!`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::record::{RawRow, RecordId};

/// Epoch values at or above this are milliseconds, below are seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Errors raised while turning a raw payload into a typed row or event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("row has no usable id")]
    MissingId,

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("{kind} event carries no row")]
    MissingRow { kind: &'static str },

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Name of a JSON value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Borrow a value as a row object.
pub fn as_row(value: &Value) -> Result<&RawRow, NormalizeError> {
    value
        .as_object()
        .ok_or_else(|| NormalizeError::NotAnObject(type_name(value)))
}

/// Read the `id` column. Accepts non-empty strings and numbers.
pub fn id_field(row: &RawRow) -> Result<RecordId, NormalizeError> {
    match row.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(RecordId::new(s.trim())),
        Some(Value::Number(n)) => Ok(RecordId::new(n.to_string())),
        _ => Err(NormalizeError::MissingId),
    }
}

/// Coerce a scalar to text. `null` and missing are `None`.
pub fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Like [`text`], but blank strings are treated as absent.
pub fn non_blank(value: Option<&Value>) -> Option<String> {
    text(value).filter(|s| !s.trim().is_empty())
}

/// Parse a timestamp from any of the shapes the backends emit.
pub fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Null => None,
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        Value::Object(map) => {
            let secs = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::from_timestamp(secs, nanos.min(999_999_999) as u32)
        }
        other => {
            log::warn!("Ignoring {} timestamp value", type_name(other));
            None
        }
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    }
}

/// Parse a textual timestamp: RFC 3339, Postgres text output, naive
/// datetimes (taken as UTC) or a bare date (midnight UTC).
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // "2024-05-01 10:00:00.123+00", "2024-05-01 10:00:00+03:00"
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    log::warn!("Unparseable timestamp {raw:?}");
    None
}

/// Parse a calendar date. Datetimes are truncated to their UTC date.
pub fn date(value: Option<&Value>) -> Option<NaiveDate> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp_str(s).map(|dt| dt.date_naive()))
        }
        other => timestamp(Some(other)).map(|dt| dt.date_naive()),
    }
}

/// Flatten a free-form JSON column into a string map.
///
/// Accepts an object, or a string holding a JSON object (some drivers
/// return `jsonb` columns as text). Values are stringified; nulls dropped.
pub fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    match value {
        Some(Value::Object(map)) => {
            for (k, v) in map {
                if let Some(s) = text(Some(v)) {
                    out.insert(k.clone(), s);
                }
            }
        }
        Some(Value::String(s)) if !s.trim().is_empty() => {
            match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => return string_map(Some(&parsed)),
                _ => log::warn!("Ignoring non-object JSON column text"),
            }
        }
        _ => {}
    }
    out
}

/// Read a list of strings from an array or a JSON-encoded array string.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Array(_)) => string_list(Some(&parsed)),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Trim and lower-case email addresses, dropping blanks and duplicates.
pub fn normalize_emails<I, S>(emails: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for email in emails {
        let e = email.as_ref().trim().to_lowercase();
        if !e.is_empty() && !out.contains(&e) {
            out.push(e);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    fn row(v: Value) -> RawRow {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_id_accepts_string_and_number() {
        assert_eq!(id_field(&row(json!({"id": "t1"}))).unwrap().as_str(), "t1");
        assert_eq!(id_field(&row(json!({"id": 42}))).unwrap().as_str(), "42");
    }

    #[test]
    fn test_id_missing_or_blank() {
        assert_eq!(id_field(&row(json!({}))), Err(NormalizeError::MissingId));
        assert_eq!(id_field(&row(json!({"id": "  "}))), Err(NormalizeError::MissingId));
        assert_eq!(id_field(&row(json!({"id": null}))), Err(NormalizeError::MissingId));
    }

    #[test]
    fn test_text_coercion() {
        assert_eq!(text(Some(&json!("a"))), Some("a".into()));
        assert_eq!(text(Some(&json!(3))), Some("3".into()));
        assert_eq!(text(Some(&json!(true))), Some("true".into()));
        assert_eq!(text(Some(&json!(null))), None);
        assert_eq!(text(None), None);
        assert_eq!(non_blank(Some(&json!("   "))), None);
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = timestamp(Some(&json!("2024-05-01T10:00:00+03:00"))).unwrap();
        assert_eq!(ts.hour(), 7);
    }

    #[test]
    fn test_timestamp_postgres_text() {
        let ts = timestamp(Some(&json!("2024-05-01 10:00:00.5+00"))).unwrap();
        assert_eq!(ts.hour(), 10);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_timestamp_naive_is_utc() {
        let ts = timestamp(Some(&json!("2024-05-01T10:00:00"))).unwrap();
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn test_timestamp_epoch_seconds_and_millis() {
        let secs = timestamp(Some(&json!(1_700_000_000))).unwrap();
        let millis = timestamp(Some(&json!(1_700_000_000_000i64))).unwrap();
        assert_eq!(secs, millis);
    }

    #[test]
    fn test_timestamp_document_store_object() {
        let a = timestamp(Some(&json!({"seconds": 1_700_000_000, "nanoseconds": 0}))).unwrap();
        let b = timestamp(Some(&json!({"_seconds": 1_700_000_000, "_nanoseconds": 0}))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_timestamp_garbage_is_none() {
        assert!(timestamp(Some(&json!("yesterday-ish"))).is_none());
        assert!(timestamp(Some(&json!([1, 2]))).is_none());
        assert!(timestamp(Some(&json!(""))).is_none());
    }

    #[test]
    fn test_date_from_datetime() {
        let d = date(Some(&json!("2024-12-31T23:00:00Z"))).unwrap();
        assert_eq!((d.year(), d.month(), d.day()), (2024, 12, 31));
        let d = date(Some(&json!("2025-01-02"))).unwrap();
        assert_eq!(d.day(), 2);
    }

    #[test]
    fn test_string_map_object_and_text() {
        let m = string_map(Some(&json!({"a": "x", "b": 2, "c": null})));
        assert_eq!(m.get("a").map(String::as_str), Some("x"));
        assert_eq!(m.get("b").map(String::as_str), Some("2"));
        assert!(!m.contains_key("c"));

        let m = string_map(Some(&json!("{\"k\": \"v\"}")));
        assert_eq!(m.get("k").map(String::as_str), Some("v"));

        assert!(string_map(Some(&json!("[1,2]"))).is_empty());
    }

    #[test]
    fn test_string_list_and_emails() {
        let list = string_list(Some(&json!(["A@x.io", " b@x.io ", 3])));
        assert_eq!(list.len(), 2);
        let emails = normalize_emails(list);
        assert_eq!(emails, vec!["a@x.io".to_string(), "b@x.io".to_string()]);

        let list = string_list(Some(&json!("[\"c@x.io\"]")));
        assert_eq!(list, vec!["c@x.io".to_string()]);
    }
}
