//! Task records and the row contract shared by every realtime table.
//!
//! A table row lives in two shapes:
//!
//! ```text
//!  backend / wire                      in memory
//! ┌──────────────────┐  Row::from_raw ┌──────────────┐
//! │ RawRow (JSON map)│ ─────────────► │ Record       │
//! │ nullable, loose  │                │ typed fields │
//! └──────────────────┘ ◄───────────── └──────────────┘
//!                       patch_to_raw / draft_to_raw
//! ```
//!
//! Only the fields the realtime logic inspects are typed. Imported columns
//! ride along opaquely in `extra_data`.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::normalize::{self, NormalizeError};
use crate::project::Project;

/// Status given to inserts that do not name one.
pub const DEFAULT_STATUS: &str = "Todo";

/// Author stamped on writes made without a signed-in email.
pub const ANONYMOUS_AUTHOR: &str = "anon";

/// A backend row as loosely-typed JSON.
pub type RawRow = Map<String, Value>;

/// Server-assigned row identity. Opaque, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Contract for a row type that can be reconciled against a change feed.
///
/// `from_raw` must be total over well-formed backend rows: only a missing
/// id may fail. `apply_patch` merges a partial diff; fields absent from
/// the patch keep their current value.
pub trait Row: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Partial diff applied optimistically and sent as an update.
    type Patch: Clone + fmt::Debug + Send + Sync + 'static;
    /// Field set for an insert (the server assigns the id).
    type Draft: Clone + fmt::Debug + Send + Sync + 'static;

    fn id(&self) -> &RecordId;

    fn from_raw(row: &RawRow) -> Result<Self, NormalizeError>;

    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Encode a patch for the persistence API. `author` is the acting
    /// user's email (or [`ANONYMOUS_AUTHOR`]).
    fn patch_to_raw(patch: &Self::Patch, author: &str) -> RawRow;

    fn draft_to_raw(draft: &Self::Draft, author: &str) -> RawRow;
}

// ───────────────────────────────────────────────────────────────────
// Priority
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Case-insensitive parse. Unknown labels are `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Record
// ───────────────────────────────────────────────────────────────────

/// One task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub content: String,
    pub status: String,
    pub assignee: Option<String>,
    pub priority: Option<Priority>,
    pub due_date: Option<NaiveDate>,
    pub project_id: Option<String>,
    /// Imported columns with no typed counterpart.
    pub extra_data: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_updated_by: Option<String>,
}

impl Record {
    /// A bare record with the default status. Handy for fixtures.
    pub fn new(id: impl Into<RecordId>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            status: DEFAULT_STATUS.to_string(),
            assignee: None,
            priority: None,
            due_date: None,
            project_id: None,
            extra_data: BTreeMap::new(),
            updated_at: None,
            last_updated_by: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Encode as a full backend row.
    pub fn to_raw(&self) -> RawRow {
        let mut row = Map::new();
        row.insert("id".into(), Value::String(self.id.to_string()));
        row.insert("content".into(), Value::String(self.content.clone()));
        row.insert("status".into(), Value::String(self.status.clone()));
        row.insert("assignee".into(), opt_string(self.assignee.as_deref()));
        row.insert(
            "priority".into(),
            opt_string(self.priority.as_ref().map(Priority::as_str)),
        );
        row.insert("due_date".into(), opt_date(self.due_date));
        row.insert("project_id".into(), opt_string(self.project_id.as_deref()));
        row.insert("extra_data".into(), string_map_value(&self.extra_data));
        row.insert(
            "updated_at".into(),
            self.updated_at
                .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .unwrap_or(Value::Null),
        );
        row.insert(
            "last_updated_by".into(),
            opt_string(self.last_updated_by.as_deref()),
        );
        row
    }
}

impl Row for Record {
    type Patch = RecordPatch;
    type Draft = NewRecord;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn from_raw(row: &RawRow) -> Result<Self, NormalizeError> {
        let id = normalize::id_field(row)?;
        Ok(Self {
            id,
            content: normalize::text(row.get("content")).unwrap_or_default(),
            status: normalize::text(row.get("status")).unwrap_or_default(),
            assignee: normalize::text(row.get("assignee")),
            priority: normalize::text(row.get("priority")).and_then(|p| Priority::parse(&p)),
            due_date: normalize::date(row.get("due_date")),
            project_id: normalize::text(row.get("project_id")),
            extra_data: normalize::string_map(row.get("extra_data")),
            updated_at: normalize::timestamp(row.get("updated_at")),
            last_updated_by: normalize::text(row.get("last_updated_by")),
        })
    }

    fn apply_patch(&mut self, patch: &RecordPatch) {
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(status) = &patch.status {
            self.status = status.clone();
        }
        if let Some(assignee) = &patch.assignee {
            self.assignee = assignee.clone();
        }
        if let Some(priority) = &patch.priority {
            self.priority = *priority;
        }
        if let Some(due_date) = &patch.due_date {
            self.due_date = *due_date;
        }
        if let Some(project_id) = &patch.project_id {
            self.project_id = project_id.clone();
        }
        if let Some(extra) = &patch.extra_data {
            self.extra_data = extra.clone();
        }
    }

    fn patch_to_raw(patch: &RecordPatch, author: &str) -> RawRow {
        let mut row = Map::new();
        if let Some(content) = &patch.content {
            row.insert("content".into(), Value::String(content.clone()));
        }
        if let Some(status) = &patch.status {
            row.insert("status".into(), Value::String(status.clone()));
        }
        if let Some(assignee) = &patch.assignee {
            row.insert("assignee".into(), opt_string(assignee.as_deref()));
        }
        if let Some(priority) = &patch.priority {
            row.insert(
                "priority".into(),
                opt_string(priority.as_ref().map(Priority::as_str)),
            );
        }
        if let Some(due_date) = &patch.due_date {
            row.insert("due_date".into(), opt_date(*due_date));
        }
        if let Some(project_id) = &patch.project_id {
            row.insert("project_id".into(), opt_string(project_id.as_deref()));
        }
        if let Some(extra) = &patch.extra_data {
            let value = if extra.is_empty() {
                Value::Null
            } else {
                string_map_value(extra)
            };
            row.insert("extra_data".into(), value);
        }
        row.insert("last_updated_by".into(), Value::String(author.to_string()));
        row
    }

    fn draft_to_raw(draft: &NewRecord, author: &str) -> RawRow {
        let mut row = Map::new();
        row.insert("content".into(), Value::String(draft.content.trim().to_string()));
        let status = draft.status.trim();
        row.insert(
            "status".into(),
            Value::String(if status.is_empty() { DEFAULT_STATUS } else { status }.to_string()),
        );
        let assignee = draft.assignee.as_deref().map(str::trim).filter(|a| !a.is_empty());
        row.insert("assignee".into(), opt_string(assignee));
        row.insert("last_updated_by".into(), Value::String(author.to_string()));
        if let Some(project_id) = &draft.project_id {
            row.insert("project_id".into(), Value::String(project_id.clone()));
        }
        if let Some(due) = draft.due_date {
            row.insert("due_date".into(), opt_date(Some(due)));
        }
        if let Some(priority) = draft.priority {
            row.insert("priority".into(), Value::String(priority.as_str().to_string()));
        }
        if !draft.extra_data.is_empty() {
            row.insert("extra_data".into(), string_map_value(&draft.extra_data));
        }
        row
    }
}

// ───────────────────────────────────────────────────────────────────
// Patch / Draft
// ───────────────────────────────────────────────────────────────────

/// Partial update of a task. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub content: Option<String>,
    pub status: Option<String>,
    pub assignee: Option<Option<String>>,
    pub priority: Option<Option<Priority>>,
    pub due_date: Option<Option<NaiveDate>>,
    pub project_id: Option<Option<String>>,
    pub extra_data: Option<BTreeMap<String, String>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn assignee(mut self, assignee: Option<&str>) -> Self {
        self.assignee = Some(assignee.map(str::to_owned));
        self
    }

    pub fn priority(mut self, priority: Option<Priority>) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn due_date(mut self, due: Option<NaiveDate>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn project(mut self, project_id: Option<&str>) -> Self {
        self.project_id = Some(project_id.map(str::to_owned));
        self
    }

    pub fn extra_data(mut self, extra: BTreeMap<String, String>) -> Self {
        self.extra_data = Some(extra);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Fields for a new task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
    pub content: String,
    pub status: String,
    pub assignee: Option<String>,
    pub priority: Option<Priority>,
    pub due_date: Option<NaiveDate>,
    pub project_id: Option<String>,
    pub extra_data: BTreeMap<String, String>,
}

impl NewRecord {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: DEFAULT_STATUS.to_string(),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

/// Project id → number of tasks in it. Unassigned tasks are not counted.
pub fn counts_by_project<'a, I>(records: I) -> HashMap<String, usize>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut counts = HashMap::new();
    for record in records {
        if let Some(project) = &record.project_id {
            *counts.entry(project.clone()).or_insert(0) += 1;
        }
    }
    counts
}

// ───────────────────────────────────────────────────────────────────
// Notification summary
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    ProjectAssigned,
    TaskAssigned,
    Overdue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub count: usize,
}

/// What needs a user's attention. Kinds with a zero count are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationSummary {
    pub items: Vec<Notice>,
}

impl NotificationSummary {
    pub fn total(&self) -> usize {
        self.items.iter().map(|n| n.count).sum()
    }

    pub fn count(&self, kind: NoticeKind) -> usize {
        self.items
            .iter()
            .find(|n| n.kind == kind)
            .map_or(0, |n| n.count)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Projects assigned to `email`, tasks assigned to it, and those of its
/// tasks due before `today`. Emails compare trimmed and lower-cased; no
/// email means nothing to report.
pub fn notification_summary<'a, P, R>(
    email: Option<&str>,
    projects: P,
    records: R,
    today: NaiveDate,
) -> NotificationSummary
where
    P: IntoIterator<Item = &'a Project>,
    R: IntoIterator<Item = &'a Record>,
{
    let email = email.unwrap_or_default().trim().to_lowercase();
    if email.is_empty() {
        return NotificationSummary::default();
    }

    let assigned_projects = projects
        .into_iter()
        .filter(|p| {
            p.assigned_emails
                .iter()
                .any(|e| e.trim().to_lowercase() == email)
        })
        .count();

    let mut mine = 0;
    let mut overdue = 0;
    for record in records {
        let assignee = record.assignee.as_deref().unwrap_or_default();
        if assignee.trim().to_lowercase() != email {
            continue;
        }
        mine += 1;
        if record.due_date.is_some_and(|due| due < today) {
            overdue += 1;
        }
    }

    let items = [
        (NoticeKind::ProjectAssigned, assigned_projects),
        (NoticeKind::TaskAssigned, mine),
        (NoticeKind::Overdue, overdue),
    ]
    .into_iter()
    .filter(|(_, count)| *count > 0)
    .map(|(kind, count)| Notice { kind, count })
    .collect();
    NotificationSummary { items }
}

fn opt_string(value: Option<&str>) -> Value {
    value
        .map(|s| Value::String(s.to_string()))
        .unwrap_or(Value::Null)
}

fn opt_date(value: Option<NaiveDate>) -> Value {
    value
        .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

fn string_map_value(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> RawRow {
        v.as_object().cloned().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn assigned(id: &str, assignee: &str, due: Option<&str>) -> Record {
        let mut r = Record::new(id, "x");
        r.assignee = Some(assignee.into());
        r.due_date = due.map(date);
        r
    }

    #[test]
    fn test_notification_summary_counts() {
        let mut mine = Project::new("p1", "Mine");
        mine.assigned_emails = vec!["ada@example.com".into()];
        let mut theirs = Project::new("p2", "Theirs");
        theirs.assigned_emails = vec!["bob@example.com".into()];
        let records = vec![
            assigned("t1", " ADA@example.com ", Some("2025-05-01")),
            assigned("t2", "ada@example.com", Some("2025-06-01")),
            assigned("t3", "ada@example.com", None),
            assigned("t4", "bob@example.com", Some("2025-01-01")),
        ];

        let summary = notification_summary(
            Some("  Ada@Example.com"),
            &[mine, theirs],
            &records,
            date("2025-06-01"),
        );
        assert_eq!(summary.count(NoticeKind::ProjectAssigned), 1);
        assert_eq!(summary.count(NoticeKind::TaskAssigned), 3);
        // Due today is not overdue.
        assert_eq!(summary.count(NoticeKind::Overdue), 1);
        assert_eq!(summary.total(), 5);
    }

    #[test]
    fn test_notification_summary_skips_empty_kinds() {
        let records = vec![assigned("t1", "ada@example.com", None)];
        let projects: Vec<Project> = Vec::new();
        let summary =
            notification_summary(Some("ada@example.com"), &projects, &records, date("2025-06-01"));
        assert_eq!(
            summary.items,
            vec![Notice {
                kind: NoticeKind::TaskAssigned,
                count: 1
            }]
        );

        let none = notification_summary(Some("   "), &projects, &records, date("2025-06-01"));
        assert!(none.is_empty());
        assert_eq!(notification_summary(None, &projects, &records, date("2025-06-01")).total(), 0);
    }

    #[test]
    fn test_from_raw_full_row() {
        let r = Record::from_raw(&raw(json!({
            "id": 7,
            "content": "Write docs",
            "status": "In Progress",
            "assignee": "ayse",
            "priority": "high",
            "due_date": "2025-03-01",
            "project_id": 12,
            "extra_data": {"Sprint": "4", "Points": 3},
            "updated_at": "2025-02-01T09:30:00Z",
            "last_updated_by": "ayse@example.com",
        })))
        .unwrap();

        assert_eq!(r.id.as_str(), "7");
        assert_eq!(r.status, "In Progress");
        assert_eq!(r.priority, Some(Priority::High));
        assert_eq!(r.project_id.as_deref(), Some("12"));
        assert_eq!(r.extra_data.get("Points").map(String::as_str), Some("3"));
        assert!(r.updated_at.is_some());
        assert!(r.due_date.is_some());
    }

    #[test]
    fn test_from_raw_sparse_row() {
        let r = Record::from_raw(&raw(json!({"id": "a", "content": null}))).unwrap();
        assert_eq!(r.content, "");
        assert_eq!(r.status, "");
        assert!(r.assignee.is_none());
        assert!(r.extra_data.is_empty());
    }

    #[test]
    fn test_from_raw_without_id_fails() {
        let err = Record::from_raw(&raw(json!({"content": "x"}))).unwrap_err();
        assert_eq!(err, NormalizeError::MissingId);
    }

    #[test]
    fn test_raw_roundtrip_preserves_record() {
        let mut r = Record::new("t1", "Ship it").with_status("Done");
        r.assignee = Some("mehmet".into());
        r.priority = Some(Priority::Low);
        r.extra_data.insert("Column".into(), "value".into());
        let back = Record::from_raw(&r.to_raw()).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_apply_patch_touches_only_given_fields() {
        let mut r = Record::new("t1", "keep me");
        r.assignee = Some("a".into());
        r.apply_patch(&RecordPatch::new().status("Done").assignee(None));
        assert_eq!(r.content, "keep me");
        assert_eq!(r.status, "Done");
        assert!(r.assignee.is_none());
    }

    #[test]
    fn test_patch_to_raw_encodes_nulls_and_author() {
        let raw = Record::patch_to_raw(&RecordPatch::new().assignee(None).status("Done"), "me@x.io");
        assert_eq!(raw.get("assignee"), Some(&Value::Null));
        assert_eq!(raw.get("status"), Some(&json!("Done")));
        assert_eq!(raw.get("last_updated_by"), Some(&json!("me@x.io")));
        assert!(!raw.contains_key("content"));
    }

    #[test]
    fn test_draft_to_raw_defaults() {
        let mut draft = NewRecord::new("  trimmed  ").with_status("  ");
        draft.assignee = Some("   ".into());
        let raw = Record::draft_to_raw(&draft, ANONYMOUS_AUTHOR);
        assert_eq!(raw.get("content"), Some(&json!("trimmed")));
        assert_eq!(raw.get("status"), Some(&json!(DEFAULT_STATUS)));
        assert_eq!(raw.get("assignee"), Some(&Value::Null));
        assert!(!raw.contains_key("extra_data"));
        assert!(!raw.contains_key("due_date"));
        assert_eq!(raw.get("last_updated_by"), Some(&json!("anon")));
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::parse("MEDIUM"), Some(Priority::Medium));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_counts_by_project() {
        let mut a = Record::new("1", "a");
        a.project_id = Some("p1".into());
        let mut b = Record::new("2", "b");
        b.project_id = Some("p1".into());
        let c = Record::new("3", "c");
        let counts = counts_by_project([&a, &b, &c]);
        assert_eq!(counts.get("p1"), Some(&2));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(RecordPatch::new().is_empty());
        assert!(!RecordPatch::new().status("x").is_empty());
    }
}
