//! Project rows.
//!
//! Projects share the [`Row`] contract with tasks, so the same reconciler
//! and feed machinery serve the projects table.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::normalize::{self, NormalizeError};
use crate::record::{Priority, RawRow, RecordId, Row};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[default]
    Active,
    Completed,
    OnHold,
}

impl ProjectStatus {
    /// Parses English labels and the legacy Turkish ones stored by older
    /// deployments ("Aktif", "Tamamlandı", "Beklemede").
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "active" | "aktif" => Some(Self::Active),
            "completed" | "tamamlandı" | "tamamlandi" => Some(Self::Completed),
            "onhold" | "on hold" | "on_hold" | "beklemede" => Some(Self::OnHold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Completed => "Completed",
            Self::OnHold => "OnHold",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: RecordId,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Users allowed to work in this project. Lower-case, trimmed.
    pub assigned_emails: Vec<String>,
    pub due_date: Option<NaiveDate>,
    pub priority: Option<Priority>,
}

impl Project {
    pub fn new(id: impl Into<RecordId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: ProjectStatus::Active,
            created_at: None,
            updated_at: None,
            assigned_emails: Vec::new(),
            due_date: None,
            priority: None,
        }
    }

    pub fn is_assigned(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.assigned_emails.iter().any(|e| *e == email)
    }
}

impl Row for Project {
    type Patch = ProjectPatch;
    type Draft = NewProject;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn from_raw(row: &RawRow) -> Result<Self, NormalizeError> {
        Ok(Self {
            id: normalize::id_field(row)?,
            name: normalize::text(row.get("name")).unwrap_or_default(),
            description: normalize::text(row.get("description")).unwrap_or_default(),
            status: normalize::text(row.get("status"))
                .and_then(|s| ProjectStatus::parse(&s))
                .unwrap_or_default(),
            created_at: normalize::timestamp(row.get("created_at")),
            updated_at: normalize::timestamp(row.get("updated_at")),
            assigned_emails: normalize::normalize_emails(normalize::string_list(
                row.get("assigned_emails"),
            )),
            due_date: normalize::date(row.get("due_date")),
            priority: normalize::text(row.get("priority")).and_then(|p| Priority::parse(&p)),
        })
    }

    fn apply_patch(&mut self, patch: &ProjectPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(emails) = &patch.assigned_emails {
            self.assigned_emails = normalize::normalize_emails(emails);
        }
        if let Some(due) = patch.due_date {
            self.due_date = due;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
    }

    // Projects carry no author column.
    fn patch_to_raw(patch: &ProjectPatch, _author: &str) -> RawRow {
        let mut row = Map::new();
        if let Some(name) = &patch.name {
            row.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(description) = &patch.description {
            row.insert("description".into(), Value::String(description.clone()));
        }
        if let Some(status) = patch.status {
            row.insert("status".into(), Value::String(status.as_str().into()));
        }
        if let Some(emails) = &patch.assigned_emails {
            row.insert("assigned_emails".into(), emails_value(emails));
        }
        if let Some(due) = patch.due_date {
            row.insert(
                "due_date".into(),
                due.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null),
            );
        }
        if let Some(priority) = patch.priority {
            row.insert(
                "priority".into(),
                priority
                    .map(|p| Value::String(p.as_str().into()))
                    .unwrap_or(Value::Null),
            );
        }
        row
    }

    fn draft_to_raw(draft: &NewProject, _author: &str) -> RawRow {
        let mut row = Map::new();
        row.insert("name".into(), Value::String(draft.name.trim().to_string()));
        row.insert(
            "description".into(),
            Value::String(draft.description.trim().to_string()),
        );
        row.insert("status".into(), Value::String(draft.status.as_str().into()));
        let emails = normalize::normalize_emails(&draft.assigned_emails);
        if !emails.is_empty() {
            row.insert("assigned_emails".into(), emails_value(&emails));
        }
        if let Some(due) = draft.due_date {
            row.insert("due_date".into(), Value::String(due.to_string()));
        }
        if let Some(priority) = draft.priority {
            row.insert("priority".into(), Value::String(priority.as_str().into()));
        }
        row
    }
}

fn emails_value(emails: &[String]) -> Value {
    let normalized = normalize::normalize_emails(emails);
    if normalized.is_empty() {
        Value::Null
    } else {
        Value::Array(normalized.into_iter().map(Value::String).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub assigned_emails: Option<Vec<String>>,
    pub due_date: Option<Option<NaiveDate>>,
    pub priority: Option<Option<Priority>>,
}

impl ProjectPatch {
    /// Archiving a project puts it on hold.
    pub fn archive() -> Self {
        Self {
            status: Some(ProjectStatus::OnHold),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub assigned_emails: Vec<String>,
    pub due_date: Option<NaiveDate>,
    pub priority: Option<Priority>,
}

impl NewProject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_raw_legacy_labels() {
        let row = json!({
            "id": "p1",
            "name": "Launch",
            "status": "Beklemede",
            "priority": "LOW",
            "assigned_emails": "[\" Ana@Example.com \", \"\"]",
        });
        let p = Project::from_raw(row.as_object().unwrap()).unwrap();
        assert_eq!(p.status, ProjectStatus::OnHold);
        assert_eq!(p.priority, Some(Priority::Low));
        assert_eq!(p.assigned_emails, vec!["ana@example.com".to_string()]);
        assert!(p.is_assigned("ANA@example.com"));
    }

    #[test]
    fn test_unknown_status_defaults_to_active() {
        let p = Project::from_raw(json!({"id": 3, "status": "??"}).as_object().unwrap()).unwrap();
        assert_eq!(p.status, ProjectStatus::Active);
    }

    #[test]
    fn test_archive_patch() {
        let mut p = Project::new("p", "n");
        p.apply_patch(&ProjectPatch::archive());
        assert_eq!(p.status, ProjectStatus::OnHold);
    }

    #[test]
    fn test_draft_omits_empty_assignments() {
        let mut draft = NewProject::new(" Site ");
        draft.assigned_emails = vec!["  ".into()];
        let raw = Project::draft_to_raw(&draft, "anon");
        assert_eq!(raw.get("name"), Some(&json!("Site")));
        assert!(!raw.contains_key("assigned_emails"));
    }

    #[test]
    fn test_patch_clears_assignments_with_null() {
        let patch = ProjectPatch {
            assigned_emails: Some(Vec::new()),
            ..ProjectPatch::default()
        };
        let raw = Project::patch_to_raw(&patch, "anon");
        assert_eq!(raw.get("assigned_emails"), Some(&Value::Null));
    }
}
