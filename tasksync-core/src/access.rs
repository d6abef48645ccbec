//! Identity, roles and the permission predicate.
//!
//! ```text
//!   User { role, overrides }
//!        │
//!        ▼
//!   role grants ∪ overrides.add − overrides.remove  =  effective permissions
//!        │
//!        ▼
//!   AccessPolicy::can_perform(permission) -> bool
//! ```
//!
//! The realtime layer never reads ambient auth state: an [`Identity`] and
//! an [`AccessPolicy`] are handed to it explicitly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::record::ANONYMOUS_AUTHOR;

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Who is acting. No email means anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: Option<&str>, display_name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            email: email.map(str::to_owned),
            display_name: display_name.map(str::to_owned),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.email.as_deref().map_or(true, |e| e.trim().is_empty())
    }

    /// Value stamped into `last_updated_by`.
    pub fn author(&self) -> &str {
        match self.email.as_deref() {
            Some(e) if !e.trim().is_empty() => e,
            _ => ANONYMOUS_AUTHOR,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Permissions
// ───────────────────────────────────────────────────────────────────

macro_rules! permissions {
    ($($variant:ident => $key:literal),+ $(,)?) => {
        /// Every gated action in the dashboard.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Permission {
            $(#[serde(rename = $key)] $variant),+
        }

        impl Permission {
            pub const ALL: &'static [Permission] = &[$(Permission::$variant),+];

            pub fn key(&self) -> &'static str {
                match self {
                    $(Permission::$variant => $key),+
                }
            }

            pub fn parse(key: &str) -> Option<Self> {
                match key {
                    $($key => Some(Permission::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

permissions! {
    AreaProjects => "area.projects",
    AreaLiveTable => "area.liveTable",
    AreaSettings => "area.settings",
    AreaUserManagement => "area.userManagement",
    ProjectsView => "projects.view",
    ProjectsCreate => "projects.create",
    ProjectsEdit => "projects.edit",
    ProjectsDelete => "projects.delete",
    ProjectsArchive => "projects.archive",
    ProjectsAssignUsers => "projects.assignUsers",
    ProjectDetailView => "projectDetail.view",
    ProjectDetailAddTask => "projectDetail.addTask",
    ProjectDetailEditTask => "projectDetail.editTask",
    ProjectDetailRemoveTask => "projectDetail.removeTask",
    ProjectDetailDeleteTask => "projectDetail.deleteTask",
    ProjectDetailImportCsv => "projectDetail.importCsv",
    LiveTableView => "liveTable.view",
    LiveTableCreateTask => "liveTable.createTask",
    LiveTableEditTask => "liveTable.editTask",
    LiveTableDeleteTask => "liveTable.deleteTask",
    LiveTableBulkDelete => "liveTable.bulkDelete",
    LiveTableImportCsv => "liveTable.importCsv",
    LiveTableExportCsv => "liveTable.exportCsv",
    LiveTableManageColumns => "liveTable.manageColumns",
    LiveTableAutoSizeColumns => "liveTable.autoSizeColumns",
    SettingsView => "settings.view",
    SettingsEdit => "settings.edit",
    UserManagementView => "userManagement.view",
    UserManagementEdit => "userManagement.edit",
    NotificationsSend => "notifications.send",
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ───────────────────────────────────────────────────────────────────
// Roles
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleId {
    Admin,
    ProjectManager,
    Member,
    Viewer,
}

use Permission::*;

const PROJECT_MANAGER_GRANTS: &[Permission] = &[
    AreaProjects,
    AreaLiveTable,
    AreaSettings,
    ProjectsView,
    ProjectsCreate,
    ProjectsEdit,
    ProjectsArchive,
    ProjectsAssignUsers,
    ProjectDetailView,
    ProjectDetailAddTask,
    ProjectDetailEditTask,
    ProjectDetailRemoveTask,
    ProjectDetailDeleteTask,
    ProjectDetailImportCsv,
    LiveTableView,
    LiveTableCreateTask,
    LiveTableEditTask,
    LiveTableDeleteTask,
    LiveTableBulkDelete,
    LiveTableImportCsv,
    LiveTableExportCsv,
    LiveTableManageColumns,
    LiveTableAutoSizeColumns,
    SettingsView,
    SettingsEdit,
    UserManagementView,
    NotificationsSend,
];

const MEMBER_GRANTS: &[Permission] = &[
    AreaProjects,
    AreaLiveTable,
    AreaSettings,
    ProjectsView,
    ProjectDetailView,
    ProjectDetailAddTask,
    ProjectDetailRemoveTask,
    LiveTableView,
    LiveTableCreateTask,
    LiveTableEditTask,
    LiveTableManageColumns,
    LiveTableAutoSizeColumns,
    SettingsView,
    SettingsEdit,
    UserManagementView,
];

const VIEWER_GRANTS: &[Permission] = &[
    AreaProjects,
    AreaLiveTable,
    AreaSettings,
    ProjectsView,
    ProjectDetailView,
    LiveTableView,
    SettingsView,
    UserManagementView,
];

impl RoleId {
    /// Default grants for the role. Admin holds everything.
    pub fn grants(&self) -> &'static [Permission] {
        match self {
            Self::Admin => Permission::ALL,
            Self::ProjectManager => PROJECT_MANAGER_GRANTS,
            Self::Member => MEMBER_GRANTS,
            Self::Viewer => VIEWER_GRANTS,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Admin => "Administrator",
            Self::ProjectManager => "Project manager",
            Self::Member => "Member",
            Self::Viewer => "Viewer",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverrides {
    #[serde(default)]
    pub add: Vec<Permission>,
    #[serde(default)]
    pub remove: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub identity: Identity,
    pub role: RoleId,
    #[serde(default)]
    pub overrides: PermissionOverrides,
}

impl User {
    pub fn new(identity: Identity, role: RoleId) -> Self {
        Self {
            identity,
            role,
            overrides: PermissionOverrides::default(),
        }
    }

    pub fn grant(mut self, permission: Permission) -> Self {
        self.overrides.add.push(permission);
        self
    }

    pub fn revoke(mut self, permission: Permission) -> Self {
        self.overrides.remove.push(permission);
        self
    }

    /// Role grants plus added overrides, minus removed ones. Removal wins.
    pub fn effective_permissions(&self) -> BTreeSet<Permission> {
        let mut set: BTreeSet<Permission> = self
            .role
            .grants()
            .iter()
            .chain(self.overrides.add.iter())
            .copied()
            .collect();
        for p in &self.overrides.remove {
            set.remove(p);
        }
        set
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.effective_permissions().contains(&permission)
    }

    pub fn has_any(&self, permissions: &[Permission]) -> bool {
        let effective = self.effective_permissions();
        permissions.iter().any(|p| effective.contains(p))
    }

    pub fn has_all(&self, permissions: &[Permission]) -> bool {
        let effective = self.effective_permissions();
        permissions.iter().all(|p| effective.contains(p))
    }

    pub fn is_admin(&self) -> bool {
        self.role == RoleId::Admin
    }
}

// ───────────────────────────────────────────────────────────────────
// Policy
// ───────────────────────────────────────────────────────────────────

/// Predicate consulted before a gated action runs.
pub trait AccessPolicy: Send + Sync {
    fn can_perform(&self, permission: Permission) -> bool;
}

/// Policy for a signed-in user, or nobody (everything denied).
#[derive(Debug, Clone, Default)]
pub struct UserAccess {
    user: Option<User>,
}

impl UserAccess {
    pub fn new(user: Option<User>) -> Self {
        Self { user }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }
}

impl AccessPolicy for UserAccess {
    fn can_perform(&self, permission: Permission) -> bool {
        self.user
            .as_ref()
            .is_some_and(|u| u.has_permission(permission))
    }
}

/// Grants everything. For tests and trusted server-side callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_perform(&self, _permission: Permission) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: RoleId) -> User {
        User::new(Identity::new("u1", Some("u@x.io"), None), role)
    }

    #[test]
    fn test_admin_has_everything() {
        let admin = user(RoleId::Admin);
        assert!(admin.is_admin());
        assert!(admin.has_all(Permission::ALL));
    }

    #[test]
    fn test_member_cannot_delete() {
        let member = user(RoleId::Member);
        assert!(member.has_permission(Permission::LiveTableEditTask));
        assert!(!member.has_permission(Permission::LiveTableDeleteTask));
        assert!(!member.has_permission(Permission::LiveTableBulkDelete));
    }

    #[test]
    fn test_overrides_add_and_remove() {
        let viewer = user(RoleId::Viewer)
            .grant(Permission::LiveTableEditTask)
            .revoke(Permission::SettingsView);
        assert!(viewer.has_permission(Permission::LiveTableEditTask));
        assert!(!viewer.has_permission(Permission::SettingsView));
    }

    #[test]
    fn test_remove_beats_add() {
        let u = user(RoleId::Viewer)
            .grant(Permission::ProjectsCreate)
            .revoke(Permission::ProjectsCreate);
        assert!(!u.has_permission(Permission::ProjectsCreate));
    }

    #[test]
    fn test_has_any() {
        let viewer = user(RoleId::Viewer);
        assert!(viewer.has_any(&[Permission::ProjectsCreate, Permission::ProjectsView]));
        assert!(!viewer.has_any(&[Permission::ProjectsCreate]));
    }

    #[test]
    fn test_signed_out_policy_denies() {
        assert!(!UserAccess::default().can_perform(Permission::LiveTableView));
        assert!(UserAccess::new(Some(user(RoleId::Viewer))).can_perform(Permission::LiveTableView));
    }

    #[test]
    fn test_permission_keys_roundtrip() {
        for p in Permission::ALL {
            assert_eq!(Permission::parse(p.key()), Some(*p));
        }
        assert_eq!(
            serde_json::to_string(&Permission::LiveTableBulkDelete).unwrap(),
            "\"liveTable.bulkDelete\""
        );
    }

    #[test]
    fn test_identity_author() {
        assert_eq!(Identity::anonymous().author(), "anon");
        assert!(Identity::new("x", Some(" "), None).is_anonymous());
        assert_eq!(Identity::new("x", Some("a@b.c"), None).author(), "a@b.c");
    }
}
