//! Per-table persistence contract and its authorization guard.
//!
//! ```text
//!  Reconciler ──► GuardedPersistence ──can_perform?──► inner Persistence
//!                      │ no                               (MemoryTable, RemoteTable)
//!                      ▼
//!               PersistenceError::Forbidden(permission)
//! ```
//!
//! Permissions are checked where the data is written, not only where the
//! button is drawn. The server wraps every table it hosts this way.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use tasksync_core::{
    AccessPolicy, AllowAll, Identity, NormalizeError, Permission, RawRow, RecordId, RoleId, User,
    UserAccess,
};

use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    #[error("not permitted: {0}")]
    Forbidden(Permission),

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("malformed row: {0}")]
    Normalize(#[from] NormalizeError),
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// CRUD over one table's raw rows.
#[async_trait]
pub trait Persistence: Send + Sync {
    fn table(&self) -> &str;

    async fn fetch_all(&self) -> Result<Vec<RawRow>, PersistenceError>;

    /// Insert one row. Returns the row as committed, id included.
    async fn insert(&self, row: RawRow) -> Result<RawRow, PersistenceError>;

    /// Insert a batch in one call. Callers chunk.
    async fn insert_many(&self, rows: Vec<RawRow>) -> Result<usize, PersistenceError>;

    /// Merge `patch` into the row. Missing id is `NotFound`.
    async fn update(&self, id: &RecordId, patch: RawRow) -> Result<(), PersistenceError>;

    /// Delete one row. Deleting a missing id succeeds.
    async fn delete(&self, id: &RecordId) -> Result<(), PersistenceError>;

    /// Delete a batch in one call. Returns how many existed.
    async fn delete_many(&self, ids: &[RecordId]) -> Result<usize, PersistenceError>;
}

#[async_trait]
impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn table(&self) -> &str {
        (**self).table()
    }

    async fn fetch_all(&self) -> Result<Vec<RawRow>, PersistenceError> {
        (**self).fetch_all().await
    }

    async fn insert(&self, row: RawRow) -> Result<RawRow, PersistenceError> {
        (**self).insert(row).await
    }

    async fn insert_many(&self, rows: Vec<RawRow>) -> Result<usize, PersistenceError> {
        (**self).insert_many(rows).await
    }

    async fn update(&self, id: &RecordId, patch: RawRow) -> Result<(), PersistenceError> {
        (**self).update(id, patch).await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), PersistenceError> {
        (**self).delete(id).await
    }

    async fn delete_many(&self, ids: &[RecordId]) -> Result<usize, PersistenceError> {
        (**self).delete_many(ids).await
    }
}

// ───────────────────────────────────────────────────────────────────
// Authorization
// ───────────────────────────────────────────────────────────────────

/// Which permission each operation on a table needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableActions {
    pub view: Permission,
    pub create: Permission,
    pub create_many: Permission,
    pub edit: Permission,
    pub delete: Permission,
    pub delete_many: Permission,
}

impl TableActions {
    /// The live task table.
    pub fn tasks() -> Self {
        Self {
            view: Permission::LiveTableView,
            create: Permission::LiveTableCreateTask,
            create_many: Permission::LiveTableImportCsv,
            edit: Permission::LiveTableEditTask,
            delete: Permission::LiveTableDeleteTask,
            delete_many: Permission::LiveTableBulkDelete,
        }
    }

    pub fn projects() -> Self {
        Self {
            view: Permission::ProjectsView,
            create: Permission::ProjectsCreate,
            create_many: Permission::ProjectsCreate,
            edit: Permission::ProjectsEdit,
            delete: Permission::ProjectsDelete,
            delete_many: Permission::ProjectsDelete,
        }
    }

    pub fn for_table(table: &str) -> Self {
        match table {
            "projects" => Self::projects(),
            _ => Self::tasks(),
        }
    }
}

/// A [`Persistence`] that refuses what the policy does not allow.
pub struct GuardedPersistence<P> {
    inner: P,
    policy: Arc<dyn AccessPolicy>,
    actions: TableActions,
}

impl<P: Persistence> GuardedPersistence<P> {
    pub fn new(inner: P, policy: Arc<dyn AccessPolicy>, actions: TableActions) -> Self {
        Self {
            inner,
            policy,
            actions,
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn check(&self, permission: Permission) -> Result<(), PersistenceError> {
        if self.policy.can_perform(permission) {
            Ok(())
        } else {
            log::warn!("Refused {permission} on '{}'", self.inner.table());
            Err(PersistenceError::Forbidden(permission))
        }
    }
}

#[async_trait]
impl<P: Persistence> Persistence for GuardedPersistence<P> {
    fn table(&self) -> &str {
        self.inner.table()
    }

    async fn fetch_all(&self) -> Result<Vec<RawRow>, PersistenceError> {
        self.check(self.actions.view)?;
        self.inner.fetch_all().await
    }

    async fn insert(&self, row: RawRow) -> Result<RawRow, PersistenceError> {
        self.check(self.actions.create)?;
        self.inner.insert(row).await
    }

    async fn insert_many(&self, rows: Vec<RawRow>) -> Result<usize, PersistenceError> {
        self.check(self.actions.create_many)?;
        self.inner.insert_many(rows).await
    }

    async fn update(&self, id: &RecordId, patch: RawRow) -> Result<(), PersistenceError> {
        self.check(self.actions.edit)?;
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), PersistenceError> {
        self.check(self.actions.delete)?;
        self.inner.delete(id).await
    }

    async fn delete_many(&self, ids: &[RecordId]) -> Result<usize, PersistenceError> {
        self.check(self.actions.delete_many)?;
        self.inner.delete_many(ids).await
    }
}

/// Maps a connected identity to the policy its requests run under.
pub trait AccessResolver: Send + Sync {
    fn resolve(&self, identity: &Identity) -> Arc<dyn AccessPolicy>;
}

/// Everyone may do everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllResolver;

impl AccessResolver for AllowAllResolver {
    fn resolve(&self, _identity: &Identity) -> Arc<dyn AccessPolicy> {
        Arc::new(AllowAll)
    }
}

/// Known users by email, with an optional role for everyone else who is
/// signed in. Anonymous identities get nothing.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<String, User>,
    default_role: Option<RoleId>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_role(mut self, role: RoleId) -> Self {
        self.default_role = Some(role);
        self
    }

    pub fn insert(&mut self, user: User) {
        if let Some(email) = user.identity.email.as_deref() {
            self.users.insert(email.trim().to_lowercase(), user);
        }
    }

    pub fn get(&self, email: &str) -> Option<&User> {
        self.users.get(&email.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl AccessResolver for UserDirectory {
    fn resolve(&self, identity: &Identity) -> Arc<dyn AccessPolicy> {
        if identity.is_anonymous() {
            return Arc::new(UserAccess::new(None));
        }
        let known = identity.email.as_deref().and_then(|e| self.get(e)).cloned();
        let user = known.or_else(|| {
            self.default_role
                .map(|role| User::new(identity.clone(), role))
        });
        Arc::new(UserAccess::new(user))
    }
}
