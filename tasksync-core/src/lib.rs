//! # tasksync-core: Data model for the realtime task table
//!
//! Everything here is synchronous and I/O free. The collaboration layer
//! (`tasksync-collab`) moves these types over feeds, channels and sockets.
//!
//! ## Modules
//!
//! - [`record`]: `RecordId`, raw rows, the [`Row`] contract, task records
//!   and the per-user notification summary
//! - [`project`]: project rows (same contract, second table)
//! - [`change`]: change events as delivered by a row-level feed
//! - [`normalize`]: coercion of heterogeneous backend rows
//! - [`access`]: identity, roles and the permission predicate

pub mod access;
pub mod change;
pub mod normalize;
pub mod project;
pub mod record;

pub use access::{
    AccessPolicy, AllowAll, Identity, Permission, PermissionOverrides, RoleId, User, UserAccess,
};
pub use change::{ChangeEvent, ChangeKind, RawChange};
pub use normalize::NormalizeError;
pub use project::{NewProject, Project, ProjectPatch, ProjectStatus};
pub use record::{
    counts_by_project, notification_summary, NewRecord, Notice, NoticeKind, NotificationSummary,
    Priority, RawRow, Record, RecordId, RecordPatch, Row, ANONYMOUS_AUTHOR, DEFAULT_STATUS,
};
