//! Optimistic reconciler: the single owner of a table's in-memory rows.
//!
//! Three inputs are merged into one list:
//!
//! ```text
//!  refetch() ───── full snapshot ──────┐
//!  mutate()/remove() ─ optimistic ─────┼──► RecordSet<R> ──► revision watch ──► view
//!  apply_event() ─── feed events ──────┘
//! ```
//!
//! Per id:
//!
//! ```text
//!  Unknown ──fetch/Insert──► Confirmed ──mutate──► Optimistic
//!                               ▲                      │
//!                               └── Update event ──────┤ (server wins)
//!                               └── failure: rollback ─┘
//!  any ──Delete event / remove──► Deleted (terminal, tombstoned)
//! ```
//!
//! Merges replace whole rows; there are no counters or deltas, so
//! applying the same event twice changes nothing.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use chrono::NaiveDate;
use tasksync_core::{
    counts_by_project, notification_summary, ChangeEvent, Identity, NormalizeError,
    NotificationSummary, Project, Record, RecordId, Row,
};

use crate::persistence::{Persistence, PersistenceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Holds a local patch the server has not confirmed
    Optimistic,
    /// Matches the last server row we saw
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("malformed row: {0}")]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, Clone)]
struct Entry<R> {
    current: R,
    confirmed: R,
    pending: bool,
    /// Clock value of the last merge that touched this row
    stamp: u64,
}

// ───────────────────────────────────────────────────────────────────
// RecordSet
// ───────────────────────────────────────────────────────────────────

/// The synchronous merge rules, without any I/O.
///
/// Every event merge ticks a logical clock. A fetch remembers the clock
/// when it starts ([`mark`](Self::mark)); rows merged after that point are
/// newer than the snapshot and survive [`replace_since`](Self::replace_since).
#[derive(Debug, Clone)]
pub struct RecordSet<R: Row> {
    order: Vec<RecordId>,
    entries: HashMap<RecordId, Entry<R>>,
    /// Rows we held and then lost; ids are never reused
    tombstones: HashSet<RecordId>,
    /// Deletes for rows we never held, kept until a later snapshot covers them
    unseen_deletes: HashMap<RecordId, u64>,
    clock: u64,
}

impl<R: Row> Default for RecordSet<R> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
            tombstones: HashSet::new(),
            unseen_deletes: HashMap::new(),
            clock: 0,
        }
    }
}

impl<R: Row> RecordSet<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &RecordId) -> Option<&R> {
        self.entries.get(id).map(|e| &e.current)
    }

    pub fn state_of(&self, id: &RecordId) -> Option<RecordState> {
        self.entries.get(id).map(|e| {
            if e.pending {
                RecordState::Optimistic
            } else {
                RecordState::Confirmed
            }
        })
    }

    pub fn is_deleted(&self, id: &RecordId) -> bool {
        self.tombstones.contains(id) || self.unseen_deletes.contains_key(id)
    }

    /// Number of deletion markers held.
    pub fn deleted_len(&self) -> usize {
        self.tombstones.len() + self.unseen_deletes.len()
    }

    /// Current rows, in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| &e.current))
    }

    pub fn records(&self) -> Vec<R> {
        self.iter().cloned().collect()
    }

    /// Clock value to pass to [`replace_since`](Self::replace_since) for a
    /// fetch starting now.
    pub fn mark(&self) -> u64 {
        self.clock
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Replace everything with a fetched snapshot, as if nothing was
    /// merged while it was in flight.
    pub fn replace_all(&mut self, rows: Vec<R>) {
        let mark = self.clock;
        self.replace_since(rows, mark);
    }

    /// Replace everything with a snapshot taken after `mark`.
    ///
    /// Deleted ids stay deleted. A row with a local patch in flight keeps
    /// its optimistic value; the snapshot becomes its rollback target.
    /// Rows merged after `mark` keep their merged value, and rows inserted
    /// after `mark` are kept even when the snapshot lacks them.
    pub fn replace_since(&mut self, rows: Vec<R>, mark: u64) {
        let mut previous = std::mem::take(&mut self.entries);
        let previous_order = std::mem::take(&mut self.order);

        for row in rows {
            let id = row.id().clone();
            if self.is_deleted(&id) || self.entries.contains_key(&id) {
                continue;
            }
            let entry = match previous.remove(&id) {
                Some(old) if old.stamp > mark => old,
                Some(old) if old.pending => Entry {
                    current: old.current,
                    confirmed: row,
                    pending: true,
                    stamp: old.stamp,
                },
                _ => Entry {
                    current: row.clone(),
                    confirmed: row,
                    pending: false,
                    stamp: mark,
                },
            };
            self.order.push(id.clone());
            self.entries.insert(id, entry);
        }

        for id in previous_order {
            if let Some(old) = previous.remove(&id) {
                if old.stamp > mark {
                    self.order.push(id.clone());
                    self.entries.insert(id, old);
                }
            }
        }

        // The snapshot already reflects deletes seen before it started.
        self.unseen_deletes.retain(|_, stamp| *stamp > mark);
    }

    /// Merge one feed event. Returns whether the visible rows changed.
    pub fn apply_event(&mut self, event: ChangeEvent<R>) -> bool {
        match event {
            ChangeEvent::Insert(row) => {
                let id = row.id().clone();
                if self.is_deleted(&id) || self.entries.contains_key(&id) {
                    return false;
                }
                self.push_confirmed(row);
                true
            }
            ChangeEvent::Update(row) => {
                let id = row.id().clone();
                if self.is_deleted(&id) {
                    return false;
                }
                let stamp = self.tick();
                match self.entries.get_mut(&id) {
                    Some(entry) => {
                        let changed = entry.current != row;
                        entry.current = row.clone();
                        entry.confirmed = row;
                        entry.pending = false;
                        entry.stamp = stamp;
                        changed
                    }
                    // We missed the insert
                    None => {
                        self.push_confirmed(row);
                        true
                    }
                }
            }
            ChangeEvent::Delete(id) => self.remove_local(&id).is_some(),
        }
    }

    /// Apply a local patch on top of the current row.
    pub fn apply_patch(&mut self, id: &RecordId, patch: &R::Patch) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.current.apply_patch(patch);
                entry.pending = true;
                true
            }
            None => false,
        }
    }

    /// Drop the local patch and go back to the last confirmed row.
    pub fn rollback(&mut self, id: &RecordId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.pending => {
                entry.current = entry.confirmed.clone();
                entry.pending = false;
                true
            }
            _ => false,
        }
    }

    /// Remove a row and remember that it is gone.
    ///
    /// Only rows we held get a permanent tombstone. A delete for an id we
    /// never saw is kept just long enough to filter a snapshot that was
    /// already in flight.
    pub fn remove_local(&mut self, id: &RecordId) -> Option<R> {
        let stamp = self.tick();
        match self.entries.remove(id) {
            Some(removed) => {
                self.order.retain(|o| o != id);
                self.unseen_deletes.remove(id);
                self.tombstones.insert(id.clone());
                Some(removed.current)
            }
            None => {
                if !self.tombstones.contains(id) {
                    self.unseen_deletes.insert(id.clone(), stamp);
                }
                None
            }
        }
    }

    /// Undo a tombstone for a delete the server refused.
    pub fn forget_deletion(&mut self, id: &RecordId) {
        self.tombstones.remove(id);
        self.unseen_deletes.remove(id);
    }

    fn push_confirmed(&mut self, row: R) {
        let id = row.id().clone();
        let stamp = self.tick();
        self.order.push(id.clone());
        self.entries.insert(
            id,
            Entry {
                current: row.clone(),
                confirmed: row,
                pending: false,
                stamp,
            },
        );
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconciler
// ───────────────────────────────────────────────────────────────────

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Rows per bulk persistence call
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl ReconcilerConfig {
    pub fn for_testing() -> Self {
        Self { batch_size: 10 }
    }
}

pub struct Reconciler<R: Row> {
    persistence: Arc<dyn Persistence>,
    identity: Identity,
    config: ReconcilerConfig,
    set: RwLock<RecordSet<R>>,
    loading: AtomicBool,
    last_error: RwLock<Option<ReconcileError>>,
    revision: watch::Sender<u64>,
    fetch_generation: AtomicU64,
}

impl<R: Row> Reconciler<R> {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        identity: Identity,
        config: ReconcilerConfig,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            persistence,
            identity,
            config,
            set: RwLock::new(RecordSet::new()),
            loading: AtomicBool::new(false),
            last_error: RwLock::new(None),
            revision,
            fetch_generation: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn table(&self) -> &str {
        self.persistence.table()
    }

    pub async fn records(&self) -> Vec<R> {
        self.set.read().await.records()
    }

    pub async fn record(&self, id: &RecordId) -> Option<R> {
        self.set.read().await.get(id).cloned()
    }

    pub async fn state_of(&self, id: &RecordId) -> Option<RecordState> {
        self.set.read().await.state_of(id)
    }

    pub async fn len(&self) -> usize {
        self.set.read().await.len()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub async fn last_error(&self) -> Option<ReconcileError> {
        self.last_error.read().await.clone()
    }

    pub async fn clear_error(&self) {
        *self.last_error.write().await = None;
    }

    /// Ticks whenever the visible rows change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    async fn fail(&self, error: ReconcileError) -> ReconcileError {
        log::warn!("Operation on '{}' failed: {error}", self.table());
        *self.last_error.write().await = Some(error.clone());
        error
    }

    /// Replace local rows with the server's. A slower, older fetch never
    /// overwrites a newer one, and events merged while the fetch was in
    /// flight are kept.
    pub async fn refetch(&self) -> Result<usize, ReconcileError> {
        let generation = self.fetch_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.loading.store(true, Ordering::Release);
        let mark = self.set.read().await.mark();

        let result = self.persistence.fetch_all().await;
        let latest = self.fetch_generation.load(Ordering::Acquire) == generation;
        if latest {
            self.loading.store(false, Ordering::Release);
        }

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Fetch of '{}' failed: {e}", self.table());
                let error = ReconcileError::Persistence(e);
                *self.last_error.write().await = Some(error.clone());
                return Err(error);
            }
        };

        let mut rows = Vec::with_capacity(raw.len());
        for row in &raw {
            match R::from_raw(row) {
                Ok(r) => rows.push(r),
                Err(e) => log::warn!("Skipping malformed row in '{}': {e}", self.table()),
            }
        }
        let count = rows.len();

        if !latest {
            log::debug!("Discarding stale fetch of '{}'", self.table());
            return Ok(count);
        }
        self.set.write().await.replace_since(rows, mark);
        self.bump();
        Ok(count)
    }

    /// Merge one feed event.
    pub async fn apply_event(&self, event: ChangeEvent<R>) -> bool {
        let changed = self.set.write().await.apply_event(event);
        if changed {
            self.bump();
        }
        changed
    }

    /// Patch a row locally, then persist. On failure the row rolls back,
    /// the error is recorded and a refetch resynchronizes.
    pub async fn mutate(&self, id: &RecordId, patch: R::Patch) -> Result<(), ReconcileError> {
        let applied = self.set.write().await.apply_patch(id, &patch);
        if !applied {
            return Err(self.fail(ReconcileError::NotFound(id.clone())).await);
        }
        self.bump();

        let raw = R::patch_to_raw(&patch, self.identity.author());
        match self.persistence.update(id, raw).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.set.write().await.rollback(id) {
                    self.bump();
                }
                let error = self.fail(e.into()).await;
                if let Err(re) = self.refetch().await {
                    log::warn!("Resync after failed update also failed: {re}");
                }
                Err(error)
            }
        }
    }

    /// Persist a new row, then merge what the server committed.
    pub async fn create(&self, draft: R::Draft) -> Result<R, ReconcileError> {
        let raw = R::draft_to_raw(&draft, self.identity.author());
        let committed = match self.persistence.insert(raw).await {
            Ok(row) => row,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        match R::from_raw(&committed) {
            Ok(row) => {
                self.apply_event(ChangeEvent::Insert(row.clone())).await;
                Ok(row)
            }
            Err(e) => {
                let error = self.fail(e.into()).await;
                if let Err(re) = self.refetch().await {
                    log::warn!("Resync after malformed insert reply also failed: {re}");
                }
                Err(error)
            }
        }
    }

    /// Insert in chunks of `batch_size`, then refetch. Stops at the first
    /// failing chunk; rows from earlier chunks stay committed.
    pub async fn create_many(&self, drafts: Vec<R::Draft>) -> Result<usize, ReconcileError> {
        let author = self.identity.author();
        let rows: Vec<_> = drafts.iter().map(|d| R::draft_to_raw(d, author)).collect();
        let batch_size = self.config.batch_size.max(1);

        let mut inserted = 0;
        let mut failure = None;
        for chunk in rows.chunks(batch_size) {
            match self.persistence.insert_many(chunk.to_vec()).await {
                Ok(n) => inserted += n,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        log::debug!("Bulk insert into '{}': {inserted}/{} rows", self.table(), rows.len());

        let error = match failure {
            Some(e) => Some(self.fail(e.into()).await),
            None => None,
        };
        let refetched = self.refetch().await;
        match error {
            Some(e) => Err(e),
            None => refetched.map(|_| inserted),
        }
    }

    /// Remove locally, then persist. A refused delete is undone by a refetch.
    pub async fn remove(&self, id: &RecordId) -> Result<(), ReconcileError> {
        if self.set.write().await.remove_local(id).is_some() {
            self.bump();
        }

        match self.persistence.delete(id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set.write().await.forget_deletion(id);
                let error = self.fail(e.into()).await;
                if let Err(re) = self.refetch().await {
                    log::warn!("Resync after failed delete also failed: {re}");
                }
                Err(error)
            }
        }
    }

    /// Delete in chunks of `batch_size`, then refetch.
    pub async fn remove_many(&self, ids: &[RecordId]) -> Result<usize, ReconcileError> {
        let batch_size = self.config.batch_size.max(1);
        let mut deleted = 0;
        let mut failure = None;

        for chunk in ids.chunks(batch_size) {
            match self.persistence.delete_many(chunk).await {
                Ok(n) => {
                    deleted += n;
                    let mut set = self.set.write().await;
                    for id in chunk {
                        set.remove_local(id);
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.bump();
        log::debug!("Bulk delete from '{}': {deleted}/{} rows", self.table(), ids.len());

        let error = match failure {
            Some(e) => Some(self.fail(e.into()).await),
            None => None,
        };
        let refetched = self.refetch().await;
        match error {
            Some(e) => Err(e),
            None => refetched.map(|_| deleted),
        }
    }
}

impl Reconciler<Record> {
    /// Task count per project id.
    pub async fn counts_by_project(&self) -> HashMap<String, usize> {
        let set = self.set.read().await;
        counts_by_project(set.iter())
    }

    /// Attention summary for this reconciler's user over the current tasks.
    pub async fn notification_summary(
        &self,
        projects: &[Project],
        today: NaiveDate,
    ) -> NotificationSummary {
        let set = self.set.read().await;
        notification_summary(self.identity.email.as_deref(), projects, set.iter(), today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_core::RecordPatch;

    fn task(id: &str, status: &str) -> Record {
        Record::new(id, format!("task {id}")).with_status(status)
    }

    fn set_with(records: &[Record]) -> RecordSet<Record> {
        let mut set = RecordSet::new();
        set.replace_all(records.to_vec());
        set
    }

    #[test]
    fn test_replace_all_confirms_everything() {
        let set = set_with(&[task("a", "Todo"), task("b", "Todo")]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.state_of(&"a".into()), Some(RecordState::Confirmed));
    }

    #[test]
    fn test_replace_all_drops_duplicate_ids() {
        let set = set_with(&[task("a", "Todo"), task("a", "Done")]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&"a".into()).unwrap().status, "Todo");
    }

    #[test]
    fn test_patch_then_rollback() {
        let mut set = set_with(&[task("a", "Todo")]);
        assert!(set.apply_patch(&"a".into(), &RecordPatch::new().status("Done")));
        assert_eq!(set.state_of(&"a".into()), Some(RecordState::Optimistic));
        assert_eq!(set.get(&"a".into()).unwrap().status, "Done");

        assert!(set.rollback(&"a".into()));
        assert_eq!(set.get(&"a".into()).unwrap().status, "Todo");
        assert_eq!(set.state_of(&"a".into()), Some(RecordState::Confirmed));
        assert!(!set.rollback(&"a".into()));
    }

    #[test]
    fn test_patch_unknown_id() {
        let mut set: RecordSet<Record> = RecordSet::new();
        assert!(!set.apply_patch(&"nope".into(), &RecordPatch::new().status("Done")));
    }

    #[test]
    fn test_update_for_unknown_id_upserts() {
        let mut set: RecordSet<Record> = RecordSet::new();
        assert!(set.apply_event(ChangeEvent::Update(task("x", "Done"))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_tombstone_blocks_late_events() {
        let mut set = set_with(&[task("a", "Todo")]);
        assert!(set.apply_event(ChangeEvent::Delete("a".into())));
        assert!(set.is_deleted(&"a".into()));

        assert!(!set.apply_event(ChangeEvent::Update(task("a", "Done"))));
        assert!(!set.apply_event(ChangeEvent::Insert(task("a", "Done"))));
        assert!(set.is_empty());
    }

    #[test]
    fn test_replace_all_keeps_deleted_ids_out() {
        let mut set = set_with(&[task("a", "Todo"), task("b", "Todo")]);
        set.remove_local(&"a".into());
        set.replace_all(vec![task("a", "Todo"), task("b", "Todo")]);
        assert_eq!(set.records(), vec![task("b", "Todo")]);

        set.forget_deletion(&"a".into());
        set.replace_all(vec![task("a", "Todo"), task("b", "Todo")]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_replace_all_preserves_pending_patch() {
        let mut set = set_with(&[task("a", "Todo")]);
        set.apply_patch(&"a".into(), &RecordPatch::new().status("Doing"));
        set.replace_all(vec![task("a", "Review")]);

        assert_eq!(set.get(&"a".into()).unwrap().status, "Doing");
        set.rollback(&"a".into());
        assert_eq!(set.get(&"a".into()).unwrap().status, "Review");
    }

    #[test]
    fn test_replace_since_keeps_rows_merged_during_fetch() {
        let mut set = set_with(&[task("a", "Todo"), task("b", "Todo")]);
        let mark = set.mark();

        // Snapshot taken at `mark`, then events land before it is applied.
        let snapshot = vec![task("a", "Todo"), task("b", "Todo")];
        set.apply_event(ChangeEvent::Update(task("a", "Done")));
        set.apply_event(ChangeEvent::Insert(task("c", "Todo")));
        set.apply_event(ChangeEvent::Delete("b".into()));
        set.replace_since(snapshot, mark);

        let ids: Vec<&str> = set.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(set.get(&"a".into()).unwrap().status, "Done");
    }

    #[test]
    fn test_replace_since_drops_rows_the_server_no_longer_has() {
        let mut set = set_with(&[task("a", "Todo"), task("b", "Todo")]);
        let mark = set.mark();
        set.replace_since(vec![task("b", "Review")], mark);
        assert_eq!(set.records(), vec![task("b", "Review")]);
    }

    #[test]
    fn test_delete_of_unseen_row_is_not_kept_forever() {
        let mut set: RecordSet<Record> = RecordSet::new();
        let mark = set.mark();
        assert!(!set.apply_event(ChangeEvent::Delete("ghost".into())));
        assert!(set.is_deleted(&"ghost".into()));

        // A snapshot already in flight still had the row.
        set.replace_since(vec![task("ghost", "Todo")], mark);
        assert!(set.is_empty());
        assert_eq!(set.deleted_len(), 1);

        // The next snapshot started after the delete; the marker goes.
        set.replace_all(Vec::new());
        assert_eq!(set.deleted_len(), 0);
    }

    #[test]
    fn test_held_row_keeps_its_tombstone() {
        let mut set = set_with(&[task("a", "Todo")]);
        set.remove_local(&"a".into());
        set.replace_all(Vec::new());
        set.replace_all(Vec::new());
        assert!(set.is_deleted(&"a".into()));
        assert!(!set.apply_event(ChangeEvent::Insert(task("a", "Todo"))));
    }

    #[tokio::test]
    async fn test_notification_summary_uses_own_email() {
        let table = Arc::new(crate::memory::MemoryTable::new("tasks"));
        let reconciler: Reconciler<Record> = Reconciler::new(
            table,
            Identity::new("u1", Some("ada@example.com"), None),
            ReconcilerConfig::default(),
        );
        let mut mine = task("a", "Todo");
        mine.assignee = Some("Ada@example.com".into());
        mine.due_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        reconciler.apply_event(ChangeEvent::Insert(mine)).await;
        reconciler.apply_event(ChangeEvent::Insert(task("b", "Todo"))).await;

        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let summary = reconciler.notification_summary(&[], today).await;
        assert_eq!(summary.count(tasksync_core::NoticeKind::TaskAssigned), 1);
        assert_eq!(summary.count(tasksync_core::NoticeKind::Overdue), 1);
        assert_eq!(summary.total(), 2);
    }

    #[test]
    fn test_iteration_keeps_arrival_order() {
        let mut set = set_with(&[task("b", "Todo")]);
        set.apply_event(ChangeEvent::Insert(task("a", "Todo")));
        set.apply_event(ChangeEvent::Insert(task("c", "Todo")));
        let ids: Vec<&str> = set.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
