//! In-memory tables that behave like the hosted backend.
//!
//! Each table assigns ids and `updated_at`, commits under one write lock,
//! and publishes a full-row [`RawChange`] for every commit while still
//! holding that lock, so subscribers see changes to a row in commit order.
//! An optional [`RowStore`] receives every commit first.
//!
//! Bulk writes are all-or-nothing: a batch is validated before anything
//! is committed, and reaches the store as one write. Ids of deleted rows
//! are retired and never accepted again.
//!
//! ```text
//!  insert/update/delete ──► RowStore (optional) ──► rows map ──► broadcast<RawChange>
//!                                                                 │
//!                              MemoryBackend::subscribe(table) ◄──┘
//! ```

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

use tasksync_core::{normalize, RawChange, RawRow, RecordId};

use crate::feed::{ChangeFeedSource, FeedError, FeedSignal, FeedStatus, FeedSubscription};
use crate::persistence::{Persistence, PersistenceError};
use crate::storage::{RowStore, StoreError, StoredRow};

/// Default change buffer per table.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

#[derive(Default)]
struct TableState {
    rows: HashMap<RecordId, StoredRow>,
    /// Ids of deleted rows
    retired: HashSet<RecordId>,
}

pub struct MemoryTable {
    name: String,
    state: RwLock<TableState>,
    changes: broadcast::Sender<RawChange>,
    /// Insertion order, also the store's sequence
    next_seq: AtomicU64,
    store: Option<Arc<RowStore>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_store(name, None, DEFAULT_CHANGE_CAPACITY)
    }

    pub fn with_store(
        name: impl Into<String>,
        store: Option<Arc<RowStore>>,
        change_capacity: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            name: name.into(),
            state: RwLock::new(TableState::default()),
            changes,
            next_seq: AtomicU64::new(1),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive every change committed from now on.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RawChange> {
        self.changes.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rows.is_empty()
    }

    pub async fn get(&self, id: &RecordId) -> Option<RawRow> {
        self.state.read().await.rows.get(id).map(|r| r.row.clone())
    }

    /// Whether `id` belonged to a row that was deleted.
    pub async fn is_retired(&self, id: &RecordId) -> bool {
        self.state.read().await.retired.contains(id)
    }

    /// Load rows and retired ids without emitting changes. Used on recovery.
    pub async fn restore(
        &self,
        stored: Vec<StoredRow>,
        retired: Vec<RecordId>,
    ) -> Result<usize, PersistenceError> {
        let mut state = self.state.write().await;
        let mut max_seq = self.next_seq.load(Ordering::SeqCst).saturating_sub(1);
        let mut restored = 0;
        for entry in stored {
            let id = normalize::id_field(&entry.row)?;
            max_seq = max_seq.max(entry.seq);
            state.rows.insert(id, entry);
            restored += 1;
        }
        state.retired.extend(retired);
        self.next_seq.store(max_seq + 1, Ordering::SeqCst);
        Ok(restored)
    }

    fn now() -> Value {
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    fn emit(&self, change: RawChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }

    /// Validate, stamp, store and publish a batch. Nothing is committed
    /// unless every row is accepted.
    fn insert_locked(
        &self,
        state: &mut TableState,
        batch: Vec<RawRow>,
    ) -> Result<Vec<RawRow>, PersistenceError> {
        let mut accepted: Vec<(RecordId, RawRow)> = Vec::with_capacity(batch.len());
        let mut seen = HashSet::with_capacity(batch.len());
        for row in batch {
            let id = match normalize::id_field(&row) {
                Ok(id) => id,
                Err(_) => RecordId::new(Uuid::new_v4().to_string()),
            };
            if state.retired.contains(&id) {
                return Err(PersistenceError::Rejected(format!("id {id} was already used")));
            }
            if state.rows.contains_key(&id) || !seen.insert(id.clone()) {
                return Err(PersistenceError::Rejected(format!("duplicate id {id}")));
            }
            accepted.push((id, row));
        }

        let now = Self::now();
        let mut prepared = Vec::with_capacity(accepted.len());
        for (id, mut row) in accepted {
            row.insert("id".into(), Value::String(id.to_string()));
            row.entry("created_at").or_insert_with(|| now.clone());
            row.insert("updated_at".into(), now.clone());
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            prepared.push((id, seq, row));
        }

        if let Some(store) = &self.store {
            store.put_rows(&self.name, &prepared)?;
        }

        let mut committed = Vec::with_capacity(prepared.len());
        for (id, seq, row) in prepared {
            state.rows.insert(id, StoredRow { seq, row: row.clone() });
            self.emit(RawChange::insert(row.clone()));
            committed.push(row);
        }
        Ok(committed)
    }

    /// Delete whichever of `ids` exist, as one commit. Returns how many.
    fn delete_locked(
        &self,
        state: &mut TableState,
        ids: &[RecordId],
    ) -> Result<usize, PersistenceError> {
        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            if state.rows.contains_key(id) && seen.insert(id) {
                doomed.push(id.clone());
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        if let Some(store) = &self.store {
            store.delete_rows(&self.name, &doomed)?;
        }
        for id in &doomed {
            if let Some(old) = state.rows.remove(id) {
                self.emit(RawChange::delete(old.row));
            }
            state.retired.insert(id.clone());
        }
        Ok(doomed.len())
    }
}

#[async_trait]
impl Persistence for MemoryTable {
    fn table(&self) -> &str {
        &self.name
    }

    async fn fetch_all(&self) -> Result<Vec<RawRow>, PersistenceError> {
        let state = self.state.read().await;
        let mut stored: Vec<&StoredRow> = state.rows.values().collect();
        stored.sort_by_key(|r| r.seq);
        Ok(stored.into_iter().map(|r| r.row.clone()).collect())
    }

    async fn insert(&self, row: RawRow) -> Result<RawRow, PersistenceError> {
        let mut state = self.state.write().await;
        self.insert_locked(&mut state, vec![row])?
            .pop()
            .ok_or_else(|| PersistenceError::Rejected("nothing inserted".into()))
    }

    async fn insert_many(&self, batch: Vec<RawRow>) -> Result<usize, PersistenceError> {
        let mut state = self.state.write().await;
        Ok(self.insert_locked(&mut state, batch)?.len())
    }

    async fn update(&self, id: &RecordId, patch: RawRow) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let Some(current) = state.rows.get(id) else {
            return Err(PersistenceError::NotFound(id.clone()));
        };

        let mut merged = current.row.clone();
        let seq = current.seq;
        for (key, value) in patch {
            if key != "id" {
                merged.insert(key, value);
            }
        }
        merged.insert("updated_at".into(), Self::now());

        if let Some(store) = &self.store {
            store.put_row(&self.name, id, seq, &merged)?;
        }
        state.rows.insert(id.clone(), StoredRow { seq, row: merged.clone() });
        self.emit(RawChange::update(merged));
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        self.delete_locked(&mut state, std::slice::from_ref(id))?;
        Ok(())
    }

    async fn delete_many(&self, ids: &[RecordId]) -> Result<usize, PersistenceError> {
        let mut state = self.state.write().await;
        self.delete_locked(&mut state, ids)
    }
}

// ───────────────────────────────────────────────────────────────────
// Backend
// ───────────────────────────────────────────────────────────────────

/// A fixed set of named tables, plus their change feeds.
pub struct MemoryBackend {
    tables: HashMap<String, Arc<MemoryTable>>,
    store: Option<Arc<RowStore>>,
    feed_buffer: usize,
}

impl MemoryBackend {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(tables, None, DEFAULT_CHANGE_CAPACITY)
    }

    /// Tables that write through to `store`. Call [`recover`](Self::recover)
    /// to load what the store already holds.
    pub fn with_store<I, S>(tables: I, store: Arc<RowStore>, change_capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(tables, Some(store), change_capacity)
    }

    fn build<I, S>(tables: I, store: Option<Arc<RowStore>>, change_capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables = tables
            .into_iter()
            .map(Into::into)
            .map(|name: String| {
                let table = MemoryTable::with_store(name.clone(), store.clone(), change_capacity);
                (name, Arc::new(table))
            })
            .collect();
        Self {
            tables,
            store,
            feed_buffer: 256,
        }
    }

    pub fn table(&self, name: &str) -> Result<Arc<MemoryTable>, PersistenceError> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| PersistenceError::UnknownTable(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn store(&self) -> Option<&Arc<RowStore>> {
        self.store.as_ref()
    }

    /// Load persisted rows into every table. Returns rows restored.
    pub async fn recover(&self) -> Result<usize, PersistenceError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut total = 0;
        for (name, table) in &self.tables {
            let rows = match store.load_table(name) {
                Ok(rows) => rows,
                Err(StoreError::TableNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let retired = store.load_retired(name)?;
            let restored = table.restore(rows, retired).await?;
            if restored > 0 {
                log::info!("Recovered {restored} rows for table '{name}'");
            }
            total += restored;
        }
        Ok(total)
    }
}

#[async_trait]
impl ChangeFeedSource for MemoryBackend {
    async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError> {
        let source = self
            .table(table)
            .map_err(|_| FeedError::UnknownTable(table.to_string()))?;
        let mut changes = source.subscribe_changes();
        let (tx, rx) = mpsc::channel(self.feed_buffer);
        let name = table.to_string();

        let task = tokio::spawn(async move {
            if tx.send(FeedSignal::Status(FeedStatus::Subscribed)).await.is_err() {
                return;
            }
            loop {
                let signals = tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => vec![FeedSignal::Change(change)],
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Feed for '{name}' lagged by {n} changes");
                            vec![
                                FeedSignal::Status(FeedStatus::Error(format!("lagged by {n}"))),
                                FeedSignal::Status(FeedStatus::Subscribed),
                            ]
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx.send(FeedSignal::Status(FeedStatus::Closed)).await;
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                };
                for signal in signals {
                    if tx.send(signal).await.is_err() {
                        return;
                    }
                }
            }
        });

        let abort = task.abort_handle();
        Ok(FeedSubscription::new(table, rx).on_unsubscribe(move || abort.abort()))
    }
}
