//! A live table: reconciler + change feed + connectivity, wired together.
//!
//! ```text
//!  open(): subscribe ─► initial refetch ─► spawn pump
//!
//!  pump:   Event ────────────► reconciler.apply_event
//!          Connectivity ─────► watch (view shows "reconnecting")
//!          ResyncRequired ───► reconciler.refetch
//!          feed ended ───────► wait, resubscribe, refetch
//! ```
//!
//! Subscribing before the first fetch means nothing committed between the
//! two is lost; duplicates are suppressed by the reconciler.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tasksync_core::{Identity, Row};

use crate::feed::{ChangeFeed, ChangeFeedSource, Connectivity, FeedConfig, FeedOutput};
use crate::persistence::Persistence;
use crate::reconciler::{ReconcileError, Reconciler, ReconcilerConfig};

#[derive(Debug, Clone)]
pub struct LiveTableConfig {
    pub feed: FeedConfig,
    pub reconciler: ReconcilerConfig,
    /// Pause before subscribing again after the feed ends
    pub resubscribe_delay: Duration,
}

impl Default for LiveTableConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            reconciler: ReconcilerConfig::default(),
            resubscribe_delay: Duration::from_secs(2),
        }
    }
}

impl LiveTableConfig {
    pub fn for_testing() -> Self {
        Self {
            feed: FeedConfig::for_testing(),
            reconciler: ReconcilerConfig::default(),
            resubscribe_delay: Duration::from_millis(50),
        }
    }
}

pub struct LiveTable<R: Row> {
    table: String,
    reconciler: Arc<Reconciler<R>>,
    connectivity: watch::Receiver<Connectivity>,
    task: JoinHandle<()>,
}

impl<R: Row> LiveTable<R> {
    /// Subscribe, load, and start merging. Never fails: a feed that cannot
    /// be subscribed shows as Reconnecting and is retried; a failed first
    /// load is left in `last_error`.
    pub async fn open(
        table: &str,
        persistence: Arc<dyn Persistence>,
        source: Arc<dyn ChangeFeedSource>,
        identity: Identity,
        config: LiveTableConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            persistence,
            identity,
            config.reconciler.clone(),
        ));
        let (conn_tx, conn_rx) = watch::channel(Connectivity::Reconnecting);

        let feed = subscribe::<R>(source.as_ref(), table, &config.feed).await;
        if let Err(e) = reconciler.refetch().await {
            log::warn!("Initial load of '{table}' failed: {e}");
        }

        let task = tokio::spawn(pump(
            table.to_string(),
            source,
            reconciler.clone(),
            feed,
            conn_tx,
            config,
        ));

        Self {
            table: table.to_string(),
            reconciler,
            connectivity: conn_rx,
            task,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<R>> {
        &self.reconciler
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }

    /// The window regained focus. Events may have been missed while the
    /// tab was in the background, so reload regardless of feed state.
    pub async fn on_window_focus(&self) -> Result<usize, ReconcileError> {
        log::debug!("Refetching '{}' on focus", self.table);
        self.reconciler.refetch().await
    }

    /// Stop the feed. The reconciler stays usable.
    pub fn close(self) {
        self.task.abort();
    }
}

impl<R: Row> Drop for LiveTable<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn subscribe<R: Row>(
    source: &dyn ChangeFeedSource,
    table: &str,
    config: &FeedConfig,
) -> Option<ChangeFeed<R>> {
    match source.subscribe(table).await {
        Ok(subscription) => Some(ChangeFeed::spawn(subscription, config.clone())),
        Err(e) => {
            log::warn!("Could not subscribe to '{table}': {e}");
            None
        }
    }
}

async fn pump<R: Row>(
    table: String,
    source: Arc<dyn ChangeFeedSource>,
    reconciler: Arc<Reconciler<R>>,
    mut feed: Option<ChangeFeed<R>>,
    conn_tx: watch::Sender<Connectivity>,
    config: LiveTableConfig,
) {
    loop {
        if let Some(mut active) = feed.take() {
            while let Some(output) = active.next().await {
                match output {
                    FeedOutput::Event(event) => {
                        reconciler.apply_event(event).await;
                    }
                    FeedOutput::Connectivity(c) => {
                        conn_tx.send_replace(c);
                    }
                    FeedOutput::ResyncRequired(reason) => {
                        log::info!("Resyncing '{table}': {reason:?}");
                        if let Err(e) = reconciler.refetch().await {
                            log::warn!("Resync of '{table}' failed: {e}");
                        }
                    }
                }
            }
        }

        conn_tx.send_replace(Connectivity::Reconnecting);
        tokio::time::sleep(config.resubscribe_delay).await;
        feed = subscribe::<R>(source.as_ref(), &table, &config.feed).await;
        if feed.is_some() {
            if let Err(e) = reconciler.refetch().await {
                log::warn!("Reload of '{table}' after resubscribe failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedError, FeedSignal, FeedSubscription};
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tasksync_core::{Record, RecordId};
    use tokio::time::{timeout, Duration};

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(2), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_open_loads_and_follows_feed() {
        let backend = Arc::new(MemoryBackend::new(["tasks"]));
        let table = backend.table("tasks").unwrap();
        table
            .insert(json!({"id": "t1", "content": "A"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let live: LiveTable<Record> = LiveTable::open(
            "tasks",
            table.clone(),
            backend.clone(),
            Identity::anonymous(),
            LiveTableConfig::for_testing(),
        )
        .await;
        assert_eq!(live.reconciler().len().await, 1);

        let mut connectivity = live.watch_connectivity();
        timeout(Duration::from_secs(1), connectivity.wait_for(|c| *c == Connectivity::Live))
            .await
            .unwrap()
            .unwrap();

        table
            .insert(json!({"id": "t2", "content": "B"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let reconciler = live.reconciler().clone();
        wait_for(|| {
            let r = reconciler.clone();
            async move { r.record(&RecordId::from("t2")).await.is_some() }
        })
        .await;
    }

    /// Subscribes fine, then never says anything.
    #[derive(Default)]
    struct SilentSource {
        senders: std::sync::Mutex<Vec<mpsc::Sender<FeedSignal>>>,
    }

    #[async_trait::async_trait]
    impl ChangeFeedSource for SilentSource {
        async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError> {
            let (tx, rx) = mpsc::channel(1);
            self.senders.lock().unwrap().push(tx);
            Ok(FeedSubscription::new(table, rx))
        }
    }

    #[tokio::test]
    async fn test_focus_refetch_picks_up_missed_rows() {
        let backend = MemoryBackend::new(["tasks"]);
        let table = backend.table("tasks").unwrap();
        let live: LiveTable<Record> = LiveTable::open(
            "tasks",
            table.clone(),
            Arc::new(SilentSource::default()),
            Identity::anonymous(),
            LiveTableConfig::for_testing(),
        )
        .await;
        assert_eq!(live.reconciler().len().await, 0);

        table
            .insert(json!({"id": "t9"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(live.on_window_focus().await.unwrap(), 1);
        assert!(live.reconciler().record(&RecordId::from("t9")).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_table_shows_reconnecting() {
        let backend = Arc::new(MemoryBackend::new(["tasks"]));
        let table = backend.table("tasks").unwrap();
        let live: LiveTable<Record> = LiveTable::open(
            "projects",
            table,
            backend,
            Identity::anonymous(),
            LiveTableConfig::for_testing(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(live.connectivity(), Connectivity::Reconnecting);
    }
}
