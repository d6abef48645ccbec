//! Change feed client: one table's row changes, normalized.
//!
//! ```text
//!  ChangeFeedSource::subscribe(table)
//!        │ FeedSignal::Change(RawChange) / FeedSignal::Status(FeedStatus)
//!        ▼
//!  ChangeFeed<R> task ── normalize ──► FeedOutput::Event(ChangeEvent<R>)
//!        │          └─ malformed ────► FeedOutput::ResyncRequired(Malformed)
//!        ▼
//!  ConnectivityTracker ──────────────► FeedOutput::Connectivity(Live | Reconnecting)
//!        ▲                           └► FeedOutput::ResyncRequired(FeedInterrupted)
//!        │
//!  fallback timer (once, only while Connecting)
//! ```
//!
//! The feed never recovers gaps itself. Whenever events may have been
//! missed it asks its owner for a full refetch instead.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 11

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tasksync_core::{ChangeEvent, NormalizeError, RawChange, Row};

/// Subscription status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Connecting,
    Subscribed,
    Closed,
    Error(String),
}

impl FeedStatus {
    /// Map a backend status string. Unknown strings count as errors.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "SUBSCRIBED" | "subscribed" => Self::Subscribed,
            "CONNECTING" | "connecting" | "joining" => Self::Connecting,
            "CLOSED" | "closed" => Self::Closed,
            "CHANNEL_ERROR" | "TIMED_OUT" | "errored" => Self::Error(raw.trim().to_string()),
            other => Self::Error(format!("unknown status '{other}'")),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Change(RawChange),
    Status(FeedStatus),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("feed source is closed")]
    Closed,
}

/// A live subscription. Dropping it unsubscribes.
pub struct FeedSubscription {
    table: String,
    rx: mpsc::Receiver<FeedSignal>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl FeedSubscription {
    pub fn new(table: impl Into<String>, rx: mpsc::Receiver<FeedSignal>) -> Self {
        Self {
            table: table.into(),
            rx,
            on_drop: None,
        }
    }

    /// Run `f` when the subscription is dropped.
    pub fn on_unsubscribe(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn recv(&mut self) -> Option<FeedSignal> {
        self.rx.recv().await
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// Anything that can deliver a table's change stream.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn subscribe(&self, table: &str) -> Result<FeedSubscription, FeedError>;
}

// ───────────────────────────────────────────────────────────────────
// Connectivity
// ───────────────────────────────────────────────────────────────────

/// What the view shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Reconnecting,
    Live,
}

/// Result of feeding one status into the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusOutcome {
    /// New connectivity, if it changed
    pub connectivity: Option<Connectivity>,
    /// Events may have been missed
    pub resync: bool,
}

/// Status state machine, separate from any timer or task.
#[derive(Debug, Clone)]
pub struct ConnectivityTracker {
    status: FeedStatus,
    connectivity: Connectivity,
    fallback_fired: bool,
    interrupted: bool,
}

impl ConnectivityTracker {
    pub fn new() -> Self {
        Self {
            status: FeedStatus::Connecting,
            connectivity: Connectivity::Reconnecting,
            fallback_fired: false,
            interrupted: false,
        }
    }

    pub fn status(&self) -> &FeedStatus {
        &self.status
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn on_status(&mut self, status: FeedStatus) -> StatusOutcome {
        let mut outcome = StatusOutcome::default();
        let target = match &status {
            FeedStatus::Subscribed => {
                outcome.resync = self.interrupted;
                self.interrupted = false;
                Connectivity::Live
            }
            FeedStatus::Closed | FeedStatus::Error(_) => {
                outcome.resync = true;
                self.interrupted = true;
                Connectivity::Reconnecting
            }
            FeedStatus::Connecting => {
                if self.status == FeedStatus::Subscribed {
                    self.interrupted = true;
                }
                Connectivity::Reconnecting
            }
        };
        self.status = status;
        if target != self.connectivity {
            self.connectivity = target;
            outcome.connectivity = Some(target);
        }
        outcome
    }

    /// The fallback deadline passed. Flips to Live at most once, and only
    /// while the backend still says Connecting.
    pub fn on_fallback(&mut self) -> Option<Connectivity> {
        if self.fallback_fired || self.status != FeedStatus::Connecting {
            return None;
        }
        self.fallback_fired = true;
        if self.connectivity == Connectivity::Live {
            return None;
        }
        self.connectivity = Connectivity::Live;
        Some(Connectivity::Live)
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// ChangeFeed
// ───────────────────────────────────────────────────────────────────

/// Feed tuning.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// How long `Connecting` may last before we claim Live anyway
    pub fallback_timeout: Duration,
    /// Output buffer between the feed task and its owner
    pub buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            fallback_timeout: Duration::from_millis(1500),
            buffer: 256,
        }
    }
}

impl FeedConfig {
    pub fn for_testing() -> Self {
        Self {
            fallback_timeout: Duration::from_millis(100),
            buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResyncReason {
    /// The subscription failed or closed
    FeedInterrupted,
    /// A payload could not be normalized
    Malformed(NormalizeError),
    /// The source stopped delivering
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutput<R> {
    Event(ChangeEvent<R>),
    Connectivity(Connectivity),
    ResyncRequired(ResyncReason),
}

/// A running feed for one table.
pub struct ChangeFeed<R> {
    table: String,
    rx: mpsc::Receiver<FeedOutput<R>>,
    connectivity: watch::Receiver<Connectivity>,
    task: JoinHandle<()>,
}

impl<R: Row> ChangeFeed<R> {
    pub fn spawn(subscription: FeedSubscription, config: FeedConfig) -> Self {
        let table = subscription.table().to_string();
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let (conn_tx, conn_rx) = watch::channel(Connectivity::Reconnecting);
        let task = tokio::spawn(drive_feed(subscription, config, tx, conn_tx));
        Self {
            table,
            rx,
            connectivity: conn_rx,
            task,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Next output. `None` once the feed task has finished.
    pub async fn next(&mut self) -> Option<FeedOutput<R>> {
        self.rx.recv().await
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }
}

impl<R> Drop for ChangeFeed<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drive_feed<R: Row>(
    mut subscription: FeedSubscription,
    config: FeedConfig,
    out: mpsc::Sender<FeedOutput<R>>,
    conn_tx: watch::Sender<Connectivity>,
) {
    let table = subscription.table().to_string();
    let mut tracker = ConnectivityTracker::new();
    let fallback = tokio::time::sleep(config.fallback_timeout);
    tokio::pin!(fallback);
    let mut fallback_armed = true;

    loop {
        let output = tokio::select! {
            _ = &mut fallback, if fallback_armed => {
                fallback_armed = false;
                match tracker.on_fallback() {
                    Some(c) => {
                        log::info!("Feed '{table}' still connecting after {:?}; assuming live", config.fallback_timeout);
                        conn_tx.send_replace(c);
                        vec![FeedOutput::Connectivity(c)]
                    }
                    None => continue,
                }
            }

            signal = subscription.recv() => match signal {
                Some(FeedSignal::Change(raw)) => match ChangeEvent::<R>::from_raw(&raw) {
                    Ok(event) => vec![FeedOutput::Event(event)],
                    Err(e) => {
                        log::warn!("Dropping malformed {} on '{table}': {e}", raw.kind.as_str());
                        vec![FeedOutput::ResyncRequired(ResyncReason::Malformed(e))]
                    }
                },
                Some(FeedSignal::Status(status)) => {
                    log::debug!("Feed '{table}' status: {status:?}");
                    let outcome = tracker.on_status(status);
                    let mut outputs = Vec::with_capacity(2);
                    if let Some(c) = outcome.connectivity {
                        conn_tx.send_replace(c);
                        outputs.push(FeedOutput::Connectivity(c));
                    }
                    if outcome.resync {
                        outputs.push(FeedOutput::ResyncRequired(ResyncReason::FeedInterrupted));
                    }
                    outputs
                }
                None => {
                    log::info!("Feed '{table}' ended");
                    conn_tx.send_replace(Connectivity::Reconnecting);
                    let _ = out.send(FeedOutput::Connectivity(Connectivity::Reconnecting)).await;
                    let _ = out.send(FeedOutput::ResyncRequired(ResyncReason::Ended)).await;
                    return;
                }
            },
        };

        for item in output {
            if out.send(item).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasksync_core::{Record, RecordId};
    use tokio::time::{timeout, Instant};

    fn feed_pair() -> (mpsc::Sender<FeedSignal>, ChangeFeed<Record>) {
        let (tx, rx) = mpsc::channel(16);
        let feed = ChangeFeed::spawn(FeedSubscription::new("tasks", rx), FeedConfig::default());
        (tx, feed)
    }

    fn insert(id: &str) -> RawChange {
        let row = json!({"id": id, "content": "Write docs", "status": "Todo"});
        RawChange::insert(row.as_object().cloned().unwrap())
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(FeedStatus::parse("SUBSCRIBED"), FeedStatus::Subscribed);
        assert_eq!(FeedStatus::parse("closed"), FeedStatus::Closed);
        assert!(FeedStatus::parse("TIMED_OUT").is_failure());
        assert!(FeedStatus::parse("CHANNEL_ERROR").is_failure());
        assert!(matches!(FeedStatus::parse("weird"), FeedStatus::Error(_)));
    }

    #[test]
    fn test_tracker_subscribed_goes_live_without_resync() {
        let mut tracker = ConnectivityTracker::new();
        let outcome = tracker.on_status(FeedStatus::Subscribed);
        assert_eq!(outcome.connectivity, Some(Connectivity::Live));
        assert!(!outcome.resync);
    }

    #[test]
    fn test_tracker_error_demands_resync() {
        let mut tracker = ConnectivityTracker::new();
        tracker.on_status(FeedStatus::Subscribed);

        let outcome = tracker.on_status(FeedStatus::Error("CHANNEL_ERROR".into()));
        assert_eq!(outcome.connectivity, Some(Connectivity::Reconnecting));
        assert!(outcome.resync);

        // Coming back after a failure also resyncs
        let outcome = tracker.on_status(FeedStatus::Subscribed);
        assert_eq!(outcome.connectivity, Some(Connectivity::Live));
        assert!(outcome.resync);
    }

    #[test]
    fn test_tracker_fallback_fires_once() {
        let mut tracker = ConnectivityTracker::new();
        assert_eq!(tracker.on_fallback(), Some(Connectivity::Live));
        assert_eq!(tracker.on_fallback(), None);

        let outcome = tracker.on_status(FeedStatus::Error("x".into()));
        assert_eq!(outcome.connectivity, Some(Connectivity::Reconnecting));
        tracker.on_status(FeedStatus::Connecting);
        assert_eq!(tracker.on_fallback(), None);
        assert_eq!(tracker.connectivity(), Connectivity::Reconnecting);
    }

    #[test]
    fn test_tracker_fallback_ignored_after_subscribed() {
        let mut tracker = ConnectivityTracker::new();
        tracker.on_status(FeedStatus::Subscribed);
        assert_eq!(tracker.on_fallback(), None);
    }

    #[tokio::test]
    async fn test_feed_normalizes_changes() {
        let (tx, mut feed) = feed_pair();
        tx.send(FeedSignal::Status(FeedStatus::Subscribed)).await.unwrap();
        tx.send(FeedSignal::Change(insert("t1"))).await.unwrap();

        assert_eq!(
            feed.next().await,
            Some(FeedOutput::Connectivity(Connectivity::Live))
        );
        match feed.next().await {
            Some(FeedOutput::Event(ChangeEvent::Insert(record))) => {
                assert_eq!(record.id, RecordId::from("t1"));
                assert_eq!(record.content, "Write docs");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(feed.connectivity(), Connectivity::Live);
    }

    #[tokio::test]
    async fn test_feed_malformed_payload_requests_resync() {
        let (tx, mut feed) = feed_pair();
        let bad = RawChange::insert(json!({"content": "no id"}).as_object().cloned().unwrap());
        tx.send(FeedSignal::Change(bad)).await.unwrap();
        tx.send(FeedSignal::Change(insert("t2"))).await.unwrap();

        assert!(matches!(
            feed.next().await,
            Some(FeedOutput::ResyncRequired(ResyncReason::Malformed(_)))
        ));
        // Stream keeps going after the bad payload
        assert!(matches!(
            feed.next().await,
            Some(FeedOutput::Event(ChangeEvent::Insert(_)))
        ));
    }

    #[tokio::test]
    async fn test_feed_end_requests_resync() {
        let (tx, mut feed) = feed_pair();
        drop(tx);
        assert_eq!(
            feed.next().await,
            Some(FeedOutput::Connectivity(Connectivity::Reconnecting))
        );
        assert_eq!(
            feed.next().await,
            Some(FeedOutput::ResyncRequired(ResyncReason::Ended))
        );
        assert_eq!(feed.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_fallback_then_error() {
        let (tx, mut feed) = feed_pair();
        tx.send(FeedSignal::Status(FeedStatus::Connecting)).await.unwrap();

        let started = Instant::now();
        assert_eq!(
            feed.next().await,
            Some(FeedOutput::Connectivity(Connectivity::Live))
        );
        assert!(started.elapsed() >= Duration::from_millis(1500));

        tx.send(FeedSignal::Status(FeedStatus::Error("CHANNEL_ERROR".into())))
            .await
            .unwrap();
        assert_eq!(
            feed.next().await,
            Some(FeedOutput::Connectivity(Connectivity::Reconnecting))
        );
        assert_eq!(
            feed.next().await,
            Some(FeedOutput::ResyncRequired(ResyncReason::FeedInterrupted))
        );

        // No second fallback flip
        assert!(timeout(Duration::from_secs(10), feed.next()).await.is_err());
        assert_eq!(feed.connectivity(), Connectivity::Reconnecting);
    }

    #[tokio::test]
    async fn test_subscription_drop_runs_unsubscribe() {
        let (_tx, rx) = mpsc::channel(1);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let sub = FeedSubscription::new("tasks", rx).on_unsubscribe(move || {
            let _ = done_tx.send(());
        });
        drop(sub);
        assert_eq!(done_rx.recv().await, Some(()));
    }
}
