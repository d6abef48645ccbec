//! Presence: who is online, and which row each of them is editing.
//!
//! ## Architecture
//!
//! ```text
//! cell focus / blur
//!       │
//!       ▼
//! PresenceSession::set_editing_row(Some(id) | None)
//!       │  EditingClaim { clientId, rowId, email, name }
//!       ▼   (channel broadcast, never echoed)
//! remote PresenceSession driver
//!       │
//!       ▼
//! PresenceTracker::apply_claim()   last claim per client wins
//!       │
//!       ▼
//! watch<PresenceView> ──► online_users, editing_by_others, editing_by_user
//! ```
//!
//! The online list comes from the channel's presence state. Right after
//! subscribing that state may not include everyone yet, so the session
//! re-reads it a couple of times shortly after joining
//! (`PresenceConfig::resync_delays`). Presence is a liveness hint: a peer
//! lost to a network partition disappears only when the hub notices.
//!
//! One user with two tabs is two client keys and two online entries.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tasksync_core::{Identity, RecordId};

use crate::channel::{
    ChannelEvent, ChannelHub, ChannelStatus, ClientKey, PresenceChannel, PresenceEntry,
};

/// Channel shared by everyone looking at the task table.
pub const PRESENCE_CHANNEL: &str = "tasks-presence";

/// Broadcast event carrying an [`EditingClaim`].
pub const EDITING_EVENT: &str = "editing";

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// "Client X is editing row Y" (or nothing, when `row_id` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditingClaim {
    pub client_id: ClientKey,
    pub row_id: Option<RecordId>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingUser {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Everything the view renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceView {
    pub online_users: Vec<PresenceEntry>,
    pub editing_by_others: BTreeSet<RecordId>,
    pub editing_by_user: BTreeMap<RecordId, EditingUser>,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Presence state for one client, fed by channel events.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    me: ClientKey,
    /// Latest claim per other client
    claims: BTreeMap<ClientKey, EditingClaim>,
    online: BTreeMap<ClientKey, PresenceEntry>,
    own_entry: Option<PresenceEntry>,
}

impl PresenceTracker {
    pub fn new(me: ClientKey) -> Self {
        Self {
            me,
            claims: BTreeMap::new(),
            online: BTreeMap::new(),
            own_entry: None,
        }
    }

    pub fn client_key(&self) -> &ClientKey {
        &self.me
    }

    pub fn is_tracked(&self) -> bool {
        self.own_entry.is_some()
    }

    /// Replace the claim from the sending client. Our own claims are ignored.
    pub fn apply_claim(&mut self, claim: EditingClaim) -> bool {
        if claim.client_id == self.me {
            return false;
        }
        if self.claims.get(&claim.client_id) == Some(&claim) {
            return false;
        }
        self.claims.insert(claim.client_id.clone(), claim);
        true
    }

    /// Full membership snapshot. An empty one while we are tracked is a
    /// snapshot that is not ready yet, and is ignored.
    pub fn apply_sync(&mut self, entries: Vec<PresenceEntry>) -> bool {
        if entries.is_empty() && self.is_tracked() {
            return false;
        }
        let mut online: BTreeMap<ClientKey, PresenceEntry> = entries
            .into_iter()
            .map(|e| (e.client_key.clone(), e))
            .collect();
        if let Some(own) = &self.own_entry {
            online.entry(self.me.clone()).or_insert_with(|| own.clone());
        }
        let changed = online != self.online;
        self.online = online;
        changed
    }

    pub fn apply_join(&mut self, entries: Vec<PresenceEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            if self.online.get(&entry.client_key) != Some(&entry) {
                self.online.insert(entry.client_key.clone(), entry);
                changed = true;
            }
        }
        changed
    }

    /// Members left. Their claims go with them.
    pub fn apply_leave(&mut self, entries: Vec<PresenceEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            if entry.client_key == self.me {
                continue;
            }
            changed |= self.online.remove(&entry.client_key).is_some();
            changed |= self.claims.remove(&entry.client_key).is_some();
        }
        changed
    }

    /// We are tracked; show ourselves without waiting for the echo.
    pub fn mark_tracked(&mut self, entry: PresenceEntry) {
        self.online.insert(self.me.clone(), entry.clone());
        self.own_entry = Some(entry);
    }

    /// The channel went away. Nobody is known to be online.
    pub fn reset_online(&mut self) {
        self.online.clear();
        self.claims.clear();
        self.own_entry = None;
    }

    pub fn view(&self) -> PresenceView {
        let mut editing_by_others = BTreeSet::new();
        let mut editing_by_user = BTreeMap::new();
        for claim in self.claims.values() {
            if let Some(row) = &claim.row_id {
                editing_by_others.insert(row.clone());
                editing_by_user.insert(
                    row.clone(),
                    EditingUser {
                        email: claim.email.clone(),
                        name: claim.name.clone(),
                    },
                );
            }
        }
        PresenceView {
            online_users: self.online.values().cloned().collect(),
            editing_by_others,
            editing_by_user,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// Presence tuning.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub channel: String,
    /// Extra presence reads after subscribing, measured from the subscribe
    pub resync_delays: Vec<Duration>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            channel: PRESENCE_CHANNEL.to_string(),
            resync_delays: vec![Duration::from_millis(80), Duration::from_millis(350)],
        }
    }
}

impl PresenceConfig {
    pub fn for_testing(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }
}

/// One client's membership in the presence channel.
pub struct PresenceSession {
    key: ClientKey,
    identity: Identity,
    channel: Option<Arc<dyn PresenceChannel>>,
    view: watch::Receiver<PresenceView>,
    editing: Mutex<Option<RecordId>>,
    task: Option<JoinHandle<()>>,
}

impl PresenceSession {
    /// Join under a fresh client key.
    pub async fn join(hub: &dyn ChannelHub, identity: Identity, config: PresenceConfig) -> Self {
        Self::join_as(hub, ClientKey::generate(), identity, config).await
    }

    /// Join under a given client key. If the channel cannot be joined the
    /// session still works, it just never shows anyone online.
    pub async fn join_as(
        hub: &dyn ChannelHub,
        key: ClientKey,
        identity: Identity,
        config: PresenceConfig,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(PresenceView::default());

        let (channel, task) = match hub.join(&config.channel, &key).await {
            Ok((channel, events)) => {
                let entry = PresenceEntry {
                    client_key: key.clone(),
                    email: identity.email.clone(),
                    name: identity.display_name.clone(),
                    user_id: (!identity.id.is_empty()).then(|| identity.id.clone()),
                };
                let task = tokio::spawn(drive_presence(
                    channel.clone(),
                    events,
                    PresenceTracker::new(key.clone()),
                    entry,
                    config.resync_delays,
                    view_tx,
                ));
                (Some(channel), Some(task))
            }
            Err(e) => {
                log::warn!("Presence unavailable on '{}': {e}", config.channel);
                (None, None)
            }
        };

        Self {
            key,
            identity,
            channel,
            view: view_rx,
            editing: Mutex::new(None),
            task,
        }
    }

    pub fn client_key(&self) -> &ClientKey {
        &self.key
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn view(&self) -> PresenceView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PresenceView> {
        self.view.clone()
    }

    pub fn online_users(&self) -> Vec<PresenceEntry> {
        self.view.borrow().online_users.clone()
    }

    pub fn editing_by_others(&self) -> BTreeSet<RecordId> {
        self.view.borrow().editing_by_others.clone()
    }

    pub fn editing_by_user(&self) -> BTreeMap<RecordId, EditingUser> {
        self.view.borrow().editing_by_user.clone()
    }

    /// Tell everyone else which row we are editing. `None` on blur.
    pub async fn set_editing_row(&self, row: Option<RecordId>) {
        let Some(channel) = &self.channel else {
            return;
        };
        let claim = EditingClaim {
            client_id: self.key.clone(),
            row_id: row.clone(),
            email: self.identity.email.clone(),
            name: self.identity.display_name.clone(),
        };
        let payload = match serde_json::to_value(&claim) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode editing claim: {e}");
                return;
            }
        };
        *self.editing.lock().await = row;
        if let Err(e) = channel.broadcast(EDITING_EVENT, payload).await {
            log::warn!("Editing claim from {} not sent: {e}", self.key);
        }
    }

    /// Best effort: clear our claim, untrack, leave.
    pub async fn leave(mut self) {
        let editing = self.editing.lock().await.is_some();
        if editing {
            self.set_editing_row(None).await;
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.untrack().await {
                log::debug!("Untrack on leave failed: {e}");
            }
            if let Err(e) = channel.leave().await {
                log::debug!("Leave failed: {e}");
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn drive_presence(
    channel: Arc<dyn PresenceChannel>,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut tracker: PresenceTracker,
    entry: PresenceEntry,
    resync_delays: Vec<Duration>,
    view_tx: watch::Sender<PresenceView>,
) {
    let mut resyncs: VecDeque<Instant> = VecDeque::new();

    loop {
        let next_resync = resyncs.front().copied();
        let changed = tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    log::debug!("Presence events for {} ended", tracker.client_key());
                    tracker.reset_online();
                    view_tx.send_replace(tracker.view());
                    return;
                };
                match event {
                    ChannelEvent::Status(ChannelStatus::Subscribed) => {
                        match channel.track(entry.clone()).await {
                            Ok(()) => {
                                tracker.mark_tracked(entry.clone());
                                let now = Instant::now();
                                resyncs = resync_delays.iter().map(|d| now + *d).collect();
                            }
                            Err(e) => {
                                log::warn!("Presence track failed: {e}");
                                tracker.reset_online();
                            }
                        }
                        true
                    }
                    ChannelEvent::Status(status) => {
                        log::warn!("Presence channel {}: {status:?}", channel.name());
                        resyncs.clear();
                        tracker.reset_online();
                        true
                    }
                    ChannelEvent::Broadcast { event, payload } if event == EDITING_EVENT => {
                        match serde_json::from_value::<EditingClaim>(payload) {
                            Ok(claim) => tracker.apply_claim(claim),
                            Err(e) => {
                                log::debug!("Ignoring malformed editing claim: {e}");
                                false
                            }
                        }
                    }
                    ChannelEvent::Broadcast { .. } => false,
                    ChannelEvent::PresenceSync(entries) => tracker.apply_sync(entries),
                    ChannelEvent::PresenceJoin(entries) => tracker.apply_join(entries),
                    ChannelEvent::PresenceLeave(entries) => tracker.apply_leave(entries),
                }
            }

            _ = tokio::time::sleep_until(next_resync.unwrap_or_else(Instant::now)), if next_resync.is_some() => {
                resyncs.pop_front();
                match channel.presence_state().await {
                    Ok(entries) => tracker.apply_sync(entries),
                    Err(e) => {
                        log::debug!("Presence re-read failed: {e}");
                        false
                    }
                }
            }
        };

        if changed {
            view_tx.send_replace(tracker.view());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, email: &str) -> PresenceEntry {
        PresenceEntry {
            client_key: ClientKey::from(key),
            email: Some(email.to_string()),
            name: None,
            user_id: None,
        }
    }

    fn claim(from: &str, row: Option<&str>) -> EditingClaim {
        EditingClaim {
            client_id: ClientKey::from(from),
            row_id: row.map(RecordId::from),
            email: Some(format!("{from}@example.com")),
            name: Some(from.to_uppercase()),
        }
    }

    #[test]
    fn test_own_claims_are_excluded() {
        let mut tracker = PresenceTracker::new("me".into());
        assert!(!tracker.apply_claim(claim("me", Some("row-1"))));
        assert!(tracker.view().editing_by_others.is_empty());
    }

    #[test]
    fn test_last_claim_wins() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.apply_claim(claim("a", Some("row-1")));
        tracker.apply_claim(claim("a", Some("row-2")));

        let view = tracker.view();
        assert_eq!(view.editing_by_others, BTreeSet::from([RecordId::from("row-2")]));
        assert_eq!(
            view.editing_by_user[&RecordId::from("row-2")].email.as_deref(),
            Some("a@example.com")
        );
    }

    #[test]
    fn test_null_claim_clears() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.apply_claim(claim("a", Some("row-1")));
        tracker.apply_claim(claim("a", None));
        assert!(tracker.view().editing_by_others.is_empty());
    }

    #[test]
    fn test_repeated_claim_is_not_a_change() {
        let mut tracker = PresenceTracker::new("me".into());
        assert!(tracker.apply_claim(claim("a", Some("row-1"))));
        assert!(!tracker.apply_claim(claim("a", Some("row-1"))));
    }

    #[test]
    fn test_leave_prunes_claims() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.apply_join(vec![entry("a", "a@example.com")]);
        tracker.apply_claim(claim("a", Some("row-1")));

        assert!(tracker.apply_leave(vec![entry("a", "a@example.com")]));
        let view = tracker.view();
        assert!(view.online_users.is_empty());
        assert!(view.editing_by_others.is_empty());
    }

    #[test]
    fn test_empty_sync_ignored_while_tracked() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.mark_tracked(entry("me", "me@example.com"));
        tracker.apply_join(vec![entry("a", "a@example.com")]);

        assert!(!tracker.apply_sync(Vec::new()));
        assert_eq!(tracker.view().online_users.len(), 2);
    }

    #[test]
    fn test_sync_keeps_self_when_tracked() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.mark_tracked(entry("me", "me@example.com"));
        tracker.apply_sync(vec![entry("a", "a@example.com")]);

        let view = tracker.view();
        let keys: Vec<&str> = view
            .online_users
            .iter()
            .map(|e| e.client_key.as_str())
            .collect();
        assert_eq!(keys, vec!["a", "me"]);
    }

    #[test]
    fn test_two_tabs_are_two_entries() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.apply_sync(vec![
            entry("tab-1", "same@example.com"),
            entry("tab-2", "same@example.com"),
        ]);
        assert_eq!(tracker.view().online_users.len(), 2);
    }

    #[test]
    fn test_reset_online() {
        let mut tracker = PresenceTracker::new("me".into());
        tracker.mark_tracked(entry("me", "me@example.com"));
        tracker.apply_claim(claim("a", Some("row-1")));
        tracker.reset_online();
        assert!(!tracker.is_tracked());
        assert_eq!(tracker.view(), PresenceView::default());
    }

    #[test]
    fn test_claim_wire_format() {
        let value = serde_json::to_value(claim("a", Some("row-1"))).unwrap();
        assert_eq!(value["clientId"], "a");
        assert_eq!(value["rowId"], "row-1");

        let parsed: EditingClaim =
            serde_json::from_value(serde_json::json!({"clientId": "b", "rowId": null})).unwrap();
        assert_eq!(parsed.row_id, None);
        assert_eq!(parsed.email, None);
    }
}
