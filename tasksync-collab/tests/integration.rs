//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients,
//! verifying tables, change feeds, presence and access control.

use std::sync::Arc;
use serde_json::json;
use tasksync_collab::client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
use tasksync_collab::server::{ServerConfig, SyncServer};
use tasksync_collab::{
    Connectivity, LiveTable, LiveTableConfig, Persistence, PersistenceError, PresenceConfig,
    PresenceSession, ReconcileError, UserDirectory,
};
use tasksync_core::{Identity, NewRecord, Permission, Record, RecordId, RecordPatch, RoleId, User};
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn(server: SyncServer) -> String {
    let url = format!("ws://{}", server.bind_addr());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    url
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let server = SyncServer::new(ServerConfig::for_testing(format!("127.0.0.1:{port}"))).unwrap();
    spawn(server).await
}

fn identity(name: &str) -> Identity {
    Identity::new(
        format!("u-{name}"),
        Some(&format!("{name}@example.com")),
        Some(name),
    )
}

async fn connected_client(url: &str, name: &str) -> SyncClient {
    let client = SyncClient::new(ClientConfig::for_testing(url), identity(name));
    client.connect().await.unwrap();
    client
}

async fn open_tasks(client: &SyncClient) -> LiveTable<Record> {
    let live = LiveTable::open(
        "tasks",
        Arc::new(client.table("tasks")),
        Arc::new(client.clone()),
        client.identity().clone(),
        LiveTableConfig::for_testing(),
    )
    .await;
    let mut connectivity = live.watch_connectivity();
    timeout(Duration::from_secs(2), connectivity.wait_for(|c| *c == Connectivity::Live))
        .await
        .expect("feed never went live")
        .unwrap();
    live
}

async fn eventually<F, Fut>(mut check: F)
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
async fn test_server_accepts_connections() {
    let url = start_test_server().await;

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects() {
    let url = start_test_server().await;

    let client = SyncClient::new(ClientConfig::for_testing(&url), identity("alice"));
    let mut event_rx = client.take_event_rx().await.unwrap();

    let connect_result = client.connect().await;
    assert!(connect_result.is_ok(), "Client should connect");

    let event = timeout(Duration::from_secs(2), event_rx.recv()).await;
    assert_eq!(event.unwrap(), Some(SyncEvent::Connected));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    client.send_ping().await.unwrap();
}

#[tokio::test]
async fn test_remote_table_crud() {
    let url = start_test_server().await;
    let client = connected_client(&url, "alice").await;
    let tasks = client.table("tasks");

    let row = tasks
        .insert(json!({"id": "t1", "content": "Write docs"}).as_object().cloned().unwrap())
        .await
        .unwrap();
    assert_eq!(row["id"], "t1");
    assert!(row.contains_key("created_at"));

    let inserted = tasks
        .insert_many(vec![
            json!({"content": "a"}).as_object().cloned().unwrap(),
            json!({"content": "b"}).as_object().cloned().unwrap(),
        ])
        .await
        .unwrap();
    assert_eq!(inserted, 2);
    assert_eq!(tasks.fetch_all().await.unwrap().len(), 3);

    tasks
        .update(
            &RecordId::from("t1"),
            json!({"status": "Done"}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();
    let rows = tasks.fetch_all().await.unwrap();
    let t1 = rows.iter().find(|r| r["id"] == "t1").unwrap();
    assert_eq!(t1["status"], "Done");

    tasks.delete(&RecordId::from("t1")).await.unwrap();
    assert_eq!(tasks.fetch_all().await.unwrap().len(), 2);

    let missing = tasks
        .update(
            &RecordId::from("nope"),
            json!({"status": "Done"}).as_object().cloned().unwrap(),
        )
        .await;
    assert!(matches!(missing, Err(PersistenceError::NotFound(_))));
}

#[tokio::test]
async fn test_unknown_table_is_reported() {
    let url = start_test_server().await;
    let client = connected_client(&url, "alice").await;

    let result = client.table("invoices").fetch_all().await;
    assert!(matches!(result, Err(PersistenceError::UnknownTable(t)) if t == "invoices"));
}

#[tokio::test]
async fn test_changes_reach_other_clients() {
    let url = start_test_server().await;
    let alice = connected_client(&url, "alice").await;
    let bob = connected_client(&url, "bob").await;

    let alice_tasks = open_tasks(&alice).await;
    let bob_tasks = open_tasks(&bob).await;

    let created = alice_tasks
        .reconciler()
        .create(NewRecord::new("Ship it"))
        .await
        .unwrap();
    assert_eq!(created.last_updated_by.as_deref(), Some("alice@example.com"));

    let id = created.id.clone();
    let bob_reconciler = bob_tasks.reconciler().clone();
    eventually(|| {
        let r = bob_reconciler.clone();
        let id = id.clone();
        async move { r.record(&id).await.is_some() }
    })
    .await;

    alice_tasks
        .reconciler()
        .mutate(&id, RecordPatch::new().status("In Progress"))
        .await
        .unwrap();
    eventually(|| {
        let r = bob_reconciler.clone();
        let id = id.clone();
        async move {
            r.record(&id)
                .await
                .map(|rec| rec.status == "In Progress")
                .unwrap_or(false)
        }
    })
    .await;

    alice_tasks.reconciler().remove(&id).await.unwrap();
    eventually(|| {
        let r = bob_reconciler.clone();
        let id = id.clone();
        async move { r.record(&id).await.is_none() }
    })
    .await;
    assert_eq!(alice_tasks.reconciler().len().await, 0);
}

#[tokio::test]
async fn test_presence_over_the_wire() {
    let url = start_test_server().await;
    let alice = connected_client(&url, "alice").await;
    let bob = connected_client(&url, "bob").await;

    let a = PresenceSession::join(&alice, identity("alice"), PresenceConfig::default()).await;
    let b = PresenceSession::join(&bob, identity("bob"), PresenceConfig::default()).await;
    assert!(a.is_connected());
    assert!(b.is_connected());

    let mut b_view = b.watch();
    timeout(Duration::from_secs(2), b_view.wait_for(|v| v.online_users.len() == 2))
        .await
        .unwrap()
        .unwrap();

    a.set_editing_row(Some(RecordId::from("t1"))).await;
    timeout(
        Duration::from_secs(2),
        b_view.wait_for(|v| v.editing_by_others.contains(&RecordId::from("t1"))),
    )
    .await
    .unwrap()
    .unwrap();

    a.leave().await;
    timeout(
        Duration::from_secs(2),
        b_view.wait_for(|v| v.online_users.len() == 1 && v.editing_by_others.is_empty()),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_viewer_cannot_edit() {
    let port = free_port().await;
    let mut directory = UserDirectory::new();
    directory.insert(User::new(identity("admin"), RoleId::Admin));
    directory.insert(User::new(identity("viewer"), RoleId::Viewer));
    let server = SyncServer::new(ServerConfig::for_testing(format!("127.0.0.1:{port}")))
        .unwrap()
        .with_resolver(Arc::new(directory));
    let url = spawn(server).await;

    let admin = connected_client(&url, "admin").await;
    let viewer = connected_client(&url, "viewer").await;
    let stranger = connected_client(&url, "stranger").await;

    admin
        .table("tasks")
        .insert(json!({"id": "t1", "content": "Keep"}).as_object().cloned().unwrap())
        .await
        .unwrap();

    // Viewers read, but an edit is refused and rolled back.
    let live = open_tasks(&viewer).await;
    assert_eq!(live.reconciler().len().await, 1);
    let result = live
        .reconciler()
        .mutate(&RecordId::from("t1"), RecordPatch::new().content("Changed"))
        .await;
    assert!(matches!(
        result,
        Err(ReconcileError::Persistence(PersistenceError::Forbidden(
            Permission::LiveTableEditTask
        )))
    ));
    let record = live.reconciler().record(&RecordId::from("t1")).await.unwrap();
    assert_eq!(record.content, "Keep");
    assert!(live.reconciler().last_error().await.is_some());

    // Unknown users get nothing.
    let denied = stranger.table("tasks").fetch_all().await;
    assert!(matches!(
        denied,
        Err(PersistenceError::Forbidden(Permission::LiveTableView))
    ));
}

#[tokio::test]
async fn test_disconnect_ends_feeds_and_requests() {
    let url = start_test_server().await;
    let client = connected_client(&url, "alice").await;
    let live = open_tasks(&client).await;

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    let mut connectivity = live.watch_connectivity();
    timeout(
        Duration::from_secs(2),
        connectivity.wait_for(|c| *c == Connectivity::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    let result = client.table("tasks").fetch_all().await;
    assert!(matches!(result, Err(PersistenceError::Transport(_))));

    // Reconnecting brings the live table back on its own.
    client.connect().await.unwrap();
    timeout(Duration::from_secs(2), connectivity.wait_for(|c| *c == Connectivity::Live))
        .await
        .unwrap()
        .unwrap();
}
