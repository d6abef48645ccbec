//! Standalone sync server.
//!
//! Configured from the environment:
//! `TASKSYNC_BIND`, `TASKSYNC_STORAGE`, `TASKSYNC_TABLES`,
//! `TASKSYNC_MAX_PEERS`, `TASKSYNC_BROADCAST_CAPACITY`, `TASKSYNC_CHANGE_CAPACITY`.
//! Log level via `RUST_LOG`.

use tasksync_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = SyncServer::new(config)?;
    server.run().await?;
    Ok(())
}
