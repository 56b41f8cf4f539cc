use anyhow::{Context, Result};
use database::SqliteStore;
use dispatch_queue::{Scheduler, TaskQueue};
use mcp_protocol::{AdminGate, McpServer};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;

/// Open the store and bring the schema up to date.
pub async fn create_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let database_url = config.database_url();
    info!(url = %database_url, "Initializing SQLite store");

    let store = SqliteStore::new(&database_url)
        .await
        .context("Failed to open SQLite store")?;

    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    Ok(Arc::new(store))
}

/// Build the queue over the store.
pub fn create_queue(store: Arc<SqliteStore>, config: &Config) -> Arc<TaskQueue<SqliteStore>> {
    Arc::new(TaskQueue::new(store, config.queue_config()))
}

/// Build and start the scheduler loop.
pub fn spawn_scheduler(
    queue: Arc<TaskQueue<SqliteStore>>,
    config: &Config,
) -> tokio::task::JoinHandle<()> {
    info!(
        tick_interval_secs = config.queue.tick_interval_secs,
        "Starting scheduler"
    );
    Scheduler::new(queue, config.scheduler_config()).spawn()
}

/// Build the RPC server over the queue.
pub fn create_server(
    queue: Arc<TaskQueue<SqliteStore>>,
    config: &Config,
) -> McpServer<SqliteStore> {
    McpServer::new(queue, AdminGate::new(config.server.admin_token.clone()))
}

/// Initialize the complete application: store, queue, scheduler, server.
pub async fn initialize_app(
    config: &Config,
) -> Result<(McpServer<SqliteStore>, tokio::task::JoinHandle<()>)> {
    info!("Initializing application");

    let store = create_store(config).await?;
    let queue = create_queue(store, config);
    let scheduler = spawn_scheduler(queue.clone(), config);
    let server = create_server(queue, config);

    info!("Application initialized");
    Ok((server, scheduler))
}

/// Ensure the directory holding the store file exists.
pub fn ensure_database_directory(database_url: &str) -> Result<()> {
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.exists() {
                info!(dir = %parent.display(), "Creating database directory");
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_database_directory() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("store.sqlite");
        let database_url = format!("sqlite://{}", db_path.display());

        ensure_database_directory(&database_url).unwrap();
        assert!(db_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_create_store_with_custom_url() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.sqlite");

        let mut config = Config::default();
        config.database.url = Some(format!("sqlite://{}", db_path.display()));

        let store = create_store(&config).await;
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_app() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("app.sqlite");

        let mut config = Config::default();
        config.database.url = Some(format!("sqlite://{}", db_path.display()));

        let (server, scheduler) = initialize_app(&config).await.unwrap();
        drop(server);
        scheduler.abort();
    }
}
