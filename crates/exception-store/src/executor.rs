//! Async exception store backed by a dedicated SQLite thread.
//!
//! All statements are sent through tokio-rusqlite's channel to a single
//! background thread, so callers on the Tokio runtime park instead of
//! blocking. Only SQL and light row mapping belong inside [`ExceptionStore::call`].
//!
//! ```ignore
//! let store = ExceptionStore::open(path).await?;
//! let page = store.pending_page("SEC-1", 1000).await?;
//! let ids: Vec<i64> = page.iter().map(|r| r.id).collect();
//! store.mark_processed(ids, Utc::now()).await?;
//! ```

use crate::{migrations, queries, ExceptionRecord, NewExceptionRecord, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => StoreError::Connection("Connection closed".to_string()),
        other => StoreError::Connection(other.to_string()),
    }
}

/// Async handle to the exception record table.
///
/// Cloning is cheap and every clone shares the same executor thread.
#[derive(Clone)]
pub struct ExceptionStore {
    conn: Connection,
    path: String,
}

impl ExceptionStore {
    /// Open (or create) a store at the given path, enable WAL and run migrations.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening exception store");

        let conn = Connection::open(path_str.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                PRAGMA temp_store = MEMORY;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let store = Self {
            conn,
            path: path_str,
        };
        store.migrate().await?;

        info!(path = %store.path, "Exception store initialized with WAL mode");
        Ok(store)
    }

    /// Open a private in-memory store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            conn,
            path: ":memory:".to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        self.call(|conn| {
            migrations::run_migrations(conn)
                .map_err(|e| StoreError::Migration(e.to_string()))
        })
        .await
    }

    /// Execute a closure on the store's connection thread.
    pub async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;
        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Execute a closure that only produces rusqlite errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check the store answers a trivial query.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1"))
            .await?;
        debug!("Exception store health check passed");
        Ok(())
    }

    pub async fn insert(&self, record: NewExceptionRecord) -> StoreResult<ExceptionRecord> {
        self.call(move |conn| queries::insert_record(conn, &record))
            .await
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<ExceptionRecord>> {
        self.call(move |conn| queries::get_record(conn, id)).await
    }

    /// Head of the pending set for `security_id`, at most `limit` rows.
    pub async fn pending_page(
        &self,
        security_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ExceptionRecord>> {
        let security_id = security_id.to_string();
        self.call(move |conn| queries::pending_page(conn, &security_id, limit))
            .await
    }

    pub async fn count_pending(&self, security_id: &str) -> StoreResult<usize> {
        let security_id = security_id.to_string();
        self.call(move |conn| queries::count_pending(conn, &security_id))
            .await
    }

    /// Stamp `ids` as processed in a single transaction.
    pub async fn mark_processed(
        &self,
        ids: Vec<i64>,
        processed_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.call(move |conn| queries::mark_processed(conn, &ids, &processed_at))
            .await
    }

    /// Wait for queued statements, then stop the executor thread.
    pub async fn close(self) -> StoreResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to close store: {:?}", e)))?;
        info!(path = %self.path, "Exception store closed");
        Ok(())
    }
}
