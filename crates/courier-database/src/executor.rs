//! The SQLite executor behind the pending-event store.
//!
//! One `tokio_rusqlite` connection owns a background thread; every room's
//! queue funnels its transactions through it, so they run one at a time in
//! submission order. Closures passed in here must only touch SQL.
//!
//! ```ignore
//! let db = AsyncDatabase::open(&paths.database_file()).await?;
//! let rows: i64 = db
//!     .call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM pending_events", [], |r| r.get(0)))
//!     .await?;
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use rusqlite::TransactionBehavior;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Handle to the executor thread. Clones share the connection.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open (creating if needed) the database file, apply pragmas and
    /// migrate it to [`crate::CURRENT_VERSION`].
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path = path.to_string_lossy().to_string();
        let conn = Connection::open(&path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = FULL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let db = Self { conn, path };
        db.migrate().await?;

        info!(path = %db.path, "Opened pending event database");
        Ok(db)
    }

    /// Open a private in-memory database (tests and ephemeral clients).
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };
        db.migrate().await?;

        debug!("In-memory database initialized");
        Ok(db)
    }

    async fn migrate(&self) -> DatabaseResult<()> {
        self.call(|conn| {
            migrations::run_migrations(conn)
                .map_err(|e| DatabaseError::Migration(e.to_string()))
        })
        .await
    }

    /// Run `f` on the executor thread.
    ///
    /// Network calls and encryption do not belong in `f`: they would stall
    /// every other room's queue.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        flatten(self.conn.call(move |conn| Ok(f(conn))).await)
    }

    /// Like [`AsyncDatabase::call`] for closures that only raise rusqlite errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// Run a closure inside one SQLite transaction.
    ///
    /// `Ok` commits. `Err` rolls back and the error is returned unchanged,
    /// so a failed closure leaves the database exactly as it was.
    pub async fn transaction<F, T>(&self, behavior: TransactionBehavior, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = self
            .conn
            .call(move |conn| {
                let tx = match conn.transaction_with_behavior(behavior) {
                    Ok(tx) => tx,
                    Err(e) => return Ok(Err(DatabaseError::from(e))),
                };
                // Dropping an uncommitted transaction rolls it back
                Ok(f(&tx).and_then(|value| {
                    tx.commit().map(|()| value).map_err(DatabaseError::from)
                }))
            })
            .await;
        flatten(result)
    }

    /// Database file path, or `:memory:`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Finish queued work and stop the executor thread.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {:?}", e)))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}

/// Unwrap our result carried inside tokio_rusqlite's.
fn flatten<T>(result: Result<DatabaseResult<T>, tokio_rusqlite::Error>) -> DatabaseResult<T> {
    result.map_err(from_tokio_rusqlite)?
}
