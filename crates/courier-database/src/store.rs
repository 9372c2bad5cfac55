//! Transactional pending-event store.
//!
//! Every logical operation of the send queue goes through exactly one
//! transaction opened here. The transaction body is a closure that runs on
//! the database thread: returning `Ok` completes (commits) the transaction,
//! returning `Err` aborts (rolls back) it.
//!
//! ```ignore
//! let store = PendingEventStore::open(&paths.database_file()).await?;
//!
//! let next = store
//!     .read_write_txn(move |txn| {
//!         let next = txn.get_max_queue_index(&room_id)? + 1;
//!         txn.add(&PendingEventRecord::new(room_id, next, txn_id, event_type, content))?;
//!         Ok(next)
//!     })
//!     .await?;
//! ```

use crate::{AsyncDatabase, DatabaseError, DatabaseResult, PendingEventRecord};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use tracing::debug;

const SELECT_COLUMNS: &str = "room_id, queue_index, txn_id, event_type, content, related_txn_id,
     related_event_id, remote_id, needs_upload, needs_encryption, encrypted_event_type,
     encrypted_content, created_at";

/// Durable store of outgoing events, keyed by (room, queue position).
#[derive(Clone)]
pub struct PendingEventStore {
    db: AsyncDatabase,
}

impl PendingEventStore {
    /// Wrap an already opened database.
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    /// Open (and migrate) the store at the given path.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        Ok(Self::new(AsyncDatabase::open(path).await?))
    }

    /// Open a private in-memory store.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        Ok(Self::new(AsyncDatabase::open_in_memory().await?))
    }

    /// The underlying database handle.
    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }

    /// Run a read-only transaction. Writes inside it fail with
    /// [`DatabaseError::ReadOnlyTransaction`].
    pub async fn read_txn<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&PendingEventsTxn<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.db
            .transaction(TransactionBehavior::Deferred, move |tx| {
                f(&PendingEventsTxn {
                    conn: tx,
                    writable: false,
                })
            })
            .await
    }

    /// Run a read-write transaction.
    pub async fn read_write_txn<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&PendingEventsTxn<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.db
            .transaction(TransactionBehavior::Immediate, move |tx| {
                f(&PendingEventsTxn {
                    conn: tx,
                    writable: true,
                })
            })
            .await
    }
}

/// Handle to the pending-events store inside an open transaction.
pub struct PendingEventsTxn<'a> {
    conn: &'a Connection,
    writable: bool,
}

impl PendingEventsTxn<'_> {
    fn ensure_writable(&self, op: &'static str) -> DatabaseResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(DatabaseError::ReadOnlyTransaction(op))
        }
    }

    /// Insert a new record. Fails if the key or txn id is already taken.
    pub fn add(&self, record: &PendingEventRecord) -> DatabaseResult<()> {
        self.ensure_writable("add")?;
        let encrypted_content = record
            .encrypted_content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO pending_events (room_id, queue_index, txn_id, event_type, content,
                related_txn_id, related_event_id, remote_id, needs_upload, needs_encryption,
                encrypted_event_type, encrypted_content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.room_id,
                record.queue_index as i64,
                record.txn_id,
                record.event_type,
                serde_json::to_string(&record.content)?,
                record.related_txn_id,
                record.related_event_id,
                record.remote_id,
                record.needs_upload,
                record.needs_encryption,
                record.encrypted_event_type,
                encrypted_content,
                record.created_at.to_rfc3339(),
            ],
        )?;

        self.conn.execute(
            "INSERT INTO room_queue_index (room_id, max_queue_index) VALUES (?1, ?2)
             ON CONFLICT(room_id) DO UPDATE
                SET max_queue_index = MAX(max_queue_index, excluded.max_queue_index)",
            params![record.room_id, record.queue_index as i64],
        )?;

        debug!(room_id = %record.room_id, queue_index = record.queue_index, "Pending event added");
        Ok(())
    }

    /// Overwrite the mutable columns of an existing record.
    pub fn update(&self, record: &PendingEventRecord) -> DatabaseResult<()> {
        self.ensure_writable("update")?;
        let encrypted_content = record
            .encrypted_content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let changed = self.conn.execute(
            "UPDATE pending_events
             SET event_type = ?3, content = ?4, related_txn_id = ?5, related_event_id = ?6,
                 remote_id = ?7, needs_upload = ?8, needs_encryption = ?9,
                 encrypted_event_type = ?10, encrypted_content = ?11
             WHERE room_id = ?1 AND queue_index = ?2",
            params![
                record.room_id,
                record.queue_index as i64,
                record.event_type,
                serde_json::to_string(&record.content)?,
                record.related_txn_id,
                record.related_event_id,
                record.remote_id,
                record.needs_upload,
                record.needs_encryption,
                record.encrypted_event_type,
                encrypted_content,
            ],
        )?;

        if changed == 0 {
            return Err(DatabaseError::NotFound(format!(
                "pending event {}/{}",
                record.room_id, record.queue_index
            )));
        }
        Ok(())
    }

    /// Remove a record. Returns whether a row was deleted.
    pub fn remove(&self, room_id: &str, queue_index: u64) -> DatabaseResult<bool> {
        self.ensure_writable("remove")?;
        let removed = self.conn.execute(
            "DELETE FROM pending_events WHERE room_id = ?1 AND queue_index = ?2",
            params![room_id, queue_index as i64],
        )?;
        Ok(removed > 0)
    }

    /// Whether a record exists for the key.
    pub fn exists(&self, room_id: &str, queue_index: u64) -> DatabaseResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM pending_events WHERE room_id = ?1 AND queue_index = ?2",
                params![room_id, queue_index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Highest queue position ever assigned in the room, 0 if none.
    pub fn get_max_queue_index(&self, room_id: &str) -> DatabaseResult<u64> {
        let max: i64 = self.conn.query_row(
            "SELECT MAX(
                COALESCE((SELECT MAX(queue_index) FROM pending_events WHERE room_id = ?1), 0),
                COALESCE((SELECT max_queue_index FROM room_queue_index WHERE room_id = ?1), 0)
             )",
            params![room_id],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    /// Fetch a single record.
    pub fn get(&self, room_id: &str, queue_index: u64) -> DatabaseResult<Option<PendingEventRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_events WHERE room_id = ?1 AND queue_index = ?2"
        );
        let record = self
            .conn
            .query_row(&sql, params![room_id, queue_index as i64], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// All records of one room, in queue order.
    pub fn get_room(&self, room_id: &str) -> DatabaseResult<Vec<PendingEventRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_events WHERE room_id = ?1 ORDER BY queue_index ASC"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let records = stmt
            .query_map(params![room_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every record, grouped by room and in queue order within each room.
    pub fn get_all(&self) -> DatabaseResult<Vec<PendingEventRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_events ORDER BY room_id ASC, queue_index ASC"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PendingEventRecord> {
    let encrypted_content: Option<String> = row.get(11)?;
    Ok(PendingEventRecord {
        room_id: row.get(0)?,
        queue_index: row.get::<_, i64>(1)? as u64,
        txn_id: row.get(2)?,
        event_type: row.get(3)?,
        content: parse_json(4, &row.get::<_, String>(4)?)?,
        related_txn_id: row.get(5)?,
        related_event_id: row.get(6)?,
        remote_id: row.get(7)?,
        needs_upload: row.get(8)?,
        needs_encryption: row.get(9)?,
        encrypted_event_type: row.get(10)?,
        encrypted_content: encrypted_content
            .map(|raw| parse_json(11, &raw))
            .transpose()?,
        created_at: parse_datetime(row.get(12)?),
    })
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn record(room: &str, index: u64, txn: &str) -> PendingEventRecord {
        PendingEventRecord::new(room, index, txn, "m.room.message", json!({"body": txn}))
    }

    #[tokio::test]
    async fn test_add_and_get_room_in_order() {
        let store = PendingEventStore::open_in_memory().await.unwrap();

        store
            .read_write_txn(|txn| {
                txn.add(&record("!a:x", 2, "t2"))?;
                txn.add(&record("!a:x", 1, "t1"))?;
                txn.add(&record("!b:x", 1, "t3"))?;
                Ok(())
            })
            .await
            .unwrap();

        let room_a = store.read_txn(|txn| txn.get_room("!a:x")).await.unwrap();
        let txn_ids: Vec<_> = room_a.iter().map(|r| r.txn_id.as_str()).collect();
        assert_eq!(txn_ids, vec!["t1", "t2"]);

        let all = store.read_txn(|txn| txn.get_all()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_record_columns_survive_storage() {
        let store = PendingEventStore::open_in_memory().await.unwrap();

        let mut original = record("!a:x", 1, "t1");
        original.related_txn_id = Some("t0".to_string());
        original.needs_encryption = true;
        original.encrypted_event_type = Some("m.room.encrypted".to_string());
        original.encrypted_content = Some(json!({"ciphertext": "abc"}));

        let to_add = original.clone();
        store.read_write_txn(move |txn| txn.add(&to_add)).await.unwrap();

        let loaded = store
            .read_txn(|txn| txn.get("!a:x", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.related_txn_id.as_deref(), Some("t0"));
        assert!(loaded.needs_encryption);
        assert_eq!(loaded.encrypted_content, Some(json!({"ciphertext": "abc"})));
        assert_eq!(loaded.content, original.content);
    }

    #[tokio::test]
    async fn test_max_queue_index_survives_removal() {
        let store = PendingEventStore::open_in_memory().await.unwrap();

        let empty = store
            .read_txn(|txn| txn.get_max_queue_index("!a:x"))
            .await
            .unwrap();
        assert_eq!(empty, 0);

        store
            .read_write_txn(|txn| {
                txn.add(&record("!a:x", 1, "t1"))?;
                txn.add(&record("!a:x", 2, "t2"))?;
                txn.remove("!a:x", 1)?;
                txn.remove("!a:x", 2)?;
                Ok(())
            })
            .await
            .unwrap();

        let max = store
            .read_txn(|txn| txn.get_max_queue_index("!a:x"))
            .await
            .unwrap();
        assert_eq!(max, 2);
    }

    #[tokio::test]
    async fn test_update_and_exists() {
        let store = PendingEventStore::open_in_memory().await.unwrap();
        store
            .read_write_txn(|txn| txn.add(&record("!a:x", 1, "t1")))
            .await
            .unwrap();

        let mut updated = record("!a:x", 1, "t1");
        updated.remote_id = Some("$e1".to_string());
        store.read_write_txn(move |txn| txn.update(&updated)).await.unwrap();

        let (exists, loaded) = store
            .read_txn(|txn| Ok((txn.exists("!a:x", 1)?, txn.get("!a:x", 1)?)))
            .await
            .unwrap();
        assert!(exists);
        assert_eq!(loaded.unwrap().remote_id.as_deref(), Some("$e1"));
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let store = PendingEventStore::open_in_memory().await.unwrap();
        let result = store
            .read_write_txn(|txn| txn.update(&record("!a:x", 9, "t9")))
            .await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_txn_rejects_writes() {
        let store = PendingEventStore::open_in_memory().await.unwrap();
        let result = store.read_txn(|txn| txn.add(&record("!a:x", 1, "t1"))).await;
        assert!(matches!(result, Err(DatabaseError::ReadOnlyTransaction("add"))));
    }

    #[tokio::test]
    async fn test_failed_txn_leaves_no_partial_writes() {
        let store = PendingEventStore::open_in_memory().await.unwrap();

        let result = store
            .read_write_txn(|txn| {
                txn.add(&record("!a:x", 1, "t1"))?;
                // Duplicate txn id violates the unique index
                txn.add(&record("!a:x", 2, "t1"))
            })
            .await;
        assert!(result.is_err());

        let (rows, max) = store
            .read_txn(|txn| Ok((txn.get_room("!a:x")?, txn.get_max_queue_index("!a:x")?)))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(max, 0);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        {
            let store = PendingEventStore::open(&path).await.unwrap();
            store
                .read_write_txn(|txn| txn.add(&record("!a:x", 1, "t1")))
                .await
                .unwrap();
        }

        let store = PendingEventStore::open(&path).await.unwrap();
        let rows = store.read_txn(|txn| txn.get_all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].txn_id, "t1");
    }
}
