//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable row of the `pending_events` table.
///
/// Holds everything that must survive a restart: identity and ordering,
/// the logical payload, relation bookkeeping, and the output of the
/// encryption step. Transient send status is not stored; it is derived
/// from `remote_id` on recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEventRecord {
    pub room_id: String,
    pub queue_index: u64,
    pub txn_id: String,
    pub event_type: String,
    pub content: Value,
    pub related_txn_id: Option<String>,
    pub related_event_id: Option<String>,
    pub remote_id: Option<String>,
    pub needs_upload: bool,
    pub needs_encryption: bool,
    pub encrypted_event_type: Option<String>,
    pub encrypted_content: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl PendingEventRecord {
    /// Create a record for a freshly enqueued event.
    pub fn new(
        room_id: impl Into<String>,
        queue_index: u64,
        txn_id: impl Into<String>,
        event_type: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            queue_index,
            txn_id: txn_id.into(),
            event_type: event_type.into(),
            content,
            related_txn_id: None,
            related_event_id: None,
            remote_id: None,
            needs_upload: false,
            needs_encryption: false,
            encrypted_event_type: None,
            encrypted_content: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this record still waits for a related event's remote id.
    pub fn has_unresolved_relation(&self) -> bool {
        self.related_txn_id.is_some() && self.related_event_id.is_none()
    }
}
