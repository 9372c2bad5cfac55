//! Network transport contract consumed by the send queue.

use crate::error::SendError;
use crate::types::{EventId, RoomId, TxnId};
use async_trait::async_trait;
use serde_json::Value;

/// Binary media to upload before an event can be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    /// MIME type, e.g. `image/png`.
    pub content_type: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Primitives the send loop needs from the homeserver.
///
/// Every call is keyed by the event's transaction id where the protocol
/// allows it, so a retried request is deduplicated by the server.
/// Implementations must tolerate concurrent callers: queues of different
/// rooms share one transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a room event, returning its server-assigned id.
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &TxnId,
        content: &Value,
    ) -> Result<EventId, SendError>;

    /// Redact `event_id`, returning the id of the redaction event.
    async fn redact_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        txn_id: &TxnId,
        content: &Value,
    ) -> Result<EventId, SendError>;

    /// Send to-device messages (`{user_id: {device_id: content}}`).
    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &TxnId,
        messages: &Value,
    ) -> Result<(), SendError>;

    /// Upload media, returning its content URI.
    async fn upload_media(&self, upload: &MediaUpload) -> Result<String, SendError>;
}
