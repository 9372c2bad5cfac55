//! One outgoing event and its delivery state.

use crate::attachment::{Attachment, AttachmentSet};
use crate::encryption::EncryptedEvent;
use crate::error::SendError;
use crate::transport::Transport;
use crate::types::{
    relation_target, EventId, RoomId, TxnId, REDACTION_EVENT_TYPE, RELATES_TO_KEY,
};
use chrono::{DateTime, Utc};
use courier_database::PendingEventRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Transient delivery status. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Waiting,
    UploadingAttachments,
    Encrypting,
    Sending,
    Sent,
    Error,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::UploadingAttachments => "uploading_attachments",
            Self::Encrypting => "encrypting",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event handed to the queue by the caller.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub event_type: String,
    pub content: Value,
    pub attachments: Vec<Attachment>,
    pub related_txn_id: Option<TxnId>,
    pub related_event_id: Option<EventId>,
}

impl OutgoingEvent {
    /// Create an event. A relation in `m.relates_to.event_id` is picked up
    /// automatically: `$`-prefixed targets are server ids, anything else is
    /// a local transaction id.
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        let (related_txn_id, related_event_id) = match relation_target(&content) {
            Some(target) if EventId::looks_like_event_id(target) => {
                (None, Some(EventId::from(target)))
            }
            Some(target) => (Some(TxnId::from(target)), None),
            None => (None, None),
        };

        Self {
            event_type: event_type.into(),
            content,
            attachments: Vec::new(),
            related_txn_id,
            related_event_id,
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Relate this event to a local event that may not be sent yet.
    pub fn related_to_txn(mut self, txn_id: TxnId) -> Self {
        self.related_txn_id = Some(txn_id);
        self
    }

    /// Relate this event to an event the server already knows.
    pub fn related_to_event(mut self, event_id: EventId) -> Self {
        self.related_event_id = Some(event_id);
        self
    }
}

/// Read-only view of a pending event for callers and UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEventSnapshot {
    pub room_id: RoomId,
    pub queue_index: u64,
    pub txn_id: TxnId,
    pub event_type: String,
    pub content: Value,
    pub status: SendStatus,
    pub error: Option<String>,
    pub remote_id: Option<EventId>,
    pub related_txn_id: Option<TxnId>,
    pub related_event_id: Option<EventId>,
    pub created_at: DateTime<Utc>,
}

/// Set the resolved relation on a record and patch it into
/// `m.relates_to.event_id` when the content carries a relation.
///
/// Idempotent.
pub(crate) fn apply_related_event_id(record: &mut PendingEventRecord, event_id: &str) {
    record.related_event_id = Some(event_id.to_string());
    if let Some(Value::Object(relates_to)) = record.content.get_mut(RELATES_TO_KEY) {
        relates_to.insert("event_id".to_string(), Value::String(event_id.to_string()));
    }
}

/// A queued event: its durable record plus transient send state.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    record: PendingEventRecord,
    status: SendStatus,
    error: Option<SendError>,
    aborted: bool,
    attachments: Option<Arc<AttachmentSet>>,
}

impl PendingEvent {
    /// Wrap a freshly persisted record.
    pub fn new(record: PendingEventRecord, attachments: Option<Arc<AttachmentSet>>) -> Self {
        Self {
            record,
            status: SendStatus::Waiting,
            error: None,
            aborted: false,
            attachments,
        }
    }

    /// Rebuild from a stored record after a restart.
    pub fn recovered(record: PendingEventRecord) -> Self {
        let status = if record.remote_id.is_some() {
            SendStatus::Sent
        } else {
            SendStatus::Waiting
        };
        Self {
            record,
            status,
            error: None,
            aborted: false,
            attachments: None,
        }
    }

    pub fn record(&self) -> &PendingEventRecord {
        &self.record
    }

    pub(crate) fn replace_record(&mut self, record: PendingEventRecord) {
        self.record = record;
    }

    pub fn room_id(&self) -> RoomId {
        RoomId::from(self.record.room_id.as_str())
    }

    pub fn queue_index(&self) -> u64 {
        self.record.queue_index
    }

    pub fn txn_id(&self) -> TxnId {
        TxnId::from(self.record.txn_id.as_str())
    }

    pub fn event_type(&self) -> &str {
        &self.record.event_type
    }

    pub fn content(&self) -> &Value {
        &self.record.content
    }

    pub fn status(&self) -> SendStatus {
        self.status
    }

    pub fn error(&self) -> Option<&SendError> {
        self.error.as_ref()
    }

    pub fn remote_id(&self) -> Option<EventId> {
        self.record.remote_id.as_deref().map(EventId::from)
    }

    pub fn related_txn_id(&self) -> Option<TxnId> {
        self.record.related_txn_id.as_deref().map(TxnId::from)
    }

    pub fn related_event_id(&self) -> Option<EventId> {
        self.record.related_event_id.as_deref().map(EventId::from)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_redaction(&self) -> bool {
        self.record.event_type == REDACTION_EVENT_TYPE
    }

    pub fn needs_upload(&self) -> bool {
        self.record.needs_upload && !self.aborted
    }

    pub fn needs_encryption(&self) -> bool {
        self.record.needs_encryption && !self.aborted
    }

    pub fn needs_sending(&self) -> bool {
        self.record.remote_id.is_none() && !self.aborted
    }

    /// Whether transmission has begun; such events can no longer be
    /// withdrawn locally.
    pub fn has_started_sending(&self) -> bool {
        self.status == SendStatus::Sending || self.record.remote_id.is_some()
    }

    /// Whether the send loop should pick this event up.
    pub(crate) fn is_actionable(&self) -> bool {
        self.needs_sending() && self.status == SendStatus::Waiting
    }

    pub fn snapshot(&self) -> PendingEventSnapshot {
        PendingEventSnapshot {
            room_id: self.room_id(),
            queue_index: self.queue_index(),
            txn_id: self.txn_id(),
            event_type: self.record.event_type.clone(),
            content: self.record.content.clone(),
            status: self.status,
            error: self.error.as_ref().map(ToString::to_string),
            remote_id: self.remote_id(),
            related_txn_id: self.related_txn_id(),
            related_event_id: self.related_event_id(),
            created_at: self.record.created_at,
        }
    }

    pub fn set_waiting(&mut self) {
        self.status = SendStatus::Waiting;
        self.error = None;
    }

    pub fn set_uploading_attachments(&mut self) {
        self.status = SendStatus::UploadingAttachments;
    }

    pub fn set_encrypting(&mut self) {
        self.status = SendStatus::Encrypting;
    }

    /// Store the encryption output; the event is now ready to transmit.
    pub fn set_encrypted(&mut self, encrypted: EncryptedEvent) {
        self.record.encrypted_event_type = Some(encrypted.event_type);
        self.record.encrypted_content = Some(encrypted.content);
        self.record.needs_encryption = false;
    }

    pub fn set_error(&mut self, error: SendError) {
        self.status = SendStatus::Error;
        self.error = Some(error);
    }

    pub fn set_sending(&mut self) {
        self.status = SendStatus::Sending;
        self.error = None;
    }

    pub fn set_sent(&mut self, remote_id: &EventId) {
        self.record.remote_id = Some(remote_id.to_string());
        self.status = SendStatus::Sent;
        self.error = None;
    }

    /// Content handed to room encryption. The relation stays in the clear
    /// so the server can aggregate it.
    pub fn content_for_encryption(&self) -> Value {
        match &self.record.content {
            Value::Object(map) => {
                let stripped: Map<String, Value> = map
                    .iter()
                    .filter(|(key, _)| key.as_str() != RELATES_TO_KEY)
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                Value::Object(stripped)
            }
            other => other.clone(),
        }
    }

    /// The type and content that go on the wire.
    pub fn payload_for_send(&self) -> (String, Value) {
        match (&self.record.encrypted_event_type, &self.record.encrypted_content) {
            (Some(event_type), Some(encrypted)) => {
                let mut content = encrypted.clone();
                if let (Value::Object(map), Some(relates_to)) =
                    (&mut content, self.record.content.get(RELATES_TO_KEY))
                {
                    map.insert(RELATES_TO_KEY.to_string(), relates_to.clone());
                }
                (event_type.clone(), content)
            }
            _ => (self.record.event_type.clone(), self.record.content.clone()),
        }
    }

    /// Upload attachments and fill their URIs into the content.
    pub async fn upload_attachments(&mut self, transport: &dyn Transport) -> Result<(), SendError> {
        let attachments = self
            .attachments
            .clone()
            .ok_or_else(|| SendError::MissingAttachments(self.txn_id()))?;

        attachments.upload_into(&mut self.record.content, transport).await?;
        self.record.needs_upload = false;
        Ok(())
    }

    /// Transmit the event, returning the server-assigned id.
    ///
    /// Redactions go through the redaction endpoint and need the target's
    /// remote id.
    pub async fn send(&mut self, transport: &dyn Transport) -> Result<EventId, SendError> {
        let room_id = self.room_id();
        let txn_id = self.txn_id();

        let remote_id = if self.is_redaction() {
            let target = self
                .related_event_id()
                .ok_or_else(|| SendError::UnresolvedRelation(txn_id.clone()))?;
            transport
                .redact_event(&room_id, &target, &txn_id, &self.record.content)
                .await?
        } else {
            let (event_type, content) = self.payload_for_send();
            transport
                .send_event(&room_id, &event_type, &txn_id, &content)
                .await?
        };

        self.set_sent(&remote_id);
        Ok(remote_id)
    }

    /// Mark aborted and cancel any in-flight upload.
    pub fn abort(&mut self) {
        self.aborted = true;
        if let Some(attachments) = self.attachments.take() {
            attachments.abort();
        }
    }

    /// Release attachment buffers.
    pub fn dispose(&mut self) {
        self.attachments = None;
    }
}
