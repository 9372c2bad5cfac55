//! Reliable delivery of outgoing room events.
//!
//! This crate provides:
//! - `SendQueue`: per-room ordered queue driving upload, encryption and
//!   transmission of each event, persisted through `courier-database`
//! - `SendQueueManager`: owns one queue per room and recovers them at startup
//! - `HttpTransport`: the homeserver client the queue sends through
//! - `SymmetricRoomEncryption`: shared-key room encryption
//!
//! Every queue change is committed to SQLite before it is applied in memory,
//! and observers hear about it through a [`SideEffectSink`] afterwards.

mod attachment;
mod config;
mod encryption;
mod error;
mod http;
mod manager;
mod pending_event;
mod queue;
mod side_effect;
mod transport;
mod types;

#[cfg(test)]
mod tests;

pub use attachment::{Attachment, AttachmentSet};
pub use config::{SendQueueConfig, DEFAULT_TRANSIENT_STATUSES};
pub use encryption::{
    EncryptedEvent, RoomEncryption, SymmetricRoomEncryption, ROOM_ALGORITHM, ROOM_KEY_EVENT_TYPE,
};
pub use error::{SendError, SendErrorKind, SendQueueError, SendQueueResult};
pub use http::{HttpTransport, TransportConfig};
pub use manager::{QueueStatus, SendQueueManager};
pub use pending_event::{
    OutgoingEvent, PendingEvent, PendingEventSnapshot, SendStatus,
};
pub use queue::{RedactionOutcome, RemoteEchoRemovals, RemovedEcho, SendQueue};
pub use side_effect::{NullSink, RecordingSink, RemovalReason, SideEffect, SideEffectSink};
pub use transport::{MediaUpload, Transport};
pub use types::{
    relation_target, EventId, RedactionTarget, RemoteEcho, RoomId, TxnId, ENCRYPTED_EVENT_TYPE,
    REDACTION_EVENT_TYPE, RELATES_TO_KEY,
};
