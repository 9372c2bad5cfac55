//! In-memory attachments uploaded before an event is sent.
//!
//! Attachment bytes are never persisted. After a restart an event that
//! still needs its upload fails with `MissingAttachments`.

use crate::error::SendError;
use crate::transport::{MediaUpload, Transport};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// One file to upload, and where its content URI goes in the event content.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Dotted path into the content, e.g. `url` or `info.thumbnail_url`.
    pub content_key: String,
    pub upload: MediaUpload,
}

impl Attachment {
    pub fn new(content_key: impl Into<String>, upload: MediaUpload) -> Self {
        Self {
            content_key: content_key.into(),
            upload,
        }
    }
}

/// Attachments of one pending event, abortable while uploading.
#[derive(Debug)]
pub struct AttachmentSet {
    items: Vec<Attachment>,
    aborted: AtomicBool,
    abort_signal: Notify,
}

impl AttachmentSet {
    pub fn new(items: Vec<Attachment>) -> Self {
        Self {
            items,
            aborted: AtomicBool::new(false),
            abort_signal: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Cancel any in-flight upload.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_signal.notify_waiters();
    }

    /// Upload every attachment in order and write the resulting URIs into
    /// `content`. Fails with [`SendError::Aborted`] once aborted.
    pub async fn upload_into(
        &self,
        content: &mut Value,
        transport: &dyn Transport,
    ) -> Result<(), SendError> {
        for attachment in &self.items {
            let uri = self.upload_one(&attachment.upload, transport).await?;
            debug!(content_key = %attachment.content_key, uri = %uri, "Uploaded attachment");
            set_at_path(content, &attachment.content_key, Value::String(uri));
        }
        Ok(())
    }

    async fn upload_one(
        &self,
        upload: &MediaUpload,
        transport: &dyn Transport,
    ) -> Result<String, SendError> {
        let notified = self.abort_signal.notified();
        tokio::pin!(notified);
        // Register before checking the flag so an abort in between is not lost
        notified.as_mut().enable();

        if self.is_aborted() {
            return Err(SendError::Aborted);
        }

        tokio::select! {
            _ = &mut notified => Err(SendError::Aborted),
            result = transport.upload_media(upload) => result,
        }
    }
}

/// Set `value` at a dotted path, creating intermediate objects.
fn set_at_path(content: &mut Value, path: &str, value: Value) {
    let mut current = content;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
