//! Integration tests for the send queue.
//!
//! - `ordering.rs`       - queue index allocation and send order
//! - `lifecycle.rs`      - upload, encryption and transmission steps
//! - `redaction.rs`      - redacting pending and sent events
//! - `failures.rs`       - failure classification and transaction atomicity
//! - `recovery.rs`       - restart from the store
//! - `reconciliation.rs` - remote echo removal and relation resolution

mod lifecycle;

use crate::encryption::{EncryptedEvent, RoomEncryption};
use crate::error::SendError;
use crate::pending_event::{OutgoingEvent, SendStatus};
use crate::queue::SendQueue;
use crate::side_effect::RecordingSink;
use crate::transport::{MediaUpload, Transport};
use crate::types::{EventId, RoomId, TxnId, ENCRYPTED_EVENT_TYPE};
use crate::SendQueueConfig;
use async_trait::async_trait;
use courier_database::PendingEventStore;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const ROOM: &str = "!room:example.org";

/// A room event or redaction the mock transport accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub room_id: RoomId,
    pub event_type: String,
    pub txn_id: TxnId,
    pub content: Value,
    /// Target of a redaction.
    pub redacts: Option<EventId>,
    pub event_id: EventId,
}

/// Scriptable in-memory transport.
///
/// Server ids are `$e1`, `$e2`, ... in acceptance order. Failures queued
/// with [`MockTransport::fail_next`] fire once, for the first request whose
/// `body` (or redaction `reason`) matches.
pub struct MockTransport {
    sent: Mutex<Vec<SentRequest>>,
    to_device: Mutex<Vec<(String, Value)>>,
    uploads: Mutex<Vec<MediaUpload>>,
    failures: Mutex<Vec<(String, SendError)>>,
    to_device_failure: Mutex<Option<SendError>>,
    offline: AtomicBool,
    next_id: AtomicUsize,
    started: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            sent: Mutex::new(Vec::new()),
            to_device: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            to_device_failure: Mutex::new(None),
            offline: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            gate,
        }
    }

    /// Fail every request with a connection error while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next request whose body or reason equals `key`.
    pub fn fail_next(&self, key: &str, error: SendError) {
        self.failures.lock().unwrap().push((key.to_string(), error));
    }

    pub fn fail_to_device(&self, error: SendError) {
        *self.to_device_failure.lock().unwrap() = Some(error);
    }

    /// Block every request until [`MockTransport::release`].
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Requests that reached the transport, held or not.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Bodies of the room events sent to `room_id`, in order.
    pub fn sent_bodies_for(&self, room_id: &RoomId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|r| &r.room_id == room_id)
            .filter_map(|r| r.content.get("body").and_then(Value::as_str).map(String::from))
            .collect()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent_bodies_for(&RoomId::from(ROOM))
    }

    pub fn redactions(&self) -> Vec<SentRequest> {
        self.sent()
            .into_iter()
            .filter(|r| r.redacts.is_some())
            .collect()
    }

    pub fn to_device_calls(&self) -> Vec<(String, Value)> {
        self.to_device.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    async fn enter(&self) -> Result<(), SendError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        if self.offline.load(Ordering::SeqCst) {
            return Err(SendError::Connection("mock transport offline".into()));
        }
        Ok(())
    }

    fn scripted_failure(&self, content: &Value) -> Option<SendError> {
        let key = content
            .get("body")
            .or_else(|| content.get("reason"))
            .and_then(Value::as_str)?;
        let mut failures = self.failures.lock().unwrap();
        let position = failures.iter().position(|(k, _)| k == key)?;
        Some(failures.remove(position).1)
    }

    fn accept(&self, mut request: SentRequest) -> EventId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event_id = EventId::from(format!("$e{n}"));
        request.event_id = event_id.clone();
        self.sent.lock().unwrap().push(request);
        event_id
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &TxnId,
        content: &Value,
    ) -> Result<EventId, SendError> {
        self.enter().await?;
        if let Some(error) = self.scripted_failure(content) {
            return Err(error);
        }
        Ok(self.accept(SentRequest {
            room_id: room_id.clone(),
            event_type: event_type.to_string(),
            txn_id: txn_id.clone(),
            content: content.clone(),
            redacts: None,
            event_id: EventId::from(""),
        }))
    }

    async fn redact_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        txn_id: &TxnId,
        content: &Value,
    ) -> Result<EventId, SendError> {
        self.enter().await?;
        if let Some(error) = self.scripted_failure(content) {
            return Err(error);
        }
        Ok(self.accept(SentRequest {
            room_id: room_id.clone(),
            event_type: "m.room.redaction".to_string(),
            txn_id: txn_id.clone(),
            content: content.clone(),
            redacts: Some(event_id.clone()),
            event_id: EventId::from(""),
        }))
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        _txn_id: &TxnId,
        messages: &Value,
    ) -> Result<(), SendError> {
        self.enter().await?;
        if let Some(error) = self.to_device_failure.lock().unwrap().take() {
            return Err(error);
        }
        self.to_device
            .lock()
            .unwrap()
            .push((event_type.to_string(), messages.clone()));
        Ok(())
    }

    async fn upload_media(&self, upload: &MediaUpload) -> Result<String, SendError> {
        self.enter().await?;
        self.uploads.lock().unwrap().push(upload.clone());
        let name = upload.filename.clone().unwrap_or_else(|| "blob".to_string());
        Ok(format!("mxc://test/{name}"))
    }
}

/// Encryption double producing readable "ciphertext".
#[derive(Default)]
pub struct MockEncryption {
    calls: AtomicUsize,
    fail: Mutex<Option<SendError>>,
}

impl MockEncryption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, error: SendError) {
        *self.fail.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl RoomEncryption for MockEncryption {
    async fn encrypt(
        &self,
        event_type: &str,
        content: &Value,
        _transport: &dyn Transport,
    ) -> Result<EncryptedEvent, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail.lock().unwrap().take() {
            return Err(error);
        }
        Ok(EncryptedEvent {
            event_type: ENCRYPTED_EVENT_TYPE.to_string(),
            content: json!({
                "ciphertext": json!({"type": event_type, "content": content}).to_string(),
            }),
        })
    }
}

pub struct Harness {
    pub queue: SendQueue,
    pub transport: Arc<MockTransport>,
    pub sink: Arc<RecordingSink>,
    pub store: PendingEventStore,
}

impl Harness {
    pub async fn new() -> Self {
        let store = PendingEventStore::open_in_memory().await.unwrap();
        Self::with_store(store, Arc::new(MockTransport::new())).await
    }

    pub async fn with_store(store: PendingEventStore, transport: Arc<MockTransport>) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let queue = SendQueue::load(
            RoomId::from(ROOM),
            store.clone(),
            transport.clone(),
            sink.clone(),
            SendQueueConfig::default(),
        )
        .await
        .unwrap();
        Self {
            queue,
            transport,
            sink,
            store,
        }
    }

    pub async fn enqueue_text(&self, body: &str) -> TxnId {
        self.queue.enqueue_event(text(body)).await.unwrap()
    }

    pub async fn status_of(&self, txn_id: &TxnId) -> Option<SendStatus> {
        self.queue
            .pending_events()
            .await
            .into_iter()
            .find(|e| &e.txn_id == txn_id)
            .map(|e| e.status)
    }

    pub async fn remote_id_of(&self, txn_id: &TxnId) -> Option<EventId> {
        self.queue
            .pending_events()
            .await
            .into_iter()
            .find(|e| &e.txn_id == txn_id)
            .and_then(|e| e.remote_id)
    }

    pub async fn stored(&self) -> Vec<courier_database::PendingEventRecord> {
        self.store
            .read_txn(|txn| txn.get_room(ROOM))
            .await
            .unwrap()
    }
}

pub fn text(body: &str) -> OutgoingEvent {
    OutgoingEvent::new("m.room.message", json!({"msgtype": "m.text", "body": body}))
}

/// Wait until the queue has no running loop.
pub async fn wait_for_idle(queue: &SendQueue) {
    wait_until(move || async move { !queue.is_sending() }).await;
}

/// Poll `condition` every few milliseconds, panicking after five seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached within 5s");
}

/// Send a simple message end to end.
#[tokio::test]
async fn basic_workflow() {
    let h = Harness::new().await;

    let txn_id = h.enqueue_text("Hello").await;
    wait_for_idle(&h.queue).await;

    assert_eq!(h.transport.sent_bodies(), vec!["Hello"]);
    assert_eq!(h.status_of(&txn_id).await, Some(SendStatus::Sent));
    assert_eq!(h.remote_id_of(&txn_id).await, Some(EventId::from("$e1")));

    let stored = h.stored().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].remote_id.as_deref(), Some("$e1"));
}
