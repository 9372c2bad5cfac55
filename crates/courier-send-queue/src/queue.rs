//! Per-room send queue.
//!
//! Every change follows the same order: commit to SQLite, apply to the
//! in-memory collection, then emit the side-effect. The events mutex is
//! never held across a network call.

use crate::attachment::AttachmentSet;
use crate::config::SendQueueConfig;
use crate::encryption::RoomEncryption;
use crate::error::{SendError, SendErrorKind, SendQueueError, SendQueueResult};
use crate::pending_event::{
    apply_related_event_id, OutgoingEvent, PendingEvent, PendingEventSnapshot, SendStatus,
};
use crate::side_effect::{RemovalReason, SideEffect, SideEffectSink};
use crate::transport::Transport;
use crate::types::{EventId, RedactionTarget, RemoteEcho, RoomId, TxnId, REDACTION_EVENT_TYPE};
use courier_database::{
    DatabaseError, DatabaseResult, PendingEventRecord, PendingEventStore, PendingEventsTxn,
};
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

type EventMap = BTreeMap<u64, PendingEvent>;

/// Result of [`SendQueue::enqueue_redaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactionOutcome {
    /// A redaction event was queued.
    Enqueued(TxnId),
    /// The target had not been sent yet; it was removed and nothing is sent.
    AbortedLocally,
    /// A pending redaction already targets the same event.
    AlreadyRedacted,
    /// The target is neither pending nor known by remote id.
    UnknownTarget,
}

/// One record removed by [`SendQueue::remove_remote_echos`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEcho {
    pub queue_index: u64,
    pub txn_id: TxnId,
    pub event_id: EventId,
}

/// Store changes made by [`SendQueue::remove_remote_echos`], applied to
/// memory by [`SendQueue::emit_removals`] once the transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEchoRemovals {
    pub room_id: RoomId,
    pub removed: Vec<RemovedEcho>,
    /// Records whose relation was resolved in the same transaction.
    pub resolved: Vec<PendingEventRecord>,
}

impl RemoteEchoRemovals {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.resolved.is_empty()
    }
}

struct QueueInner {
    room_id: RoomId,
    store: PendingEventStore,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn SideEffectSink>,
    config: SendQueueConfig,
    events: Mutex<EventMap>,
    encryption: RwLock<Option<Arc<dyn RoomEncryption>>>,
    /// Set while a send loop task owns the queue.
    sending: AtomicBool,
    offline: AtomicBool,
    disposed: AtomicBool,
    loop_handle: SyncMutex<Option<JoinHandle<()>>>,
}

/// Ordered queue of outgoing events for one room.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<QueueInner>,
}

impl SendQueue {
    /// Create an empty queue.
    pub fn new(
        room_id: RoomId,
        store: PendingEventStore,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn SideEffectSink>,
        config: SendQueueConfig,
    ) -> Self {
        Self::from_records(room_id, Vec::new(), store, transport, sink, config)
    }

    /// Rebuild a room's queue from the store.
    ///
    /// Emits nothing and does not start sending; call
    /// [`SendQueue::resume_sending`] once the room is ready.
    pub async fn load(
        room_id: RoomId,
        store: PendingEventStore,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn SideEffectSink>,
        config: SendQueueConfig,
    ) -> SendQueueResult<Self> {
        let room = room_id.to_string();
        let records = store.read_txn(move |txn| txn.get_room(&room)).await?;

        if !records.is_empty() {
            info!(room_id = %room_id, count = records.len(), "Recovered pending events");
        }
        Ok(Self::from_records(room_id, records, store, transport, sink, config))
    }

    pub(crate) fn from_records(
        room_id: RoomId,
        records: Vec<PendingEventRecord>,
        store: PendingEventStore,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn SideEffectSink>,
        config: SendQueueConfig,
    ) -> Self {
        let events: EventMap = records
            .into_iter()
            .map(|record| (record.queue_index, PendingEvent::recovered(record)))
            .collect();

        Self {
            inner: Arc::new(QueueInner {
                room_id,
                store,
                transport,
                sink,
                config,
                events: Mutex::new(events),
                encryption: RwLock::new(None),
                sending: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                loop_handle: SyncMutex::new(None),
            }),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    pub fn is_sending(&self) -> bool {
        self.inner.sending.load(Ordering::SeqCst)
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.events.lock().await.is_empty()
    }

    /// Ordered view of the pending events.
    pub async fn pending_events(&self) -> Vec<PendingEventSnapshot> {
        self.inner
            .events
            .lock()
            .await
            .values()
            .map(PendingEvent::snapshot)
            .collect()
    }

    /// Install or clear the room's encryption context.
    ///
    /// Applies to events enqueued afterwards.
    pub async fn set_encryption(&self, encryption: Option<Arc<dyn RoomEncryption>>) {
        *self.inner.encryption.write().await = encryption;
    }

    /// Persist a new event and schedule it for sending.
    pub async fn enqueue_event(&self, event: OutgoingEvent) -> SendQueueResult<TxnId> {
        self.ensure_live()?;

        let needs_encryption =
            event.event_type != REDACTION_EVENT_TYPE && self.inner.encryption.read().await.is_some();

        let txn_id = TxnId::new();
        let mut record = PendingEventRecord::new(
            self.inner.room_id.as_str(),
            0,
            txn_id.as_str(),
            event.event_type,
            event.content,
        );
        record.related_txn_id = event.related_txn_id.map(|id| id.0);
        record.needs_upload = !event.attachments.is_empty();
        record.needs_encryption = needs_encryption;
        if let Some(event_id) = event.related_event_id {
            apply_related_event_id(&mut record, event_id.as_str());
        }

        let attachments = if event.attachments.is_empty() {
            None
        } else {
            Some(Arc::new(AttachmentSet::new(event.attachments)))
        };

        let mut events = self.inner.events.lock().await;
        if record.has_unresolved_relation() {
            let related_remote_id = record.related_txn_id.as_deref().and_then(|related| {
                events
                    .values()
                    .find(|e| e.record().txn_id == related)
                    .and_then(|e| e.record().remote_id.clone())
            });
            if let Some(remote_id) = related_remote_id {
                apply_related_event_id(&mut record, &remote_id);
            }
        }

        let txn_id = self.insert_locked(&mut events, record, attachments).await?;
        drop(events);

        self.start_sending();
        Ok(txn_id)
    }

    /// Redact an event by server id or local transaction id.
    pub async fn enqueue_redaction(
        &self,
        target: RedactionTarget,
        reason: Option<String>,
    ) -> SendQueueResult<RedactionOutcome> {
        self.ensure_live()?;

        let mut events = self.inner.events.lock().await;

        let already_redacted = events.values().any(|e| {
            e.is_redaction()
                && !e.is_aborted()
                && match &target {
                    RedactionTarget::Event(id) => e.related_event_id().as_ref() == Some(id),
                    RedactionTarget::Txn(id) => e.related_txn_id().as_ref() == Some(id),
                }
        });
        if already_redacted {
            debug!(room_id = %self.inner.room_id, target = ?target, "Target already has a pending redaction");
            return Ok(RedactionOutcome::AlreadyRedacted);
        }

        let (related_txn_id, related_event_id) = match &target {
            RedactionTarget::Txn(target_txn) => {
                let Some(local) = events.values().find(|e| e.txn_id() == *target_txn) else {
                    debug!(
                        room_id = %self.inner.room_id,
                        txn_id = %target_txn,
                        "Redaction target is not pending, ignoring"
                    );
                    return Ok(RedactionOutcome::UnknownTarget);
                };

                if !local.has_started_sending() {
                    let queue_index = local.queue_index();
                    self.remove_locked(&mut events, queue_index, RemovalReason::Aborted)
                        .await?;
                    info!(
                        room_id = %self.inner.room_id,
                        txn_id = %target_txn,
                        "Redacted event before sending, aborted locally"
                    );
                    return Ok(RedactionOutcome::AbortedLocally);
                }

                (Some(target_txn.clone()), local.remote_id())
            }
            RedactionTarget::Event(event_id) => {
                let local_txn = events
                    .values()
                    .find(|e| e.remote_id().as_ref() == Some(event_id))
                    .map(PendingEvent::txn_id);
                (local_txn, Some(event_id.clone()))
            }
        };

        let content = match reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        let mut record = PendingEventRecord::new(
            self.inner.room_id.as_str(),
            0,
            TxnId::new().as_str(),
            REDACTION_EVENT_TYPE,
            content,
        );
        record.related_txn_id = related_txn_id.map(|id| id.0);
        record.related_event_id = related_event_id.map(|id| id.0);

        let txn_id = self.insert_locked(&mut events, record, None).await?;
        drop(events);

        self.start_sending();
        Ok(RedactionOutcome::Enqueued(txn_id))
    }

    /// Remove an event that has not started transmission.
    ///
    /// Returns `false` if no such event is pending.
    pub async fn abort_event(&self, txn_id: &TxnId) -> SendQueueResult<bool> {
        self.ensure_live()?;

        let mut events = self.inner.events.lock().await;
        let Some(event) = events.values().find(|e| e.txn_id() == *txn_id) else {
            return Ok(false);
        };
        if event.has_started_sending() {
            return Err(SendQueueError::SendInProgress(txn_id.clone()));
        }

        let queue_index = event.queue_index();
        self.remove_locked(&mut events, queue_index, RemovalReason::Aborted)
            .await?;
        info!(room_id = %self.inner.room_id, txn_id = %txn_id, "Aborted pending event");
        Ok(true)
    }

    /// Move an event parked in Error back to Waiting and restart sending.
    pub async fn retry_event(&self, txn_id: &TxnId) -> SendQueueResult<()> {
        self.ensure_live()?;

        let mut events = self.inner.events.lock().await;
        let event = events
            .values_mut()
            .find(|e| e.txn_id() == *txn_id)
            .ok_or_else(|| SendQueueError::EventNotFound(txn_id.clone()))?;

        if event.status() == SendStatus::Error {
            event.set_waiting();
            self.emit_updated(event);
            debug!(room_id = %self.inner.room_id, txn_id = %txn_id, "Retrying pending event");
        }
        drop(events);

        self.start_sending();
        Ok(())
    }

    /// Leave offline mode and restart the send loop.
    pub fn resume_sending(&self) {
        if self.is_disposed() {
            return;
        }
        if self.inner.offline.swap(false, Ordering::SeqCst) {
            info!(room_id = %self.inner.room_id, "Resuming send queue");
        }
        self.start_sending();
    }

    /// Remove server-confirmed events inside a caller-owned transaction.
    ///
    /// Echoes are matched by transaction id when present, otherwise by
    /// remote id. Related events waiting on a removed event are resolved in
    /// the same transaction. Memory is untouched until the caller passes the
    /// result to [`SendQueue::emit_removals`] after commit.
    pub fn remove_remote_echos(
        &self,
        txn: &PendingEventsTxn<'_>,
        echoes: &[RemoteEcho],
    ) -> DatabaseResult<RemoteEchoRemovals> {
        let room = self.inner.room_id.as_str();
        let records = txn.get_room(room)?;

        let mut removed: Vec<RemovedEcho> = Vec::new();
        for echo in echoes {
            let matched = records.iter().find(|record| match &echo.txn_id {
                Some(txn_id) => record.txn_id == txn_id.as_str(),
                None => record.remote_id.as_deref() == Some(echo.event_id.as_str()),
            });
            let Some(record) = matched else {
                continue;
            };
            if removed.iter().any(|r| r.queue_index == record.queue_index) {
                continue;
            }

            txn.remove(room, record.queue_index)?;
            removed.push(RemovedEcho {
                queue_index: record.queue_index,
                txn_id: TxnId::from(record.txn_id.as_str()),
                event_id: echo.event_id.clone(),
            });
        }

        let mut resolved = Vec::new();
        for echo in &removed {
            resolved.extend(resolve_relations(
                txn,
                room,
                echo.txn_id.as_str(),
                echo.event_id.as_str(),
            )?);
        }

        Ok(RemoteEchoRemovals {
            room_id: self.inner.room_id.clone(),
            removed,
            resolved,
        })
    }

    /// Apply a committed [`RemoteEchoRemovals`] batch to memory.
    pub async fn emit_removals(&self, removals: RemoteEchoRemovals) {
        if removals.room_id != self.inner.room_id {
            warn!(
                room_id = %self.inner.room_id,
                other_room_id = %removals.room_id,
                "Ignoring removals for another room"
            );
            return;
        }

        let mut events = self.inner.events.lock().await;
        self.apply_removals_locked(&mut events, removals);
        drop(events);

        self.start_sending();
    }

    /// Remove server-confirmed events in a transaction of their own.
    ///
    /// Returns the number of removed events.
    pub async fn confirm_remote_echos(&self, echoes: Vec<RemoteEcho>) -> SendQueueResult<usize> {
        if echoes.is_empty() {
            return Ok(0);
        }

        let mut events = self.inner.events.lock().await;
        let queue = self.clone();
        let removals = self
            .inner
            .store
            .read_write_txn(move |txn| queue.remove_remote_echos(txn, &echoes))
            .await?;

        let count = removals.removed.len();
        self.apply_removals_locked(&mut events, removals);
        drop(events);

        self.start_sending();
        Ok(count)
    }

    /// Stop the send loop and release resources. Stored records are kept.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.loop_handle.lock().take() {
            handle.abort();
        }

        let mut events = self.inner.events.lock().await;
        for event in events.values_mut() {
            event.dispose();
        }
        events.clear();
        self.inner.sending.store(false, Ordering::SeqCst);

        debug!(room_id = %self.inner.room_id, "Disposed send queue");
    }

    fn ensure_live(&self) -> SendQueueResult<()> {
        if self.is_disposed() {
            return Err(SendQueueError::Disposed(self.inner.room_id.clone()));
        }
        Ok(())
    }

    fn emit(&self, effect: SideEffect) {
        self.inner.sink.emit(effect);
    }

    fn emit_updated(&self, event: &PendingEvent) {
        self.emit(SideEffect::EventUpdated {
            room_id: self.inner.room_id.clone(),
            txn_id: event.txn_id(),
            status: event.status(),
        });
    }

    /// Allocate the next queue index, persist, then insert into memory.
    async fn insert_locked(
        &self,
        events: &mut EventMap,
        mut record: PendingEventRecord,
        attachments: Option<Arc<AttachmentSet>>,
    ) -> SendQueueResult<TxnId> {
        let memory_max = events.keys().next_back().copied().unwrap_or(0);
        let room = self.inner.room_id.to_string();

        let record = self
            .inner
            .store
            .read_write_txn(move |txn| {
                record.queue_index = txn.get_max_queue_index(&room)?.max(memory_max) + 1;
                txn.add(&record)?;
                Ok(record)
            })
            .await?;

        let txn_id = TxnId::from(record.txn_id.as_str());
        let queue_index = record.queue_index;
        debug!(
            room_id = %self.inner.room_id,
            txn_id = %txn_id,
            queue_index,
            event_type = %record.event_type,
            "Enqueued event"
        );
        events.insert(queue_index, PendingEvent::new(record, attachments));

        self.emit(SideEffect::EventAdded {
            room_id: self.inner.room_id.clone(),
            txn_id: txn_id.clone(),
            queue_index,
        });
        Ok(txn_id)
    }

    /// Delete a record that never reached the server, then abort and drop
    /// it from memory.
    ///
    /// Events whose relation still waits for its remote id can never be
    /// resolved and are removed in the same transaction.
    async fn remove_locked(
        &self,
        events: &mut EventMap,
        queue_index: u64,
        reason: RemovalReason,
    ) -> DatabaseResult<()> {
        let room = self.inner.room_id.to_string();
        let dependents = self
            .inner
            .store
            .read_write_txn(move |txn| remove_with_dependents(txn, &room, queue_index))
            .await?;

        self.drop_removed(events, queue_index, reason);
        for dependent in dependents {
            if let Some(event) = events.get(&dependent) {
                info!(
                    room_id = %self.inner.room_id,
                    txn_id = %event.txn_id(),
                    related_txn_id = ?event.related_txn_id(),
                    "Related event removed, dropping dependent"
                );
            }
            self.drop_removed(events, dependent, RemovalReason::Aborted);
        }
        Ok(())
    }

    fn drop_removed(&self, events: &mut EventMap, queue_index: u64, reason: RemovalReason) {
        if let Some(mut event) = events.remove(&queue_index) {
            event.abort();
            event.dispose();
            self.emit(SideEffect::EventRemoved {
                room_id: self.inner.room_id.clone(),
                txn_id: event.txn_id(),
                reason,
            });
        }
    }

    fn apply_removals_locked(&self, events: &mut EventMap, removals: RemoteEchoRemovals) {
        for removed in removals.removed {
            if let Some(mut event) = events.remove(&removed.queue_index) {
                event.dispose();
            }
            debug!(
                room_id = %self.inner.room_id,
                txn_id = %removed.txn_id,
                event_id = %removed.event_id,
                "Removed remote echo"
            );
            self.emit(SideEffect::EventRemoved {
                room_id: self.inner.room_id.clone(),
                txn_id: removed.txn_id,
                reason: RemovalReason::RemoteEcho,
            });
        }

        self.apply_resolved_locked(events, removals.resolved);
    }

    fn apply_resolved_locked(&self, events: &mut EventMap, resolved: Vec<PendingEventRecord>) {
        for record in resolved {
            if let Some(event) = events.get_mut(&record.queue_index) {
                event.replace_record(record);
                // Parked only because the target had no remote id yet
                if matches!(event.error(), Some(SendError::UnresolvedRelation(_))) {
                    event.set_waiting();
                }
                self.emit_updated(event);
            }
        }
    }

    fn start_sending(&self) {
        if self.is_disposed() || self.is_offline() {
            return;
        }
        if self
            .inner
            .sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let queue = self.clone();
        let span = info_span!("send_loop", room_id = %self.inner.room_id);
        let handle = tokio::spawn(async move { queue.send_loop().await }.instrument(span));
        *self.inner.loop_handle.lock() = Some(handle);
    }

    async fn send_loop(self) {
        debug!("Send loop started");
        loop {
            if self.is_disposed() {
                return;
            }

            let next = {
                let events = self.inner.events.lock().await;
                match events.values().find(|e| e.is_actionable()) {
                    Some(event) => event.clone(),
                    None => {
                        self.inner.sending.store(false, Ordering::SeqCst);
                        debug!("Send loop idle");
                        return;
                    }
                }
            };

            let span = info_span!(
                "send_event",
                txn_id = %next.txn_id(),
                queue_index = next.queue_index(),
                event_type = %next.event_type()
            );
            let queue_index = next.queue_index();
            let result = self.process_event(next).instrument(span.clone()).await;

            if let Err(error) = result {
                let keep_going = self
                    .handle_send_failure(queue_index, error)
                    .instrument(span)
                    .await;
                if !keep_going {
                    return;
                }
            }
        }
    }

    async fn process_event(&self, mut pending: PendingEvent) -> Result<(), SendError> {
        let queue_index = pending.queue_index();
        let transport = self.inner.transport.as_ref();

        if pending.needs_upload() {
            self.mark(queue_index, PendingEvent::set_uploading_attachments)
                .await?;
            pending.set_uploading_attachments();
            pending
                .upload_attachments(transport)
                .instrument(info_span!("upload_attachments"))
                .await?;
            let record = self.persist_step(&pending).await?;
            pending.replace_record(record);
        }

        if pending.needs_encryption() {
            self.mark(queue_index, PendingEvent::set_encrypting).await?;
            pending.set_encrypting();

            let encryption = self
                .inner
                .encryption
                .read()
                .await
                .clone()
                .ok_or_else(|| SendError::Encryption("room has no encryption context".into()))?;
            let encrypted = encryption
                .encrypt(pending.event_type(), &pending.content_for_encryption(), transport)
                .instrument(info_span!("encrypt"))
                .await?;
            pending.set_encrypted(encrypted);

            let record = self.persist_step(&pending).await?;
            pending.replace_record(record);
        }

        let mut claimed = self.claim_for_sending(queue_index).await?;
        let remote_id = claimed
            .send(transport)
            .instrument(info_span!("transmit"))
            .await?;

        self.commit_remote_id(&claimed, remote_id).await
    }

    /// Apply a transient status change to the live event.
    async fn mark(
        &self,
        queue_index: u64,
        update: impl FnOnce(&mut PendingEvent),
    ) -> Result<(), SendError> {
        let mut events = self.inner.events.lock().await;
        match events.get_mut(&queue_index) {
            Some(event) if !event.is_aborted() => {
                update(event);
                self.emit_updated(event);
                Ok(())
            }
            _ => Err(SendError::Aborted),
        }
    }

    /// Persist the output of an upload or encryption step.
    ///
    /// The stored row stays authoritative for the relation, which may have
    /// been resolved while the step ran.
    async fn persist_step(&self, pending: &PendingEvent) -> Result<PendingEventRecord, SendError> {
        let queue_index = pending.queue_index();
        let mut events = self.inner.events.lock().await;
        if !matches!(events.get(&queue_index), Some(event) if !event.is_aborted()) {
            return Err(SendError::Aborted);
        }

        let step = pending.record().clone();
        let room = self.inner.room_id.to_string();
        let record = self
            .inner
            .store
            .read_write_txn(move |txn| {
                let mut current = txn.get(&room, queue_index)?.ok_or_else(|| {
                    DatabaseError::NotFound(format!("pending event {}", step.txn_id))
                })?;
                current.content = step.content;
                current.needs_upload = step.needs_upload;
                current.needs_encryption = step.needs_encryption;
                current.encrypted_event_type = step.encrypted_event_type;
                current.encrypted_content = step.encrypted_content;
                if let Some(related_event_id) = current.related_event_id.clone() {
                    apply_related_event_id(&mut current, &related_event_id);
                }
                txn.update(&current)?;
                Ok(current)
            })
            .await?;

        if let Some(event) = events.get_mut(&queue_index) {
            event.replace_record(record.clone());
        }
        Ok(record)
    }

    /// Mark the live event Sending and hand back a copy to transmit.
    async fn claim_for_sending(&self, queue_index: u64) -> Result<PendingEvent, SendError> {
        let mut events = self.inner.events.lock().await;
        let event = match events.get_mut(&queue_index) {
            Some(event) if !event.is_aborted() => event,
            _ => return Err(SendError::Aborted),
        };
        if event.record().has_unresolved_relation() {
            return Err(SendError::UnresolvedRelation(event.txn_id()));
        }

        event.set_sending();
        self.emit_updated(event);
        Ok(event.clone())
    }

    /// Persist the remote id and resolve dependent relations atomically.
    async fn commit_remote_id(
        &self,
        sent: &PendingEvent,
        remote_id: EventId,
    ) -> Result<(), SendError> {
        let queue_index = sent.queue_index();
        let mut events = self.inner.events.lock().await;

        let room = self.inner.room_id.to_string();
        let txn_id = sent.txn_id();
        let related_txn = txn_id.to_string();
        let remote = remote_id.to_string();
        let resolved = self
            .inner
            .store
            .read_write_txn(move |txn| {
                if let Some(mut record) = txn.get(&room, queue_index)? {
                    record.remote_id = Some(remote.clone());
                    txn.update(&record)?;
                }
                resolve_relations(txn, &room, &related_txn, &remote)
            })
            .await?;

        if let Some(event) = events.get_mut(&queue_index) {
            event.set_sent(&remote_id);
            self.emit_updated(event);
        }
        info!(
            room_id = %self.inner.room_id,
            txn_id = %txn_id,
            event_id = %remote_id,
            resolved = resolved.len(),
            "Event sent"
        );
        self.apply_resolved_locked(&mut events, resolved);
        Ok(())
    }

    /// Returns whether the loop should continue.
    async fn handle_send_failure(&self, queue_index: u64, error: SendError) -> bool {
        let mut events = self.inner.events.lock().await;
        let Some(event) = events.get_mut(&queue_index) else {
            debug!(error = %error, "Event removed while processing");
            return true;
        };
        if event.is_aborted() || error == SendError::Aborted {
            debug!("Event aborted while processing");
            return true;
        }

        match error.kind(&self.inner.config) {
            SendErrorKind::Connectivity => {
                event.set_waiting();
                self.emit_updated(event);
                self.inner.offline.store(true, Ordering::SeqCst);
                self.emit(SideEffect::QueueOffline {
                    room_id: self.inner.room_id.clone(),
                });
                warn!(error = %error, "Connection lost, pausing send queue");

                self.inner.sending.store(false, Ordering::SeqCst);
                drop(events);

                // A resume may have landed while the flag was still held
                !self.is_offline()
                    && !self.is_disposed()
                    && self
                        .inner
                        .sending
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
            }
            SendErrorKind::Permanent => {
                let txn_id = event.txn_id();
                match self
                    .remove_locked(&mut events, queue_index, RemovalReason::Rejected)
                    .await
                {
                    Ok(()) => {
                        warn!(
                            txn_id = %txn_id,
                            status = ?error.status(),
                            error = %error,
                            "Event rejected, removed from queue"
                        );
                    }
                    Err(db_error) => {
                        error!(txn_id = %txn_id, error = %db_error, "Failed to remove rejected event");
                        if let Some(event) = events.get_mut(&queue_index) {
                            event.set_error(SendError::from(db_error));
                            self.emit_updated(event);
                        }
                    }
                }
                true
            }
            SendErrorKind::Other => {
                warn!(error = %error, "Event failed, parked in error state");
                event.set_error(error);
                self.emit_updated(event);
                true
            }
        }
    }
}

/// Remove a record and, transitively, every record of the room still
/// waiting for its remote id. Returns the queue indices of the dependents.
fn remove_with_dependents(
    txn: &PendingEventsTxn<'_>,
    room_id: &str,
    queue_index: u64,
) -> DatabaseResult<Vec<u64>> {
    let Some(target) = txn.get(room_id, queue_index)? else {
        return Ok(Vec::new());
    };
    txn.remove(room_id, queue_index)?;

    let mut dependents = Vec::new();
    let mut orphaned = vec![target.txn_id];
    while let Some(related_txn_id) = orphaned.pop() {
        for record in txn.get_room(room_id)? {
            if record.has_unresolved_relation()
                && record.related_txn_id.as_deref() == Some(related_txn_id.as_str())
            {
                txn.remove(room_id, record.queue_index)?;
                dependents.push(record.queue_index);
                orphaned.push(record.txn_id);
            }
        }
    }
    Ok(dependents)
}

/// Resolve `related_event_id` on every record of the room that waits for
/// `related_txn_id`.
fn resolve_relations(
    txn: &PendingEventsTxn<'_>,
    room_id: &str,
    related_txn_id: &str,
    remote_id: &str,
) -> DatabaseResult<Vec<PendingEventRecord>> {
    let mut resolved = Vec::new();
    for mut record in txn.get_room(room_id)? {
        if record.related_txn_id.as_deref() == Some(related_txn_id)
            && record.related_event_id.is_none()
        {
            apply_related_event_id(&mut record, remote_id);
            txn.update(&record)?;
            resolved.push(record);
        }
    }
    Ok(resolved)
}
