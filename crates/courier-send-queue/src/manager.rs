//! Send queue manager coordinating per-room queues.

use crate::config::SendQueueConfig;
use crate::encryption::RoomEncryption;
use crate::error::SendQueueResult;
use crate::pending_event::{OutgoingEvent, SendStatus};
use crate::queue::{RedactionOutcome, SendQueue};
use crate::side_effect::SideEffectSink;
use crate::transport::Transport;
use crate::types::{RedactionTarget, RemoteEcho, RoomId, TxnId};
use courier_database::{PendingEventRecord, PendingEventStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Owns one [`SendQueue`] per room over a shared store and transport.
pub struct SendQueueManager {
    store: PendingEventStore,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn SideEffectSink>,
    config: SendQueueConfig,
    queues: RwLock<HashMap<RoomId, SendQueue>>,
}

impl SendQueueManager {
    pub fn new(
        store: PendingEventStore,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn SideEffectSink>,
        config: SendQueueConfig,
    ) -> Self {
        Self {
            store,
            transport,
            sink,
            config,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild every room's queue from the store (crash recovery).
    ///
    /// Queues are not started; install encryption contexts, then call
    /// [`SendQueueManager::resume_all`]. Returns the number of recovered
    /// events.
    pub async fn load(&self) -> SendQueueResult<usize> {
        let records = self.store.read_txn(|txn| txn.get_all()).await?;
        let total = records.len();

        let mut by_room: HashMap<RoomId, Vec<PendingEventRecord>> = HashMap::new();
        for record in records {
            by_room
                .entry(RoomId::from(record.room_id.as_str()))
                .or_default()
                .push(record);
        }

        let mut queues = self.queues.write().await;
        for (room_id, records) in by_room {
            if queues.contains_key(&room_id) {
                continue;
            }
            let queue = SendQueue::from_records(
                room_id.clone(),
                records,
                self.store.clone(),
                self.transport.clone(),
                self.sink.clone(),
                self.config.clone(),
            );
            queues.insert(room_id, queue);
        }

        info!(rooms = queues.len(), events = total, "Loaded send queues");
        Ok(total)
    }

    /// Get or create the queue of a room.
    pub async fn get_or_create_queue(&self, room_id: &RoomId) -> SendQueueResult<SendQueue> {
        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(room_id) {
                return Ok(queue.clone());
            }
        }

        let queue = SendQueue::load(
            room_id.clone(),
            self.store.clone(),
            self.transport.clone(),
            self.sink.clone(),
            self.config.clone(),
        )
        .await?;

        let mut queues = self.queues.write().await;
        // Another caller may have created it while loading
        let queue = queues.entry(room_id.clone()).or_insert(queue).clone();

        debug!(room_id = %room_id, "Created send queue");
        Ok(queue)
    }

    /// Install or clear a room's encryption context.
    pub async fn set_room_encryption(
        &self,
        room_id: &RoomId,
        encryption: Option<Arc<dyn RoomEncryption>>,
    ) -> SendQueueResult<()> {
        let queue = self.get_or_create_queue(room_id).await?;
        queue.set_encryption(encryption).await;
        Ok(())
    }

    pub async fn enqueue_event(
        &self,
        room_id: &RoomId,
        event: OutgoingEvent,
    ) -> SendQueueResult<TxnId> {
        let queue = self.get_or_create_queue(room_id).await?;
        queue.enqueue_event(event).await
    }

    pub async fn enqueue_redaction(
        &self,
        room_id: &RoomId,
        target: RedactionTarget,
        reason: Option<String>,
    ) -> SendQueueResult<RedactionOutcome> {
        let queue = self.get_or_create_queue(room_id).await?;
        queue.enqueue_redaction(target, reason).await
    }

    /// Remove a room's server-confirmed events.
    pub async fn confirm_remote_echos(
        &self,
        room_id: &RoomId,
        echoes: Vec<RemoteEcho>,
    ) -> SendQueueResult<usize> {
        let queue = self.get_or_create_queue(room_id).await?;
        queue.confirm_remote_echos(echoes).await
    }

    /// Leave offline mode on every queue and restart their loops.
    pub async fn resume_all(&self) {
        let queues = self.queues.read().await;
        for queue in queues.values() {
            queue.resume_sending();
        }
        debug!(rooms = queues.len(), "Resumed all send queues");
    }

    /// Dispose and forget a room's queue. Stored records are kept.
    pub async fn remove_queue(&self, room_id: &RoomId) {
        let removed = self.queues.write().await.remove(room_id);
        if let Some(queue) = removed {
            queue.dispose().await;
            info!(room_id = %room_id, "Removed send queue");
        }
    }

    /// Status of every queue.
    pub async fn get_status(&self) -> HashMap<RoomId, QueueStatus> {
        let queues = self.queues.read().await;
        let mut status = HashMap::new();

        for (room_id, queue) in queues.iter() {
            let events = queue.pending_events().await;
            status.insert(
                room_id.clone(),
                QueueStatus {
                    pending: events.len(),
                    errors: events
                        .iter()
                        .filter(|e| e.status == SendStatus::Error)
                        .count(),
                    sending: queue.is_sending(),
                    offline: queue.is_offline(),
                },
            );
        }

        status
    }

    pub async fn queue_count(&self) -> usize {
        self.queues.read().await.len()
    }

    /// Dispose every queue.
    pub async fn dispose_all(&self) {
        let queues: Vec<SendQueue> = self.queues.write().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.dispose().await;
        }
    }
}

/// Status of one room's send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Events still in the queue, including sent ones awaiting their echo.
    pub pending: usize,
    /// Events parked in Error.
    pub errors: usize,
    pub sending: bool,
    pub offline: bool,
}
