//! Side-effects of the send queue.
//!
//! Side-effects are emitted after the change they describe has been
//! committed to SQLite. Recovery emits nothing.

use crate::pending_event::SendStatus;
use crate::types::{RoomId, TxnId};

/// Why a pending event left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Withdrawn locally before it reached the server.
    Aborted,
    /// Permanently refused by the server.
    Rejected,
    /// Its echo arrived through sync.
    RemoteEcho,
}

/// An observable change of a send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// A new event was appended to a room's queue.
    EventAdded {
        room_id: RoomId,
        txn_id: TxnId,
        queue_index: u64,
    },
    /// The status or content of a pending event changed.
    EventUpdated {
        room_id: RoomId,
        txn_id: TxnId,
        status: SendStatus,
    },
    /// A pending event was removed.
    EventRemoved {
        room_id: RoomId,
        txn_id: TxnId,
        reason: RemovalReason,
    },
    /// Sending paused after a connectivity failure.
    QueueOffline { room_id: RoomId },
}

/// Receives side-effects from send queues.
pub trait SideEffectSink: Send + Sync {
    /// Called after the corresponding change has been committed.
    fn emit(&self, effect: SideEffect);
}

/// Discards all side-effects.
#[derive(Debug, Default)]
pub struct NullSink;

impl SideEffectSink for NullSink {
    fn emit(&self, _effect: SideEffect) {}
}

/// Records side-effects for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    effects: std::sync::Mutex<Vec<SideEffect>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded side-effects.
    pub fn effects(&self) -> Vec<SideEffect> {
        self.effects.lock().expect("lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.effects.lock().expect("lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.effects.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SideEffectSink for RecordingSink {
    fn emit(&self, effect: SideEffect) {
        self.effects.lock().expect("lock poisoned").push(effect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_records_in_order() {
        let sink = RecordingSink::new();
        let room_id = RoomId::from("!r:x");
        let txn_id = TxnId::from("t1");

        sink.emit(SideEffect::EventAdded {
            room_id: room_id.clone(),
            txn_id: txn_id.clone(),
            queue_index: 1,
        });
        sink.emit(SideEffect::EventRemoved {
            room_id: room_id.clone(),
            txn_id: txn_id.clone(),
            reason: RemovalReason::RemoteEcho,
        });

        let effects = sink.effects();
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[0], SideEffect::EventAdded { queue_index: 1, .. }));
        assert!(matches!(
            effects[1],
            SideEffect::EventRemoved { reason: RemovalReason::RemoteEcho, .. }
        ));

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn null_sink_discards_effects() {
        NullSink.emit(SideEffect::QueueOffline {
            room_id: RoomId::from("!r:x"),
        });
    }
}
