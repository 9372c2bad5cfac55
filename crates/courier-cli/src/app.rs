//! Command implementations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use courier_config_and_utils::{Config, Paths};
use courier_database::PendingEventStore;
use courier_send_queue::{
    HttpTransport, OutgoingEvent, RedactionOutcome, RedactionTarget, RoomId, SendQueueConfig,
    SendQueueManager, SideEffect, SideEffectSink, TransportConfig,
};
use serde_json::json;
use tracing::{info, warn};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reports queue side-effects through the log.
struct LogSink;

impl SideEffectSink for LogSink {
    fn emit(&self, effect: SideEffect) {
        match effect {
            SideEffect::EventAdded {
                room_id,
                txn_id,
                queue_index,
            } => info!(room_id = %room_id, txn_id = %txn_id, queue_index, "Queued"),
            SideEffect::EventUpdated {
                room_id,
                txn_id,
                status,
            } => info!(room_id = %room_id, txn_id = %txn_id, status = %status, "Updated"),
            SideEffect::EventRemoved {
                room_id,
                txn_id,
                reason,
            } => info!(room_id = %room_id, txn_id = %txn_id, reason = ?reason, "Removed"),
            SideEffect::QueueOffline { room_id } => {
                warn!(room_id = %room_id, "Homeserver unreachable, queue paused")
            }
        }
    }
}

async fn open_store(paths: &Paths) -> Result<PendingEventStore, Box<dyn std::error::Error>> {
    paths.ensure_dirs()?;
    Ok(PendingEventStore::open(&paths.database_file()).await?)
}

async fn open_manager(
    config: &Config,
    paths: &Paths,
) -> Result<SendQueueManager, Box<dyn std::error::Error>> {
    let store = open_store(paths).await?;
    let transport = HttpTransport::new(TransportConfig::from_config(config)?)?;
    let manager = SendQueueManager::new(
        store,
        Arc::new(transport),
        Arc::new(LogSink),
        SendQueueConfig::from_config(config),
    );
    manager.load().await?;
    Ok(manager)
}

/// Waits until no queue has a running send loop.
async fn wait_until_idle(manager: &SendQueueManager) {
    loop {
        let status = manager.get_status().await;
        if status.values().all(|s| !s.sending) {
            return;
        }
        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
    }
}

async fn finish(manager: SendQueueManager) {
    wait_until_idle(&manager).await;
    for (room_id, status) in manager.get_status().await {
        if status.offline {
            warn!(room_id = %room_id, pending = status.pending, "Left pending, run `courier flush` later");
        } else if status.errors > 0 {
            warn!(room_id = %room_id, errors = status.errors, "Events failed to send");
        }
    }
    manager.dispose_all().await;
}

pub async fn send_text(
    config: &Config,
    paths: &Paths,
    room: &str,
    body: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open_manager(config, paths).await?;
    let room_id = RoomId::from(room);

    let event = OutgoingEvent::new("m.room.message", json!({"msgtype": "m.text", "body": body}));
    let txn_id = manager.enqueue_event(&room_id, event).await?;
    println!("{}", txn_id);

    manager.resume_all().await;
    finish(manager).await;
    Ok(())
}

pub async fn redact(
    config: &Config,
    paths: &Paths,
    room: &str,
    target: &str,
    reason: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open_manager(config, paths).await?;
    let room_id = RoomId::from(room);

    let outcome = manager
        .enqueue_redaction(&room_id, RedactionTarget::parse(target), reason)
        .await?;
    match outcome {
        RedactionOutcome::Enqueued(txn_id) => println!("{}", txn_id),
        RedactionOutcome::AbortedLocally => println!("Removed unsent event {}", target),
        RedactionOutcome::AlreadyRedacted => println!("Redaction of {} already queued", target),
        RedactionOutcome::UnknownTarget => println!("No pending event {}", target),
    }

    manager.resume_all().await;
    finish(manager).await;
    Ok(())
}

pub async fn flush(config: &Config, paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let manager = open_manager(config, paths).await?;
    manager.resume_all().await;
    finish(manager).await;
    Ok(())
}

pub async fn print_status(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(paths).await?;
    let records = store.read_txn(|txn| txn.get_all()).await?;

    if records.is_empty() {
        println!("No pending events");
        return Ok(());
    }

    let mut by_room: BTreeMap<&str, Vec<_>> = BTreeMap::new();
    for record in &records {
        by_room.entry(record.room_id.as_str()).or_default().push(record);
    }

    for (room_id, records) in by_room {
        println!("{} ({} pending)", room_id, records.len());
        for record in records {
            let state = match &record.remote_id {
                Some(event_id) => format!("sent as {}", event_id),
                None => "waiting".to_string(),
            };
            println!(
                "  #{} {} {} {}",
                record.queue_index, record.txn_id, record.event_type, state
            );
        }
    }
    Ok(())
}
