//! Transformation and transmission steps of a pending event.

use super::{text, wait_for_idle, Harness, MockEncryption};
use crate::attachment::Attachment;
use crate::encryption::RoomEncryption;
use crate::error::SendError;
use crate::pending_event::{OutgoingEvent, SendStatus};
use crate::side_effect::SideEffect;
use crate::transport::MediaUpload;
use crate::types::{RedactionTarget, TxnId, ENCRYPTED_EVENT_TYPE};
use crate::RedactionOutcome;
use serde_json::json;
use std::sync::Arc;

fn statuses_of(effects: &[SideEffect], txn_id: &TxnId) -> Vec<SendStatus> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            SideEffect::EventUpdated { txn_id: t, status, .. } if t == txn_id => Some(*status),
            _ => None,
        })
        .collect()
}

fn image_event() -> OutgoingEvent {
    OutgoingEvent::new("m.room.message", json!({"msgtype": "m.image", "body": "cat.png"}))
        .with_attachment(Attachment::new(
            "url",
            MediaUpload {
                content_type: "image/png".to_string(),
                filename: Some("cat.png".to_string()),
                data: vec![1, 2, 3],
            },
        ))
}

#[tokio::test]
async fn full_pipeline_walks_every_status() {
    let h = Harness::new().await;
    let encryption = Arc::new(MockEncryption::new());
    h.queue
        .set_encryption(Some(encryption.clone() as Arc<dyn RoomEncryption>))
        .await;

    let txn_id = h.queue.enqueue_event(image_event()).await.unwrap();
    wait_for_idle(&h.queue).await;

    assert_eq!(
        statuses_of(&h.sink.effects(), &txn_id),
        vec![
            SendStatus::UploadingAttachments,
            SendStatus::Encrypting,
            SendStatus::Sending,
            SendStatus::Sent,
        ]
    );
    assert_eq!(h.transport.upload_count(), 1);
    assert_eq!(encryption.calls(), 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_type, ENCRYPTED_EVENT_TYPE);
    assert_eq!(sent[0].txn_id, txn_id);
    // The uploaded URI reached the plaintext before encryption
    let ciphertext = sent[0].content["ciphertext"].as_str().unwrap();
    assert!(ciphertext.contains("mxc://test/cat.png"));

    let stored = h.stored().await;
    assert!(!stored[0].needs_upload);
    assert!(!stored[0].needs_encryption);
    assert_eq!(stored[0].content["url"], "mxc://test/cat.png");
    assert_eq!(
        stored[0].encrypted_event_type.as_deref(),
        Some(ENCRYPTED_EVENT_TYPE)
    );
    assert_eq!(stored[0].remote_id.as_deref(), Some("$e1"));
}

#[tokio::test]
async fn plain_event_skips_upload_and_encryption() {
    let h = Harness::new().await;

    let txn_id = h.enqueue_text("plain").await;
    wait_for_idle(&h.queue).await;

    assert_eq!(
        statuses_of(&h.sink.effects(), &txn_id),
        vec![SendStatus::Sending, SendStatus::Sent]
    );
    assert_eq!(h.transport.sent()[0].event_type, "m.room.message");
}

#[tokio::test]
async fn upload_without_encryption_skips_encrypting() {
    let h = Harness::new().await;

    let txn_id = h.queue.enqueue_event(image_event()).await.unwrap();
    wait_for_idle(&h.queue).await;

    assert_eq!(
        statuses_of(&h.sink.effects(), &txn_id),
        vec![
            SendStatus::UploadingAttachments,
            SendStatus::Sending,
            SendStatus::Sent,
        ]
    );
    assert_eq!(h.transport.sent()[0].content["url"], "mxc://test/cat.png");
}

#[tokio::test]
async fn redactions_are_never_encrypted() {
    let h = Harness::new().await;
    let encryption = Arc::new(MockEncryption::new());
    h.queue
        .set_encryption(Some(encryption.clone() as Arc<dyn RoomEncryption>))
        .await;

    let outcome = h
        .queue
        .enqueue_redaction(RedactionTarget::parse("$old"), Some("spam".to_string()))
        .await
        .unwrap();
    assert!(matches!(outcome, RedactionOutcome::Enqueued(_)));
    wait_for_idle(&h.queue).await;

    assert_eq!(encryption.calls(), 0);
    let redactions = h.transport.redactions();
    assert_eq!(redactions.len(), 1);
    assert_eq!(redactions[0].redacts.as_ref().unwrap().as_str(), "$old");
    assert_eq!(redactions[0].content, json!({"reason": "spam"}));
}

#[tokio::test]
async fn relation_stays_in_the_clear_when_encrypted() {
    let h = Harness::new().await;
    h.queue
        .set_encryption(Some(Arc::new(MockEncryption::new()) as Arc<dyn RoomEncryption>))
        .await;

    h.queue
        .enqueue_event(OutgoingEvent::new(
            "m.reaction",
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "$target", "key": "👍"}}),
        ))
        .await
        .unwrap();
    wait_for_idle(&h.queue).await;

    let sent = &h.transport.sent()[0];
    assert_eq!(sent.event_type, ENCRYPTED_EVENT_TYPE);
    assert_eq!(sent.content["m.relates_to"]["event_id"], "$target");
    let ciphertext = sent.content["ciphertext"].as_str().unwrap();
    assert!(!ciphertext.contains("m.relates_to"));
}

#[tokio::test]
async fn encryption_set_after_enqueue_does_not_apply() {
    let h = Harness::new().await;
    h.transport.hold();

    h.enqueue_text("early").await;
    let encryption = Arc::new(MockEncryption::new());
    h.queue
        .set_encryption(Some(encryption.clone() as Arc<dyn RoomEncryption>))
        .await;

    h.transport.release();
    wait_for_idle(&h.queue).await;

    assert_eq!(encryption.calls(), 0);
    assert_eq!(h.transport.sent_bodies(), vec!["early"]);
}

#[tokio::test]
async fn reaction_to_pending_event_resolves_after_send() {
    let h = Harness::new().await;
    h.transport.hold();

    let target = h.enqueue_text("target").await;
    let reaction = h
        .queue
        .enqueue_event(OutgoingEvent::new(
            "m.reaction",
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": target.as_str(), "key": "+1"}}),
        ))
        .await
        .unwrap();

    h.transport.release();
    wait_for_idle(&h.queue).await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].txn_id, reaction);
    assert_eq!(sent[1].content["m.relates_to"]["event_id"], "$e1");

    let pending = h.queue.pending_events().await;
    assert_eq!(pending[1].related_txn_id.as_ref(), Some(&target));
    assert_eq!(pending[1].related_event_id.as_ref().unwrap().as_str(), "$e1");
}

#[tokio::test]
async fn parked_reaction_is_released_when_its_target_is_sent() {
    let h = Harness::new().await;
    h.transport.fail_next(
        "target",
        SendError::Rejected {
            status: 500,
            errcode: "M_UNKNOWN".to_string(),
            message: "try later".to_string(),
        },
    );

    let target = h.enqueue_text("target").await;
    let reaction = h
        .queue
        .enqueue_event(OutgoingEvent::new(
            "m.reaction",
            json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": target.as_str(), "key": "+1"}}),
        ))
        .await
        .unwrap();
    wait_for_idle(&h.queue).await;

    let pending = h.queue.pending_events().await;
    assert_eq!(pending[0].status, SendStatus::Error);
    assert_eq!(pending[1].status, SendStatus::Error);
    assert_eq!(
        pending[1].error.as_deref(),
        Some(SendError::UnresolvedRelation(reaction.clone()).to_string().as_str())
    );

    // Only the target is retried by hand
    h.queue.retry_event(&target).await.unwrap();
    wait_for_idle(&h.queue).await;

    assert_eq!(h.status_of(&target).await, Some(SendStatus::Sent));
    assert_eq!(h.status_of(&reaction).await, Some(SendStatus::Sent));

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].txn_id, reaction);
    assert_eq!(sent[1].content["m.relates_to"]["event_id"], "$e1");
    assert!(h
        .queue
        .pending_events()
        .await
        .iter()
        .all(|e| e.error.is_none()));
}
