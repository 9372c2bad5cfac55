//! Room encryption seam and a symmetric shared-key implementation.

use crate::error::SendError;
use crate::transport::Transport;
use crate::types::{RoomId, TxnId, ENCRYPTED_EVENT_TYPE};
use async_trait::async_trait;
use courier_config_and_utils::{encrypt_room_payload, RoomKey};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Algorithm name advertised in encrypted content.
pub const ROOM_ALGORITHM: &str = "m.chacha20poly1305.v1";

/// Event type used to share a room key with member devices.
pub const ROOM_KEY_EVENT_TYPE: &str = "m.room_key";

/// Encrypted replacement for an event's type and content.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedEvent {
    pub event_type: String,
    pub content: Value,
}

/// Encrypts outgoing room events.
///
/// `transport` is passed in so implementations can share keys with other
/// devices before the first encrypted event leaves.
#[async_trait]
pub trait RoomEncryption: Send + Sync {
    async fn encrypt(
        &self,
        event_type: &str,
        content: &Value,
        transport: &dyn Transport,
    ) -> Result<EncryptedEvent, SendError>;
}

/// Shared-key room encryption with ChaCha20-Poly1305.
///
/// The key is sent once to every recipient device over to-device
/// messaging before the first event is encrypted with it.
pub struct SymmetricRoomEncryption {
    room_id: RoomId,
    key: RoomKey,
    device_id: String,
    /// user id -> device ids receiving the key.
    recipients: BTreeMap<String, Vec<String>>,
    key_shared: AtomicBool,
}

impl SymmetricRoomEncryption {
    pub fn new(room_id: RoomId, key: RoomKey, device_id: impl Into<String>) -> Self {
        Self {
            room_id,
            key,
            device_id: device_id.into(),
            recipients: BTreeMap::new(),
            key_shared: AtomicBool::new(false),
        }
    }

    /// Add a device that must receive the room key.
    pub fn with_recipient(mut self, user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.recipients
            .entry(user_id.into())
            .or_default()
            .push(device_id.into());
        self
    }

    /// Whether the key has been delivered to the recipients.
    pub fn is_key_shared(&self) -> bool {
        self.key_shared.load(Ordering::SeqCst)
    }

    async fn share_key(&self, transport: &dyn Transport) -> Result<(), SendError> {
        if self.is_key_shared() {
            return Ok(());
        }
        if self.recipients.is_empty() {
            self.key_shared.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let key_content = json!({
            "algorithm": ROOM_ALGORITHM,
            "room_id": self.room_id,
            "session_id": self.key.key_id(),
            "session_key": self.key.to_base64(),
        });

        let mut messages = Map::new();
        for (user_id, devices) in &self.recipients {
            let per_device: Map<String, Value> = devices
                .iter()
                .map(|device| (device.clone(), key_content.clone()))
                .collect();
            messages.insert(user_id.clone(), Value::Object(per_device));
        }

        transport
            .send_to_device(ROOM_KEY_EVENT_TYPE, &TxnId::new(), &Value::Object(messages))
            .await?;

        self.key_shared.store(true, Ordering::SeqCst);
        info!(
            room_id = %self.room_id,
            session_id = %self.key.key_id(),
            users = self.recipients.len(),
            "Shared room key"
        );
        Ok(())
    }
}

#[async_trait]
impl RoomEncryption for SymmetricRoomEncryption {
    async fn encrypt(
        &self,
        event_type: &str,
        content: &Value,
        transport: &dyn Transport,
    ) -> Result<EncryptedEvent, SendError> {
        self.share_key(transport).await?;

        let plaintext = json!({
            "type": event_type,
            "content": content,
            "room_id": self.room_id,
        });
        let bytes =
            serde_json::to_vec(&plaintext).map_err(|e| SendError::Encryption(e.to_string()))?;
        let payload = encrypt_room_payload(&self.key, &bytes)
            .map_err(|e| SendError::Encryption(e.to_string()))?;

        debug!(room_id = %self.room_id, event_type, "Encrypted event");
        Ok(EncryptedEvent {
            event_type: ENCRYPTED_EVENT_TYPE.to_string(),
            content: json!({
                "algorithm": ROOM_ALGORITHM,
                "session_id": self.key.key_id(),
                "device_id": self.device_id,
                "ciphertext": payload.ciphertext_b64,
                "nonce": payload.nonce_b64,
            }),
        })
    }
}
