//! Configuration, paths, logging and room-key crypto for the Courier client.

mod config;
mod error;
mod logging;
mod paths;
pub mod room_crypto;

pub use config::{
    Config, DEFAULT_HOMESERVER_URL, DEFAULT_LOG_LEVEL, DEFAULT_PERMANENT_STATUSES,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_with_config, LogConfig, LogFileWriter};
pub use paths::Paths;
pub use room_crypto::{
    decrypt_room_payload, encrypt_room_payload, encrypt_room_payload_with_nonce,
    EncryptedRoomPayload, RoomCryptoError, RoomKey,
};
