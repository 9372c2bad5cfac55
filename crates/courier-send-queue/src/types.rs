//! Identifier types and constants for the send queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type of a redaction.
pub const REDACTION_EVENT_TYPE: &str = "m.room.redaction";

/// Event type produced by room encryption.
pub const ENCRYPTED_EVENT_TYPE: &str = "m.room.encrypted";

/// Content key carrying an event's relation to another event.
pub const RELATES_TO_KEY: &str = "m.relates_to";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Creates the identifier from an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a conversation (`!opaque:server`).
    RoomId
);

string_id!(
    /// Client-generated idempotency token for one outgoing event.
    TxnId
);

string_id!(
    /// Server-assigned event id (`$opaque`).
    EventId
);

impl TxnId {
    /// Generates a fresh transaction id.
    ///
    /// Transaction ids never start with `$`, which keeps them apart from
    /// server event ids wherever either may appear.
    pub fn new() -> Self {
        Self(format!("t{}", Uuid::new_v4().simple()))
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl EventId {
    /// Whether a raw id string has the shape of a server event id.
    pub fn looks_like_event_id(raw: &str) -> bool {
        raw.starts_with('$')
    }
}

/// What a redaction points at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RedactionTarget {
    /// An event the server already knows.
    Event(EventId),
    /// A local event identified by its transaction id.
    Txn(TxnId),
}

impl RedactionTarget {
    /// Classifies a raw id: `$`-prefixed ids are server event ids,
    /// everything else is a local transaction id.
    pub fn parse(raw: &str) -> Self {
        if EventId::looks_like_event_id(raw) {
            Self::Event(EventId::from(raw))
        } else {
            Self::Txn(TxnId::from(raw))
        }
    }
}

/// A server-confirmed copy of an event this client sent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteEcho {
    pub event_id: EventId,
    /// Present when the echo came back to the sending device.
    pub txn_id: Option<TxnId>,
}

impl RemoteEcho {
    pub fn new(event_id: impl Into<EventId>, txn_id: Option<TxnId>) -> Self {
        Self {
            event_id: event_id.into(),
            txn_id,
        }
    }
}

/// Reads `m.relates_to.event_id` from event content.
pub fn relation_target(content: &Value) -> Option<&str> {
    content
        .get(RELATES_TO_KEY)
        .and_then(|relates_to| relates_to.get("event_id"))
        .and_then(Value::as_str)
}
