//! Send queue error types.

use crate::types::{RoomId, TxnId};
use crate::SendQueueConfig;
use courier_database::DatabaseError;
use thiserror::Error;

/// Failure of one step of delivering a pending event.
///
/// Only [`SendError::kind`] drives control flow; the variants exist for
/// diagnostics and for the UI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Device or server unreachable (DNS, connect, timeout, reset).
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered with a non-success status.
    #[error("Request rejected with HTTP {status} ({errcode}): {message}")]
    Rejected {
        status: u16,
        errcode: String,
        message: String,
    },

    /// Room encryption failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// The event needs an upload but its attachments are gone (lost on restart).
    #[error("Attachments for {0} are no longer available")]
    MissingAttachments(TxnId),

    /// The related event has no remote id yet.
    #[error("Relation of {0} is not resolved yet")]
    UnresolvedRelation(TxnId),

    /// The work was cancelled because the event was aborted.
    #[error("Aborted")]
    Aborted,

    /// The request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The server response could not be parsed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A store transaction failed while persisting progress.
    #[error("Store error: {0}")]
    Store(String),
}

/// Classification deciding what the send loop does after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Pause the queue and mark it offline; the event stays Waiting.
    Connectivity,
    /// Abort the event and remove it; never retried.
    Permanent,
    /// Park the event in Error until retried or removed.
    Other,
}

impl SendError {
    /// Classify this failure under the given queue configuration.
    pub fn kind(&self, config: &SendQueueConfig) -> SendErrorKind {
        match self {
            Self::Connection(_) => SendErrorKind::Connectivity,
            Self::Rejected { status, .. } if config.transient_statuses.contains(status) => {
                SendErrorKind::Connectivity
            }
            Self::Rejected { status, .. } if config.permanent_statuses.contains(status) => {
                SendErrorKind::Permanent
            }
            _ => SendErrorKind::Other,
        }
    }

    /// HTTP status of a rejection, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<DatabaseError> for SendError {
    fn from(e: DatabaseError) -> Self {
        Self::Store(e.to_string())
    }
}

/// Error returned by the public send queue API.
#[derive(Error, Debug)]
pub enum SendQueueError {
    /// Store transaction failed; nothing changed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// No pending event with this transaction id.
    #[error("Pending event not found: {0}")]
    EventNotFound(TxnId),

    /// The event has begun transmission and must run to completion.
    #[error("Pending event {0} is already being sent")]
    SendInProgress(TxnId),

    /// The queue was disposed.
    #[error("Send queue for {0} has been disposed")]
    Disposed(RoomId),
}

/// Result type alias using SendQueueError.
pub type SendQueueResult<T> = Result<T, SendQueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> SendError {
        SendError::Rejected {
            status,
            errcode: "M_UNKNOWN".to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn classifies_default_taxonomy() {
        let config = SendQueueConfig::default();

        assert_eq!(
            SendError::Connection("refused".into()).kind(&config),
            SendErrorKind::Connectivity
        );
        assert_eq!(rejected(400).kind(&config), SendErrorKind::Permanent);
        assert_eq!(rejected(403).kind(&config), SendErrorKind::Permanent);
        assert_eq!(rejected(404).kind(&config), SendErrorKind::Permanent);
        assert_eq!(rejected(503).kind(&config), SendErrorKind::Connectivity);
        assert_eq!(rejected(500).kind(&config), SendErrorKind::Other);
        assert_eq!(rejected(429).kind(&config), SendErrorKind::Other);
        assert_eq!(
            SendError::Encryption("no session".into()).kind(&config),
            SendErrorKind::Other
        );
        assert_eq!(SendError::Store("busy".into()).kind(&config), SendErrorKind::Other);
    }

    #[test]
    fn permanent_statuses_are_configurable() {
        let config = SendQueueConfig {
            permanent_statuses: vec![400, 403, 404, 413],
            ..SendQueueConfig::default()
        };
        assert_eq!(rejected(413).kind(&config), SendErrorKind::Permanent);
        assert_eq!(rejected(413).status(), Some(413));
    }

    #[test]
    fn database_errors_become_store_failures() {
        let err: SendError = DatabaseError::NotFound("row".into()).into();
        assert!(matches!(err, SendError::Store(msg) if msg.contains("row")));
    }
}
