//! Send queue configuration.

use courier_config_and_utils::{Config, DEFAULT_PERMANENT_STATUSES};

/// Gateway statuses meaning the homeserver is unreachable rather than
/// refusing the request.
pub const DEFAULT_TRANSIENT_STATUSES: [u16; 3] = [502, 503, 504];

/// Policy knobs of a send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendQueueConfig {
    /// Statuses after which the event is aborted and removed.
    pub permanent_statuses: Vec<u16>,
    /// Statuses treated like a lost connection.
    pub transient_statuses: Vec<u16>,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            permanent_statuses: DEFAULT_PERMANENT_STATUSES.to_vec(),
            transient_statuses: DEFAULT_TRANSIENT_STATUSES.to_vec(),
        }
    }
}

impl SendQueueConfig {
    /// Build the queue policy from the client configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            permanent_statuses: config.permanent_statuses.clone(),
            ..Self::default()
        }
    }
}
