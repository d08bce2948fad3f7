//! Error types for the collaboration crate.

use crate::site::SiteId;
use thiserror::Error;

/// Result type alias for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can occur while replicating or synchronizing a document.
///
/// None of these are raised on the local editing path: the engine itself is
/// total, and the session turns every fault into a status change or a
/// transient error event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// The transport failed to connect or lost its connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded into a known message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The session is not connected.
    #[error("Session is not connected")]
    NotConnected,

    /// A direct peer channel rejected a frame.
    #[error("Peer channel to {0} failed")]
    PeerChannelFailed(SiteId),

    /// All reconnect attempts were used up.
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Serialization(err.to_string())
    }
}
