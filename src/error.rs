//! Error taxonomy for the conversation engine.
//!
//! Each concern has its own enum; [`EngineError`] is what engine operations
//! return and what observers receive.

use thiserror::Error;

use crate::session::ConnectionState;

/// Microphone acquisition and capture failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Missing, busy, or permission-denied input device.
    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to start capture stream: {0}")]
    StreamFailed(String),
    #[error("microphone has not been acquired")]
    NotAcquired,
}

/// Relay socket failures. Any of these ends a connected session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error("relay did not open within {0} ms")]
    Timeout(u64),
    #[error("relay connection closed{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed(Option<String>),
    #[error("relay transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to decode artifact {uri}: {reason}")]
    Decode { uri: String, reason: String },
    #[error("audio output unavailable: {0}")]
    Output(String),
    #[error("no playback track for item {0}")]
    UnknownTrack(String),
    #[error("item {0} has no audio artifact yet")]
    NoArtifact(String),
    #[error("seek failed: {0}")]
    Seek(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccumulatorError {
    /// A chunk arrived for an item whose buffer was already merged.
    #[error("stale chunk for sealed item {item_id}")]
    StaleChunk { item_id: String },
}

/// Inbound frames that cannot be understood.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed inbound event: {0}")]
    Malformed(String),
    #[error("{event_type} is missing field `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("failed to persist artifact: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("session is already {0}")]
    AlreadyActive(ConnectionState),
    #[error("session is not connected")]
    NotConnected,
    #[error("unknown conversation item: {0}")]
    UnknownItem(String),
    /// An `error` event sent by the remote service.
    #[error("remote error: {0}")]
    Remote(String),
}

impl EngineError {
    /// Short machine-readable category, used on the IPC wire.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Capture(CaptureError::DeviceUnavailable(_)) => "device_unavailable",
            EngineError::Capture(_) => "capture",
            EngineError::Relay(_) => "socket",
            EngineError::Playback(_) => "playback",
            EngineError::Accumulator(_) => "stale_chunk",
            EngineError::Protocol(_) => "malformed_event",
            EngineError::Artifact(_) => "artifact",
            EngineError::AlreadyActive(_) => "already_active",
            EngineError::NotConnected => "not_connected",
            EngineError::UnknownItem(_) => "unknown_item",
            EngineError::Remote(_) => "remote",
        }
    }
}
