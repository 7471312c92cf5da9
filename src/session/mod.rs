//! Conversation session: data model, observer interface, and the state
//! machine that drives everything else.
//!
//! `connection_state` moves Disconnected → Connecting → Connected →
//! Disconnected. The `is_recording` and `is_remote_speaking` overlay flags
//! are independent of each other: recording is set and cleared by the
//! manual turn commands, remote-speaking by inbound audio and completion
//! events. Both are forced to false by mode changes and disconnect, and are
//! never true while Disconnected.

mod engine;
mod items;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::debug_log::DebugEvent;
use crate::error::EngineError;

pub use engine::{EngineParts, SessionEngine};
pub use items::ConversationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Turn-taking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Push-to-talk: audio is sent only between start and stop recording.
    Manual,
    /// The server segments turns with voice-activity detection.
    #[serde(alias = "vad")]
    ContinuousVad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Streaming,
    Completed,
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationItem {
    pub id: String,
    pub role: Role,
    pub transcript: Option<String>,
    pub status: ItemStatus,
    pub audio_artifact_url: Option<String>,
}

impl ConversationItem {
    pub fn streaming(id: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            role,
            transcript: None,
            status: ItemStatus::Streaming,
            audio_artifact_url: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Per-conversation state, reset on every connect.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub connection_state: ConnectionState,
    pub mode: Mode,
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    pub is_recording: bool,
    pub is_remote_speaking: bool,
}

impl Session {
    pub fn new(config: &EngineConfig, mode: Mode) -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            mode,
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            temperature: config.temperature,
            is_recording: false,
            is_remote_speaking: false,
        }
    }
}

/// What observers see when session flags change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub mode: Mode,
    pub is_recording: bool,
    pub is_remote_speaking: bool,
    pub malformed_events: u64,
}

/// Receives engine notifications. All methods default to no-ops.
///
/// Calls are one-way; `on_event` may also be invoked from the capture
/// thread when frames are forwarded.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, _event: &DebugEvent) {}
    fn on_error(&self, _error: &EngineError) {}
    fn on_item_updated(&self, _item: &ConversationItem) {}
    fn on_state_changed(&self, _snapshot: &SessionSnapshot) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}
