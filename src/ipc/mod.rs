//! JSON-line IPC protocol for driving the engine from a host process.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (engine -> host).
//! Commands use `{"command": "<name>", ...}` format (host -> engine).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::debug_log::{DebugEvent, EventSource};
use crate::playback::{InterruptMark, SurfaceHandle, TrackState};
use crate::session::{ConversationItem, Mode, SessionSnapshot};

// ---------------------------------------------------------------------------
// Events: engine -> host (stdout)
// ---------------------------------------------------------------------------

/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    Starting {},
    Ready {},
    StateChange(SessionSnapshot),
    ItemUpdated(ConversationItem),
    /// One entry of the diagnostic log, as it is recorded.
    ProtocolEvent(DebugEvent),
    Error {
        kind: String,
        message: String,
    },
    DebugLog {
        events: Vec<DebugEvent>,
    },
    TrackState {
        #[serde(rename = "itemId")]
        item_id: String,
        #[serde(flatten)]
        state: TrackState,
    },
    Interrupted(Option<InterruptMark>),
    Downloaded {
        #[serde(rename = "itemId")]
        item_id: String,
        path: String,
    },
    AudioDevices {
        input: Vec<String>,
        output: Vec<String>,
    },
    Pong {},
    Stopping {},
}

// ---------------------------------------------------------------------------
// Commands: host -> engine (stdin)
// ---------------------------------------------------------------------------

/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    Connect {
        #[serde(default)]
        mode: Option<Mode>,
    },
    Disconnect {},
    SetMode {
        mode: Mode,
    },
    StartRecording {},
    StopRecording {},
    Interrupt {},
    SendText {
        text: String,
    },
    AttachSurface {
        item_id: String,
        surface: SurfaceHandle,
    },
    TogglePlay {
        item_id: String,
    },
    Seek {
        item_id: String,
        offset: u64,
    },
    Download {
        item_id: String,
    },
    DebugLog {
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        source: Option<EventSource>,
    },
    ClearDebugLog {},
    ListAudioDevices {},
    Ping {},
    Stop {},
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectionState, ItemStatus, Role};
    use serde_json::{json, Value};

    fn to_value(event: &EngineEvent) -> Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn test_unit_events_have_empty_data() {
        assert_eq!(to_value(&EngineEvent::Pong {}), json!({"event": "pong", "data": {}}));
        assert_eq!(to_value(&EngineEvent::Ready {}), json!({"event": "ready", "data": {}}));
    }

    #[test]
    fn test_state_change_carries_snapshot() {
        let event = EngineEvent::StateChange(SessionSnapshot {
            connection_state: ConnectionState::Connected,
            mode: Mode::ContinuousVad,
            is_recording: false,
            is_remote_speaking: true,
            malformed_events: 2,
        });
        assert_eq!(
            to_value(&event),
            json!({
                "event": "state_change",
                "data": {
                    "connectionState": "connected",
                    "mode": "continuous_vad",
                    "isRecording": false,
                    "isRemoteSpeaking": true,
                    "malformedEvents": 2,
                }
            })
        );
    }

    #[test]
    fn test_item_updated_and_track_state() {
        let item = ConversationItem {
            id: "a1".into(),
            role: Role::Assistant,
            transcript: Some("hi".into()),
            status: ItemStatus::Completed,
            audio_artifact_url: Some("artifact://x.wav".into()),
        };
        let v = to_value(&EngineEvent::ItemUpdated(item));
        assert_eq!(v["event"], "item_updated");
        assert_eq!(v["data"]["audioArtifactUrl"], "artifact://x.wav");

        let v = to_value(&EngineEvent::TrackState {
            item_id: "a1".into(),
            state: TrackState {
                is_playing: true,
                is_loading: false,
                has_error: false,
            },
        });
        assert_eq!(
            v,
            json!({"event": "track_state", "data": {"itemId": "a1", "isPlaying": true, "isLoading": false, "hasError": false}})
        );
    }

    #[test]
    fn test_parse_commands() {
        let cmd: EngineCommand = serde_json::from_str(r#"{"command":"connect","mode":"vad"}"#).unwrap();
        assert!(matches!(cmd, EngineCommand::Connect { mode: Some(Mode::ContinuousVad) }));

        let cmd: EngineCommand = serde_json::from_str(r#"{"command":"connect"}"#).unwrap();
        assert!(matches!(cmd, EngineCommand::Connect { mode: None }));

        let cmd: EngineCommand =
            serde_json::from_str(r#"{"command":"seek","item_id":"a1","offset":4800}"#).unwrap();
        assert!(matches!(cmd, EngineCommand::Seek { ref item_id, offset: 4800 } if item_id == "a1"));

        let cmd: EngineCommand = serde_json::from_str(
            r#"{"command":"attach_surface","item_id":"a1","surface":"wave-3"}"#,
        )
        .unwrap();
        match cmd {
            EngineCommand::AttachSurface { surface, .. } => assert_eq!(surface, SurfaceHandle::new("wave-3")),
            other => panic!("unexpected {other:?}"),
        }

        let cmd: EngineCommand =
            serde_json::from_str(r#"{"command":"debug_log","source":"server"}"#).unwrap();
        assert!(matches!(
            cmd,
            EngineCommand::DebugLog { filter: None, source: Some(EventSource::Server) }
        ));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_str::<EngineCommand>(r#"{"command":"explode"}"#).is_err());
        assert!(serde_json::from_str::<EngineCommand>(r#"{"command":"set_mode","mode":"auto"}"#).is_err());
    }
}
