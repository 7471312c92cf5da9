//! IPC bridge: stdin reader, stdout event emitter, and the observer that
//! turns engine notifications into events.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{EngineCommand, EngineEvent};
use crate::debug_log::DebugEvent;
use crate::error::EngineError;
use crate::session::{ConversationItem, SessionObserver, SessionSnapshot};

/// Event types whose payload is raw audio.
const AUDIO_EVENT_TYPES: [&str; 2] = ["input_audio_buffer.append", "response.audio.delta"];

/// Emit an `EngineEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &EngineEvent) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Ignore write/flush errors; the pipe may be closed.
    let _ = write_event(&mut handle, event);
}

fn write_event(out: &mut impl Write, event: &EngineEvent) -> io::Result<()> {
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{}", json)?;
    out.flush()
}

pub fn emit_error(err: &EngineError) {
    emit_event(&EngineEvent::Error {
        kind: err.kind().to_string(),
        message: err.to_string(),
    });
}

/// If the input has a `"type"` field but no `"command"` field, rename
/// `"type"` to `"command"` so serde can deserialize it.
fn normalize_command_json(input: &str) -> String {
    if let Ok(mut obj) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(input)
    {
        if !obj.contains_key("command") {
            if let Some(type_val) = obj.remove("type") {
                obj.insert("command".to_string(), type_val);
                if let Ok(json) = serde_json::to_string(&obj) {
                    return json;
                }
            }
        }
    }
    input.to_string()
}

fn parse_command(line: &str) -> Result<EngineCommand, serde_json::Error> {
    serde_json::from_str(&normalize_command_json(line))
}

/// Spawn a blocking thread that reads JSON lines from stdin and forwards
/// parsed commands through the returned channel.
///
/// The thread exits when stdin is closed or the receiver is dropped.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<EngineCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_command(trimmed) {
                        Ok(cmd) => {
                            debug!(?cmd, "Received command");
                            if tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Invalid JSON command: {} (input: {})", e, trimmed);
                            emit_event(&EngineEvent::Error {
                                kind: "invalid_command".into(),
                                message: format!("Invalid JSON command: {}", e),
                            });
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

/// Forwards engine notifications to stdout.
///
/// Audio-carrying protocol events are held back unless `forward_audio` is
/// set; they stay in the diagnostic log either way.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpcObserver {
    pub forward_audio: bool,
}

impl IpcObserver {
    fn forwards(&self, event: &DebugEvent) -> bool {
        self.forward_audio || !AUDIO_EVENT_TYPES.contains(&event.event_type())
    }
}

impl SessionObserver for IpcObserver {
    fn on_event(&self, event: &DebugEvent) {
        if self.forwards(event) {
            emit_event(&EngineEvent::ProtocolEvent(event.clone()));
        }
    }

    fn on_error(&self, err: &EngineError) {
        emit_error(err);
    }

    fn on_item_updated(&self, item: &ConversationItem) {
        emit_event(&EngineEvent::ItemUpdated(item.clone()));
    }

    fn on_state_changed(&self, snapshot: &SessionSnapshot) {
        emit_event(&EngineEvent::StateChange(snapshot.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_log::EventSource;
    use serde_json::json;

    #[test]
    fn test_write_event_is_one_line() {
        let mut buf = Vec::new();
        write_event(&mut buf, &EngineEvent::Stopping {}).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\"event\":\"stopping\",\"data\":{}}\n");
    }

    #[test]
    fn test_type_field_is_accepted_as_command() {
        assert!(matches!(parse_command(r#"{"type":"ping"}"#), Ok(EngineCommand::Ping {})));
        assert!(matches!(
            parse_command(r#"{"command":"send_text","type":"ignored","text":"hi"}"#),
            Ok(EngineCommand::SendText { .. })
        ));
        assert_eq!(normalize_command_json("not json"), "not json");
    }

    #[test]
    fn test_audio_events_held_back_by_default() {
        let append = DebugEvent::new(
            EventSource::Client,
            json!({"type": "input_audio_buffer.append", "audio": "AAAA"}),
        );
        let update = DebugEvent::new(EventSource::Client, json!({"type": "session.update"}));

        let quiet = IpcObserver::default();
        assert!(!quiet.forwards(&append));
        assert!(quiet.forwards(&update));

        let verbose = IpcObserver { forward_audio: true };
        assert!(verbose.forwards(&append));
    }
}
