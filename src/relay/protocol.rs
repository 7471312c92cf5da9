//! Realtime relay wire protocol.
//!
//! Outbound events are typed [`ClientEvent`]s serialized with a `type` tag.
//! Inbound frames are first decoded to JSON (so they can be logged verbatim)
//! and then interpreted into [`ServerEvent`]s the engine acts on.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;

use crate::audio::wav::{decode_wav, pcm16_from_le_bytes, pcm16_to_le_bytes, samples_to_ms};
use crate::config::VadConfig;
use crate::error::ProtocolError;
use crate::playback::InterruptMark;
use crate::session::{Mode, Role};

// ── Outbound ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    CommitAudio,
    #[serde(rename = "response.create")]
    CreateResponse,
    #[serde(rename = "response.cancel")]
    CancelResponse,
    #[serde(rename = "conversation.item.truncate")]
    TruncateItem {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
    #[serde(rename = "conversation.item.create")]
    CreateItem { item: OutboundItem },
}

impl ClientEvent {
    /// Base64-encode a PCM16 frame for `input_audio_buffer.append`.
    pub fn append_audio(frame: &[i16]) -> Self {
        ClientEvent::AppendAudio {
            audio: BASE64.encode(pcm16_to_le_bytes(frame)),
        }
    }

    pub fn user_text(text: &str) -> Self {
        ClientEvent::CreateItem {
            item: OutboundItem {
                kind: "message".into(),
                role: Role::User,
                content: vec![ContentPart {
                    kind: "input_text".into(),
                    text: text.to_string(),
                }],
            },
        }
    }

    /// Cancel the in-flight response and truncate the interrupted item to
    /// what was actually heard. `mark.offset` is in samples at `sample_rate`.
    pub fn cancel_response(mark: &InterruptMark, sample_rate: u32) -> [ClientEvent; 2] {
        [
            ClientEvent::CancelResponse,
            ClientEvent::TruncateItem {
                item_id: mark.track_id.clone(),
                content_index: 0,
                audio_end_ms: samples_to_ms(mark.offset, sample_rate),
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    /// `null` disables server-side turn detection (manual mode).
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
}

impl SessionConfig {
    pub fn turn_detection_for(mode: Mode, vad: &VadConfig) -> Option<TurnDetection> {
        match mode {
            Mode::Manual => None,
            Mode::ContinuousVad => Some(TurnDetection {
                kind: "server_vad".into(),
                threshold: vad.threshold,
                prefix_padding_ms: vad.prefix_padding_ms,
                silence_duration_ms: vad.silence_duration_ms,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Inbound events the engine reacts to. Everything else is `Other` and is
/// only logged.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AudioDelta {
        item_id: String,
        samples: Vec<i16>,
    },
    TranscriptDelta {
        item_id: String,
        delta: String,
    },
    InputTranscription {
        item_id: String,
        transcript: String,
    },
    ItemCreated {
        item_id: String,
        role: Role,
        text: Option<String>,
    },
    ItemDone {
        item_id: String,
        role: Role,
        transcript: Option<String>,
        /// Base64 WAV supplied in place of incremental deltas.
        pre_encoded: Option<String>,
    },
    /// The input buffer became a user item.
    AudioCommitted {
        item_id: String,
    },
    SpeechStarted,
    Error {
        /// Machine-readable error code, when the server sends one.
        code: Option<String>,
        message: String,
    },
    Other(String),
}

/// Parse a text frame into JSON. Frames that are not JSON objects with a
/// string `type` are malformed.
pub fn decode_frame(text: &str) -> Result<Value, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if value.get("type").and_then(Value::as_str).is_none() {
        return Err(ProtocolError::Malformed("event has no `type`".into()));
    }
    Ok(value)
}

pub fn parse_server_event(event: &Value) -> Result<ServerEvent, ProtocolError> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

    let parsed = match event_type {
        "response.audio.delta" => {
            let item_id = str_field(event, event_type, "item_id")?;
            let bytes = BASE64
                .decode(str_field(event, event_type, "delta")?)
                .map_err(|e| ProtocolError::Malformed(format!("{event_type}: bad base64: {e}")))?;
            if bytes.len() % 2 != 0 {
                return Err(ProtocolError::Malformed(format!(
                    "{event_type}: odd PCM16 byte count {}",
                    bytes.len()
                )));
            }
            ServerEvent::AudioDelta {
                item_id: item_id.to_string(),
                samples: pcm16_from_le_bytes(&bytes),
            }
        }
        "response.audio_transcript.delta" => ServerEvent::TranscriptDelta {
            item_id: str_field(event, event_type, "item_id")?.to_string(),
            delta: str_field(event, event_type, "delta")?.to_string(),
        },
        "conversation.item.input_audio_transcription.completed" => {
            ServerEvent::InputTranscription {
                item_id: str_field(event, event_type, "item_id")?.to_string(),
                transcript: str_field(event, event_type, "transcript")?.trim().to_string(),
            }
        }
        "conversation.item.created" => {
            let item = obj_field(event, event_type, "item")?;
            ServerEvent::ItemCreated {
                item_id: str_field(item, event_type, "id")?.to_string(),
                role: role_of(item),
                text: content_string(item, "text"),
            }
        }
        "response.output_item.done" => {
            let item = obj_field(event, event_type, "item")?;
            ServerEvent::ItemDone {
                item_id: str_field(item, event_type, "id")?.to_string(),
                role: role_of(item),
                transcript: content_string(item, "transcript"),
                pre_encoded: item.get("audio").and_then(Value::as_str).map(str::to_string),
            }
        }
        "input_audio_buffer.committed" => ServerEvent::AudioCommitted {
            item_id: str_field(event, event_type, "item_id")?.to_string(),
        },
        "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
        "error" => {
            let detail = event.get("error");
            let text = |field: &str| detail.and_then(|e| e.get(field)).and_then(Value::as_str);
            ServerEvent::Error {
                code: text("code").map(str::to_string),
                message: text("message").unwrap_or("unknown error").to_string(),
            }
        }
        other => ServerEvent::Other(other.to_string()),
    };
    Ok(parsed)
}

/// Decode and validate a pre-encoded base64 WAV payload.
pub fn decode_pre_encoded(payload: &str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| ProtocolError::Malformed(format!("pre-encoded audio: bad base64: {e}")))?;
    decode_wav(&bytes).map_err(|e| ProtocolError::Malformed(format!("pre-encoded audio: {e}")))?;
    Ok(bytes)
}

fn str_field<'a>(
    value: &'a Value,
    event_type: &str,
    field: &'static str,
) -> Result<&'a str, ProtocolError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MissingField {
            event_type: event_type.to_string(),
            field,
        })
}

fn obj_field<'a>(
    value: &'a Value,
    event_type: &str,
    field: &'static str,
) -> Result<&'a Value, ProtocolError> {
    value
        .get(field)
        .filter(|v| v.is_object())
        .ok_or_else(|| ProtocolError::MissingField {
            event_type: event_type.to_string(),
            field,
        })
}

fn role_of(item: &Value) -> Role {
    match item.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        _ => Role::Assistant,
    }
}

/// First non-empty `key` string among the item's content parts.
fn content_string(item: &Value, key: &str) -> Option<String> {
    item.get("content")?
        .as_array()?
        .iter()
        .filter_map(|part| part.get(key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::encode_wav;
    use serde_json::json;

    #[test]
    fn test_manual_session_update_has_null_turn_detection() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                voice: "alloy".into(),
                instructions: "be brief".into(),
                temperature: 0.8,
                turn_detection: SessionConfig::turn_detection_for(Mode::Manual, &VadConfig::default()),
                input_audio_transcription: None,
            },
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "session.update");
        assert_eq!(v["session"]["voice"], "alloy");
        assert!(v["session"]["turn_detection"].is_null());
        assert!(v["session"].get("input_audio_transcription").is_none());
    }

    #[test]
    fn test_vad_session_update_carries_descriptor() {
        let vad = VadConfig {
            threshold: 0.6,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        };
        let td = SessionConfig::turn_detection_for(Mode::ContinuousVad, &vad);
        let v = serde_json::to_value(td).unwrap();
        assert_eq!(v["type"], "server_vad");
        assert_eq!(v["prefix_padding_ms"], 300);
        assert_eq!(v["silence_duration_ms"], 500);
    }

    #[test]
    fn test_unit_events_serialize_to_bare_type() {
        assert_eq!(
            serde_json::to_value(ClientEvent::CreateResponse).unwrap(),
            json!({ "type": "response.create" })
        );
        assert_eq!(
            serde_json::to_value(ClientEvent::CommitAudio).unwrap(),
            json!({ "type": "input_audio_buffer.commit" })
        );
    }

    #[test]
    fn test_append_audio_is_base64_le_pcm() {
        let ClientEvent::AppendAudio { audio } = ClientEvent::append_audio(&[1, -2]) else {
            panic!("wrong variant");
        };
        assert_eq!(BASE64.decode(audio).unwrap(), vec![0x01, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn test_cancel_response_truncates_at_heard_offset() {
        let mark = InterruptMark {
            track_id: "a1".into(),
            offset: 36_000,
        };
        let [cancel, truncate] = ClientEvent::cancel_response(&mark, 24_000);
        assert_eq!(cancel, ClientEvent::CancelResponse);
        assert_eq!(
            serde_json::to_value(truncate).unwrap(),
            json!({
                "type": "conversation.item.truncate",
                "item_id": "a1",
                "content_index": 0,
                "audio_end_ms": 1500,
            })
        );
    }

    #[test]
    fn test_user_text_item_shape() {
        let v = serde_json::to_value(ClientEvent::user_text("Hello!")).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_text", "text": "Hello!" }],
                },
            })
        );
    }

    #[test]
    fn test_decode_frame_rejects_non_events() {
        assert!(decode_frame("ping").is_err());
        assert!(decode_frame("{\"no_type\":1}").is_err());
        assert!(decode_frame("[1,2]").is_err());
        assert!(decode_frame("{\"type\":\"session.created\"}").is_ok());
    }

    #[test]
    fn test_parse_audio_delta() {
        let delta = BASE64.encode(pcm16_to_le_bytes(&[5, -5, 300]));
        let event = json!({ "type": "response.audio.delta", "item_id": "a1", "delta": delta });
        assert_eq!(
            parse_server_event(&event).unwrap(),
            ServerEvent::AudioDelta {
                item_id: "a1".into(),
                samples: vec![5, -5, 300],
            }
        );
    }

    #[test]
    fn test_parse_audio_delta_errors() {
        let missing = json!({ "type": "response.audio.delta", "delta": "AAAA" });
        assert_eq!(
            parse_server_event(&missing),
            Err(ProtocolError::MissingField {
                event_type: "response.audio.delta".into(),
                field: "item_id",
            })
        );
        let odd = json!({ "type": "response.audio.delta", "item_id": "a", "delta": BASE64.encode([1u8, 2, 3]) });
        assert!(matches!(parse_server_event(&odd), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_parse_item_done_with_and_without_payload() {
        let plain = json!({
            "type": "response.output_item.done",
            "item": {
                "id": "a1",
                "role": "assistant",
                "content": [{ "type": "audio", "transcript": "Hi there" }],
            },
        });
        assert_eq!(
            parse_server_event(&plain).unwrap(),
            ServerEvent::ItemDone {
                item_id: "a1".into(),
                role: Role::Assistant,
                transcript: Some("Hi there".into()),
                pre_encoded: None,
            }
        );

        let wav = BASE64.encode(encode_wav(&[1, 2, 3], 24_000));
        let with_audio = json!({
            "type": "response.output_item.done",
            "item": { "id": "a2", "role": "assistant", "audio": wav },
        });
        let ServerEvent::ItemDone { pre_encoded: Some(payload), .. } =
            parse_server_event(&with_audio).unwrap()
        else {
            panic!("expected pre-encoded payload");
        };
        assert_eq!(decode_pre_encoded(&payload).unwrap().len(), 44 + 6);
    }

    #[test]
    fn test_parse_item_created_user_text() {
        let event = json!({
            "type": "conversation.item.created",
            "item": {
                "id": "u1",
                "role": "user",
                "content": [{ "type": "input_text", "text": "Hello!" }],
            },
        });
        assert_eq!(
            parse_server_event(&event).unwrap(),
            ServerEvent::ItemCreated {
                item_id: "u1".into(),
                role: Role::User,
                text: Some("Hello!".into()),
            }
        );
    }

    #[test]
    fn test_parse_misc_events() {
        assert_eq!(
            parse_server_event(&json!({ "type": "input_audio_buffer.speech_started" })).unwrap(),
            ServerEvent::SpeechStarted
        );
        assert_eq!(
            parse_server_event(&json!({ "type": "error", "error": { "message": "bad" } })).unwrap(),
            ServerEvent::Error { code: None, message: "bad".into() }
        );
        assert_eq!(
            parse_server_event(&json!({
                "type": "error",
                "error": { "code": "input_audio_buffer_commit_empty", "message": "buffer too small" },
            }))
            .unwrap(),
            ServerEvent::Error {
                code: Some("input_audio_buffer_commit_empty".into()),
                message: "buffer too small".into(),
            }
        );
        assert_eq!(
            parse_server_event(&json!({
                "type": "input_audio_buffer.committed",
                "previous_item_id": null,
                "item_id": "u7",
            }))
            .unwrap(),
            ServerEvent::AudioCommitted { item_id: "u7".into() }
        );
        assert_eq!(
            parse_server_event(&json!({ "type": "session.created" })).unwrap(),
            ServerEvent::Other("session.created".into())
        );
        assert_eq!(
            parse_server_event(&json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "item_id": "u1",
                "transcript": " what time is it\n",
            }))
            .unwrap(),
            ServerEvent::InputTranscription {
                item_id: "u1".into(),
                transcript: "what time is it".into(),
            }
        );
    }

    #[test]
    fn test_pre_encoded_rejects_non_wav() {
        assert!(decode_pre_encoded(&BASE64.encode(b"not a wav at all")).is_err());
        assert!(decode_pre_encoded("%%%").is_err());
    }
}
