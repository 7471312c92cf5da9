//! Engine configuration (`engine_config.json` in the data directory).

pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::audio::wav::DEFAULT_SAMPLE_RATE;
use crate::debug_log::DEFAULT_CAPACITY;
use paths::get_data_dir;

/// Overrides `apiKey` when set.
pub const API_KEY_ENV: &str = "DUPLEX_API_KEY";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sampleRate must be greater than zero")]
    ZeroSampleRate,
    #[error("debugLogCapacity must be greater than zero")]
    ZeroLogCapacity,
    #[error("maxVisibleItems must be greater than zero")]
    ZeroVisibleItems,
    #[error("temperature {0} is outside 0.6..=1.2")]
    Temperature(f32),
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VadConfig {
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u32,
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
        }
    }
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_prefix_padding_ms() -> u32 {
    300
}
fn default_silence_duration_ms() -> u32 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Relay endpoint the engine connects to.
    pub relay_origin: String,
    pub api_key: String,
    pub model: String,
    /// Realtime endpoint the relay proxies to. Passed through untouched.
    pub upstream_url: String,

    pub voice: String,
    pub instructions: String,
    pub temperature: f32,
    /// Sent as the first user turn after connecting. Empty disables it.
    pub greeting: String,
    /// `None` disables input transcription.
    pub transcription_model: Option<String>,
    pub vad: VadConfig,

    pub sample_rate: u32,
    pub debug_log_capacity: usize,
    pub max_visible_items: usize,
    pub connect_timeout_ms: u64,
    /// Play assistant items as soon as they complete.
    pub autoplay: bool,
    /// Include audio-carrying protocol events in the IPC event stream.
    pub forward_audio_events: bool,

    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub download_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relay_origin: "ws://localhost:8081".into(),
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".into(),
            upstream_url: "wss://api.openai.com/v1/realtime".into(),
            voice: "alloy".into(),
            instructions: String::new(),
            temperature: 0.8,
            greeting: "Hello!".into(),
            transcription_model: Some("whisper-1".into()),
            vad: VadConfig::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            debug_log_capacity: DEFAULT_CAPACITY,
            max_visible_items: 50,
            connect_timeout_ms: 10_000,
            autoplay: true,
            forward_audio_events: false,
            input_device: None,
            output_device: None,
            download_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.debug_log_capacity == 0 {
            return Err(ConfigError::ZeroLogCapacity);
        }
        if self.max_visible_items == 0 {
            return Err(ConfigError::ZeroVisibleItems);
        }
        if !(0.6..=1.2).contains(&self.temperature) {
            return Err(ConfigError::Temperature(self.temperature));
        }
        Ok(())
    }

    /// Apply environment overrides.
    pub fn with_env(mut self) -> Self {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.api_key = key;
            }
        }
        self
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(paths::get_default_download_dir)
    }
}

/// Read engine_config.json from the data directory, falling back to
/// defaults if it is missing, unreadable, or invalid.
pub fn read_engine_config() -> EngineConfig {
    read_engine_config_from(&get_config_path())
}

pub fn read_engine_config_from(path: &Path) -> EngineConfig {
    let config: EngineConfig = read_json_file(path).unwrap_or_default();
    let config = config.with_env();
    match config.validate() {
        Ok(()) => config,
        Err(e) => {
            warn!("Invalid {}: {}; using defaults", path.display(), e);
            EngineConfig::default().with_env()
        }
    }
}

/// Path to engine_config.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("engine_config.json")
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.sample_rate, 24_000);
        assert_eq!(cfg.debug_log_capacity, 300);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"voice":"verse","vad":{"silenceDurationMs":800},"maxVisibleItems":5}"#,
        )
        .unwrap();
        assert_eq!(cfg.voice, "verse");
        assert_eq!(cfg.vad.silence_duration_ms, 800);
        assert_eq!(cfg.vad.prefix_padding_ms, 300);
        assert_eq!(cfg.max_visible_items, 5);
        assert_eq!(cfg.relay_origin, "ws://localhost:8081");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = EngineConfig {
            temperature: 2.0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Temperature(2.0)));
        let cfg = EngineConfig {
            sample_rate: 0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroSampleRate));
    }

    #[test]
    fn test_read_from_file_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        assert_eq!(read_engine_config_from(&path).voice, "alloy");

        std::fs::write(&path, r#"{"voice":"shimmer","temperature":0.7}"#).unwrap();
        let cfg = read_engine_config_from(&path);
        assert_eq!(cfg.voice, "shimmer");
        assert_eq!(cfg.temperature, 0.7);

        std::fs::write(&path, r#"{"debugLogCapacity":0}"#).unwrap();
        assert_eq!(read_engine_config_from(&path).debug_log_capacity, 300);

        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(read_engine_config_from(&path), EngineConfig::default().with_env());
    }
}
