//! Playback of completed conversation items.
//!
//! A [`PlaybackBackend`] decodes artifact bytes into a [`TrackHandle`]; the
//! [`PlaybackRegistry`] maps each item id to exactly one [`PlaybackTrack`]
//! and tracks its loading/playing/error state.

mod registry;
mod rodio_backend;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PlaybackError;

pub use registry::{PlaybackRegistry, PlaybackTrack, TrackState};
pub use rodio_backend::{list_output_devices, RodioBackend};

#[cfg(test)]
pub(crate) use registry::tests as fakes;

/// Invoked by the backend when a track reaches its end.
pub type FinishedCallback = Box<dyn Fn() + Send + Sync>;

/// Opaque handle to the rendering surface a track is bound to
/// (a waveform widget id, a window handle, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceHandle(pub String);

impl SurfaceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Surface used for tracks started by the engine itself.
    pub fn speaker() -> Self {
        Self("speaker".into())
    }
}

/// Where playback was stopped by a barge-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptMark {
    pub track_id: String,
    /// Playback position in samples at the artifact's rate.
    pub offset: u64,
}

// ── Backend traits ──────────────────────────────────────────────────

/// A decoded, controllable track.
pub trait TrackHandle: Send {
    fn play(&self);
    fn pause(&self);
    fn stop(&self);
    fn seek(&self, offset_samples: u64) -> Result<(), PlaybackError>;
    fn position_samples(&self) -> u64;
}

/// Decodes artifacts into playable tracks (dyn-compatible).
pub trait PlaybackBackend: Send + Sync {
    /// Decode `wav` (the bytes behind `uri`). Resolves once the track is
    /// ready to play; `on_finished` fires every time playback reaches the end.
    fn decode(
        &self,
        uri: String,
        wav: Arc<[u8]>,
        on_finished: FinishedCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn TrackHandle>, PlaybackError>> + Send + '_>>;
}
