//! Duplex voice: a real-time conversation engine for streaming realtime
//! model relays.
//!
//! Microphone frames flow out over the relay socket while model audio flows
//! back in, gets reassembled per conversation item, and is exposed as
//! playable WAV artifacts. The [`session::SessionEngine`] owns every piece
//! of mutable state and is the only place items and chunk buffers change.

pub mod artifacts;
pub mod audio;
pub mod config;
pub mod debug_log;
pub mod error;
pub mod ipc;
pub mod logger;
pub mod playback;
pub mod relay;
pub mod session;

pub use error::EngineError;
pub use session::{ConnectionState, Mode, SessionEngine};
