//! Audio data path: WAV framing, per-item chunk accumulation, microphone
//! capture, and the capture/streaming controller.

pub mod accumulator;
pub mod capture;
pub mod controller;
pub mod wav;

pub use accumulator::ChunkAccumulator;
pub use capture::{CpalMicrophone, FrameCallback, Microphone};
pub use controller::{CaptureController, RecordedTurn};
pub use wav::{decode_wav, encode_wav, DEFAULT_SAMPLE_RATE};
