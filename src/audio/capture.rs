//! Microphone capture via cpal.
//!
//! Opens the default (or named) input device at its native rate, downmixes
//! to mono, resamples to the session rate, converts to PCM16 and hands
//! fixed-size frames to whichever callback is currently installed.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{error, info, warn};

use super::wav::f32_to_pcm16;
use crate::error::CaptureError;

/// Frame size in samples (100 ms at 24 kHz).
pub const FRAME_SAMPLES: usize = 2400;

/// Receives each captured PCM16 frame at the session rate.
pub type FrameCallback = Box<dyn FnMut(&[i16]) + Send>;

/// A capture device the controller can drive.
///
/// `acquire` claims the device without producing audio; `start` begins
/// delivering frames to the given callback. `pause` halts delivery but keeps
/// any partially assembled frame, `stop` halts and flushes it.
pub trait Microphone {
    fn acquire(&mut self) -> Result<(), CaptureError>;
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError>;
    fn pause(&mut self);
    fn stop(&mut self);
    fn release(&mut self);
    fn is_acquired(&self) -> bool;
}

/// List available input device names.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// Wrapper to hold a cpal::Stream in a Send context.
struct SendStream(Stream);

// SAFETY: the stream is only kept alive, played, paused, and dropped from
// the owning engine. cpal manages its own callback thread internally.
unsafe impl Send for SendStream {}

#[derive(Default)]
struct FrameSlot {
    callback: Option<FrameCallback>,
    pending: Vec<i16>,
}

impl FrameSlot {
    fn push(&mut self, samples: &[i16]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..FRAME_SAMPLES).collect();
            if let Some(cb) = self.callback.as_mut() {
                cb(&frame);
            }
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let frame = std::mem::take(&mut self.pending);
        if let Some(cb) = self.callback.as_mut() {
            cb(&frame);
        }
    }
}

/// cpal-backed [`Microphone`].
pub struct CpalMicrophone {
    device_name: Option<String>,
    target_rate: u32,
    stream: Option<SendStream>,
    slot: Arc<Mutex<FrameSlot>>,
}

impl CpalMicrophone {
    /// `device_name` of `None` uses the system default input.
    pub fn new(device_name: Option<String>, target_rate: u32) -> Self {
        Self {
            device_name,
            target_rate,
            stream: None,
            slot: Arc::new(Mutex::new(FrameSlot::default())),
        }
    }

    fn build_stream(&self) -> Result<Stream, CaptureError> {
        let host = cpal::default_host();
        let device = match self.device_name.as_deref() {
            Some(name) => host
                .input_devices()
                .map_err(|e| {
                    CaptureError::DeviceUnavailable(format!("failed to enumerate input devices: {e}"))
                })?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceUnavailable(format!("input device not found: {name}")))?,
            None => host
                .default_input_device()
                .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".into()))?,
        };

        let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
        let default_config = device.default_input_config().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("failed to get input config for {dev_name}: {e}"))
        })?;

        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels();
        let target_rate = self.target_rate;
        info!(
            device = %dev_name,
            native_rate,
            channels,
            target_rate,
            "Selected input device"
        );

        let stream_config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(native_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let slot = Arc::clone(&self.slot);
        device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, channels);
                    let resampled = resample_linear(&mono, native_rate, target_rate);
                    let pcm = f32_to_pcm16(&resampled);
                    match slot.lock() {
                        Ok(mut slot) => slot.push(&pcm),
                        Err(e) => error!("Capture frame slot poisoned: {}", e),
                    }
                },
                move |err| {
                    error!("Audio input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to open input stream: {e}")))
    }

    fn with_slot(&self, f: impl FnOnce(&mut FrameSlot)) {
        match self.slot.lock() {
            Ok(mut slot) => f(&mut slot),
            Err(e) => error!("Capture frame slot poisoned: {}", e),
        }
    }
}

impl Microphone for CpalMicrophone {
    fn acquire(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.build_stream()?;
        // Some hosts start streams on creation.
        if let Err(e) = stream.pause() {
            warn!("Could not pause freshly opened input stream: {}", e);
        }
        self.stream = Some(SendStream(stream));
        info!("Microphone acquired");
        Ok(())
    }

    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        let stream = self.stream.as_ref().ok_or(CaptureError::NotAcquired)?;
        self.with_slot(|slot| slot.callback = Some(on_frame));
        stream
            .0
            .play()
            .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;
        info!("Audio capture started");
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.0.pause() {
                warn!("Failed to pause input stream: {}", e);
            }
        }
    }

    fn stop(&mut self) {
        self.pause();
        self.with_slot(FrameSlot::flush);
    }

    fn release(&mut self) {
        self.stream = None;
        self.with_slot(|slot| *slot = FrameSlot::default());
        info!("Microphone released");
    }

    fn is_acquired(&self) -> bool {
        self.stream.is_some()
    }
}

/// Simple linear resampler from `from_rate` to `to_rate`.
/// Operates on mono f32 samples.
pub(crate) fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_48k_to_24k_halves_length() {
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 / 4800.0)).collect();
        let out = resample_linear(&input, 48_000, 24_000);
        assert_eq!(out.len(), 2400);
        assert!((out[100] - input[200]).abs() < 1e-6);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 24_000, 24_000), input);
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let stereo = vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(to_mono(&stereo, 2), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_frame_slot_emits_fixed_frames_and_flushes_tail() {
        let frames = Arc::new(Mutex::new(Vec::<usize>::new()));
        let sink = Arc::clone(&frames);
        let mut slot = FrameSlot {
            callback: Some(Box::new(move |f: &[i16]| sink.lock().unwrap().push(f.len()))),
            pending: Vec::new(),
        };
        slot.push(&vec![0; FRAME_SAMPLES + 100]);
        slot.push(&vec![0; FRAME_SAMPLES]);
        assert_eq!(*frames.lock().unwrap(), vec![FRAME_SAMPLES, FRAME_SAMPLES]);
        slot.flush();
        assert_eq!(*frames.lock().unwrap(), vec![FRAME_SAMPLES, FRAME_SAMPLES, 100]);
        assert!(slot.pending.is_empty());
    }
}
