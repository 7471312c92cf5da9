//! Capture/streaming controller.
//!
//! Owns the microphone and decides where frames go. Continuous capture
//! forwards every frame to the relay as it arrives. Manual capture forwards
//! too, and also retains frames so the finished turn can be turned into a
//! local WAV echo.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use super::capture::{FrameCallback, Microphone};
use super::wav::encode_wav;
use crate::error::CaptureError;
use crate::relay::RelaySender;

/// A finished manual recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTurn {
    pub samples: usize,
    pub wav: Vec<u8>,
}

#[derive(Default)]
struct CaptureShared {
    relay: Mutex<Option<RelaySender>>,
    retained: Mutex<Vec<Vec<i16>>>,
    retaining: AtomicBool,
}

impl CaptureShared {
    fn on_frame(&self, frame: &[i16]) {
        if self.retaining.load(Ordering::SeqCst) {
            match self.retained.lock() {
                Ok(mut frames) => frames.push(frame.to_vec()),
                Err(e) => error!("Retained frame buffer poisoned: {}", e),
            }
        }
        match self.relay.lock() {
            Ok(relay) => {
                if let Some(relay) = relay.as_ref() {
                    relay.send_audio(frame);
                }
            }
            Err(e) => error!("Capture relay slot poisoned: {}", e),
        }
    }

    fn take_retained(&self) -> Vec<Vec<i16>> {
        match self.retained.lock() {
            Ok(mut frames) => std::mem::take(&mut *frames),
            Err(e) => {
                error!("Retained frame buffer poisoned: {}", e);
                Vec::new()
            }
        }
    }
}

pub struct CaptureController {
    microphone: Box<dyn Microphone>,
    shared: Arc<CaptureShared>,
    capturing: bool,
}

impl CaptureController {
    pub fn new(microphone: Box<dyn Microphone>) -> Self {
        Self {
            microphone,
            shared: Arc::new(CaptureShared::default()),
            capturing: false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_acquired(&self) -> bool {
        self.microphone.is_acquired()
    }

    /// Claim the microphone without starting capture.
    pub fn acquire(&mut self) -> Result<(), CaptureError> {
        self.microphone.acquire()
    }

    /// Route captured frames to `relay`.
    pub fn attach(&mut self, relay: RelaySender) {
        if let Ok(mut slot) = self.shared.relay.lock() {
            *slot = Some(relay);
        }
    }

    fn frame_callback(&self) -> FrameCallback {
        let shared = Arc::clone(&self.shared);
        Box::new(move |frame: &[i16]| shared.on_frame(frame))
    }

    /// Forward every captured frame to the relay immediately.
    ///
    /// If the device cannot be acquired nothing changes and the error is
    /// returned.
    pub fn begin_continuous(&mut self) -> Result<(), CaptureError> {
        self.microphone.acquire()?;
        self.shared.retaining.store(false, Ordering::SeqCst);
        let callback = self.frame_callback();
        self.microphone.start(callback)?;
        self.capturing = true;
        info!("Continuous capture started");
        Ok(())
    }

    /// Like [`begin_continuous`](Self::begin_continuous) but also retains
    /// each forwarded frame for [`end_manual`](Self::end_manual).
    pub fn begin_manual(&mut self) -> Result<(), CaptureError> {
        self.microphone.acquire()?;
        self.shared.take_retained();
        self.shared.retaining.store(true, Ordering::SeqCst);
        let callback = self.frame_callback();
        if let Err(e) = self.microphone.start(callback) {
            self.shared.retaining.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.capturing = true;
        info!("Manual capture started");
        Ok(())
    }

    /// Stop a manual recording. Returns the retained audio as a WAV, or
    /// `None` if no frame was captured.
    pub fn end_manual(&mut self, sample_rate: u32) -> Option<RecordedTurn> {
        self.microphone.stop();
        self.capturing = false;
        self.shared.retaining.store(false, Ordering::SeqCst);

        let frames = self.shared.take_retained();
        if frames.is_empty() {
            debug!("Manual capture ended with no frames");
            return None;
        }
        let samples: Vec<i16> = frames.concat();
        info!(frames = frames.len(), samples = samples.len(), "Manual capture ended");
        Some(RecordedTurn {
            samples: samples.len(),
            wav: encode_wav(&samples, sample_rate),
        })
    }

    /// Halt capture without discarding anything buffered.
    pub fn pause(&mut self) {
        self.microphone.pause();
        self.capturing = false;
        debug!("Capture paused");
    }

    /// Stop capture, detach from the relay and give the device back.
    pub fn release(&mut self) {
        self.microphone.release();
        self.capturing = false;
        self.shared.retaining.store(false, Ordering::SeqCst);
        self.shared.take_retained();
        if let Ok(mut slot) = self.shared.relay.lock() {
            *slot = None;
        }
    }
}
