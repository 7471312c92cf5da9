//! rodio output for decoded artifacts.
//!
//! One output stream is opened on first decode and shared by every track;
//! a track only owns a `Sink` on it. rodio's `OutputStream` is not `Send`,
//! so it lives on a dedicated thread that parks until the backend is dropped.

use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::source::EmptyCallback;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{FinishedCallback, PlaybackBackend, TrackHandle};
use crate::error::PlaybackError;

/// Creates a sink on the shared output.
type SinkFactory = Arc<dyn Fn() -> Result<Sink, PlaybackError> + Send + Sync>;

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

struct SharedOutput {
    new_sink: SinkFactory,
    /// Never sent on. Dropping it lets the output thread exit.
    _shutdown: mpsc::Sender<()>,
}

pub struct RodioBackend {
    output_device: Option<String>,
    output: Mutex<Option<SharedOutput>>,
}

impl RodioBackend {
    /// `output_device` of `None` uses the system default output.
    pub fn new(output_device: Option<String>) -> Self {
        Self {
            output_device,
            output: Mutex::new(None),
        }
    }

    fn lock_output(&self) -> Result<MutexGuard<'_, Option<SharedOutput>>, PlaybackError> {
        self.output
            .lock()
            .map_err(|e| PlaybackError::Output(format!("output lock poisoned: {e}")))
    }

    /// Sink factory for the shared output, opening it on first use.
    async fn shared_sinks(&self) -> Result<SinkFactory, PlaybackError> {
        let cached = self.lock_output()?.as_ref().map(|shared| Arc::clone(&shared.new_sink));
        if let Some(new_sink) = cached {
            return Ok(new_sink);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let device = self.output_device.clone();
        std::thread::Builder::new()
            .name("duplex-output".into())
            .spawn(move || run_output(device, ready_tx, shutdown_rx))
            .map_err(|e| PlaybackError::Output(format!("failed to spawn output thread: {e}")))?;

        let handle = ready_rx
            .await
            .map_err(|_| PlaybackError::Output("output thread exited before opening".into()))?
            .map_err(PlaybackError::Output)?;
        let new_sink: SinkFactory = Arc::new(move || {
            Sink::try_new(&handle)
                .map_err(|e| PlaybackError::Output(format!("failed to create audio sink: {e}")))
        });

        // A concurrent decode may have opened the output first; keep that one.
        let mut output = self.lock_output()?;
        let shared = output.get_or_insert(SharedOutput {
            new_sink,
            _shutdown: shutdown_tx,
        });
        Ok(Arc::clone(&shared.new_sink))
    }

    /// Forget the shared output so the next decode reopens it.
    fn reset_output(&self) {
        if let Ok(mut output) = self.lock_output() {
            if output.take().is_some() {
                warn!("Audio output lost, will reopen on next decode");
            }
        }
    }
}

impl PlaybackBackend for RodioBackend {
    fn decode(
        &self,
        uri: String,
        wav: Arc<[u8]>,
        on_finished: FinishedCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn TrackHandle>, PlaybackError>> + Send + '_>> {
        Box::pin(async move {
            let new_sink = self.shared_sinks().await?;
            let track = match RodioTrack::new(uri, wav, new_sink, on_finished) {
                Ok(track) => track,
                Err(e) => {
                    if matches!(e, PlaybackError::Output(_)) {
                        self.reset_output();
                    }
                    return Err(e);
                }
            };
            debug!(uri = %track.uri, sample_rate = track.sample_rate, "Artifact decoded");
            Ok(Box::new(track) as Box<dyn TrackHandle>)
        })
    }
}

/// Owns the output stream until the backend drops its shutdown sender.
fn run_output(
    device: Option<String>,
    ready: oneshot::Sender<Result<OutputStreamHandle, String>>,
    shutdown: mpsc::Receiver<()>,
) {
    let (_stream, handle) = match open_output_stream(device.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(handle)).is_err() {
        return;
    }
    info!("Audio output opened");
    let _ = shutdown.recv();
    debug!("Audio output thread exiting");
}

struct RodioTrack {
    uri: String,
    wav: Arc<[u8]>,
    sample_rate: u32,
    new_sink: SinkFactory,
    sink: Mutex<Sink>,
    /// Offset the current sink's source starts at.
    base: AtomicU64,
    on_finished: Arc<dyn Fn() + Send + Sync>,
}

impl RodioTrack {
    fn new(
        uri: String,
        wav: Arc<[u8]>,
        new_sink: SinkFactory,
        on_finished: FinishedCallback,
    ) -> Result<Self, PlaybackError> {
        let source = decode_source(&uri, &wav)?;
        let sample_rate = source.sample_rate();
        let sink = new_sink()?;
        sink.pause();
        let on_finished: Arc<dyn Fn() + Send + Sync> = Arc::from(on_finished);
        Self::arm(&sink, source, &on_finished);
        Ok(Self {
            uri,
            wav,
            sample_rate,
            new_sink,
            sink: Mutex::new(sink),
            base: AtomicU64::new(0),
            on_finished,
        })
    }

    /// Queue `source` followed by the end-of-track notification.
    fn arm<S>(sink: &Sink, source: S, on_finished: &Arc<dyn Fn() + Send + Sync>)
    where
        S: Source<Item = i16> + Send + 'static,
    {
        sink.append(source);
        let on_finished = Arc::clone(on_finished);
        sink.append(EmptyCallback::<f32>::new(Box::new(move || on_finished())));
    }

    fn lock_sink(&self) -> Option<MutexGuard<'_, Sink>> {
        match self.sink.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!(uri = %self.uri, "Sink lock poisoned: {}", e);
                None
            }
        }
    }
}

impl TrackHandle for RodioTrack {
    fn play(&self) {
        let Some(sink) = self.lock_sink() else {
            return;
        };
        if sink.empty() {
            // Finished earlier: start over from the beginning.
            match decode_source(&self.uri, &self.wav) {
                Ok(source) => {
                    self.base.store(0, Ordering::Relaxed);
                    Self::arm(&sink, source, &self.on_finished);
                }
                Err(e) => {
                    warn!(uri = %self.uri, error = %e, "Could not re-arm finished track");
                    return;
                }
            }
        }
        sink.play();
    }

    fn pause(&self) {
        if let Some(sink) = self.lock_sink() {
            sink.pause();
        }
    }

    fn stop(&self) {
        if let Some(sink) = self.lock_sink() {
            sink.stop();
        }
    }

    /// Swaps in a fresh sink that starts at the target, so the caller never
    /// waits on the audio thread.
    fn seek(&self, offset_samples: u64) -> Result<(), PlaybackError> {
        let target = samples_to_duration(offset_samples, self.sample_rate);
        let source = decode_source(&self.uri, &self.wav)
            .map_err(|e| PlaybackError::Seek(e.to_string()))?
            .skip_duration(target);
        let fresh = (self.new_sink)().map_err(|e| PlaybackError::Seek(e.to_string()))?;

        let mut sink = self
            .lock_sink()
            .ok_or_else(|| PlaybackError::Seek("sink unavailable".into()))?;
        if sink.is_paused() || sink.empty() {
            fresh.pause();
        }
        Self::arm(&fresh, source, &self.on_finished);
        let previous = std::mem::replace(&mut *sink, fresh);
        previous.stop();
        self.base.store(offset_samples, Ordering::Relaxed);
        debug!(uri = %self.uri, offset_samples, "Track seeked");
        Ok(())
    }

    fn position_samples(&self) -> u64 {
        let played = self
            .lock_sink()
            .map(|sink| duration_to_samples(sink.get_pos(), self.sample_rate))
            .unwrap_or(0);
        self.base.load(Ordering::Relaxed) + played
    }
}

fn decode_source(uri: &str, wav: &Arc<[u8]>) -> Result<Decoder<Cursor<Arc<[u8]>>>, PlaybackError> {
    Decoder::new(Cursor::new(Arc::clone(wav))).map_err(|e| PlaybackError::Decode {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

/// Open the named output device, falling back to the default.
fn open_output_stream(
    output_device_name: Option<&str>,
) -> Result<(OutputStream, OutputStreamHandle), String> {
    if let Some(name) = output_device_name {
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate output devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));

        match device {
            Some(dev) => {
                info!(device = %name, "Using configured output device");
                OutputStream::try_from_device(&dev)
                    .map_err(|e| format!("Failed to open output device '{}': {}", name, e))
            }
            None => {
                warn!(
                    device = %name,
                    "Configured output device not found, falling back to default"
                );
                OutputStream::try_default()
                    .map_err(|e| format!("No audio output device available: {}", e))
            }
        }
    } else {
        OutputStream::try_default().map_err(|e| format!("No audio output device available: {}", e))
    }
}

fn duration_to_samples(d: Duration, sample_rate: u32) -> u64 {
    (d.as_micros() * sample_rate as u128 / 1_000_000) as u64
}

fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples * 1_000_000 / sample_rate as u64)
}
