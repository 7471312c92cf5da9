//! The session state machine.
//!
//! All conversation item and chunk buffer mutation happens here, on the
//! single path that dispatches caller commands and inbound relay frames.
//! Capture frames go straight from the microphone callback to the relay and
//! never touch this state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    ConnectionState, ConversationItem, ConversationStore, ItemStatus, Mode, Role, Session,
    SessionObserver, SessionSnapshot,
};
use crate::artifacts::{ArtifactStore, DownloadSink};
use crate::audio::{encode_wav, CaptureController, ChunkAccumulator, Microphone};
use crate::config::EngineConfig;
use crate::debug_log::{DebugEvent, DiagnosticLog, EventSource};
use crate::error::{ArtifactError, EngineError, PlaybackError, ProtocolError, RelayError};
use crate::playback::{InterruptMark, PlaybackBackend, PlaybackRegistry, PlaybackTrack, SurfaceHandle};
use crate::relay::protocol::{
    decode_frame, decode_pre_encoded, parse_server_event, SessionConfig, TranscriptionConfig,
};
use crate::relay::{build_relay_url, ClientEvent, RelayConnector, RelayIncoming, RelaySender, ServerEvent};

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub microphone: Box<dyn Microphone>,
    pub connector: Arc<dyn RelayConnector>,
    pub playback: Arc<dyn PlaybackBackend>,
    pub observer: Arc<dyn SessionObserver>,
}

pub struct SessionEngine {
    config: EngineConfig,
    session: Session,
    capture: CaptureController,
    connector: Arc<dyn RelayConnector>,
    relay: Option<RelaySender>,
    inbound: Option<mpsc::UnboundedReceiver<RelayIncoming>>,
    accumulator: ChunkAccumulator,
    items: ConversationStore,
    registry: PlaybackRegistry,
    artifacts: ArtifactStore,
    downloads: DownloadSink,
    log: Arc<Mutex<DiagnosticLog>>,
    observer: Arc<dyn SessionObserver>,
    malformed_events: u64,
}

impl SessionEngine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let artifacts = ArtifactStore::new();
        Self {
            session: Session::new(&config, Mode::Manual),
            capture: CaptureController::new(parts.microphone),
            connector: parts.connector,
            relay: None,
            inbound: None,
            accumulator: ChunkAccumulator::new(),
            items: ConversationStore::new(config.max_visible_items),
            registry: PlaybackRegistry::new(parts.playback, artifacts.clone()),
            artifacts,
            downloads: DownloadSink::new(config.download_dir()),
            log: Arc::new(Mutex::new(DiagnosticLog::new(config.debug_log_capacity))),
            observer: parts.observer,
            malformed_events: 0,
            config,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.session.connection_state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.session.connection_state,
            mode: self.session.mode,
            is_recording: self.session.is_recording,
            is_remote_speaking: self.session.is_remote_speaking,
            malformed_events: self.malformed_events,
        }
    }

    pub fn items(&self) -> &ConversationStore {
        &self.items
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_capturing()
    }

    /// Inbound frames that could not be decoded or interpreted.
    pub fn malformed_event_count(&self) -> u64 {
        self.malformed_events
    }

    pub fn artifact(&self, uri: &str) -> Option<Arc<[u8]>> {
        self.artifacts.get(uri)
    }

    pub fn track(&self, item_id: &str) -> Option<Arc<PlaybackTrack>> {
        self.registry.get(&self.item_key(item_id))
    }

    /// Diagnostic events matching `text`, optionally from one source.
    pub fn debug_events(&self, text: &str, source: Option<EventSource>) -> Vec<DebugEvent> {
        match self.log.lock() {
            Ok(log) => log.filter(text, source),
            Err(e) => {
                error!("Diagnostic log lock poisoned: {}", e);
                Vec::new()
            }
        }
    }

    pub fn clear_debug_events(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Open a session in `mode`.
    ///
    /// The microphone is acquired before anything else; if that fails no
    /// socket is opened. Any later failure tears down what was set up and
    /// leaves the session Disconnected.
    pub async fn connect(&mut self, mode: Mode) -> Result<(), EngineError> {
        let state = self.session.connection_state;
        if state != ConnectionState::Disconnected {
            return Err(EngineError::AlreadyActive(state));
        }

        self.session = Session::new(&self.config, mode);
        self.session.connection_state = ConnectionState::Connecting;

        if let Err(e) = self.capture.acquire() {
            self.session.connection_state = ConnectionState::Disconnected;
            warn!(error = %e, "Microphone unavailable, not connecting");
            return Err(e.into());
        }
        self.notify_state();
        info!(?mode, origin = %self.config.relay_origin, "Connecting to relay");

        let url = match build_relay_url(
            &self.config.relay_origin,
            &self.config.api_key,
            &self.config.model,
            &self.config.upstream_url,
        ) {
            Ok(url) => url,
            Err(e) => return Err(self.abort_connect(e.into())),
        };

        let timeout_ms = self.config.connect_timeout_ms;
        let connector = Arc::clone(&self.connector);
        let link = match tokio::time::timeout(Duration::from_millis(timeout_ms), connector.open(&url)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(self.abort_connect(e.into())),
            Err(_) => return Err(self.abort_connect(RelayError::Timeout(timeout_ms).into())),
        };

        let relay = RelaySender::new(link.outbound, Arc::clone(&self.log), Arc::clone(&self.observer));
        self.capture.attach(relay.clone());
        self.relay = Some(relay);
        self.inbound = Some(link.inbound);

        if let Err(e) = self.configure_remote(mode) {
            return Err(self.abort_connect(e));
        }
        if let Err(e) = self.send_greeting() {
            return Err(self.abort_connect(e));
        }
        if mode == Mode::ContinuousVad {
            if let Err(e) = self.capture.begin_continuous() {
                return Err(self.abort_connect(e.into()));
            }
        }

        self.session.connection_state = ConnectionState::Connected;
        self.notify_state();
        info!(?mode, "Session connected");
        Ok(())
    }

    fn abort_connect(&mut self, err: EngineError) -> EngineError {
        warn!(error = %err, "Connect aborted");
        self.relay = None;
        self.inbound = None;
        self.capture.release();
        self.session.connection_state = ConnectionState::Disconnected;
        self.session.is_recording = false;
        self.session.is_remote_speaking = false;
        self.notify_state();
        err
    }

    /// Close the session. A no-op when already Disconnected.
    pub fn disconnect(&mut self) {
        if self.session.connection_state == ConnectionState::Disconnected {
            return;
        }
        info!("Disconnecting");
        self.teardown();
    }

    fn teardown(&mut self) {
        // Dropping every sender closes the socket.
        self.relay = None;
        self.inbound = None;
        self.capture.release();
        if let Some(mark) = self.registry.interrupt() {
            debug!(track_id = %mark.track_id, "Stopped playback on disconnect");
        }
        self.registry.clear();
        self.items.clear();
        self.accumulator.clear();
        self.artifacts.clear();
        self.session.connection_state = ConnectionState::Disconnected;
        self.session.is_recording = false;
        self.session.is_remote_speaking = false;
        self.notify_state();
    }

    fn on_socket_lost(&mut self, err: RelayError) {
        if self.session.connection_state == ConnectionState::Disconnected {
            return;
        }
        let err = EngineError::from(err);
        error!(error = %err, "Relay connection lost");
        self.report(&err);
        self.teardown();
    }

    // ── Mode and recording ──────────────────────────────────────────

    /// Switch turn-taking mode.
    ///
    /// Capture is paused before leaving continuous mode and started after
    /// entering it, so it never runs in manual mode outside a recording and
    /// never stops in continuous mode. Both overlay flags are cleared.
    pub fn toggle_mode(&mut self, mode: Mode) -> Result<(), EngineError> {
        let previous = self.session.mode;
        self.session.mode = mode;
        self.session.is_recording = false;
        self.session.is_remote_speaking = false;

        if self.session.connection_state == ConnectionState::Connected {
            if previous == Mode::ContinuousVad || self.capture.is_capturing() {
                self.capture.pause();
            }
            self.configure_remote(mode)?;
            if mode == Mode::ContinuousVad {
                if let Err(e) = self.capture.begin_continuous() {
                    // Fall back to manual so remote and local agree.
                    self.session.mode = Mode::Manual;
                    if let Err(restore) = self.configure_remote(Mode::Manual) {
                        warn!(error = %restore, "Could not restore manual turn detection");
                    }
                    self.notify_state();
                    return Err(e.into());
                }
            }
        }

        info!(from = ?previous, to = ?mode, "Mode changed");
        self.notify_state();
        Ok(())
    }

    /// Begin a push-to-talk turn, cutting off any assistant playback first.
    pub fn start_recording(&mut self) -> Result<(), EngineError> {
        self.require_connected()?;
        if self.session.mode != Mode::Manual {
            debug!("Ignoring start_recording outside manual mode");
            return Ok(());
        }
        if self.session.is_recording {
            return Ok(());
        }
        if let Some(mark) = self.interrupt() {
            self.send_cancel(&mark)?;
        }
        self.capture.begin_manual()?;
        self.session.is_recording = true;
        self.notify_state();
        Ok(())
    }

    /// End a push-to-talk turn.
    ///
    /// The recorded audio becomes a completed local user item right away,
    /// then the turn is committed and a response requested.
    pub fn stop_recording(&mut self) -> Result<Option<ConversationItem>, EngineError> {
        self.require_connected()?;
        if !self.session.is_recording {
            return Ok(None);
        }
        let turn = self.capture.end_manual(self.config.sample_rate);
        self.session.is_recording = false;
        self.notify_state();

        let Some(turn) = turn else {
            return Ok(None);
        };

        let uri = self.artifacts.put(turn.wav);
        let item = ConversationItem {
            id: format!("local_{}", uuid::Uuid::new_v4().simple()),
            role: Role::User,
            transcript: None,
            status: ItemStatus::Completed,
            audio_artifact_url: Some(uri),
        };
        info!(item_id = %item.id, samples = turn.samples, "Recorded user turn");
        self.items.insert_completed(item.clone());
        self.items.push_echo(&item.id);
        self.observer.on_item_updated(&item);

        self.send(&ClientEvent::CommitAudio)?;
        self.send(&ClientEvent::CreateResponse)?;
        Ok(Some(item))
    }

    // ── Barge-in ────────────────────────────────────────────────────

    /// Stop whatever is playing or about to play. Returns the track and the
    /// sample offset it stopped at (0 if it never started), or `None` if
    /// there was nothing to stop. Safe in any state.
    pub fn interrupt(&mut self) -> Option<InterruptMark> {
        self.registry.interrupt()
    }

    /// [`interrupt`](Self::interrupt), and if something was playing tell
    /// the remote where the user cut it off.
    pub fn barge_in(&mut self) -> Result<Option<InterruptMark>, EngineError> {
        let mark = self.interrupt();
        if let Some(mark) = &mark {
            if self.session.connection_state == ConnectionState::Connected {
                self.send_cancel(mark)?;
            }
        }
        Ok(mark)
    }

    fn send_cancel(&mut self, mark: &InterruptMark) -> Result<(), EngineError> {
        for event in ClientEvent::cancel_response(mark, self.config.sample_rate) {
            self.send(&event)?;
        }
        Ok(())
    }

    // ── Text, playback and artifacts ────────────────────────────────

    pub fn send_text(&mut self, text: &str) -> Result<(), EngineError> {
        self.require_connected()?;
        self.send(&ClientEvent::user_text(text))?;
        self.send(&ClientEvent::CreateResponse)
    }

    /// Bind `item_id` to a rendering surface, creating its playback track
    /// on first call. Later calls return the same track.
    pub fn attach_surface(
        &mut self,
        item_id: &str,
        surface: SurfaceHandle,
    ) -> Result<Arc<PlaybackTrack>, EngineError> {
        let key = self.item_key(item_id);
        if let Some(track) = self.registry.get(&key) {
            return Ok(track);
        }
        let item = self
            .items
            .get(&key)
            .ok_or_else(|| EngineError::UnknownItem(item_id.to_string()))?;
        let uri = item
            .audio_artifact_url
            .clone()
            .ok_or_else(|| PlaybackError::NoArtifact(item_id.to_string()))?;
        Ok(self.registry.get_or_create(&key, &uri, surface))
    }

    pub fn toggle_play(&mut self, item_id: &str) -> Result<bool, EngineError> {
        Ok(self.registry.toggle_play(&self.item_key(item_id))?)
    }

    pub fn seek(&self, item_id: &str, offset_samples: u64) -> Result<(), EngineError> {
        Ok(self.registry.seek(&self.item_key(item_id), offset_samples)?)
    }

    /// Write an item's artifact to the download directory as
    /// `{role}-{item_id}.wav`.
    pub fn download_artifact(&self, item_id: &str) -> Result<PathBuf, EngineError> {
        let item = self
            .items
            .get(item_id)
            .ok_or_else(|| EngineError::UnknownItem(item_id.to_string()))?;
        let uri = item
            .audio_artifact_url
            .as_deref()
            .ok_or_else(|| PlaybackError::NoArtifact(item_id.to_string()))?;
        let bytes = self
            .artifacts
            .get(uri)
            .ok_or_else(|| ArtifactError::NotFound(uri.to_string()))?;
        let filename = format!("{}-{}.wav", item.role, item.id);
        Ok(self.downloads.save(&filename, &bytes)?)
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Wait for the next relay notification. Pending forever while there is
    /// no connection, so it can sit in a `select!` unconditionally.
    pub async fn next_inbound(&mut self) -> RelayIncoming {
        match self.inbound.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(incoming) => incoming,
                None => {
                    self.inbound = None;
                    RelayIncoming::Closed(None)
                }
            },
            None => std::future::pending().await,
        }
    }

    pub fn handle_incoming(&mut self, incoming: RelayIncoming) {
        match incoming {
            RelayIncoming::Text(text) => self.handle_frame(&text),
            RelayIncoming::Closed(reason) => self.on_socket_lost(RelayError::Closed(reason)),
            RelayIncoming::Error(e) => self.on_socket_lost(RelayError::Transport(e)),
        }
    }

    /// Log one inbound frame verbatim and act on it.
    pub fn handle_frame(&mut self, text: &str) {
        let raw = match decode_frame(text) {
            Ok(raw) => raw,
            Err(e) => return self.count_malformed(e),
        };
        let record = DebugEvent::new(EventSource::Server, raw);
        match self.log.lock() {
            Ok(mut log) => log.push(record.clone()),
            Err(e) => error!("Diagnostic log lock poisoned: {}", e),
        }
        self.observer.on_event(&record);

        match parse_server_event(&record.event) {
            Ok(event) => self.dispatch(event),
            Err(e) => self.count_malformed(e),
        }
    }

    fn dispatch(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AudioDelta { item_id, samples } => self.on_audio_delta(&item_id, samples),
            ServerEvent::TranscriptDelta { item_id, delta } => {
                self.items.get_or_create_streaming(&item_id, Role::Assistant);
                if let Some(item) = self.items.append_transcript(&item_id, &delta) {
                    self.observer.on_item_updated(&item);
                }
            }
            ServerEvent::InputTranscription { item_id, transcript } => {
                self.on_input_transcription(&item_id, &transcript)
            }
            ServerEvent::ItemCreated { item_id, role, text } => {
                self.on_item_created(&item_id, role, text)
            }
            ServerEvent::ItemDone {
                item_id,
                role,
                transcript,
                pre_encoded,
            } => self.on_item_done(&item_id, role, transcript, pre_encoded),
            ServerEvent::SpeechStarted => {
                if self.session.mode == Mode::ContinuousVad {
                    if let Err(e) = self.barge_in() {
                        self.report(&e);
                    }
                }
            }
            ServerEvent::AudioCommitted { item_id } => {
                self.link_echo(&item_id);
            }
            ServerEvent::Error { code, message } => {
                // A rejected commit never yields a user item.
                if code.as_deref().is_some_and(|c| c.starts_with("input_audio_buffer")) {
                    if let Some(local) = self.items.drop_echo() {
                        debug!(local_id = %local, "Echo abandoned after rejected commit");
                    }
                }
                self.report(&EngineError::Remote(message))
            }
            ServerEvent::Other(event_type) => debug!(event_type = %event_type, "Unhandled server event"),
        }
    }

    fn on_audio_delta(&mut self, item_id: &str, samples: Vec<i16>) {
        let len = samples.len();
        if let Err(e) = self.accumulator.append(item_id, samples) {
            warn!(item_id, samples = len, "Dropping audio for sealed item");
            self.report(&e.into());
            return;
        }
        let (item, created) = self.items.get_or_create_streaming(item_id, Role::Assistant);
        if created {
            self.observer.on_item_updated(&item);
        }
        self.set_remote_speaking(true);
    }

    fn on_item_done(
        &mut self,
        item_id: &str,
        role: Role,
        transcript: Option<String>,
        pre_encoded: Option<String>,
    ) {
        self.set_remote_speaking(false);

        let (item, _) = self.items.get_or_create_streaming(item_id, role);
        if item.is_completed() {
            debug!(item_id, "Completion for an already completed item");
            return;
        }
        if let Some(transcript) = transcript {
            self.items.set_transcript(item_id, &transcript);
        }

        let supplied = match pre_encoded.map(|payload| decode_pre_encoded(&payload)) {
            Some(Ok(wav)) => {
                self.accumulator.discard(item_id);
                Some(wav)
            }
            Some(Err(e)) => {
                self.count_malformed(e);
                None
            }
            None => None,
        };

        let wav = match supplied {
            Some(wav) => Some(wav),
            None => match self.accumulator.merge_and_seal(item_id) {
                Ok(samples) if samples.is_empty() => None,
                Ok(samples) => Some(encode_wav(&samples, self.config.sample_rate)),
                Err(e) => {
                    self.report(&e.into());
                    None
                }
            },
        };

        let uri = wav.map(|wav| self.artifacts.put(wav));
        let Some(item) = self.items.seal(item_id, uri.clone()) else {
            return;
        };
        info!(item_id, role = %item.role, has_audio = uri.is_some(), "Item completed");
        self.observer.on_item_updated(&item);

        if let Some(uri) = uri {
            if item.role == Role::Assistant && self.config.autoplay {
                self.registry.autoplay(item_id, &uri, SurfaceHandle::speaker());
            }
        }
    }

    fn on_item_created(&mut self, item_id: &str, role: Role, text: Option<String>) {
        match (role, text) {
            (Role::User, Some(text)) => {
                let item = ConversationItem {
                    id: item_id.to_string(),
                    role: Role::User,
                    transcript: Some(text),
                    status: ItemStatus::Completed,
                    audio_artifact_url: None,
                };
                self.items.insert_completed(item.clone());
                self.observer.on_item_updated(&item);
            }
            (Role::User, None) => {
                if self.items.get(item_id).is_some() || self.link_echo(item_id) {
                    return;
                }
                let (item, created) = self.items.get_or_create_streaming(item_id, Role::User);
                if created {
                    self.observer.on_item_updated(&item);
                }
            }
            (Role::Assistant, _) => {
                let (item, created) = self.items.get_or_create_streaming(item_id, Role::Assistant);
                if created {
                    self.observer.on_item_updated(&item);
                }
            }
        }
    }

    /// Alias a server user item to the oldest pending echo. Returns whether
    /// there was one. Ids that already resolve are left alone.
    fn link_echo(&mut self, item_id: &str) -> bool {
        if self.items.get(item_id).is_some() {
            return false;
        }
        match self.items.claim_echo(item_id) {
            Some(local) => {
                debug!(item_id, local_id = %local, "Server id linked to local echo");
                true
            }
            None => false,
        }
    }

    fn on_input_transcription(&mut self, item_id: &str, transcript: &str) {
        if self.items.get(item_id).is_none() {
            let item = ConversationItem {
                id: item_id.to_string(),
                role: Role::User,
                transcript: Some(transcript.to_string()),
                status: ItemStatus::Completed,
                audio_artifact_url: None,
            };
            self.items.insert_completed(item.clone());
            self.observer.on_item_updated(&item);
            return;
        }
        let Some(mut item) = self.items.set_transcript(item_id, transcript) else {
            return;
        };
        if !item.is_completed() {
            if let Some(sealed) = self.items.seal(item_id, None) {
                item = sealed;
            }
        }
        self.observer.on_item_updated(&item);
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn require_connected(&self) -> Result<(), EngineError> {
        if self.session.connection_state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    /// Local id for `item_id` (server ids of echoed turns map to the echo).
    fn item_key(&self, item_id: &str) -> String {
        self.items
            .get(item_id)
            .map(|item| item.id.clone())
            .unwrap_or_else(|| item_id.to_string())
    }

    fn configure_remote(&mut self, mode: Mode) -> Result<(), EngineError> {
        let session = SessionConfig {
            voice: self.session.voice.clone(),
            instructions: self.session.instructions.clone(),
            temperature: self.session.temperature,
            turn_detection: SessionConfig::turn_detection_for(mode, &self.config.vad),
            input_audio_transcription: self
                .config
                .transcription_model
                .clone()
                .map(|model| TranscriptionConfig { model }),
        };
        self.send(&ClientEvent::SessionUpdate { session })
    }

    fn send_greeting(&mut self) -> Result<(), EngineError> {
        let greeting = self.config.greeting.trim().to_string();
        if greeting.is_empty() {
            return Ok(());
        }
        self.send(&ClientEvent::user_text(&greeting))?;
        self.send(&ClientEvent::CreateResponse)
    }

    /// Send over the relay. A failed send while connected ends the session.
    fn send(&mut self, event: &ClientEvent) -> Result<(), EngineError> {
        let relay = self.relay.as_ref().ok_or(EngineError::NotConnected)?;
        if let Err(e) = relay.send(event) {
            if self.session.connection_state == ConnectionState::Connected {
                warn!(error = %e, "Relay send failed, disconnecting");
                self.teardown();
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn set_remote_speaking(&mut self, speaking: bool) {
        if self.session.is_remote_speaking != speaking {
            self.session.is_remote_speaking = speaking;
            self.notify_state();
        }
    }

    fn count_malformed(&mut self, err: ProtocolError) {
        self.malformed_events += 1;
        warn!(count = self.malformed_events, error = %err, "Malformed inbound event");
        self.report(&err.into());
    }

    fn report(&self, err: &EngineError) {
        warn!(kind = err.kind(), error = %err, "Session error");
        self.observer.on_error(err);
    }

    fn notify_state(&self) {
        self.observer.on_state_changed(&self.snapshot());
    }
}
