use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{InterruptMark, PlaybackBackend, SurfaceHandle, TrackHandle};
use crate::artifacts::ArtifactStore;
use crate::error::PlaybackError;

/// Snapshot of a track's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackState {
    pub is_playing: bool,
    pub is_loading: bool,
    pub has_error: bool,
}

/// Playback state for one conversation item.
pub struct PlaybackTrack {
    item_id: String,
    source_uri: String,
    surface: SurfaceHandle,
    is_playing: AtomicBool,
    is_loading: AtomicBool,
    has_error: AtomicBool,
    autoplay: AtomicBool,
    released: AtomicBool,
    handle: Mutex<Option<Box<dyn TrackHandle>>>,
}

impl PlaybackTrack {
    fn new(item_id: &str, source_uri: &str, surface: SurfaceHandle) -> Self {
        Self {
            item_id: item_id.to_string(),
            source_uri: source_uri.to_string(),
            surface,
            is_playing: AtomicBool::new(false),
            is_loading: AtomicBool::new(true),
            has_error: AtomicBool::new(false),
            autoplay: AtomicBool::new(false),
            released: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading.load(Ordering::SeqCst)
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TrackState {
        TrackState {
            is_playing: self.is_playing(),
            is_loading: self.is_loading(),
            has_error: self.has_error(),
        }
    }

    fn lock_handle(&self) -> Option<MutexGuard<'_, Option<Box<dyn TrackHandle>>>> {
        match self.handle.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!(item_id = %self.item_id, "Track handle lock poisoned: {}", e);
                None
            }
        }
    }

    /// Flip between playing and paused. Returns `false` without touching
    /// anything while the track is loading or errored.
    pub fn toggle_play(&self) -> bool {
        let Some(guard) = self.lock_handle() else {
            return false;
        };
        if self.is_loading() || self.has_error() {
            return false;
        }
        let Some(handle) = guard.as_ref() else {
            return false;
        };
        let play = !self.is_playing();
        if play {
            handle.play();
        } else {
            handle.pause();
        }
        self.is_playing.store(play, Ordering::SeqCst);
        debug!(item_id = %self.item_id, playing = play, "Track toggled");
        true
    }

    /// Start playback as soon as the decode is ready (or now, if it is).
    pub fn play_when_ready(&self) {
        let Some(guard) = self.lock_handle() else {
            return;
        };
        match guard.as_ref() {
            Some(handle) if !self.has_error() && !self.is_playing() => {
                handle.play();
                self.is_playing.store(true, Ordering::SeqCst);
            }
            Some(_) => {}
            None => self.autoplay.store(true, Ordering::SeqCst),
        }
    }

    /// Drop a pending start-on-ready. Returns whether one was pending.
    fn cancel_autoplay(&self) -> bool {
        // Taken under the handle lock so it cannot interleave with `on_ready`.
        let Some(_guard) = self.lock_handle() else {
            return false;
        };
        self.autoplay.swap(false, Ordering::SeqCst)
    }

    /// Pause if playing and report where playback stopped.
    fn halt(&self) -> Option<u64> {
        let guard = self.lock_handle()?;
        let handle = guard.as_ref()?;
        if !self.is_playing() {
            return None;
        }
        let offset = handle.position_samples();
        handle.pause();
        self.is_playing.store(false, Ordering::SeqCst);
        Some(offset)
    }

    fn pause(&self) {
        if let Some(guard) = self.lock_handle() {
            if let Some(handle) = guard.as_ref() {
                handle.pause();
            }
        }
        self.is_playing.store(false, Ordering::SeqCst);
    }

    pub fn seek(&self, offset_samples: u64) -> Result<(), PlaybackError> {
        let guard = self
            .lock_handle()
            .ok_or_else(|| PlaybackError::Seek("track handle unavailable".into()))?;
        match guard.as_ref() {
            Some(handle) if !self.has_error() => handle.seek(offset_samples),
            _ => Err(PlaybackError::Seek(format!("track {} is not ready", self.item_id))),
        }
    }

    fn on_ready(&self, handle: Box<dyn TrackHandle>) {
        let Some(mut guard) = self.lock_handle() else {
            return;
        };
        if self.released.load(Ordering::SeqCst) {
            handle.stop();
            return;
        }
        if self.autoplay.swap(false, Ordering::SeqCst) {
            handle.play();
            self.is_playing.store(true, Ordering::SeqCst);
        }
        *guard = Some(handle);
        self.is_loading.store(false, Ordering::SeqCst);
        debug!(item_id = %self.item_id, "Track ready");
    }

    fn on_error(&self, err: &PlaybackError) {
        warn!(item_id = %self.item_id, error = %err, "Track decode failed");
        self.has_error.store(true, Ordering::SeqCst);
        self.is_loading.store(false, Ordering::SeqCst);
    }

    fn on_finished(&self) {
        self.is_playing.store(false, Ordering::SeqCst);
        debug!(item_id = %self.item_id, "Track finished");
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.is_playing.store(false, Ordering::SeqCst);
        if let Some(mut guard) = self.lock_handle() {
            if let Some(handle) = guard.take() {
                handle.stop();
            }
        }
    }
}

/// Item id → track. Registration is idempotent: the first call for an id
/// wins and later calls get the same track back.
pub struct PlaybackRegistry {
    backend: Arc<dyn PlaybackBackend>,
    artifacts: ArtifactStore,
    tracks: HashMap<String, Arc<PlaybackTrack>>,
}

impl PlaybackRegistry {
    pub fn new(backend: Arc<dyn PlaybackBackend>, artifacts: ArtifactStore) -> Self {
        Self {
            backend,
            artifacts,
            tracks: HashMap::new(),
        }
    }

    /// Return the track for `item_id`, creating it and starting its decode
    /// on first use. `source_uri` and `surface` are ignored when the track
    /// already exists.
    pub fn get_or_create(
        &mut self,
        item_id: &str,
        source_uri: &str,
        surface: SurfaceHandle,
    ) -> Arc<PlaybackTrack> {
        if let Some(track) = self.tracks.get(item_id) {
            return Arc::clone(track);
        }

        let track = Arc::new(PlaybackTrack::new(item_id, source_uri, surface));
        self.tracks.insert(item_id.to_string(), Arc::clone(&track));
        info!(item_id, uri = source_uri, "Registered playback track");

        let backend = Arc::clone(&self.backend);
        let bytes = self.artifacts.get(source_uri);
        let uri = source_uri.to_string();
        let weak: Weak<PlaybackTrack> = Arc::downgrade(&track);
        let task_track = Arc::clone(&track);
        tokio::spawn(async move {
            let Some(bytes) = bytes else {
                task_track.on_error(&PlaybackError::Decode {
                    uri,
                    reason: "artifact not found".into(),
                });
                return;
            };
            let on_finished = Box::new(move || {
                if let Some(track) = weak.upgrade() {
                    track.on_finished();
                }
            });
            match backend.decode(uri, bytes, on_finished).await {
                Ok(handle) => task_track.on_ready(handle),
                Err(e) => task_track.on_error(&e),
            }
        });

        track
    }

    pub fn get(&self, item_id: &str) -> Option<Arc<PlaybackTrack>> {
        self.tracks.get(item_id).cloned()
    }

    /// Toggle a track. Starting one track pauses any other that is playing.
    /// Returns whether the toggle took effect.
    pub fn toggle_play(&self, item_id: &str) -> Result<bool, PlaybackError> {
        let track = self
            .tracks
            .get(item_id)
            .ok_or_else(|| PlaybackError::UnknownTrack(item_id.to_string()))?;
        if !track.is_playing() && !track.is_loading() && !track.has_error() {
            self.silence_others(item_id);
        }
        Ok(track.toggle_play())
    }

    /// Register `item_id` and start it as soon as it is decoded. Every other
    /// track is paused and loses any pending start, so only one plays.
    pub fn autoplay(
        &mut self,
        item_id: &str,
        source_uri: &str,
        surface: SurfaceHandle,
    ) -> Arc<PlaybackTrack> {
        let track = self.get_or_create(item_id, source_uri, surface);
        self.silence_others(item_id);
        track.play_when_ready();
        track
    }

    fn silence_others(&self, item_id: &str) {
        for other in self.tracks.values() {
            if other.item_id == item_id {
                continue;
            }
            if other.cancel_autoplay() {
                debug!(item_id = %other.item_id, "Pending playback superseded");
            }
            if other.is_playing() {
                other.pause();
            }
        }
    }

    pub fn seek(&self, item_id: &str, offset_samples: u64) -> Result<(), PlaybackError> {
        self.tracks
            .get(item_id)
            .ok_or_else(|| PlaybackError::UnknownTrack(item_id.to_string()))?
            .seek(offset_samples)
    }

    /// The track currently playing, if any.
    pub fn active_track(&self) -> Option<Arc<PlaybackTrack>> {
        self.tracks.values().find(|t| t.is_playing()).cloned()
    }

    /// Stop every playing track and drop every pending start.
    ///
    /// Reports where a playing track stopped. When nothing was audible yet
    /// but a track was about to start, reports that track at offset 0.
    pub fn interrupt(&self) -> Option<InterruptMark> {
        let mut halted = None;
        let mut pending = None;
        for track in self.tracks.values() {
            if let Some(offset) = track.halt() {
                info!(item_id = %track.item_id, offset, "Playback interrupted");
                halted.get_or_insert_with(|| InterruptMark {
                    track_id: track.item_id.clone(),
                    offset,
                });
            } else if track.cancel_autoplay() {
                info!(item_id = %track.item_id, "Pending playback cancelled");
                pending.get_or_insert_with(|| InterruptMark {
                    track_id: track.item_id.clone(),
                    offset: 0,
                });
            }
        }
        halted.or(pending)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Release every track.
    pub fn clear(&mut self) {
        for track in self.tracks.values() {
            track.release();
        }
        if !self.tracks.is_empty() {
            debug!(tracks = self.tracks.len(), "Playback registry cleared");
        }
        self.tracks.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::playback::FinishedCallback;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Shared view of a fake track's state.
    #[derive(Default)]
    pub(crate) struct FakeTrackState {
        pub playing: AtomicBool,
        pub stopped: AtomicBool,
        pub position: AtomicU64,
    }

    pub(crate) struct FakeHandle {
        state: Arc<FakeTrackState>,
    }

    impl TrackHandle for FakeHandle {
        fn play(&self) {
            self.state.playing.store(true, Ordering::SeqCst);
        }
        fn pause(&self) {
            self.state.playing.store(false, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.state.playing.store(false, Ordering::SeqCst);
            self.state.stopped.store(true, Ordering::SeqCst);
        }
        fn seek(&self, offset_samples: u64) -> Result<(), PlaybackError> {
            self.state.position.store(offset_samples, Ordering::SeqCst);
            Ok(())
        }
        fn position_samples(&self) -> u64 {
            self.state.position.load(Ordering::SeqCst)
        }
    }

    /// Decodes instantly; URIs registered via `fail_uri` fail.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub tracks: Mutex<HashMap<String, Arc<FakeTrackState>>>,
        pub finishers: Mutex<HashMap<String, FinishedCallback>>,
        pub fail_all: AtomicBool,
        pub decodes: AtomicU64,
    }

    impl FakeBackend {
        pub fn state_for(&self, uri: &str) -> Option<Arc<FakeTrackState>> {
            self.tracks.lock().unwrap().get(uri).cloned()
        }

        pub fn finish(&self, uri: &str) {
            if let Some(cb) = self.finishers.lock().unwrap().get(uri) {
                cb();
            }
        }
    }

    impl PlaybackBackend for FakeBackend {
        fn decode(
            &self,
            uri: String,
            _wav: Arc<[u8]>,
            on_finished: FinishedCallback,
        ) -> Pin<Box<dyn Future<Output = Result<Box<dyn TrackHandle>, PlaybackError>> + Send + '_>>
        {
            Box::pin(async move {
                self.decodes.fetch_add(1, Ordering::SeqCst);
                if self.fail_all.load(Ordering::SeqCst) {
                    return Err(PlaybackError::Decode {
                        uri,
                        reason: "corrupt".into(),
                    });
                }
                let state = Arc::new(FakeTrackState::default());
                self.tracks.lock().unwrap().insert(uri.clone(), Arc::clone(&state));
                self.finishers.lock().unwrap().insert(uri, on_finished);
                Ok(Box::new(FakeHandle { state }) as Box<dyn TrackHandle>)
            })
        }
    }

    pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn registry() -> (PlaybackRegistry, Arc<FakeBackend>, ArtifactStore) {
        let backend = Arc::new(FakeBackend::default());
        let artifacts = ArtifactStore::new();
        let registry = PlaybackRegistry::new(backend.clone(), artifacts.clone());
        (registry, backend, artifacts)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (mut registry, backend, artifacts) = registry();
        let uri = artifacts.put(vec![0; 44]);
        let first = registry.get_or_create("a1", &uri, SurfaceHandle::new("wave-1"));
        let second = registry.get_or_create("a1", "artifact://other.wav", SurfaceHandle::new("wave-2"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.surface(), &SurfaceHandle::new("wave-1"));
        assert_eq!(second.source_uri(), uri);
        wait_until(|| !first.is_loading()).await;
        assert_eq!(backend.decodes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_toggle_is_noop_while_loading_or_errored() {
        let (mut registry, backend, artifacts) = registry();
        backend.fail_all.store(true, Ordering::SeqCst);
        let uri = artifacts.put(vec![0; 44]);
        let track = registry.get_or_create("bad", &uri, SurfaceHandle::speaker());
        // Nothing has been polled yet: still loading.
        assert!(track.is_loading());
        assert!(!registry.toggle_play("bad").unwrap());

        wait_until(|| track.has_error()).await;
        assert!(!registry.toggle_play("bad").unwrap());
        assert!(!track.is_playing());
    }

    #[tokio::test]
    async fn test_missing_artifact_marks_error() {
        let (mut registry, _backend, _artifacts) = registry();
        let track = registry.get_or_create("x", "artifact://missing.wav", SurfaceHandle::speaker());
        wait_until(|| track.has_error()).await;
        assert!(!track.is_loading());
    }

    #[tokio::test]
    async fn test_toggle_plays_and_pauses() {
        let (mut registry, backend, artifacts) = registry();
        let uri = artifacts.put(vec![0; 44]);
        let track = registry.get_or_create("a1", &uri, SurfaceHandle::speaker());
        wait_until(|| !track.is_loading()).await;

        assert!(registry.toggle_play("a1").unwrap());
        assert!(track.is_playing());
        assert!(backend.state_for(&uri).unwrap().playing.load(Ordering::SeqCst));

        assert!(registry.toggle_play("a1").unwrap());
        assert!(!track.is_playing());
        assert!(matches!(registry.toggle_play("nope"), Err(PlaybackError::UnknownTrack(_))));
    }

    #[tokio::test]
    async fn test_starting_one_track_pauses_the_other() {
        let (mut registry, _backend, artifacts) = registry();
        let a = registry.get_or_create("a", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());
        let b = registry.get_or_create("b", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());
        wait_until(|| !a.is_loading() && !b.is_loading()).await;

        registry.toggle_play("a").unwrap();
        registry.toggle_play("b").unwrap();
        assert!(!a.is_playing());
        assert!(b.is_playing());
    }

    #[tokio::test]
    async fn test_finish_callback_clears_playing() {
        let (mut registry, backend, artifacts) = registry();
        let uri = artifacts.put(vec![0; 44]);
        let track = registry.get_or_create("a1", &uri, SurfaceHandle::speaker());
        track.play_when_ready();
        wait_until(|| track.is_playing()).await;

        backend.finish(&uri);
        assert!(!track.is_playing());
    }

    #[tokio::test]
    async fn test_interrupt_reports_position() {
        let (mut registry, backend, artifacts) = registry();
        assert!(registry.interrupt().is_none());

        let uri = artifacts.put(vec![0; 44]);
        let track = registry.get_or_create("a1", &uri, SurfaceHandle::speaker());
        track.play_when_ready();
        wait_until(|| track.is_playing()).await;
        backend.state_for(&uri).unwrap().position.store(1200, Ordering::SeqCst);

        let mark = registry.interrupt().unwrap();
        assert_eq!(mark, InterruptMark { track_id: "a1".into(), offset: 1200 });
        assert!(!track.is_playing());
        assert!(registry.interrupt().is_none());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_start_while_decoding() {
        let (mut registry, backend, artifacts) = registry();
        let uri = artifacts.put(vec![0; 44]);
        // The decode task has not been polled yet.
        let track = registry.autoplay("a1", &uri, SurfaceHandle::speaker());
        assert!(track.is_loading());

        let mark = registry.interrupt().unwrap();
        assert_eq!(mark, InterruptMark { track_id: "a1".into(), offset: 0 });

        wait_until(|| !track.is_loading()).await;
        assert!(!track.is_playing());
        assert!(!backend.state_for(&uri).unwrap().playing.load(Ordering::SeqCst));
        assert!(registry.interrupt().is_none());
    }

    #[tokio::test]
    async fn test_autoplay_pauses_the_track_already_playing() {
        let (mut registry, backend, artifacts) = registry();
        let first_uri = artifacts.put(vec![0; 44]);
        let first = registry.autoplay("a1", &first_uri, SurfaceHandle::speaker());
        wait_until(|| first.is_playing()).await;

        let second = registry.autoplay("a2", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());
        assert!(!first.is_playing());
        assert!(!backend.state_for(&first_uri).unwrap().playing.load(Ordering::SeqCst));
        wait_until(|| second.is_playing()).await;

        assert_eq!(registry.interrupt().unwrap().track_id, "a2");
        assert!(registry.active_track().is_none());
    }

    #[tokio::test]
    async fn test_latest_autoplay_wins_while_both_decode() {
        let (mut registry, _backend, artifacts) = registry();
        let first = registry.autoplay("a1", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());
        let second = registry.autoplay("a2", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());

        wait_until(|| !first.is_loading() && !second.is_loading()).await;
        assert!(!first.is_playing());
        assert!(second.is_playing());
    }

    #[tokio::test]
    async fn test_interrupt_halts_every_playing_track() {
        let (mut registry, _backend, artifacts) = registry();
        let a = registry.get_or_create("a", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());
        let b = registry.get_or_create("b", &artifacts.put(vec![0; 44]), SurfaceHandle::speaker());
        a.play_when_ready();
        b.play_when_ready();
        wait_until(|| a.is_playing() && b.is_playing()).await;

        assert!(registry.interrupt().is_some());
        assert!(!a.is_playing());
        assert!(!b.is_playing());
        assert!(registry.interrupt().is_none());
    }

    #[tokio::test]
    async fn test_clear_releases_tracks() {
        let (mut registry, backend, artifacts) = registry();
        let uri = artifacts.put(vec![0; 44]);
        let track = registry.get_or_create("a1", &uri, SurfaceHandle::speaker());
        wait_until(|| !track.is_loading()).await;

        registry.clear();
        assert!(registry.is_empty());
        assert!(backend.state_for(&uri).unwrap().stopped.load(Ordering::SeqCst));
        assert!(registry.get("a1").is_none());
    }
}
