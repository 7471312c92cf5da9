//! Playable audio artifacts.
//!
//! Completed items get a sealed WAV stored under an `artifact://` URI. The
//! store is shared between the session engine (writer) and playback decode
//! tasks (readers).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{error, info};

use crate::error::ArtifactError;

pub const ARTIFACT_SCHEME: &str = "artifact://";

#[derive(Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store sealed WAV bytes and return their URI.
    pub fn put(&self, bytes: Vec<u8>) -> String {
        let uri = format!("{}{}.wav", ARTIFACT_SCHEME, uuid::Uuid::new_v4());
        match self.inner.write() {
            Ok(mut map) => {
                map.insert(uri.clone(), Arc::from(bytes));
            }
            Err(e) => error!("Artifact store lock poisoned: {}", e),
        }
        uri
    }

    pub fn get(&self, uri: &str) -> Option<Arc<[u8]>> {
        self.inner.read().ok()?.get(uri).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.write() {
            map.clear();
        }
    }
}

/// Writes artifacts to a download directory.
#[derive(Debug, Clone)]
pub struct DownloadSink {
    dir: PathBuf,
}

impl DownloadSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to `{dir}/{filename}`. Path separators in `filename`
    /// are replaced so the file always lands inside the directory.
    pub fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(&self.dir)?;
        let safe: String = filename
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        let path = self.dir.join(safe);
        std::fs::write(&path, bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "Artifact downloaded");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_and_clear() {
        let store = ArtifactStore::new();
        let uri = store.put(vec![1, 2, 3]);
        assert!(uri.starts_with(ARTIFACT_SCHEME));
        assert!(uri.ends_with(".wav"));
        assert_eq!(store.get(&uri).as_deref(), Some(&[1u8, 2, 3][..]));

        let other = store.clone();
        other.clear();
        assert!(store.get(&uri).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_uris_are_unique() {
        let store = ArtifactStore::new();
        assert_ne!(store.put(vec![]), store.put(vec![]));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_download_sink_writes_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DownloadSink::new(dir.path().join("downloads"));
        let path = sink.save("../assistant-a1.wav", b"RIFF").unwrap();
        assert!(path.starts_with(dir.path().join("downloads")));
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF");
    }
}
