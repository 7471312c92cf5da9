//! Per-item buffering of inbound PCM16 audio deltas.
//!
//! Chunks for one item are kept in receipt order and merged exactly once.
//! After the merge (or a discard) the item is sealed: further chunks for it
//! are rejected with [`AccumulatorError::StaleChunk`].

use std::collections::HashMap;

use tracing::debug;

use crate::error::AccumulatorError;

#[derive(Debug, Default)]
struct Entry {
    chunks: Vec<Vec<i16>>,
    samples: usize,
    sealed: bool,
}

#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    entries: HashMap<String, Entry>,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to `item_id`'s buffer, creating the buffer on first use.
    pub fn append(&mut self, item_id: &str, chunk: Vec<i16>) -> Result<(), AccumulatorError> {
        let entry = self.entries.entry(item_id.to_string()).or_default();
        if entry.sealed {
            return Err(AccumulatorError::StaleChunk {
                item_id: item_id.to_string(),
            });
        }
        entry.samples += chunk.len();
        entry.chunks.push(chunk);
        Ok(())
    }

    /// Concatenate every chunk for `item_id` into one buffer and seal it.
    ///
    /// An item that never received a chunk merges to an empty buffer.
    pub fn merge_and_seal(&mut self, item_id: &str) -> Result<Vec<i16>, AccumulatorError> {
        let entry = self.entries.entry(item_id.to_string()).or_default();
        if entry.sealed {
            return Err(AccumulatorError::StaleChunk {
                item_id: item_id.to_string(),
            });
        }
        let mut merged = Vec::with_capacity(entry.samples);
        for chunk in entry.chunks.drain(..) {
            merged.extend_from_slice(&chunk);
        }
        entry.samples = 0;
        entry.sealed = true;
        debug!(item_id, samples = merged.len(), "Merged audio chunks");
        Ok(merged)
    }

    /// Drop any buffered chunks for `item_id` without merging and seal it.
    /// Used when the remote supplies a complete pre-encoded payload.
    pub fn discard(&mut self, item_id: &str) {
        let entry = self.entries.entry(item_id.to_string()).or_default();
        if !entry.chunks.is_empty() {
            debug!(item_id, chunks = entry.chunks.len(), "Discarding buffered chunks");
        }
        entry.chunks.clear();
        entry.samples = 0;
        entry.sealed = true;
    }

    /// Samples currently buffered (not yet merged) for `item_id`.
    pub fn buffered_samples(&self, item_id: &str) -> usize {
        self.entries.get(item_id).map_or(0, |e| e.samples)
    }

    pub fn is_sealed(&self, item_id: &str) -> bool {
        self.entries.get(item_id).is_some_and(|e| e.sealed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
