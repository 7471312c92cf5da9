//! Bounded diagnostic log of protocol events.
//!
//! Every event crossing the relay, in either direction, is recorded here as
//! a `{time, source, event}` envelope. The log keeps the most recent
//! `capacity` entries and evicts the oldest first.

use std::fmt;

use chrono::{DateTime, Utc};
use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of retained events.
pub const DEFAULT_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Client,
    Server,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Client => write!(f, "client"),
            EventSource::Server => write!(f, "server"),
        }
    }
}

/// One logged protocol event. Serializes as the wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEvent {
    pub time: DateTime<Utc>,
    pub source: EventSource,
    pub event: Value,
}

impl DebugEvent {
    pub fn new(source: EventSource, event: Value) -> Self {
        Self {
            time: Utc::now(),
            source,
            event,
        }
    }

    /// The event's `type` field, or an empty string if it has none.
    pub fn event_type(&self) -> &str {
        self.event.get("type").and_then(Value::as_str).unwrap_or("")
    }

    fn matches(&self, needle: &str, source: Option<EventSource>) -> bool {
        if source.is_some_and(|s| s != self.source) {
            return false;
        }
        if needle.is_empty() {
            return true;
        }
        self.event_type().to_lowercase().contains(needle)
            || self.event.to_string().to_lowercase().contains(needle)
    }
}

pub struct DiagnosticLog {
    buffer: HeapRb<DebugEvent>,
    total: u64,
}

impl DiagnosticLog {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: HeapRb::new(capacity.max(1)),
            total: 0,
        }
    }

    /// Append an event, evicting the oldest one if the log is full.
    pub fn push(&mut self, event: DebugEvent) {
        self.buffer.push_overwrite(event);
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.buffer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity().get()
    }

    /// Number of events ever pushed, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<DebugEvent> {
        self.buffer.iter().cloned().collect()
    }

    /// Retained events whose type or payload contains `text`
    /// (case-insensitive), optionally restricted to one source.
    pub fn filter(&self, text: &str, source: Option<EventSource>) -> Vec<DebugEvent> {
        let needle = text.trim().to_lowercase();
        self.buffer
            .iter()
            .filter(|e| e.matches(&needle, source))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
