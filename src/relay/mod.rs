//! Relay transport.
//!
//! The engine talks to the realtime service through a relay endpoint. A
//! [`RelayConnector`] opens the connection and hands back a [`RelayLink`]:
//! an outbound channel of text frames and an inbound stream of
//! [`RelayIncoming`] notifications.

pub mod protocol;
mod websocket;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{error, warn};
use url::Url;

use crate::debug_log::{DebugEvent, DiagnosticLog, EventSource};
use crate::error::RelayError;
use crate::session::SessionObserver;

pub use protocol::{ClientEvent, ServerEvent};
pub use websocket::WebSocketConnector;

/// What arrives from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayIncoming {
    Text(String),
    Closed(Option<String>),
    Error(String),
}

/// An open relay connection. Dropping `outbound` closes the socket.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<RelayIncoming>,
}

/// Opens relay connections (dyn-compatible).
pub trait RelayConnector: Send + Sync {
    fn open(&self, url: &Url) -> Pin<Box<dyn Future<Output = Result<RelayLink, RelayError>> + Send + '_>>;
}

/// Build the relay target: `origin` plus `apiKey`, `model` and the upstream
/// realtime endpoint as the `url` query parameter (passed through as-is).
pub fn build_relay_url(
    origin: &str,
    api_key: &str,
    model: &str,
    upstream: &str,
) -> Result<Url, RelayError> {
    Url::parse_with_params(origin, &[("apiKey", api_key), ("model", model), ("url", upstream)])
        .map_err(|e| RelayError::InvalidUrl(format!("{origin}: {e}")))
}

/// Serializes, logs and sends client events. Cheap to clone; the capture
/// callback holds one to forward frames.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<String>,
    log: Arc<Mutex<DiagnosticLog>>,
    observer: Arc<dyn SessionObserver>,
}

impl RelaySender {
    pub fn new(
        tx: mpsc::UnboundedSender<String>,
        log: Arc<Mutex<DiagnosticLog>>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self { tx, log, observer }
    }

    pub fn send(&self, event: &ClientEvent) -> Result<(), RelayError> {
        let value = serde_json::to_value(event)
            .map_err(|e| RelayError::Transport(format!("failed to serialize client event: {e}")))?;
        let text = value.to_string();
        let record = DebugEvent::new(EventSource::Client, value);
        match self.log.lock() {
            Ok(mut log) => log.push(record.clone()),
            Err(e) => error!("Diagnostic log lock poisoned: {}", e),
        }
        self.observer.on_event(&record);
        self.tx.send(text).map_err(|_| RelayError::Closed(None))
    }

    /// Forward one captured PCM16 frame.
    pub fn send_audio(&self, frame: &[i16]) {
        if let Err(e) = self.send(&ClientEvent::append_audio(frame)) {
            warn!(error = %e, "Dropping captured frame");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullObserver;

    #[test]
    fn test_relay_url_carries_params() {
        let url = build_relay_url(
            "ws://localhost:8081",
            "sk-test",
            "gpt-4o-realtime-preview",
            "wss://api.openai.com/v1/realtime",
        )
        .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("apiKey".into(), "sk-test".into()),
                ("model".into(), "gpt-4o-realtime-preview".into()),
                ("url".into(), "wss://api.openai.com/v1/realtime".into()),
            ]
        );
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_relay_url_rejects_bad_origin() {
        assert!(matches!(
            build_relay_url("not a url", "k", "m", "u"),
            Err(RelayError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_sender_logs_before_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(DiagnosticLog::new(10)));
        let sender = RelaySender::new(tx, Arc::clone(&log), Arc::new(NullObserver));

        sender.send(&ClientEvent::CreateResponse).unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"{"type":"response.create"}"#);
        let events = log.lock().unwrap().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, EventSource::Client);

        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(sender.send(&ClientEvent::CreateResponse), Err(RelayError::Closed(None))));
    }
}
