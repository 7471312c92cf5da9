//! tokio-tungstenite relay connector.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::{RelayConnector, RelayIncoming, RelayLink};
use crate::error::RelayError;

/// Connects to the relay over a WebSocket. Each connection gets a writer
/// task draining the outbound channel and a reader task forwarding text
/// frames.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl RelayConnector for WebSocketConnector {
    fn open(&self, url: &Url) -> Pin<Box<dyn Future<Output = Result<RelayLink, RelayError>> + Send + '_>> {
        let target = url.to_string();
        Box::pin(async move {
            let (ws, _response) = connect_async(target.as_str())
                .await
                .map_err(|e| RelayError::Connect(e.to_string()))?;
            info!(host = ?url_host(&target), "Relay socket open");

            let (mut ws_tx, mut ws_rx) = ws.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<RelayIncoming>();

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        warn!(error = %e, "Relay send failed");
                        break;
                    }
                }
                // Sender dropped: the session is closing the socket.
                let _ = ws_tx.close().await;
                debug!("Relay writer exiting");
            });

            tokio::spawn(async move {
                while let Some(msg) = ws_rx.next().await {
                    let incoming = match msg {
                        Ok(Message::Text(text)) => RelayIncoming::Text(text),
                        Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                            Ok(text) => RelayIncoming::Text(text),
                            Err(e) => RelayIncoming::Text(format!("<{} non-utf8 bytes>", e.as_bytes().len())),
                        },
                        Ok(Message::Close(frame)) => {
                            let _ = in_tx.send(RelayIncoming::Closed(frame.map(|f| f.reason.to_string())));
                            return;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = in_tx.send(RelayIncoming::Error(e.to_string()));
                            return;
                        }
                    };
                    if in_tx.send(incoming).is_err() {
                        break;
                    }
                }
                let _ = in_tx.send(RelayIncoming::Closed(None));
                debug!("Relay reader exiting");
            });

            Ok(RelayLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// Host portion only; the query string carries the API key.
fn url_host(target: &str) -> Option<String> {
    Url::parse(target).ok()?.host_str().map(str::to_string)
}
