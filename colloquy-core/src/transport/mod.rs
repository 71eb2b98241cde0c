//! Duplex transport: credential exchange, socket lifecycle, and the
//! send/receive loops that bridge the wire to typed envelopes and events.
//!
//! The adapter introduces no reordering: envelopes leave in the order they
//! were queued, inbound events are forwarded in arrival order. Malformed
//! inbound frames are counted, logged and dropped (non-fatal); socket-level
//! failures surface as a terminal [`TransportEvent::Failed`] so the dispatch
//! loop can move the session to its errored state.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{ColloquyError, Result};
use crate::protocol::{parse_inbound, InboundEvent, OutboundEnvelope};

/// Outbound queue depth. Capture frames use `try_send` and are dropped when
/// full (lossy policy); control and tool envelopes use an awaited `send`.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Inbound queue depth between the socket reader and the dispatch loop.
const INBOUND_QUEUE_DEPTH: usize = 256;

/// What the receive loop hands to the dispatch loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// A parsed wire event, in arrival order.
    Event(InboundEvent),
    /// The peer closed the connection. Terminal for this transport.
    Closed { reason: Option<String> },
    /// Socket-level failure. Terminal and fatal.
    Failed(String),
}

/// Transport counters for observability.
#[derive(Default)]
pub struct TransportDiagnostics {
    pub messages_sent: AtomicUsize,
    pub events_received: AtomicUsize,
    pub protocol_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportDiagnosticsSnapshot {
    pub messages_sent: usize,
    pub events_received: usize,
    pub protocol_errors: usize,
}

impl TransportDiagnostics {
    pub fn snapshot(&self) -> TransportDiagnosticsSnapshot {
        TransportDiagnosticsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Fetch the short-lived connection secret from the host's token endpoint.
///
/// One out-of-band POST; the secret is used only for the socket handshake
/// and never persisted.
pub async fn fetch_credential(client: &reqwest::Client, token_url: &str) -> Result<String> {
    let response = client
        .post(token_url)
        .send()
        .await
        .map_err(|e| ColloquyError::Credential(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ColloquyError::Credential(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| ColloquyError::Credential(format!("token response not JSON: {e}")))?;

    extract_secret(&body)
        .ok_or_else(|| ColloquyError::Credential("token response carries no secret".into()))
}

/// Pull the bearer secret out of the token endpoint's response body.
fn extract_secret(body: &Value) -> Option<String> {
    body.pointer("/client_secret/value")
        .or_else(|| body.get("secret"))
        .or_else(|| body.get("token"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

/// A live duplex connection with its send and receive loops.
///
/// Owned exclusively by the session controller; exactly one exists per
/// controller instance.
pub struct Transport {
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    inbound_rx: Option<mpsc::Receiver<TransportEvent>>,
    closer: Arc<Notify>,
    diagnostics: Arc<TransportDiagnostics>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl Transport {
    /// Establish the duplex connection with the given short-lived credential
    /// and spawn the send/receive loops.
    pub async fn open(url: &str, credential: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ColloquyError::Transport(format!("bad endpoint {url}: {e}")))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| ColloquyError::Transport(format!("credential not header-safe: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| ColloquyError::Transport(format!("connect {url}: {e}")))?;
        info!(url, "duplex connection established");

        let (mut ws_tx, mut ws_rx) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundEnvelope>(OUTBOUND_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(INBOUND_QUEUE_DEPTH);
        let closer = Arc::new(Notify::new());
        let diagnostics = Arc::new(TransportDiagnostics::default());

        // Send loop: outbound queue → socket, in queue order.
        let close_signal = Arc::clone(&closer);
        let send_diag = Arc::clone(&diagnostics);
        let send_fail_tx = inbound_tx.clone();
        let send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_signal.notified() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    envelope = outbound_rx.recv() => {
                        let Some(envelope) = envelope else {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match envelope.to_wire() {
                            Ok(t) => t,
                            Err(e) => {
                                warn!("dropping unserializable envelope: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            let _ = send_fail_tx
                                .send(TransportEvent::Failed(format!("send: {e}")))
                                .await;
                            break;
                        }
                        send_diag.messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!("transport send loop finished");
        });

        // Receive loop: socket → parsed events, in arrival order.
        let recv_diag = Arc::clone(&diagnostics);
        let recv_task = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => match parse_inbound(&text) {
                        Ok(event) => {
                            recv_diag.events_received.fetch_add(1, Ordering::Relaxed);
                            if inbound_tx.send(TransportEvent::Event(event)).await.is_err() {
                                break; // dispatch loop is gone
                            }
                        }
                        Err(e) => {
                            recv_diag.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("{e}");
                        }
                    },
                    Ok(Message::Binary(bin)) => {
                        recv_diag.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(bytes = bin.len(), "unexpected binary frame dropped");
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| format!("{} {}", f.code, f.reason));
                        let _ = inbound_tx.send(TransportEvent::Closed { reason }).await;
                        break;
                    }
                    Ok(_) => {} // ping/pong handled by tungstenite
                    Err(e) => {
                        let _ = inbound_tx
                            .send(TransportEvent::Failed(e.to_string()))
                            .await;
                        break;
                    }
                }
            }
            debug!("transport receive loop finished");
        });

        Ok(Self {
            outbound_tx,
            inbound_rx: Some(inbound_rx),
            closer,
            diagnostics,
            send_task,
            recv_task,
        })
    }

    /// Sender half of the outbound queue. Cloned by the capture pipeline and
    /// the tool bridge.
    pub fn outbound(&self) -> mpsc::Sender<OutboundEnvelope> {
        self.outbound_tx.clone()
    }

    /// Take the inbound event stream. Called once by the dispatch loop.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inbound_rx.take()
    }

    /// Queue an envelope, waiting for queue space. Used for control and tool
    /// traffic, never for capture frames.
    pub async fn send(&self, envelope: OutboundEnvelope) -> Result<()> {
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| ColloquyError::Transport("connection is closed".into()))
    }

    pub fn diagnostics_snapshot(&self) -> TransportDiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Release the connection: sends a close frame and winds both loops
    /// down. Safe to call more than once.
    pub fn close(&self) {
        self.closer.notify_one();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closer.notify_one();
        self.send_task.abort();
        self.recv_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_client_secret() {
        let body = json!({"client_secret": {"value": "ek_abc", "expires_at": 1}});
        assert_eq!(extract_secret(&body).as_deref(), Some("ek_abc"));
    }

    #[test]
    fn extracts_flat_secret_and_token_fields() {
        assert_eq!(
            extract_secret(&json!({"secret": "s1"})).as_deref(),
            Some("s1")
        );
        assert_eq!(
            extract_secret(&json!({"token": "t1"})).as_deref(),
            Some("t1")
        );
    }

    #[test]
    fn missing_secret_yields_none() {
        assert!(extract_secret(&json!({"expires_at": 1})).is_none());
        assert!(extract_secret(&json!({"client_secret": {}})).is_none());
    }
}
