//! Inbound event dispatch loop.
//!
//! One dedicated task consumes the transport's event stream in arrival order
//! and fans each event kind out to its owner: audio deltas to the playback
//! scheduler, tool requests to the bridge, speech/lifecycle events to the
//! shared session state. Tool handlers run on their own tasks, so a slow
//! tool never delays the next audio delta.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::playback::PlaybackScheduler;
use crate::protocol::InboundEvent;
use crate::session::SessionShared;
use crate::status::SessionState;
use crate::tools::ToolBridge;
use crate::transport::TransportEvent;

/// Dispatch counters for observability.
#[derive(Default)]
pub struct DispatchDiagnostics {
    pub events_handled: AtomicUsize,
    pub decode_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchDiagnosticsSnapshot {
    pub events_handled: usize,
    pub decode_errors: usize,
}

impl DispatchDiagnostics {
    pub fn snapshot(&self) -> DispatchDiagnosticsSnapshot {
        DispatchDiagnosticsSnapshot {
            events_handled: self.events_handled.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// All context the dispatch loop needs, passed as one struct.
pub struct DispatchContext {
    pub inbound: mpsc::Receiver<TransportEvent>,
    pub playback: Arc<PlaybackScheduler>,
    pub bridge: ToolBridge,
    pub shared: Arc<SessionShared>,
    /// Fired once when `session.created` is observed; resolves `connect()`.
    pub created_tx: Option<oneshot::Sender<()>>,
    pub diagnostics: Arc<DispatchDiagnostics>,
}

/// Consume inbound events until the transport ends or the session closes.
pub async fn run(mut ctx: DispatchContext) {
    while let Some(event) = ctx.inbound.recv().await {
        match event {
            TransportEvent::Event(event) => {
                ctx.diagnostics.events_handled.fetch_add(1, Ordering::Relaxed);
                handle_event(&mut ctx, event);
            }
            TransportEvent::Closed { reason } => {
                if matches!(
                    ctx.shared.state(),
                    SessionState::Closing | SessionState::Closed
                ) {
                    debug!("transport closed during teardown");
                } else {
                    let reason =
                        reason.unwrap_or_else(|| "connection closed by peer".to_string());
                    warn!(%reason, "transport closed unexpectedly");
                    ctx.shared.fail(format!("transport closed: {reason}"));
                    ctx.playback.flush();
                }
                break;
            }
            TransportEvent::Failed(message) => {
                warn!(%message, "transport failure");
                ctx.shared.fail(format!("transport error: {message}"));
                ctx.playback.flush();
                break;
            }
        }
    }
    debug!("dispatch loop finished");
}

fn handle_event(ctx: &mut DispatchContext, event: InboundEvent) {
    match event {
        InboundEvent::SessionCreated => {
            info!("session acknowledged by remote");
            ctx.shared.set_state(SessionState::Active);
            if let Some(created) = ctx.created_tx.take() {
                let _ = created.send(());
            }
        }

        InboundEvent::AudioDelta { delta } => {
            if let Err(e) = ctx.playback.enqueue_chunk(&delta) {
                // Malformed payload: drop the chunk, keep the session alive.
                ctx.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{e}");
                ctx.shared.surface_error(e.to_string());
            }
        }

        InboundEvent::ResponseDone => {
            // Playback clears is_speaking on its own once the queue drains.
            debug!("response complete");
        }

        InboundEvent::SpeechStarted => {
            // Barge-in: cancel queued playback in the same handling step.
            ctx.playback.flush();
            ctx.shared.set_listening(true);
        }

        InboundEvent::SpeechStopped => {
            ctx.shared.set_listening(false);
        }

        InboundEvent::ToolCallRequest {
            call_id,
            name,
            arguments,
        } => {
            ctx.bridge.dispatch(call_id, name, arguments);
        }

        InboundEvent::Error { error } => {
            // The remote side is still live; surface without tearing down.
            warn!(message = %error.message, "remote error event");
            ctx.shared.surface_error(error.message);
        }
    }
}
