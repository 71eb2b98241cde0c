//! Colloquy console host entry point.
//!
//! Loads settings, registers the demo tool handlers, runs one live voice
//! session and mirrors status events to the log until Ctrl-C.

mod handlers;
mod settings;

use std::sync::Arc;

use colloquy_core::{SessionController, ToolRegistry};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use handlers::DemoStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let settings = settings::load_settings(&settings::default_settings_path());
    let config = settings.to_session_config();

    let store = DemoStore::with_sample_data();
    let mut registry = ToolRegistry::new();
    handlers::register_demo_handlers(&mut registry, Arc::clone(&store));

    let session = Arc::new(SessionController::new(config, registry));

    // Mirror the reactive status surface into the log.
    let mut status_rx = session.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status_rx.recv().await {
            info!(
                state = ?event.state,
                connected = event.snapshot.is_connected,
                speaking = event.snapshot.is_speaking,
                listening = event.snapshot.is_listening,
                error = event.snapshot.error.as_deref().unwrap_or(""),
                "status"
            );
        }
    });

    if let Err(e) = session.connect().await {
        error!("connect failed: {e}");
        return Err(e.into());
    }
    info!("session live — press Ctrl-C to hang up");

    tokio::signal::ctrl_c().await?;
    session.disconnect();

    let diag = session.diagnostics_snapshot();
    info!(
        frames_sent = diag.capture.frames_sent,
        frames_dropped = diag.capture.frames_dropped,
        entries_played = diag.playback.entries_played,
        entries_flushed = diag.playback.entries_flushed,
        events_handled = diag.dispatch.events_handled,
        findings = store.findings_count(),
        "session summary"
    );
    Ok(())
}
