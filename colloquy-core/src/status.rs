//! Host-facing session state and status events.
//!
//! The controller publishes a [`SessionStatusEvent`] on its broadcast channel
//! every time the connection state or the speaking/listening flags change.
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them over whatever IPC they use, unmodified.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a voice session.
///
/// `Idle → Connecting → Configuring → Active → Closing → Closed`, with a
/// side transition `* → Errored` on fatal transport/device failure.
/// `Errored` is terminal; only a fresh controller recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Controller created, `connect()` not yet called.
    Idle,
    /// Credential fetch / socket open in progress.
    Connecting,
    /// Connected; waiting for the remote to acknowledge configuration.
    Configuring,
    /// Live duplex session: capture uploads, playback drains.
    Active,
    /// `disconnect()` teardown in progress.
    Closing,
    /// Session finished; all owned resources released.
    Closed,
    /// Fatal transport or device failure. Terminal.
    Errored,
}

impl SessionState {
    /// Whether the session currently holds a live transport connection.
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Configuring | SessionState::Active)
    }
}

/// Point-in-time view of the session published to the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// True while the transport connection is open.
    pub is_connected: bool,
    /// True while synthesized speech is queued or audible.
    pub is_speaking: bool,
    /// True while the remote VAD reports the user speaking.
    pub is_listening: bool,
    /// Most recent surfaced error, if any. Non-fatal errors (remote, protocol,
    /// tool) appear here without tearing the session down.
    pub error: Option<String>,
}

/// Emitted on the controller's status channel when anything in the snapshot
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    pub snapshot: StatusSnapshot,
}

/// Emitted per captured frame so hosts can render a live mic level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the frame in [0.0, 1.0].
    pub rms: f32,
}
