//! Events the remote service sends over the duplex connection.

use serde::Deserialize;

use crate::error::{ColloquyError, Result};

/// Tagged union of every inbound event kind this engine consumes.
///
/// Immutable once constructed. Events arrive in connection order and are
/// dispatched in that order.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// Error reported by the remote service. Non-fatal: the connection is
    /// still live, so the session stays active.
    #[serde(rename = "error")]
    Error { error: RemoteErrorBody },

    /// One chunk of base64-encoded PCM16 synthesized speech.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// The model finished its current response.
    #[serde(rename = "response.done")]
    ResponseDone,

    /// The remote acknowledged the session; configuration is accepted.
    #[serde(rename = "session.created")]
    SessionCreated,

    /// Server VAD: the user started speaking (barge-in trigger).
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// Server VAD: the user stopped speaking.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// The model requests a host tool invocation. `arguments` is the raw
    /// JSON string as sent on the wire.
    #[serde(rename = "response.function_call_arguments.done")]
    ToolCallRequest {
        call_id: String,
        name: String,
        arguments: String,
    },
}

/// Body of an inbound `error` event.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteErrorBody {
    pub message: String,
}

/// Parse one wire text frame into an [`InboundEvent`].
///
/// Malformed JSON and unrecognized `type` tags both surface as
/// `ColloquyError::Protocol`; callers log and drop such frames.
pub fn parse_inbound(text: &str) -> Result<InboundEvent> {
    serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(120).collect();
        ColloquyError::Protocol(format!("unparseable inbound message ({e}): {preview}"))
    })
}
