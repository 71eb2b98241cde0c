//! Messages this engine sends over the duplex connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ColloquyError, Result};

/// A tagged wire message, consumed exactly once by the transport send task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundEnvelope {
    /// Declare session parameters: voice, audio formats, turn detection and
    /// the tool schema the model may call.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    /// One frame of base64-encoded PCM16 microphone audio.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    /// A completed tool-call result correlated by `call_id`.
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ConversationItem },

    /// Ask the model to resume generation (sent after each tool result).
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl OutboundEnvelope {
    /// Serialize to the wire's JSON text representation.
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ColloquyError::Protocol(format!("envelope serialize: {e}")))
    }
}

/// The `session` payload of a `session.update` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    pub tools: Vec<ToolSpec>,
}

/// Turn-detection mode negotiated with the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    /// Detection strategy, e.g. `"server_vad"`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        Self {
            kind: "server_vad".into(),
        }
    }
}

/// A tool the remote model is allowed to call, declared at configure time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the tool's arguments.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".into(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// The `item` payload of a `conversation.item.create` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ConversationItem {
    /// Result of a host tool invocation, correlated by `call_id`.
    /// `output` is the handler's JSON result, stringified.
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}
