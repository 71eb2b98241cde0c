use thiserror::Error;

/// All errors produced by colloquy-core.
///
/// Only `Transport`, `AudioDevice`, `AudioStream` and `NoDefaultInputDevice`
/// are fatal to a session. `Protocol`, `Remote` and `ToolExecution` are
/// recovered locally and reflected in the status surface.
#[derive(Debug, Error)]
pub enum ColloquyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote service error: {0}")]
    Remote(String),

    #[error("tool execution error: {0}")]
    ToolExecution(String),

    #[error("credential fetch failed: {0}")]
    Credential(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("session is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ColloquyError {
    /// Whether this error tears the session down (moves it to `Errored`).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ColloquyError::Transport(_)
                | ColloquyError::AudioDevice(_)
                | ColloquyError::AudioStream(_)
                | ColloquyError::NoDefaultInputDevice
        )
    }
}

pub type Result<T> = std::result::Result<T, ColloquyError>;
