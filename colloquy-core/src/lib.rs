//! # colloquy-core
//!
//! Real-time duplex voice-session engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → MicCapture → SPSC RingBuffer → CapturePipeline(spawn_blocking)
//!                                                   │ resample + PCM16/base64
//!                                                   ▼
//!                                        Transport send task ──► remote service
//!                                                                      │
//! SampleSink ◄─ PlaybackScheduler ◄─┐                                  ▼
//!                                   ├── dispatch loop ◄── Transport receive task
//! ToolBridge ──► host handlers ─────┘
//! ```
//!
//! One `SessionController` owns one live session: `connect()`, a reactive
//! status surface, and an idempotent `disconnect()`. The audio callback is
//! zero-alloc; all heap work happens on pipeline threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod status;
pub mod tools;
pub mod transport;

// Convenience re-exports for downstream crates
pub use error::ColloquyError;
pub use playback::{sink::SampleSink, PlaybackScheduler, Timeline};
pub use protocol::{InboundEvent, OutboundEnvelope, ToolSpec};
pub use session::{SessionConfig, SessionController, SinkFactory};
pub use status::{MicActivityEvent, SessionState, SessionStatusEvent, StatusSnapshot};
pub use tools::{ToolHandler, ToolRegistry};

#[cfg(feature = "audio-rodio")]
pub use playback::sink::RodioSink;
