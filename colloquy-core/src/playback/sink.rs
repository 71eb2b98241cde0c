//! Output device seam for the playback scheduler.
//!
//! The scheduler never talks to an audio API directly — it hands decoded
//! frames to a [`SampleSink`]. Production uses [`RodioSink`]; tests inject a
//! recording fake. Exactly one sink instance exists per scheduler, so
//! multiple concurrent playback graphs cannot coexist.

use crate::buffering::frame::AudioFrame;
use crate::error::Result;

/// Accepts decoded audio frames for immediate audible output.
///
/// `play` must not block for the frame's audible duration: the sink buffers
/// internally and plays handed-off frames back-to-back in FIFO order. A frame
/// handed to the sink is in flight and can no longer be cancelled.
///
/// Like the capture stream, device-backed sinks are `!Send` on most
/// platforms. The trait therefore has no `Send` bound: sinks are constructed
/// *inside* the scheduler's drain thread (via the factory passed to
/// `PlaybackScheduler::start`) and never leave it.
pub trait SampleSink: 'static {
    fn play(&mut self, frame: AudioFrame) -> Result<()>;
}

impl SampleSink for Box<dyn SampleSink> {
    fn play(&mut self, frame: AudioFrame) -> Result<()> {
        (**self).play(frame)
    }
}

/// rodio-backed sink on the system default output device.
#[cfg(feature = "audio-rodio")]
pub struct RodioSink {
    /// Kept alive so the output stream is not closed prematurely.
    _stream: rodio::OutputStream,
    sink: rodio::Sink,
}

#[cfg(feature = "audio-rodio")]
impl RodioSink {
    /// Open the system default output device.
    ///
    /// Must be called on the thread that will also drop this value — in
    /// practice, inside the scheduler's sink factory.
    ///
    /// # Errors
    /// Returns `ColloquyError::AudioDevice` when no output device is
    /// available or the sink cannot be created.
    pub fn open_default() -> Result<Self> {
        use crate::error::ColloquyError;

        let (stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| ColloquyError::AudioDevice(format!("output device: {e}")))?;
        let sink = rodio::Sink::try_new(&handle)
            .map_err(|e| ColloquyError::AudioDevice(format!("output sink: {e}")))?;
        tracing::info!("playback sink ready");
        Ok(Self {
            _stream: stream,
            sink,
        })
    }
}

#[cfg(feature = "audio-rodio")]
impl SampleSink for RodioSink {
    fn play(&mut self, frame: AudioFrame) -> Result<()> {
        let source = rodio::buffer::SamplesBuffer::new(1, frame.sample_rate, frame.samples);
        self.sink.append(source);
        Ok(())
    }
}
