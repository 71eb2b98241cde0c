//! Typed audio frame passed between pipeline stages.

use std::time::Duration;

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// Owned by whichever stage currently holds it — frames move between stages,
/// they are never shared.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 24000, 44100, 48000).
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the play-out duration of this frame.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Returns true if the frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_of_full_second() {
        let frame = AudioFrame::new(vec![0.0; 24_000], 24_000);
        assert_eq!(frame.duration(), Duration::from_secs(1));
    }

    #[test]
    fn duration_of_forty_ms_frame() {
        let frame = AudioFrame::new(vec![0.0; 960], 24_000);
        let ms = frame.duration().as_millis();
        assert_eq!(ms, 40);
    }
}
