//! Blocking capture pipeline loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → &[f32] (one chunk per iteration)
//! 2. Resample to the wire rate (24 kHz)
//! 3. Accumulate into fixed-size frames (frame_samples)
//! 4. Per frame: RMS → MicActivityEvent broadcast
//! 5. While the session is Active: PCM16 + base64 encode →
//!    input_audio_buffer.append → outbound queue (try_send)
//! ```
//!
//! The loop never blocks on the outbound queue: when the session is not
//! Active, or the queue is full, the frame is dropped and counted. This is
//! the deliberate lossy at-most-once policy — real-time responsiveness over
//! completeness. Dropped frames are never queued for later.
//!
//! The entire loop runs in `spawn_blocking`, keeping the Tokio executor free
//! for the transport and dispatch tasks.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::{
    audio::{codec, resample::RateConverter},
    buffering::{AudioConsumer, Consumer},
    protocol::OutboundEnvelope,
    status::{MicActivityEvent, SessionState},
};

/// Chunk size drained from the ring buffer per iteration.
/// 20 ms at 48 kHz = 960 samples; a reasonable stride for most capture rates.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY: Duration = Duration::from_millis(5);

/// Capture pipeline counters for observability.
#[derive(Default)]
pub struct CaptureDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureDiagnosticsSnapshot {
    pub samples_in: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureDiagnosticsSnapshot {
        CaptureDiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// All context the capture loop needs, passed as one struct so the
/// `spawn_blocking` closure stays tidy.
pub struct CaptureContext {
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    /// Session state shared with the controller; frames upload only while
    /// `Active`.
    pub state: Arc<Mutex<SessionState>>,
    pub outbound: mpsc::Sender<OutboundEnvelope>,
    pub activity_tx: broadcast::Sender<MicActivityEvent>,
    pub capture_sample_rate: u32,
    pub wire_sample_rate: u32,
    /// Samples per uploaded frame at the wire rate (e.g. 960 = 40 ms).
    pub frame_samples: usize,
    pub activity_seq: Arc<AtomicU64>,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

/// Run the blocking capture loop until `ctx.running` becomes false.
pub fn run(ctx: CaptureContext) {
    info!(
        capture_rate = ctx.capture_sample_rate,
        wire_rate = ctx.wire_sample_rate,
        frame_samples = ctx.frame_samples,
        "capture pipeline started"
    );

    let mut resampler = match RateConverter::new(
        ctx.capture_sample_rate,
        ctx.wire_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            return;
        }
    };

    let mut ctx = ctx;
    // Scratch buffer reused each iteration
    let mut raw = vec![0f32; DRAIN_CHUNK];
    // Wire-rate samples awaiting a full frame
    let mut pending: Vec<f32> = Vec::with_capacity(ctx.frame_samples * 2);

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(SLEEP_EMPTY);
            continue;
        }
        ctx.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

        let resampled = resampler.process(&raw[..n]);
        if resampled.is_empty() {
            // Partial chunk — waiting for more data to fill rubato's input buffer
            continue;
        }
        pending.extend_from_slice(&resampled);

        while pending.len() >= ctx.frame_samples {
            let frame: Vec<f32> = pending.drain(..ctx.frame_samples).collect();
            emit_frame(&ctx, &frame);
        }
    }

    // Remainder in `pending` is intentionally discarded: the lossy policy
    // never uploads stale audio after a stop.
    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        frames_sent = snap.frames_sent,
        frames_dropped = snap.frames_dropped,
        "capture pipeline stopped"
    );
}

/// Broadcast mic activity and, while the session is Active, upload the frame.
fn emit_frame(ctx: &CaptureContext, frame: &[f32]) {
    let rms = compute_rms(frame);
    let seq = ctx.activity_seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.activity_tx.send(MicActivityEvent { seq, rms });

    if *ctx.state.lock() != SessionState::Active {
        ctx.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let envelope = OutboundEnvelope::InputAudioAppend {
        audio: codec::encode_chunk(frame),
    };
    match ctx.outbound.try_send(envelope) {
        Ok(()) => {
            ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            ctx.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("dropping capture frame: {e}");
        }
    }

    if seq % 100 == 0 {
        debug!(
            seq,
            rms = format_args!("{:.4}", rms),
            "capture level check"
        );
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Instant;

    use tokio::sync::mpsc::error::TryRecvError;

    use crate::buffering::{create_audio_ring, Producer};

    fn test_ctx(
        consumer: AudioConsumer,
        state: SessionState,
    ) -> (
        CaptureContext,
        mpsc::Receiver<OutboundEnvelope>,
        Arc<AtomicBool>,
        Arc<Mutex<SessionState>>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(32);
        let (activity_tx, _) = broadcast::channel(32);
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(Mutex::new(state));
        let ctx = CaptureContext {
            consumer,
            running: Arc::clone(&running),
            state: Arc::clone(&state),
            outbound,
            activity_tx,
            capture_sample_rate: 24_000,
            wire_sample_rate: 24_000,
            frame_samples: 960,
            activity_seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        };
        (ctx, outbound_rx, running, state)
    }

    fn recv_envelope_with_timeout(
        rx: &mut mpsc::Receiver<OutboundEnvelope>,
        timeout: Duration,
    ) -> OutboundEnvelope {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(env) => return env,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for outbound envelope");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Disconnected) => panic!("outbound channel closed unexpectedly"),
            }
        }
    }

    #[test]
    fn active_session_uploads_full_frames() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.25f32; 1920]); // exactly two frames

        let (ctx, mut rx, running, _state) = test_ctx(consumer, SessionState::Active);
        let diagnostics = Arc::clone(&ctx.diagnostics);

        let handle = thread::spawn(move || run(ctx));

        let first = recv_envelope_with_timeout(&mut rx, Duration::from_secs(1));
        let second = recv_envelope_with_timeout(&mut rx, Duration::from_secs(1));
        running.store(false, Ordering::SeqCst);
        handle.join().expect("capture thread panicked");

        for env in [first, second] {
            match env {
                OutboundEnvelope::InputAudioAppend { audio } => {
                    let decoded = codec::decode_chunk(&audio, 1.0).unwrap();
                    assert_eq!(decoded.len(), 960);
                }
                other => panic!("expected audio append, got {other:?}"),
            }
        }
        assert_eq!(diagnostics.snapshot().frames_sent, 2);
    }

    #[test]
    fn frames_are_dropped_outside_active_state() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.25f32; 1920]);

        let (ctx, mut rx, running, _state) = test_ctx(consumer, SessionState::Configuring);
        let diagnostics = Arc::clone(&ctx.diagnostics);

        let handle = thread::spawn(move || run(ctx));
        thread::sleep(Duration::from_millis(60));
        running.store(false, Ordering::SeqCst);
        handle.join().expect("capture thread panicked");

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_sent, 0);
        assert_eq!(snap.frames_dropped, 2);
    }

    #[test]
    fn frames_resume_when_state_becomes_active() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.25f32; 960]);

        let (ctx, mut rx, running, state) = test_ctx(consumer, SessionState::Configuring);

        let handle = thread::spawn(move || run(ctx));
        thread::sleep(Duration::from_millis(60));
        // First frame dropped while configuring; now activate and push more.
        *state.lock() = SessionState::Active;
        producer.push_slice(&vec![0.25f32; 960]);

        let env = recv_envelope_with_timeout(&mut rx, Duration::from_secs(1));
        running.store(false, Ordering::SeqCst);
        handle.join().expect("capture thread panicked");

        assert!(matches!(env, OutboundEnvelope::InputAudioAppend { .. }));
    }

    #[test]
    fn partial_frames_are_not_uploaded() {
        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&vec![0.25f32; 500]); // less than one frame

        let (ctx, mut rx, running, _state) = test_ctx(consumer, SessionState::Active);

        let handle = thread::spawn(move || run(ctx));
        thread::sleep(Duration::from_millis(60));
        running.store(false, Ordering::SeqCst);
        handle.join().expect("capture thread panicked");

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let rms = compute_rms(&samples);
        assert!((rms - 0.5).abs() < 1e-5, "rms={rms}");
    }
}
