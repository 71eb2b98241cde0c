//! Gapless playback scheduling for synthesized speech.
//!
//! ## Scheduling algorithm
//!
//! The scheduler keeps a [`Timeline`] with one piece of state: the instant
//! the previously scheduled entry ends. For each dequeued entry,
//! `start = max(now, next_start)` and `next_start = start + duration`. This
//! yields gapless, non-overlapping, strictly ordered output from purely
//! local per-entry decisions — no global timer thread.
//!
//! ## Barge-in
//!
//! `flush()` discards all *queued* (not yet handed to the sink) entries and
//! resets the timeline. The entry already handed to the output sink plays to
//! audible completion; with the default 40 ms frames that window stays below
//! perceptual interruption latency. See `flush` docs.
//!
//! ## Threading
//!
//! Entries arrive from the dispatch loop; a dedicated drain thread owns the
//! sink (device sinks are `!Send`) and the timeline. The two sides share
//! only the queue mutex, a flush epoch, and atomics — crossing through a
//! crossbeam doorbell channel so the drain thread can sleep when idle.

pub mod sink;

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audio::codec;
use crate::buffering::frame::AudioFrame;
use crate::error::{ColloquyError, Result};
use crate::playback::sink::SampleSink;

/// How far ahead of its computed start an entry is handed to the sink.
/// The sink needs the next buffer before the current one ends to stay
/// gapless; until hand-off the entry remains cancellable by `flush()`.
const SCHEDULE_LEAD: Duration = Duration::from_millis(20);

/// Idle sleep for the drain thread when the queue is empty.
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// Computes entry start times on a monotonic clock.
///
/// Pure bookkeeping — no I/O, no threads — so the ordering and gaplessness
/// properties are testable in isolation.
#[derive(Debug, Default)]
pub struct Timeline {
    /// End of the last scheduled entry; `None` when nothing is scheduled.
    next_start: Option<Instant>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an entry of `duration` at `now`, returning its start instant.
    ///
    /// `start = max(now, next_start)`; afterwards
    /// `next_start = start + duration`.
    pub fn schedule(&mut self, now: Instant, duration: Duration) -> Instant {
        let start = match self.next_start {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next_start = Some(start + duration);
        start
    }

    /// Forget all scheduled entries (barge-in).
    pub fn reset(&mut self) {
        self.next_start = None;
    }

    /// End of the last scheduled entry, if any.
    pub fn next_start(&self) -> Option<Instant> {
        self.next_start
    }
}

/// Playback counters for observability.
#[derive(Default)]
pub struct PlaybackDiagnostics {
    pub entries_enqueued: AtomicUsize,
    pub entries_played: AtomicUsize,
    pub entries_flushed: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackDiagnosticsSnapshot {
    pub entries_enqueued: usize,
    pub entries_played: usize,
    pub entries_flushed: usize,
}

impl PlaybackDiagnostics {
    pub fn snapshot(&self) -> PlaybackDiagnosticsSnapshot {
        PlaybackDiagnosticsSnapshot {
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_played: self.entries_played.load(Ordering::Relaxed),
            entries_flushed: self.entries_flushed.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    /// Decoded entries awaiting their start time. Strictly FIFO.
    queue: Mutex<VecDeque<AudioFrame>>,
    /// Bumped by `flush()`; the drain thread discards anything scheduled
    /// under an older epoch.
    epoch: AtomicU64,
    /// Drain thread lifetime flag.
    running: AtomicBool,
    diagnostics: PlaybackDiagnostics,
}

/// Owns the playback queue, timeline and drain thread.
///
/// One instance per session controller; the output device is exclusively
/// owned by the drain thread's sink.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    /// Wire sample rate of inbound audio chunks (Hz).
    sample_rate: u32,
    /// Output gain in [0.0, 1.0] applied at decode time.
    gain: f32,
    speaking_tx: watch::Sender<bool>,
    /// Doorbell waking the drain thread when entries arrive.
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    drain_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PlaybackScheduler {
    /// Create a scheduler for chunks at `sample_rate` Hz with the given
    /// output `gain`. Call [`start`](Self::start) before enqueueing.
    pub fn new(sample_rate: u32, gain: f32) -> Self {
        let (speaking_tx, _) = watch::channel(false);
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                epoch: AtomicU64::new(0),
                running: AtomicBool::new(false),
                diagnostics: PlaybackDiagnostics::default(),
            }),
            sample_rate,
            gain: gain.clamp(0.0, 1.0),
            speaking_tx,
            doorbell_tx,
            doorbell_rx,
            drain_handle: Mutex::new(None),
        }
    }

    /// Spawn the drain thread, constructing the sink on that thread.
    ///
    /// Blocks until the sink is confirmed open (or failed), then returns —
    /// the same open-confirm handshake the capture side uses.
    ///
    /// # Errors
    /// Propagates the factory's error (typically `AudioDevice`) when the
    /// output device cannot be opened.
    pub fn start<S, F>(&self, sink_factory: F) -> Result<()>
    where
        S: SampleSink,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // already running
        }

        let shared = Arc::clone(&self.shared);
        let doorbell_rx = self.doorbell_rx.clone();
        let speaking_tx = self.speaking_tx.clone();

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("playback-drain".into())
            .spawn(move || {
                // Sink must be created on THIS thread — device sinks are !Send.
                let mut sink = match sink_factory() {
                    Ok(s) => {
                        let _ = open_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        shared.running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                drain_loop(&shared, &doorbell_rx, &speaking_tx, &mut sink);
                // Sink drops here, releasing the output device on this thread.
            })
            .map_err(|e| ColloquyError::AudioStream(format!("spawn drain thread: {e}")))?;

        *self.drain_handle.lock() = Some(handle);

        match open_rx.recv() {
            Ok(Ok(())) => {
                info!("playback scheduler started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(ColloquyError::AudioStream(
                    "drain thread died before confirming sink".into(),
                ))
            }
        }
    }

    /// Decode one base64 PCM16 wire chunk and append it to the queue.
    ///
    /// Sets `is_speaking = true` immediately; the drain thread schedules the
    /// entry at `max(now, next_start)`.
    pub fn enqueue_chunk(&self, payload: &str) -> Result<()> {
        let samples = codec::decode_chunk(payload, self.gain)?;
        if samples.is_empty() {
            return Ok(());
        }
        self.enqueue(AudioFrame::new(samples, self.sample_rate));
        Ok(())
    }

    /// Append an already-decoded frame to the queue.
    pub fn enqueue(&self, frame: AudioFrame) {
        self.shared.queue.lock().push_back(frame);
        self.shared
            .diagnostics
            .entries_enqueued
            .fetch_add(1, Ordering::Relaxed);
        self.speaking_tx.send_if_modified(|v| !std::mem::replace(v, true));
        self.ring_doorbell();
    }

    /// Barge-in: discard every queued (not yet started) entry and reset the
    /// timeline.
    ///
    /// The entry already handed to the sink — at most one lead window ahead —
    /// plays to audible completion. `is_speaking` falls to `false` once the
    /// queue is drained and that last entry ends.
    pub fn flush(&self) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if discarded > 0 {
            self.shared
                .diagnostics
                .entries_flushed
                .fetch_add(discarded, Ordering::Relaxed);
        }
        debug!(discarded, "playback flushed");
        self.ring_doorbell();
    }

    /// True while entries are queued or audible.
    pub fn is_speaking(&self) -> bool {
        *self.speaking_tx.borrow()
    }

    /// Subscribe to speaking-state changes.
    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.speaking_tx.subscribe()
    }

    /// Number of queued (not yet started) entries.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Snapshot of playback counters.
    pub fn diagnostics_snapshot(&self) -> PlaybackDiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Stop the drain thread and release the sink. Idempotent.
    pub fn stop(&self) {
        self.flush();
        self.shared.running.store(false, Ordering::SeqCst);
        self.ring_doorbell();
        if let Some(handle) = self.drain_handle.lock().take() {
            let _ = handle.join();
        }
        let _ = self.speaking_tx.send(false);
    }

    fn ring_doorbell(&self) {
        match self.doorbell_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                warn!("playback drain thread is gone");
            }
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.doorbell_tx.try_send(());
    }
}

/// Drain loop: pop entries FIFO, wait out their scheduled start, hand them
/// to the sink. Runs until `running` goes false.
fn drain_loop<S: SampleSink>(
    shared: &Shared,
    doorbell: &Receiver<()>,
    speaking_tx: &watch::Sender<bool>,
    sink: &mut S,
) {
    let mut timeline = Timeline::new();
    let mut epoch = shared.epoch.load(Ordering::SeqCst);
    // End of the entry most recently handed to the sink. Survives a flush:
    // barge-in cancels queued entries, never the one already in flight.
    let mut in_flight_end: Option<Instant> = None;

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let current_epoch = shared.epoch.load(Ordering::SeqCst);
        if current_epoch != epoch {
            epoch = current_epoch;
            timeline.reset();
        }

        let entry = shared.queue.lock().pop_front();
        let Some(frame) = entry else {
            // Queue empty: once the in-flight entry ends, speech is over.
            let still_audible = in_flight_end
                .map(|end| Instant::now() < end)
                .unwrap_or(false);
            if !still_audible {
                in_flight_end = None;
                timeline.reset();
                speaking_tx.send_if_modified(|v| std::mem::replace(v, false));
            }
            let _ = doorbell.recv_timeout(IDLE_WAIT);
            continue;
        };

        let duration = frame.duration();
        let start = timeline.schedule(Instant::now(), duration);

        // Hold the entry until one lead window before its start, so a flush
        // arriving in the gap still cancels it.
        let hand_off_at = start.checked_sub(SCHEDULE_LEAD).unwrap_or(start);
        let mut cancelled = false;
        loop {
            let now = Instant::now();
            if now >= hand_off_at {
                break;
            }
            if !shared.running.load(Ordering::SeqCst)
                || shared.epoch.load(Ordering::SeqCst) != epoch
            {
                cancelled = true;
                break;
            }
            let wait = (hand_off_at - now).min(IDLE_WAIT);
            std::thread::sleep(wait);
        }
        if cancelled {
            // Popped but never started: counts as flushed, same as entries
            // still sitting in the queue when flush() ran.
            shared
                .diagnostics
                .entries_flushed
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if let Err(e) = sink.play(frame) {
            warn!("sink rejected frame: {e}");
            continue;
        }
        in_flight_end = Some(start + duration);
        shared
            .diagnostics
            .entries_played
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    /// Sink that records hand-off instants and sample counts.
    struct RecordingSink {
        handed: StdArc<Mutex<Vec<(Instant, usize)>>>,
    }

    impl SampleSink for RecordingSink {
        fn play(&mut self, frame: AudioFrame) -> Result<()> {
            self.handed.lock().push((Instant::now(), frame.samples.len()));
            Ok(())
        }
    }

    fn frame_ms(ms: u64) -> AudioFrame {
        let samples = (24_000 * ms / 1000) as usize;
        AudioFrame::new(vec![0.1; samples], 24_000)
    }

    #[test]
    fn timeline_back_to_back_is_gapless() {
        let mut tl = Timeline::new();
        let t0 = Instant::now();
        let d = Duration::from_millis(40);

        let s1 = tl.schedule(t0, d);
        let s2 = tl.schedule(t0, d);
        let s3 = tl.schedule(t0, d);

        assert_eq!(s1, t0);
        assert_eq!(s2, s1 + d);
        assert_eq!(s3, s2 + d);
    }

    #[test]
    fn timeline_starts_now_after_idle_gap() {
        let mut tl = Timeline::new();
        let t0 = Instant::now();
        let d = Duration::from_millis(10);

        tl.schedule(t0, d);
        // Next arrival well after the first entry ended
        let late = t0 + Duration::from_millis(500);
        let start = tl.schedule(late, d);
        assert_eq!(start, late);
    }

    #[test]
    fn timeline_never_overlaps() {
        let mut tl = Timeline::new();
        let t0 = Instant::now();
        let mut prev_end = t0;
        for ms in [40u64, 7, 120, 3, 80] {
            let d = Duration::from_millis(ms);
            let start = tl.schedule(t0, d);
            assert!(start >= prev_end, "entries must not overlap");
            prev_end = start + d;
        }
    }

    #[test]
    fn timeline_reset_forgets_schedule() {
        let mut tl = Timeline::new();
        let t0 = Instant::now();
        tl.schedule(t0, Duration::from_secs(10));
        tl.reset();
        assert!(tl.next_start().is_none());
        let start = tl.schedule(t0, Duration::from_millis(1));
        assert_eq!(start, t0);
    }

    #[test]
    fn entries_hand_off_in_order_and_speaking_tracks_queue() {
        let handed = StdArc::new(Mutex::new(Vec::new()));
        let handed_cl = StdArc::clone(&handed);

        let sched = PlaybackScheduler::new(24_000, 1.0);
        sched
            .start(move || Ok(RecordingSink { handed: handed_cl }))
            .unwrap();

        sched.enqueue(frame_ms(30));
        sched.enqueue(frame_ms(30));
        assert!(sched.is_speaking());

        // Both entries (60 ms total) should hand off and finish well within this.
        std::thread::sleep(Duration::from_millis(250));

        let handed = handed.lock().clone();
        assert_eq!(handed.len(), 2);
        assert!(handed[0].0 <= handed[1].0, "hand-off order must be FIFO");
        assert!(!sched.is_speaking(), "speaking must clear once drained");

        sched.stop();
        let snap = sched.diagnostics_snapshot();
        assert_eq!(snap.entries_enqueued, 2);
        assert_eq!(snap.entries_played, 2);
    }

    #[test]
    fn flush_discards_queued_entries() {
        let handed = StdArc::new(Mutex::new(Vec::new()));
        let handed_cl = StdArc::clone(&handed);

        let sched = PlaybackScheduler::new(24_000, 1.0);
        sched
            .start(move || Ok(RecordingSink { handed: handed_cl }))
            .unwrap();

        // A long head entry keeps the followers queued behind it.
        sched.enqueue(frame_ms(500));
        std::thread::sleep(Duration::from_millis(50));
        sched.enqueue(frame_ms(100));
        sched.enqueue(frame_ms(100));

        sched.flush();
        assert_eq!(sched.pending(), 0, "flush must empty the queue");

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            handed.lock().len(),
            1,
            "only the in-flight head entry may reach the sink"
        );

        sched.stop();
        // Both followers count as flushed, whether they were still in the
        // queue or already popped into the drain thread's start-time wait.
        let snap = sched.diagnostics_snapshot();
        assert_eq!(snap.entries_flushed, 2);
    }

    #[test]
    fn enqueue_chunk_decodes_wire_audio() {
        let handed = StdArc::new(Mutex::new(Vec::new()));
        let handed_cl = StdArc::clone(&handed);

        let sched = PlaybackScheduler::new(24_000, 1.0);
        sched
            .start(move || Ok(RecordingSink { handed: handed_cl }))
            .unwrap();

        let payload = codec::encode_chunk(&vec![0.25f32; 240]);
        sched.enqueue_chunk(&payload).unwrap();
        std::thread::sleep(Duration::from_millis(80));

        let handed = handed.lock().clone();
        assert_eq!(handed.len(), 1);
        assert_eq!(handed[0].1, 240);
        sched.stop();
    }

    #[test]
    fn bad_chunk_is_a_protocol_error_and_queues_nothing() {
        let sched = PlaybackScheduler::new(24_000, 1.0);
        let err = sched.enqueue_chunk("!!!").unwrap_err();
        assert!(matches!(err, ColloquyError::Protocol(_)));
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let sched = PlaybackScheduler::new(24_000, 1.0);
        sched
            .start(|| {
                Ok(RecordingSink {
                    handed: StdArc::new(Mutex::new(Vec::new())),
                })
            })
            .unwrap();
        sched.stop();
        sched.stop();
        assert!(!sched.is_speaking());
    }
}
