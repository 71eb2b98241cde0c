//! `SessionController` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionController::new()
//!     └─► connect()       → credential fetched, socket open, configured,
//!         │                 capture + playback running, state = Active
//!         └─► disconnect() → capture stopped, playback flushed, socket
//!                            closed, state = Closed
//! ```
//!
//! `connect()` may be called once per controller; a session that ended in
//! `Closed` or `Errored` is recovered by building a fresh controller. Fatal
//! failures (transport, audio device) land in `Errored`; everything else is
//! surfaced on the status channel while the session stays live.
//!
//! ## Threading
//!
//! The controller owns one transport (send + receive tasks), one dispatch
//! task, one blocking capture thread and one playback drain thread. They
//! meet only at channels and the shared state below — there is no other
//! shared mutable state.

pub mod capture;
pub mod dispatch;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    audio::MicCapture,
    buffering::create_audio_ring,
    error::{ColloquyError, Result},
    playback::{sink::SampleSink, PlaybackDiagnosticsSnapshot, PlaybackScheduler},
    protocol::{OutboundEnvelope, SessionSettings, TurnDetection},
    status::{MicActivityEvent, SessionState, SessionStatusEvent, StatusSnapshot},
    tools::{ToolBridge, ToolRegistry},
    transport::{fetch_credential, Transport, TransportDiagnosticsSnapshot},
};

use capture::{CaptureContext, CaptureDiagnostics, CaptureDiagnosticsSnapshot};
use dispatch::{DispatchContext, DispatchDiagnostics, DispatchDiagnosticsSnapshot};

/// Broadcast channel capacity: events buffered for slow host consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for a voice session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the conversational speech service.
    pub realtime_url: String,
    /// HTTP endpoint issuing the short-lived connection secret.
    pub token_url: String,
    /// Synthesized voice name requested at configure time.
    pub voice: String,
    /// System instructions for the model, if any.
    pub instructions: Option<String>,
    /// Sample rate of wire audio in both directions (Hz). Default: 24000.
    pub wire_sample_rate: u32,
    /// Samples per uploaded capture frame at the wire rate.
    /// Default: 960 (40 ms).
    pub frame_samples: usize,
    /// Playback gain in [0.0, 1.0]. Default: 1.0.
    pub playback_gain: f32,
    /// Input device name to prefer; `None` uses the system default.
    pub preferred_input_device: Option<String>,
    /// How long `connect()` waits for the remote session acknowledgement.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            realtime_url: "wss://api.openai.com/v1/realtime?model=gpt-realtime".into(),
            token_url: "http://localhost:8080/api/voice/token".into(),
            voice: "sage".into(),
            instructions: None,
            wire_sample_rate: 24_000,
            frame_samples: 960,
            playback_gain: 1.0,
            preferred_input_device: None,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Session state + status snapshot shared between the controller, the
/// dispatch loop and the capture pipeline.
///
/// All mutation goes through the transition methods here, which publish a
/// [`SessionStatusEvent`] after every change.
pub struct SessionShared {
    state: Arc<Mutex<SessionState>>,
    snapshot: Mutex<StatusSnapshot>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
}

impl SessionShared {
    pub fn new(status_tx: broadcast::Sender<SessionStatusEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::Idle)),
            snapshot: Mutex::new(StatusSnapshot {
                is_connected: false,
                is_speaking: false,
                is_listening: false,
                error: None,
            }),
            status_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.lock().clone()
    }

    /// Handle for the capture pipeline's Active-gate check.
    pub fn state_handle(&self) -> Arc<Mutex<SessionState>> {
        Arc::clone(&self.state)
    }

    pub fn set_state(&self, next: SessionState) {
        *self.state.lock() = next;
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.is_connected = next.is_connected();
            if !next.is_connected() {
                snapshot.is_listening = false;
                snapshot.is_speaking = false;
            }
        }
        self.publish();
    }

    pub fn set_listening(&self, listening: bool) {
        self.snapshot.lock().is_listening = listening;
        self.publish();
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.snapshot.lock().is_speaking = speaking;
        self.publish();
    }

    /// Record a non-fatal error (remote, protocol, tool) without leaving the
    /// current state.
    pub fn surface_error(&self, message: String) {
        self.snapshot.lock().error = Some(message);
        self.publish();
    }

    /// Fatal failure: record the error and move to the terminal `Errored`
    /// state.
    pub fn fail(&self, message: String) {
        self.snapshot.lock().error = Some(message);
        self.set_state(SessionState::Errored);
    }

    fn publish(&self) {
        let event = SessionStatusEvent {
            state: self.state(),
            snapshot: self.snapshot(),
        };
        let _ = self.status_tx.send(event);
    }
}

/// Factory constructing the playback sink on the drain thread.
pub type SinkFactory = Box<dyn FnOnce() -> Result<Box<dyn SampleSink>> + Send + 'static>;

/// Aggregate of the per-component counters.
#[derive(Debug, Clone, Copy)]
pub struct SessionDiagnostics {
    pub capture: CaptureDiagnosticsSnapshot,
    pub playback: PlaybackDiagnosticsSnapshot,
    pub dispatch: DispatchDiagnosticsSnapshot,
    pub transport: Option<TransportDiagnosticsSnapshot>,
}

/// The top-level session handle exposed to the host application.
///
/// `SessionController` is `Send + Sync` — all fields use interior
/// mutability. Wrap in `Arc` to share with event-forwarding tasks.
pub struct SessionController {
    config: SessionConfig,
    registry: ToolRegistry,
    shared: Arc<SessionShared>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    activity_tx: broadcast::Sender<MicActivityEvent>,
    activity_seq: Arc<AtomicU64>,
    playback: Arc<PlaybackScheduler>,
    capture_running: Arc<AtomicBool>,
    capture_diagnostics: Arc<CaptureDiagnostics>,
    dispatch_diagnostics: Arc<DispatchDiagnostics>,
    transport: Mutex<Option<Transport>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    speaking_task: Mutex<Option<JoinHandle<()>>>,
    sink_factory: Mutex<Option<SinkFactory>>,
    http: reqwest::Client,
}

impl SessionController {
    /// Create a controller with the given configuration and host tool table.
    ///
    /// Uses the default output device for playback; override with
    /// [`with_sink_factory`](Self::with_sink_factory) before connecting.
    pub fn new(config: SessionConfig, registry: ToolRegistry) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        let playback = Arc::new(PlaybackScheduler::new(
            config.wire_sample_rate,
            config.playback_gain,
        ));

        Self {
            config,
            registry,
            shared: Arc::new(SessionShared::new(status_tx.clone())),
            status_tx,
            activity_tx,
            activity_seq: Arc::new(AtomicU64::new(0)),
            playback,
            capture_running: Arc::new(AtomicBool::new(false)),
            capture_diagnostics: Arc::new(CaptureDiagnostics::default()),
            dispatch_diagnostics: Arc::new(DispatchDiagnostics::default()),
            transport: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            speaking_task: Mutex::new(None),
            sink_factory: Mutex::new(Some(default_sink_factory())),
            http: reqwest::Client::new(),
        }
    }

    /// Replace the playback sink factory (hosts with their own output path,
    /// tests with a fake sink).
    pub fn with_sink_factory(self, factory: SinkFactory) -> Self {
        *self.sink_factory.lock() = Some(factory);
        self
    }

    /// Connect: fetch a credential, open the transport, configure the
    /// session and start capture + playback.
    ///
    /// Resolves once the remote acknowledges the session, or fails with a
    /// fatal error after tearing everything down.
    ///
    /// # Errors
    /// - `ColloquyError::AlreadyConnected` when called on a non-idle
    ///   controller (one `connect()` per instance).
    /// - `ColloquyError::Credential` / `Transport` on handshake failure.
    /// - `ColloquyError::AudioDevice` when the microphone or output device
    ///   cannot be opened.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.state() != SessionState::Idle {
            return Err(ColloquyError::AlreadyConnected);
        }

        let span = info_span!(
            "session",
            voice = %self.config.voice,
            url = %self.config.realtime_url,
        );

        async {
            self.shared.set_state(SessionState::Connecting);

            let credential = match fetch_credential(&self.http, &self.config.token_url).await {
                Ok(c) => c,
                Err(e) => {
                    self.shared.fail(e.to_string());
                    return Err(e);
                }
            };

            let mut transport = match Transport::open(&self.config.realtime_url, &credential).await
            {
                Ok(t) => t,
                Err(e) => {
                    self.shared.fail(e.to_string());
                    return Err(e);
                }
            };

            self.shared.set_state(SessionState::Configuring);

            // Playback must exist before the first audio delta can arrive.
            let factory = self.sink_factory.lock().take().ok_or_else(|| {
                ColloquyError::AudioDevice("playback sink factory already consumed".into())
            })?;
            if let Err(e) = self.playback.start(factory) {
                transport.close();
                self.shared.fail(e.to_string());
                return Err(e);
            }
            self.spawn_speaking_forwarder();

            // Dispatch loop consumes inbound events from here on.
            let inbound = transport.take_inbound().ok_or_else(|| {
                ColloquyError::Transport("inbound stream already taken".into())
            })?;
            let bridge = ToolBridge::new(self.registry.clone(), transport.outbound());
            let (created_tx, created_rx) = oneshot::channel();
            let dispatch_task = tokio::spawn(dispatch::run(DispatchContext {
                inbound,
                playback: Arc::clone(&self.playback),
                bridge,
                shared: Arc::clone(&self.shared),
                created_tx: Some(created_tx),
                diagnostics: Arc::clone(&self.dispatch_diagnostics),
            }));
            *self.dispatch_task.lock() = Some(dispatch_task);

            let outbound = transport.outbound();
            *self.transport.lock() = Some(transport);

            // Declare voice, formats, interruption mode and the tool schema.
            let configure = OutboundEnvelope::SessionUpdate {
                session: self.session_settings(),
            };
            if outbound.send(configure).await.is_err() {
                self.teardown();
                let e = ColloquyError::Transport("connection closed before configure".into());
                self.shared.fail(e.to_string());
                return Err(e);
            }

            // Resolve on session.created, or give up.
            match tokio::time::timeout(self.config.connect_timeout, created_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    self.teardown();
                    let e = ColloquyError::Transport("connection lost while configuring".into());
                    if self.shared.state() != SessionState::Errored {
                        self.shared.fail(e.to_string());
                    }
                    return Err(e);
                }
                Err(_) => {
                    self.teardown();
                    let e = ColloquyError::Transport(
                        "timed out waiting for session acknowledgement".into(),
                    );
                    self.shared.fail(e.to_string());
                    return Err(e);
                }
            }

            // Microphone last: a device failure aborts the whole connect.
            if let Err(e) = self.start_capture(outbound).await {
                self.teardown();
                self.shared.fail(e.to_string());
                return Err(e);
            }

            info!("session connected — live");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Stop capture, flush playback, close the transport and move to
    /// `Closed`. Idempotent and callable from any state, including
    /// mid-error; never returns an error.
    pub fn disconnect(&self) {
        if self.shared.state() == SessionState::Closed {
            return;
        }
        self.shared.set_state(SessionState::Closing);
        self.teardown();
        self.shared.set_state(SessionState::Closed);
        info!("session disconnected");
    }

    /// Current status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.shared.snapshot()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Subscribe to status events (state + snapshot on every change).
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to live mic level events.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<MicActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Snapshot of all component counters.
    pub fn diagnostics_snapshot(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            capture: self.capture_diagnostics.snapshot(),
            playback: self.playback.diagnostics_snapshot(),
            dispatch: self.dispatch_diagnostics.snapshot(),
            transport: self
                .transport
                .lock()
                .as_ref()
                .map(|t| t.diagnostics_snapshot()),
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            voice: self.config.voice.clone(),
            instructions: self.config.instructions.clone(),
            modalities: vec!["audio".into(), "text".into()],
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            turn_detection: TurnDetection::server_vad(),
            tools: self.registry.specs(),
        }
    }

    /// Forward playback speaking-state changes into the status surface.
    fn spawn_speaking_forwarder(&self) {
        let mut speaking_rx = self.playback.subscribe_speaking();
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            while speaking_rx.changed().await.is_ok() {
                let speaking = *speaking_rx.borrow();
                shared.set_speaking(speaking);
            }
        });
        *self.speaking_task.lock() = Some(task);
    }

    /// Open the microphone on a blocking thread and run the capture loop.
    ///
    /// Waits until the device is confirmed open (or failed), then returns;
    /// the loop continues in the background.
    async fn start_capture(&self, outbound: mpsc::Sender<OutboundEnvelope>) -> Result<()> {
        self.capture_diagnostics.reset();
        self.capture_running.store(true, Ordering::SeqCst);

        let (producer, consumer) = create_audio_ring();
        let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();

        let running = Arc::clone(&self.capture_running);
        let state = self.shared.state_handle();
        let activity_tx = self.activity_tx.clone();
        let activity_seq = Arc::clone(&self.activity_seq);
        let diagnostics = Arc::clone(&self.capture_diagnostics);
        let preferred = self.config.preferred_input_device.clone();
        let wire_sample_rate = self.config.wire_sample_rate;
        let frame_samples = self.config.frame_samples;

        tokio::task::spawn_blocking(move || {
            // Open the device on THIS thread — cpal::Stream is !Send.
            let capture = match MicCapture::open_with_preference(
                producer,
                Arc::clone(&running),
                preferred.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let capture_sample_rate = capture.sample_rate;
            capture::run(CaptureContext {
                consumer,
                running,
                state,
                outbound,
                activity_tx,
                capture_sample_rate,
                wire_sample_rate,
                frame_samples,
                activity_seq,
                diagnostics,
            });

            // Stream drops here, releasing the device on this thread.
            drop(capture);
        });

        match open_rx.await {
            Ok(Ok(rate)) => {
                info!(capture_rate = rate, "microphone capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.capture_running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.capture_running.store(false, Ordering::SeqCst);
                Err(ColloquyError::AudioStream(
                    "capture task died before confirming device".into(),
                ))
            }
        }
    }

    /// Release everything the session owns. Leaves state untouched so
    /// callers can land in `Closed` or `Errored` as appropriate.
    fn teardown(&self) {
        self.capture_running.store(false, Ordering::SeqCst);
        self.playback.stop();
        if let Some(transport) = self.transport.lock().take() {
            self.teardown_transport(transport);
        }
        if let Some(task) = self.speaking_task.lock().take() {
            task.abort();
        }
    }

    fn teardown_transport(&self, transport: Transport) {
        transport.close();
        drop(transport); // aborts the send/receive loops
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if !matches!(
            self.shared.state(),
            SessionState::Idle | SessionState::Closed
        ) {
            warn!("session controller dropped while live — tearing down");
        }
        self.teardown();
    }
}

#[cfg(feature = "audio-rodio")]
fn default_sink_factory() -> SinkFactory {
    Box::new(|| {
        crate::playback::sink::RodioSink::open_default()
            .map(|s| Box::new(s) as Box<dyn SampleSink>)
    })
}

#[cfg(not(feature = "audio-rodio"))]
fn default_sink_factory() -> SinkFactory {
    Box::new(|| -> Result<Box<dyn SampleSink>> {
        Err(ColloquyError::AudioDevice(
            "compiled without audio-rodio feature and no sink factory supplied".into(),
        ))
    })
}
