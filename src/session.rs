//! Voice session controller
//!
//! Owns the lifecycle of one duplex session: acquires the microphone, the
//! output device and the remote channel, wires capture, playback and the tool
//! bridge together, and releases everything through a single teardown path.
//!
//! ```text
//! Idle -> Connecting -> Active -> Closing -> Idle
//!            |                      ^
//!            +---- (failure) -------+--> Idle
//! ```

use crate::capture::{CaptureConfig, CapturePipeline, CaptureSinks};
use crate::channel::{ChannelHandle, ChannelPair, ConnectError, Connector};
use crate::codec::OUTPUT_SAMPLE_RATE;
use crate::config::SessionConfig;
use crate::device::{AudioBackend, DeviceError, InputDevice, OutputDevice};
use crate::events::ServerEvent;
use crate::mixer::{MixerTimeline, OutputEngine};
use crate::playback::{PlaybackScheduler, SourceId};
use crate::tools::{NoteSink, ToolBridge};
use crate::transcript::TranscriptSink;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`VoiceSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

/// Why a session could not be started
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(#[source] DeviceError),

    #[error("output device unavailable: {0}")]
    OutputUnavailable(#[source] DeviceError),

    #[error("could not connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("failed to start audio thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session start was cancelled")]
    Cancelled,
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on opening the remote channel.
    pub connect_timeout: Duration,
    pub capture: CaptureConfig,
    pub output_sample_rate: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            capture: CaptureConfig::default(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

/// Resources acquired while connecting.
struct Link {
    input: Box<dyn InputDevice>,
    output: Box<dyn OutputDevice>,
    channel: ChannelPair,
}

/// Resources held while Active. Taking them out of the slot is what makes
/// teardown run once.
struct Running {
    capture: CapturePipeline,
    channel: ChannelHandle,
    shutdown: oneshot::Sender<()>,
    event_loop: JoinHandle<()>,
    output: OutputEngine,
}

/// Everything the event loop waits on.
struct LoopInputs {
    events: UnboundedReceiver<ServerEvent>,
    finished: UnboundedReceiver<SourceId>,
    faults: UnboundedReceiver<DeviceError>,
    shutdown: oneshot::Receiver<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Asked to stop by teardown.
    Stopped,
    /// The remote side closed or the event stream ended.
    Closed,
    /// Channel error or audio device failure.
    Failed,
}

struct Inner<C, B> {
    connector: C,
    backend: B,
    config: SessionConfig,
    notes: Arc<dyn NoteSink>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    amplitude: Arc<watch::Sender<f32>>,
    transcript: TranscriptSink,
    running: tokio::sync::Mutex<Option<Running>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One duplex voice session. Clones control the same session.
pub struct VoiceSession<C: Connector, B: AudioBackend> {
    inner: Arc<Inner<C, B>>,
}

impl<C: Connector, B: AudioBackend> Clone for VoiceSession<C, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector, B: AudioBackend> VoiceSession<C, B> {
    pub fn new(
        connector: C,
        backend: B,
        config: SessionConfig,
        notes: Arc<dyn NoteSink>,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (amplitude, _) = watch::channel(0.0f32);
        let (transcript, _) = watch::channel(String::new());
        Self {
            inner: Arc::new(Inner {
                connector,
                backend,
                config,
                notes,
                options,
                state,
                amplitude: Arc::new(amplitude),
                transcript: TranscriptSink::new(transcript),
                running: tokio::sync::Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Connect and start streaming. Resolves once the session is Active, or
    /// with the reason it could not get there (the session is Idle again).
    pub async fn start(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let began = inner.state.send_if_modified(|state| {
            if *state != SessionState::Idle {
                return false;
            }
            *lock(&inner.cancel) = Some(cancel_tx);
            *state = SessionState::Connecting;
            true
        });
        if !began {
            return Err(SessionError::AlreadyRunning);
        }
        info!("Session connecting (voice {})", inner.config.voice);

        let attempt = tokio::select! {
            result = inner.establish() => Some(result),
            _ = cancel_rx => None,
        };

        // Holding the slot keeps a concurrent stop() from running teardown
        // before the resources are installed.
        let mut slot = inner.running.lock().await;
        let cancelled = lock(&inner.cancel).take().is_none();

        let result = match attempt {
            None => Err(SessionError::Cancelled),
            Some(Ok(link)) if cancelled => {
                link.channel.handle.close();
                Err(SessionError::Cancelled)
            }
            Some(result) => result.and_then(|link| inner.activate(link)),
        };

        match result {
            Ok(running) => {
                inner.state.send_replace(SessionState::Active);
                running.capture.begin();
                *slot = Some(running);
                info!("Session active");
                Ok(())
            }
            Err(e) => {
                drop(slot);
                warn!("Session failed to start: {}", e);
                inner.state.send_replace(SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Tear the session down. Cancels a pending start; no-op when Idle or
    /// already closing.
    pub async fn stop(&self) {
        if let Some(cancel) = lock(&self.inner.cancel).take() {
            debug!("Cancelling session start");
            let _ = cancel.send(());
        }
        self.inner.teardown(false).await;
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Loudness of the most recent microphone frame, 0 when not capturing.
    pub fn amplitude(&self) -> watch::Receiver<f32> {
        self.inner.amplitude.subscribe()
    }

    /// Transcript of the model's current turn.
    pub fn transcript(&self) -> watch::Receiver<String> {
        self.inner.transcript.subscribe()
    }
}

impl<C: Connector, B: AudioBackend> Inner<C, B> {
    async fn establish(&self) -> Result<Link, SessionError> {
        let input = self
            .backend
            .open_input(self.options.capture.sample_rate)
            .map_err(SessionError::PermissionDenied)?;
        let output = self
            .backend
            .open_output(self.options.output_sample_rate)
            .map_err(SessionError::OutputUnavailable)?;

        let timeout = self.options.connect_timeout;
        let channel = tokio::time::timeout(timeout, self.connector.open(&self.config))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        Ok(Link {
            input,
            output,
            channel,
        })
    }

    fn activate(self: &Arc<Self>, link: Link) -> Result<Running, SessionError> {
        let Link {
            input,
            output,
            channel: ChannelPair { handle, events },
        } = link;

        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let rate = self.options.output_sample_rate;
        let engine = match OutputEngine::spawn(output, rate, finished_tx, faults_tx.clone()) {
            Ok(engine) => engine,
            Err(e) => {
                handle.close();
                return Err(e.into());
            }
        };
        let sinks = CaptureSinks {
            channel: handle.clone(),
            amplitude: self.amplitude.clone(),
            faults: faults_tx,
        };
        let capture = match CapturePipeline::spawn(input, self.options.capture, sinks) {
            Ok(capture) => capture,
            Err(e) => {
                handle.close();
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inputs = LoopInputs {
            events,
            finished: finished_rx,
            faults: faults_rx,
            shutdown: shutdown_rx,
        };
        let scheduler = PlaybackScheduler::with_sample_rate(engine.timeline(), rate);
        let event_loop =
            tokio::spawn(self.clone().run_event_loop(inputs, scheduler, handle.clone()));

        Ok(Running {
            capture,
            channel: handle,
            shutdown: shutdown_tx,
            event_loop,
            output: engine,
        })
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut inputs: LoopInputs,
        mut scheduler: PlaybackScheduler<MixerTimeline>,
        channel: ChannelHandle,
    ) {
        let mut bridge = ToolBridge::new(self.notes.clone());

        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut inputs.shutdown => break LoopExit::Stopped,
                Some(e) = inputs.faults.recv() => {
                    error!("Audio device failed: {}", e);
                    break LoopExit::Failed;
                }
                Some(id) = inputs.finished.recv() => scheduler.on_source_finished(id),
                event = inputs.events.recv() => {
                    let Some(event) = event else {
                        info!("Event stream ended");
                        break LoopExit::Closed;
                    };
                    match event {
                        ServerEvent::TranscriptDelta { text } => self.transcript.append(&text),
                        ServerEvent::AudioChunk { chunk } => {
                            scheduler.on_audio_chunk(&chunk);
                        }
                        ServerEvent::ToolCall(request) => {
                            if let Some(ack) = bridge.handle(request) {
                                if !channel.send_tool_result(&ack.id, &ack.name, ack.result) {
                                    warn!("Tool result for {} not sent, channel closed", ack.id);
                                }
                            }
                        }
                        ServerEvent::TurnComplete => {
                            debug!("Turn complete");
                            self.transcript.reset();
                        }
                        ServerEvent::Interrupted => {
                            let stopped = scheduler.on_interrupted();
                            info!("Interrupted, {} queued sources dropped", stopped);
                        }
                        ServerEvent::Error { detail } => {
                            error!("Channel error: {}", detail);
                            break LoopExit::Failed;
                        }
                        ServerEvent::Closed => {
                            info!("Remote closed the session");
                            break LoopExit::Closed;
                        }
                    }
                }
            }
        };

        scheduler.disarm();
        debug!("Event loop exited: {:?}", exit);
        if exit != LoopExit::Stopped {
            self.teardown(true).await;
        }
    }

    /// Release everything. The first caller takes the resources; everyone
    /// else returns immediately.
    async fn teardown(&self, from_loop: bool) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let Running {
            capture,
            channel,
            shutdown,
            event_loop,
            output,
        } = running;

        capture.stop();
        self.state.send_replace(SessionState::Closing);
        info!("Session closing");

        channel.close();
        let _ = shutdown.send(());
        if !from_loop {
            if let Err(e) = event_loop.await {
                error!("Event loop task failed: {}", e);
            }
        }
        output.shutdown().await;
        capture.join().await;

        self.amplitude.send_replace(0.0);
        self.transcript.reset();
        self.state.send_replace(SessionState::Idle);
        info!("Session idle");
    }
}
