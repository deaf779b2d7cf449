//! Live session controller
//!
//! One task owns every piece of session state: connection state, chat
//! history, transcript buffers, the playback cursor, timers and device
//! handles. Everything that happens concurrently (commands from handles,
//! transport deliveries, playback completions, quota timers, the result of
//! the asynchronous open) arrives as a message on that task's queues, so no
//! two of them ever interleave.
//!
//! Each `start` mints a new epoch. Every asynchronous completion and every
//! forwarded event carries the epoch it belongs to and is discarded once
//! that epoch is no longer the live session; resources that arrive late are
//! released instead of applied.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::state::{ConnectionState, SessionSnapshot};
use crate::audio::{
    decode_blob, encode_frame, AudioBackendConfig, AudioCaptureChannel, AudioPlaybackScheduler,
    CaptureDevices, CaptureFormat, MicrophoneStream, OutputDevice, SourceId,
};
use crate::error::{QuotaKind, SessionError};
use crate::live::{InboundMessage, LiveConnector, LiveSession, PropertyContext, SessionSetup, TransportEvent};
use crate::transcript::{Direction, TranscriptAggregator};
use crate::usage::UsageGuard;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Consecutive failed usage writes before the conversation is cut off
const MAX_USAGE_WRITE_FAILURES: u32 = 3;

/// Result of a start request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The session is connecting; watch the snapshot for the open
    Started { session_id: String },
    /// The previous session is not fully disconnected; nothing was done
    Ignored(ConnectionState),
    /// Refused before any device or network I/O
    Rejected(SessionError),
}

/// Collaborators the controller drives
#[derive(Clone)]
pub struct ControllerDeps {
    pub connector: Arc<dyn LiveConnector>,
    pub capture: Arc<dyn CaptureDevices>,
    pub output: Arc<dyn OutputDevice>,
    pub usage: UsageGuard,
}

enum Command {
    Start {
        context: PropertyContext,
        config_id: String,
        reply: oneshot::Sender<StartOutcome>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum ControlEvent {
    Established {
        epoch: u64,
        result: Result<Established, SessionError>,
    },
    Transport {
        epoch: u64,
        event: TransportEvent,
    },
    SourceEnded {
        epoch: u64,
        id: SourceId,
    },
    SessionCeiling {
        epoch: u64,
    },
    UsageTick {
        epoch: u64,
    },
}

/// Microphone and remote session acquired by an open attempt
struct Established {
    microphone: MicrophoneStream,
    live: Arc<dyn LiveSession>,
}

impl Established {
    async fn release(self) {
        let Established {
            mut microphone,
            live,
        } = self;

        match tokio::time::timeout(CLOSE_TIMEOUT, live.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error closing superseded session: {:#}", e),
            Err(_) => error!("Timed out closing superseded session"),
        }
        if let Err(e) = microphone.backend.stop().await {
            error!("Error releasing superseded microphone: {:#}", e);
        }
    }
}

/// Resources exclusively owned by the current session
struct ActiveSession {
    epoch: u64,
    config_id: String,
    timers: Vec<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    live: Option<Arc<dyn LiveSession>>,
    capture: Option<AudioCaptureChannel>,
    playback: Option<AudioPlaybackScheduler>,
    usage_write_failures: u32,
}

/// Cloneable handle used by the outer layers (HTTP, CLI)
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Start a conversation; a no-op unless the session is `Disconnected`
    pub async fn start(
        &self,
        context: PropertyContext,
        config_id: impl Into<String>,
    ) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                context,
                config_id: config_id.into(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("Session controller has shut down"))?;
        rx.await.context("Session controller dropped the start request")
    }

    /// Tear the session down; safe from any state, any number of times
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| anyhow!("Session controller has shut down"))?;
        rx.await.context("Session controller dropped the stop request")
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

pub struct SessionController {
    config: SessionConfig,
    deps: ControllerDeps,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    view: SessionSnapshot,
    aggregator: TranscriptAggregator,
    epoch: u64,
    session: Option<ActiveSession>,
}

impl SessionController {
    /// Spawn the controller task and return a handle to it
    ///
    /// The task runs until every handle is dropped, then tears down any
    /// session still open.
    pub fn spawn(config: SessionConfig, deps: ControllerDeps) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let controller = Self {
            config,
            deps,
            events_tx,
            snapshot: snapshot_tx,
            view: SessionSnapshot::default(),
            aggregator: TranscriptAggregator::new(),
            epoch: 0,
            session: None,
        };
        tokio::spawn(controller.run(commands_rx, events_rx));

        SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<ControlEvent>,
    ) {
        info!("Session controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { context, config_id, reply }) => {
                        let outcome = self.start(context, config_id);
                        let _ = reply.send(outcome);
                    }
                    Some(Command::Stop { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.stop().await;
        info!("Session controller stopped");
    }

    fn publish(&mut self) {
        self.view.interim_transcript = self.aggregator.interim().to_string();
        self.snapshot.send_replace(self.view.clone());
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.epoch == epoch)
    }

    fn start(&mut self, context: PropertyContext, config_id: String) -> StartOutcome {
        if self.view.state != ConnectionState::Disconnected {
            info!("Start ignored while {:?}", self.view.state);
            return StartOutcome::Ignored(self.view.state);
        }

        match self.deps.usage.can_start(&config_id) {
            Ok(true) => {}
            Ok(false) => {
                return self.reject(config_id, SessionError::QuotaExceeded(QuotaKind::DailyAtStart))
            }
            Err(e) => {
                return self.reject(
                    config_id,
                    SessionError::Configuration(format!("Usage store unavailable: {:#}", e)),
                )
            }
        }

        if let Err(e) = self.deps.connector.ensure_configured() {
            return self.reject(config_id, SessionError::Configuration(format!("{:#}", e)));
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let session_id = uuid::Uuid::new_v4().to_string();

        info!("Starting session {} for {} (epoch {})", session_id, config_id, epoch);

        self.aggregator.reset();
        self.view = SessionSnapshot {
            session_id: Some(session_id.clone()),
            config_id: Some(config_id.clone()),
            state: ConnectionState::Connecting,
            ..SessionSnapshot::default()
        };

        // Transport deliveries, tagged with this session's epoch
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                if events.send(ControlEvent::Transport { epoch, event }).is_err() {
                    break;
                }
            }
        });

        let setup = SessionSetup::for_property(&context, &self.config.model, &self.config.voice);
        let backend_config = AudioBackendConfig {
            target_sample_rate: self.config.input_sample_rate,
            target_channels: 1,
            buffer_duration_ms: self.config.capture_buffer_ms,
        };
        let capture = Arc::clone(&self.deps.capture);
        let connector = Arc::clone(&self.deps.connector);
        let events = self.events_tx.clone();

        // Not cancelled by stop: a late result must come back to be released
        tokio::spawn(async move {
            let result = open_session(capture, connector, backend_config, setup, transport_tx).await;
            if let Err(mpsc::error::SendError(ControlEvent::Established {
                result: Ok(established),
                ..
            })) = events.send(ControlEvent::Established { epoch, result })
            {
                established.release().await;
            }
        });

        self.session = Some(ActiveSession {
            epoch,
            config_id,
            timers: Vec::new(),
            forwarders: vec![forwarder],
            live: None,
            capture: None,
            playback: None,
            usage_write_failures: 0,
        });
        self.publish();

        StartOutcome::Started { session_id }
    }

    fn reject(&mut self, config_id: String, err: SessionError) -> StartOutcome {
        warn!("Session for {} refused: {}", config_id, err);

        self.view.config_id = Some(config_id);
        self.view.state = ConnectionState::Error;
        self.view.session_error = Some(err.to_string());
        self.publish();

        StartOutcome::Rejected(err)
    }

    async fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Established { epoch, result } => self.on_established(epoch, result).await,
            ControlEvent::Transport { epoch, event } => {
                if self.is_current(epoch) {
                    self.on_transport(event).await;
                }
            }
            ControlEvent::SourceEnded { epoch, id } => {
                if let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) {
                    if let Some(playback) = session.playback.as_mut() {
                        playback.on_source_ended(id);
                    }
                }
            }
            ControlEvent::SessionCeiling { epoch } => {
                if self.is_current(epoch) && self.view.state == ConnectionState::Connected {
                    let limit = self.deps.usage.limits().session;
                    warn!("Session ceiling of {}s reached", limit.as_secs());
                    self.end_with_quota(QuotaKind::Session(limit)).await;
                }
            }
            ControlEvent::UsageTick { epoch } => {
                if self.is_current(epoch) && self.view.state == ConnectionState::Connected {
                    self.on_usage_tick().await;
                }
            }
        }
    }

    async fn on_established(&mut self, epoch: u64, result: Result<Established, SessionError>) {
        if !self.is_current(epoch) || self.view.state != ConnectionState::Connecting {
            info!("Discarding open result of superseded session (epoch {})", epoch);
            if let Ok(established) = result {
                tokio::spawn(established.release());
            }
            return;
        }

        match result {
            Ok(established) => self.on_open(epoch, established).await,
            Err(err) => {
                error!("Failed to start session: {}", err);
                self.fail(err).await;
            }
        }
    }

    async fn on_open(&mut self, epoch: u64, established: Established) {
        let Established {
            mut microphone,
            live,
        } = established;

        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        let output = match self.deps.output.open(
            self.config.output_sample_rate,
            self.config.output_channels,
            ended_tx,
        ) {
            Ok(output) => output,
            Err(e) => {
                if let Some(session) = self.session.as_mut() {
                    session.live = Some(live);
                }
                if let Err(stop_err) = microphone.backend.stop().await {
                    error!("Error releasing microphone: {:#}", stop_err);
                }
                self.fail(SessionError::Device(format!("{:#}", e))).await;
                return;
            }
        };

        let events = self.events_tx.clone();
        let ended_forwarder = tokio::spawn(async move {
            while let Some(id) = ended_rx.recv().await {
                if events.send(ControlEvent::SourceEnded { epoch, id }).is_err() {
                    break;
                }
            }
        });

        let sample_rate = self.config.input_sample_rate;
        let sink_session = Arc::clone(&live);
        let capture = AudioCaptureChannel::attach(
            microphone,
            CaptureFormat {
                sample_rate,
                channels: 1,
                frame_samples: self.config.frame_samples,
            },
            move |samples| {
                if let Err(e) = sink_session.send_audio(encode_frame(&samples, sample_rate)) {
                    debug!("Audio frame not sent: {:#}", e);
                }
            },
        );

        let timers = self.start_timers(epoch);
        let playback = AudioPlaybackScheduler::new(
            output,
            self.config.output_sample_rate,
            self.config.output_channels,
        );

        if let Some(session) = self.session.as_mut() {
            session.live = Some(live);
            session.capture = Some(capture);
            session.playback = Some(playback);
            session.forwarders.push(ended_forwarder);
            session.timers = timers;
        }

        self.view.state = ConnectionState::Connected;
        self.view.started_at = Some(Utc::now());
        self.publish();

        info!("Session connected (epoch {})", epoch);
    }

    fn start_timers(&self, epoch: u64) -> Vec<JoinHandle<()>> {
        let limits = self.deps.usage.limits();

        let events = self.events_tx.clone();
        let ceiling = tokio::spawn(async move {
            tokio::time::sleep(limits.session).await;
            let _ = events.send(ControlEvent::SessionCeiling { epoch });
        });

        let events = self.events_tx.clone();
        let tick = limits.accrual_tick.max(Duration::from_millis(1));
        let accrual = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
            loop {
                ticker.tick().await;
                if events.send(ControlEvent::UsageTick { epoch }).is_err() {
                    break;
                }
            }
        });

        vec![ceiling, accrual]
    }

    async fn on_usage_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let config_id = session.config_id.clone();
        let limits = self.deps.usage.limits();

        // A failed write may still have reached the store, so the ceiling is
        // checked either way. Unrecorded time is only tolerated for a few ticks.
        match self.deps.usage.accrue(&config_id, limits.accrual_tick.as_millis() as u64) {
            Ok(_) => session.usage_write_failures = 0,
            Err(e) => {
                session.usage_write_failures += 1;
                error!(
                    "Failed to record usage for {} ({} in a row): {:#}",
                    config_id, session.usage_write_failures, e
                );
                if session.usage_write_failures >= MAX_USAGE_WRITE_FAILURES {
                    self.fail(SessionError::Configuration(format!("Usage store unavailable: {:#}", e)))
                        .await;
                    return;
                }
            }
        }

        match self.deps.usage.can_start(&config_id) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Daily ceiling reached for {}", config_id);
                self.end_with_quota(QuotaKind::Daily(limits.daily)).await;
            }
            Err(e) => error!("Failed to read usage for {}: {:#}", config_id, e),
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => self.on_message(msg),
            TransportEvent::Error(message) => {
                error!("Session error: {}", message);
                self.fail(SessionError::Transport(message)).await;
            }
            TransportEvent::Closed(None) => {
                info!("Live endpoint closed the session");
                self.stop().await;
            }
            TransportEvent::Closed(Some(reason)) => {
                warn!("Live endpoint closed the session: {}", reason);
                self.fail(SessionError::Transport(reason)).await;
            }
        }
    }

    fn on_message(&mut self, msg: InboundMessage) {
        if let Some(text) = &msg.input_transcript {
            self.aggregator.on_fragment(Direction::Input, text);
        }
        if let Some(text) = &msg.output_transcript {
            self.aggregator.on_fragment(Direction::Output, text);
        }

        if msg.turn_complete {
            for turn in self.aggregator.on_turn_complete(msg.grounding) {
                info!("{:?}: {}", turn.speaker, turn.text);
                self.view.chat_history.push(turn);
            }
        }

        if let Some(playback) = self.session.as_mut().and_then(|s| s.playback.as_mut()) {
            for data in &msg.audio {
                let scheduled = decode_blob(data).and_then(|bytes| playback.on_audio_fragment(&bytes));
                if let Err(e) = scheduled {
                    warn!("Dropping audio fragment: {:#}", e);
                }
            }
            if msg.interrupted {
                playback.on_interrupt();
            }
        }

        self.publish();
    }

    async fn end_with_quota(&mut self, kind: QuotaKind) {
        self.view.session_error = Some(SessionError::QuotaExceeded(kind).to_string());
        self.stop().await;
    }

    /// Release everything, then show the failure
    async fn fail(&mut self, err: SessionError) {
        self.teardown().await;
        self.view.session_error = Some(err.to_string());
        self.view.state = ConnectionState::Error;
        self.publish();
    }

    /// Release everything and return to `Disconnected`, keeping any error message
    async fn stop(&mut self) {
        self.teardown().await;
        self.view.state = ConnectionState::Disconnected;
        self.publish();
    }

    /// Cancel timers, close the network, release hardware; each step best-effort
    async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        info!("Tearing down session (epoch {})", session.epoch);

        for timer in session.timers.drain(..) {
            timer.abort();
        }

        if let Some(live) = session.live.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, live.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Error closing session: {:#}", e),
                Err(_) => error!("Timed out closing session"),
            }
        }

        if let Some(mut capture) = session.capture.take() {
            if let Err(e) = capture.detach().await {
                error!("Error releasing microphone: {:#}", e);
            }
        }

        for forwarder in session.forwarders.drain(..) {
            forwarder.abort();
        }

        if let Some(mut playback) = session.playback.take() {
            if let Err(e) = playback.close() {
                error!("Error closing audio output: {:#}", e);
            }
        }

        self.aggregator.reset();
    }
}

/// Acquire the microphone, then open the remote session
async fn open_session(
    capture: Arc<dyn CaptureDevices>,
    connector: Arc<dyn LiveConnector>,
    backend_config: AudioBackendConfig,
    setup: SessionSetup,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
) -> Result<Established, SessionError> {
    let mut microphone = capture
        .open_microphone(backend_config)
        .await
        .map_err(|e| SessionError::Device(format!("{:#}", e)))?;

    match connector.connect(setup, transport_tx).await {
        Ok(live) => Ok(Established { microphone, live }),
        Err(e) => {
            if let Err(stop_err) = microphone.backend.stop().await {
                error!("Error releasing microphone: {:#}", stop_err);
            }
            Err(SessionError::Transport(format!("{:#}", e)))
        }
    }
}
