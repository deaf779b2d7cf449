// Fakes for the session controller's seams: live endpoint, microphone and
// audio output. Each records what the controller did to it.
#![allow(dead_code)]

use anyhow::{bail, Result};
use live_concierge::audio::{
    AudioBackend, AudioBackendConfig, AudioBlob, AudioFrame, CaptureDevices, MicrophoneStream,
    OutputContext, OutputDevice, PlayableBuffer, SourceId,
};
use live_concierge::live::{LiveConnector, LiveSession, PropertyContext, SessionSetup, TransportEvent};
use live_concierge::{
    ConnectionState, ControllerDeps, MemoryUsageStore, SessionConfig, SessionController,
    SessionHandle, SessionSnapshot, UsageGuard, UsageLimits, UsageStore,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// ============================================================================
// Live endpoint
// ============================================================================

#[derive(Default)]
pub struct FakeLiveSession {
    pub sent: Mutex<Vec<AudioBlob>>,
    pub closed: AtomicBool,
}

impl FakeLiveSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LiveSession for FakeLiveSession {
    fn send_audio(&self, blob: AudioBlob) -> Result<()> {
        if self.is_closed() {
            bail!("Live session is closed");
        }
        self.sent.lock().unwrap().push(blob);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub connects: AtomicUsize,
    pub events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    pub sessions: Mutex<Vec<Arc<FakeLiveSession>>>,
    pub setups: Mutex<Vec<SessionSetup>>,
    /// When set, `connect` waits for a permit before completing
    pub gate: Option<Arc<Notify>>,
    pub fail_connect: bool,
    pub unconfigured: bool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Deliver an event as if it came from the endpoint
    pub fn emit(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("no open session")
            .send(event)
            .expect("controller stopped listening");
    }

    pub fn last_session(&self) -> Option<Arc<FakeLiveSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl LiveConnector for FakeConnector {
    fn ensure_configured(&self) -> Result<()> {
        if self.unconfigured {
            bail!("API key missing: set CONCIERGE_API_KEY");
        }
        Ok(())
    }

    async fn connect(
        &self,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn LiveSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.setups.lock().unwrap().push(setup);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_connect {
            bail!("connection refused");
        }

        *self.events.lock().unwrap() = Some(events);
        let session = Arc::new(FakeLiveSession::default());
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// Microphone
// ============================================================================

struct FakeMicrophone {
    released: Arc<AtomicUsize>,
    capturing: bool,
}

#[async_trait::async_trait]
impl AudioBackend for FakeMicrophone {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        let (_tx, rx) = mpsc::channel(1);
        self.capturing = true;
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if self.capturing {
            self.capturing = false;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "fake microphone"
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub opened: AtomicUsize,
    pub released: Arc<AtomicUsize>,
    pub frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    pub deny: bool,
}

impl FakeCapture {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Push a frame into the most recently opened microphone
    pub async fn speak(&self, samples: Vec<i16>) {
        let tx = self.frames.lock().unwrap().clone().expect("microphone not open");
        tx.send(AudioFrame {
            samples,
            sample_rate: 16000,
            channels: 1,
            timestamp_ms: 0,
        })
        .await
        .expect("capture stream closed");
    }
}

#[async_trait::async_trait]
impl CaptureDevices for FakeCapture {
    async fn open_microphone(&self, _config: AudioBackendConfig) -> Result<MicrophoneStream> {
        if self.deny {
            bail!("Permission denied");
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        *self.frames.lock().unwrap() = Some(tx);

        Ok(MicrophoneStream {
            backend: Box::new(FakeMicrophone {
                released: Arc::clone(&self.released),
                capturing: true,
            }),
            frames: rx,
        })
    }
}

// ============================================================================
// Audio output
// ============================================================================

#[derive(Debug, Default)]
pub struct OutputLog {
    pub opened: usize,
    pub closed: usize,
    pub started: Vec<(SourceId, f64, f64)>,
    pub stopped: Vec<SourceId>,
}

#[derive(Default)]
pub struct FakeOutput {
    pub log: Arc<Mutex<OutputLog>>,
    pub unavailable: bool,
}

impl FakeOutput {
    pub fn log(&self) -> std::sync::MutexGuard<'_, OutputLog> {
        self.log.lock().unwrap()
    }
}

struct FakeOutputContext {
    log: Arc<Mutex<OutputLog>>,
}

impl OutputContext for FakeOutputContext {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn start_source(&mut self, id: SourceId, buffer: PlayableBuffer, when: f64) -> Result<()> {
        self.log.lock().unwrap().started.push((id, when, buffer.duration()));
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

impl OutputDevice for FakeOutput {
    fn open(
        &self,
        _sample_rate: u32,
        _channels: u16,
        _ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>> {
        if self.unavailable {
            bail!("No output device");
        }
        self.log.lock().unwrap().opened += 1;
        Ok(Box::new(FakeOutputContext {
            log: Arc::clone(&self.log),
        }))
    }
}

// ============================================================================
// Usage store
// ============================================================================

/// Store whose writes land in memory but never persist, like a full disk
/// under `JsonFileUsageStore`
#[derive(Default)]
pub struct UnpersistedUsageStore {
    inner: MemoryUsageStore,
}

impl UsageStore for UnpersistedUsageStore {
    fn get(&self, key: &str) -> Result<Option<u64>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: u64) -> Result<()> {
        self.inner.set(key, value)?;
        bail!("No space left on device")
    }
}

/// Store that reads fine but rejects every write
#[derive(Default)]
pub struct ReadOnlyUsageStore;

impl UsageStore for ReadOnlyUsageStore {
    fn get(&self, _key: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: u64) -> Result<()> {
        bail!("Read-only file system")
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub handle: SessionHandle,
    pub connector: Arc<FakeConnector>,
    pub capture: Arc<FakeCapture>,
    pub output: Arc<FakeOutput>,
    pub usage: UsageGuard,
}

pub fn property() -> PropertyContext {
    PropertyContext {
        address: "Via Roma 1, Firenze".to_string(),
        check_in: "15:00".to_string(),
        check_out: "10:00".to_string(),
        rules: "No smoking".to_string(),
        appliances: "Induction hob".to_string(),
        booking_platform: None,
        check_in_and_out_procedures: None,
        location: None,
    }
}

pub fn harness_with(
    connector: FakeConnector,
    capture: FakeCapture,
    output: FakeOutput,
    limits: UsageLimits,
) -> Harness {
    harness_with_store(connector, capture, output, Arc::new(MemoryUsageStore::new()), limits)
}

pub fn harness_with_store(
    connector: FakeConnector,
    capture: FakeCapture,
    output: FakeOutput,
    store: Arc<dyn UsageStore>,
    limits: UsageLimits,
) -> Harness {
    let connector = Arc::new(connector);
    let capture = Arc::new(capture);
    let output = Arc::new(output);
    let usage = UsageGuard::new(store, limits);

    let handle = SessionController::spawn(
        SessionConfig::default(),
        ControllerDeps {
            connector: connector.clone(),
            capture: capture.clone(),
            output: output.clone(),
            usage: usage.clone(),
        },
    );

    Harness {
        handle,
        connector,
        capture,
        output,
        usage,
    }
}

pub fn harness() -> Harness {
    harness_with(
        FakeConnector::new(),
        FakeCapture::default(),
        FakeOutput::default(),
        UsageLimits::default(),
    )
}

/// Wait (real time) until the published snapshot satisfies `predicate`
pub async fn wait_until<F>(handle: &SessionHandle, predicate: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let mut rx = handle.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for session snapshot")
        .expect("session controller stopped")
        .clone();
    snapshot
}

pub async fn wait_for_state(handle: &SessionHandle, state: ConnectionState) -> SessionSnapshot {
    wait_until(handle, |s| s.state == state).await
}

/// Poll `condition` for up to a second
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
