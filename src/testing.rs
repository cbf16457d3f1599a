//! In-memory stand-ins for every collaborator seam, used by unit tests.

use crate::audio::{BlockCallback, CaptureDevice, CaptureStream, PlaybackDevice, PlaybackOutput};
use crate::booking::Appointment;
use crate::calendar::{CalendarEntry, CalendarError, CalendarSink};
use crate::error::{Result, SessionError};
use crate::places::{Place, PlaceSearch, SearchError, StaticDirectory};
use crate::session::{
    LiveConnection, LiveConnector, LiveSession, SessionEvent, SessionMode, SessionSetup,
    ToolResponse,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

pub fn sample_places() -> Vec<Place> {
    StaticDirectory::default().places().to_vec()
}

#[derive(Default)]
pub struct FakeSession {
    audio: Mutex<Vec<(Vec<u8>, u32)>>,
    responses: Mutex<Vec<ToolResponse>>,
    closes: AtomicUsize,
}

impl FakeSession {
    pub fn audio_blocks(&self) -> Vec<(Vec<u8>, u32)> {
        self.audio.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<ToolResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl LiveSession for FakeSession {
    fn send_audio(&self, pcm: Vec<u8>, sample_rate: u32) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Transport("Connection closed".into()));
        }
        self.audio.lock().unwrap().push((pcm, sample_rate));
        Ok(())
    }

    fn send_tool_response(&self, response: ToolResponse) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Transport("Connection closed".into()));
        }
        self.responses.lock().unwrap().push(response);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    setups: Vec<SessionSetup>,
    sessions: Vec<Arc<FakeSession>>,
    events: Vec<mpsc::UnboundedSender<SessionEvent>>,
    max_open: usize,
    fail_next: bool,
}

/// Records every connect; optionally acknowledges each session at once.
pub struct FakeConnector {
    state: Mutex<ConnectorState>,
    auto_open: bool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectorState::default()),
            auto_open: true,
        }
    }

    /// Sessions stay in CONNECTING until the test sends `Open`.
    pub fn manual() -> Self {
        Self {
            auto_open: false,
            ..Self::new()
        }
    }

    pub fn fail_next_connect(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().setups.len()
    }

    pub fn modes(&self) -> Vec<SessionMode> {
        self.state.lock().unwrap().setups.iter().map(|s| s.mode).collect()
    }

    pub fn setup(&self, index: usize) -> SessionSetup {
        self.state.lock().unwrap().setups[index].clone()
    }

    pub fn session(&self, index: usize) -> Arc<FakeSession> {
        self.state.lock().unwrap().sessions[index].clone()
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.state.lock().unwrap().sessions.last().cloned().unwrap()
    }

    /// Sessions that were never closed.
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.sessions.iter().filter(|s| !s.is_closed()).count()
    }

    /// Highest number of simultaneously open sessions seen at connect time.
    pub fn max_open(&self) -> usize {
        self.state.lock().unwrap().max_open
    }

    /// Deliver an event on the most recent session.
    pub fn emit(&self, event: SessionEvent) {
        let state = self.state.lock().unwrap();
        let _ = state.events.last().unwrap().send(event);
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self, setup: SessionSetup) -> Result<LiveConnection> {
        let mut state = self.state.lock().unwrap();
        state.setups.push(setup);
        if std::mem::take(&mut state.fail_next) {
            return Err(SessionError::Transport("connection refused".into()));
        }

        let session = Arc::new(FakeSession::default());
        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_open {
            let _ = tx.send(SessionEvent::Open);
        }
        state.sessions.push(session.clone());
        state.events.push(tx);
        let open = state.sessions.iter().filter(|s| !s.is_closed()).count();
        state.max_open = state.max_open.max(open);

        Ok(LiveConnection {
            session,
            events: rx,
        })
    }
}

/// Microphone whose blocks are pushed by the test.
pub struct FakeCaptureDevice {
    callback: Arc<Mutex<Option<BlockCallback>>>,
    opens: AtomicUsize,
    stops: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl FakeCaptureDevice {
    pub fn new() -> Self {
        Self {
            callback: Arc::new(Mutex::new(None)),
            opens: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            fail: AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let device = Self::new();
        device.fail.store(true, Ordering::SeqCst);
        device
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn push_block(&self, block: &[f32]) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(block);
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureDevice for FakeCaptureDevice {
    async fn open(
        &self,
        _sample_rate: u32,
        _block_size: usize,
        on_block: BlockCallback,
    ) -> Result<Box<dyn CaptureStream>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Device("permission denied".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(on_block);
        Ok(Box::new(FakeCaptureStream {
            callback: self.callback.clone(),
            stops: self.stops.clone(),
        }))
    }
}

struct FakeCaptureStream {
    callback: Arc<Mutex<Option<BlockCallback>>>,
    stops: Arc<AtomicUsize>,
}

impl CaptureStream for FakeCaptureStream {
    /// Counts every call so a double stop is visible to tests.
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = None;
    }
}

/// Output with a settable clock that records what was scheduled.
pub struct FakePlaybackDevice {
    clock: Arc<Mutex<f64>>,
    scheduled: Arc<Mutex<Vec<(f64, usize)>>>,
    closes: Arc<AtomicUsize>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakePlaybackDevice {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Mutex::new(0.0)),
            scheduled: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            gate: Mutex::new(None),
        }
    }

    /// `open` waits until the returned sender fires, like a slow sound server.
    pub fn gated() -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let device = Self::new();
        *device.gate.lock().unwrap() = Some(rx);
        (device, tx)
    }

    pub fn set_time(&self, t: f64) {
        *self.clock.lock().unwrap() = t;
    }

    /// `(start, sample count)` per scheduled buffer.
    pub fn scheduled(&self) -> Vec<(f64, usize)> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackDevice for FakePlaybackDevice {
    async fn open(&self, _sample_rate: u32) -> Result<Box<dyn PlaybackOutput>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(Box::new(FakeOutput {
            clock: self.clock.clone(),
            scheduled: self.scheduled.clone(),
            closes: self.closes.clone(),
        }))
    }
}

struct FakeOutput {
    clock: Arc<Mutex<f64>>,
    scheduled: Arc<Mutex<Vec<(f64, usize)>>>,
    closes: Arc<AtomicUsize>,
}

impl PlaybackOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn schedule(&mut self, start_at: f64, samples: Vec<f32>) -> Result<()> {
        self.scheduled.lock().unwrap().push((start_at, samples.len()));
        Ok(())
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSearch {
    places: Vec<Place>,
    fail: bool,
}

impl FakeSearch {
    pub fn new(places: Vec<Place>) -> Self {
        Self { places, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            places: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl PlaceSearch for FakeSearch {
    async fn search(&self, _query: &str) -> std::result::Result<Vec<Place>, SearchError> {
        if self.fail {
            return Err(SearchError::Other("quota exceeded".into()));
        }
        Ok(self.places.clone())
    }
}

/// Forwards every inserted appointment to a channel.
pub struct FakeCalendar {
    inserted: Option<mpsc::UnboundedSender<Appointment>>,
}

impl FakeCalendar {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Appointment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { inserted: Some(tx) }, rx)
    }

    pub fn failing() -> Self {
        Self { inserted: None }
    }
}

#[async_trait]
impl CalendarSink for FakeCalendar {
    async fn insert(
        &self,
        appointment: &Appointment,
    ) -> std::result::Result<CalendarEntry, CalendarError> {
        match &self.inserted {
            Some(tx) => {
                let _ = tx.send(appointment.clone());
                Ok(CalendarEntry {
                    id: format!("evt-{}", appointment.id),
                    link: Some(format!("https://calendar.test/{}", appointment.id)),
                })
            }
            None => Err(CalendarError::Rejected("calendar offline".into())),
        }
    }
}
