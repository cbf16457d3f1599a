//! Dual-mode session orchestrator
//!
//! A single task owns the live session, its audio resources and the booking
//! store. Commands from the [`OrchestratorHandle`], events from the open
//! session and transition timers are all handled on that task, one at a
//! time, so the state machine never races itself:
//!
//! ```text
//! IDLE -> CONNECTING(mode) -> ACTIVE(mode) -> TRANSITIONING(from -> to) -> CONNECTING(to)
//! ```
//!
//! A transition waits the dial (or hang-up) delay, tears the current session
//! down, waits the settle delay and connects the other mode, carrying the
//! booking that triggered it.

use crate::audio::{AudioPipeline, DuplexAudio};
use crate::booking::{Appointment, BookingDetails, BookingMirror, BookingStatus, BookingStore};
use crate::config::SolaConfig;
use crate::error::{Result, SessionError};
use crate::prompts;
use crate::session::{LiveConnector, LiveSession, SessionEvent, SessionMode, Speaker, ToolCall};
use crate::tools::Dispatcher;
use crate::view::{Message, Role, SessionView, ViewMode};
use chrono::Local;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting(SessionMode),
    Active(SessionMode),
    Transitioning { from: SessionMode, to: SessionMode },
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("IDLE"),
            Phase::Connecting(mode) => write!(f, "CONNECTING({})", mode),
            Phase::Active(mode) => write!(f, "ACTIVE({})", mode),
            Phase::Transitioning { from, to } => write!(f, "TRANSITIONING({} -> {})", from, to),
        }
    }
}

/// Point-in-time view of the orchestrator, answered from its own task.
#[derive(Debug, Clone)]
pub struct Status {
    pub phase: Phase,
    pub mode: Option<SessionMode>,
    pub transition_in_flight: bool,
    /// Transitions accepted so far (duplicates rejected by the guard are not
    /// counted).
    pub transitions_requested: u64,
    pub booking: Option<BookingDetails>,
    pub appointment: Option<Appointment>,
    pub last_outcome: Option<String>,
}

/// Delays that shape a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionDelays {
    /// Ringing time before the receptionist session.
    pub dial: Duration,
    /// Pause before going back to the caller session.
    pub hangup: Duration,
    /// Gap between closing one session and opening the next.
    pub settle: Duration,
}

impl Default for TransitionDelays {
    fn default() -> Self {
        Self {
            dial: Duration::from_millis(3000),
            hangup: Duration::from_millis(1500),
            settle: Duration::from_millis(500),
        }
    }
}

impl From<&SolaConfig> for TransitionDelays {
    fn from(config: &SolaConfig) -> Self {
        Self {
            dial: config.dial_delay(),
            hangup: config.hangup_delay(),
            settle: config.settle_delay(),
        }
    }
}

/// Sample negotiating booking used by the debug dial.
pub fn debug_booking() -> BookingDetails {
    BookingDetails {
        place_id: "debug-1".to_string(),
        place_name: "Debug Salon".to_string(),
        service: "Haircut".to_string(),
        date: Local::now().format("%Y-%m-%d").to_string(),
        time: "15:30".to_string(),
        status: BookingStatus::Negotiating,
    }
}

enum Command {
    Start,
    Stop,
    CancelBooking,
    Dial(BookingDetails),
    Status(oneshot::Sender<Status>),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    /// The dial/hang-up delay elapsed; tear down the current session.
    TransitionDue(u64),
    /// The settle delay elapsed; connect the target mode.
    ReconnectDue(u64),
}

enum Wake {
    Command(Option<Command>),
    Timer(Timer),
    Session(Option<SessionEvent>),
}

struct PendingTransition {
    ticket: u64,
    from: SessionMode,
    target: SessionMode,
    booking: Option<BookingDetails>,
    timer: JoinHandle<()>,
}

/// The one live connection plus the audio wired to it.
#[derive(Default)]
struct LiveResources {
    mode: Option<SessionMode>,
    session: Option<Arc<dyn LiveSession>>,
    audio: Option<DuplexAudio>,
}

impl LiveResources {
    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Ordered teardown: session, then processing node, microphone and
    /// output. Every step is skipped when its resource is already gone.
    async fn release(&mut self) {
        if let Some(audio) = &self.audio {
            audio.tap().set_open(false);
        }
        if let Some(session) = self.session.take() {
            match session.close().await {
                Ok(()) => debug!("Session closed"),
                Err(e) => warn!("Session close failed: {}", e),
            }
        }
        if let Some(mut audio) = self.audio.take() {
            audio.release();
        }
        if let Some(mode) = self.mode.take() {
            info!("{} session resources released", mode);
        }
    }
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Command>,
    view: SessionView,
    mirror: BookingMirror,
}

impl OrchestratorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| SessionError::Stopped)
    }

    /// Open the caller session.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Close whatever is open and go idle.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Cancel a booking that is still being negotiated.
    pub fn cancel_booking(&self) -> Result<()> {
        self.send(Command::CancelBooking)
    }

    /// Inject a negotiating booking and dial it.
    pub fn dial(&self, booking: BookingDetails) -> Result<()> {
        self.send(Command::Dial(booking))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub async fn status(&self) -> Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    /// Latest booking record, readable without a round trip.
    pub fn booking(&self) -> Option<BookingDetails> {
        self.mirror.snapshot()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.view.subscribe()
    }
}

pub struct Orchestrator {
    delays: TransitionDelays,
    connector: Arc<dyn LiveConnector>,
    audio: AudioPipeline,
    dispatcher: Dispatcher,
    store: BookingStore,
    view: SessionView,
    phase: Phase,
    live: LiveResources,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    transition_in_flight: bool,
    transitions_requested: u64,
    pending: Option<PendingTransition>,
    next_ticket: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    timers_rx: mpsc::UnboundedReceiver<Timer>,
}

impl Orchestrator {
    pub fn new(
        delays: TransitionDelays,
        connector: Arc<dyn LiveConnector>,
        audio: AudioPipeline,
        dispatcher: Dispatcher,
        view: SessionView,
    ) -> (Self, OrchestratorHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let store = BookingStore::new();
        let handle = OrchestratorHandle {
            tx,
            view: view.clone(),
            mirror: store.mirror(),
        };

        let orchestrator = Self {
            delays,
            connector,
            audio,
            dispatcher,
            store,
            view,
            phase: Phase::Idle,
            live: LiveResources::default(),
            events: None,
            transition_in_flight: false,
            transitions_requested: 0,
            pending: None,
            next_ticket: 0,
            commands,
            timers_tx,
            timers_rx,
        };
        (orchestrator, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Orchestrator started");
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                Some(timer) = self.timers_rx.recv() => Wake::Timer(timer),
                event = next_event(&mut self.events) => Wake::Session(event),
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Timer(timer) => self.handle_timer(timer).await,
                Wake::Session(event) => self.handle_event(event).await,
            }
        }

        self.abort_pending();
        self.disconnect(true).await;
        self.phase = Phase::Idle;
        info!("Orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                if self.phase != Phase::Idle {
                    warn!("Start ignored in {}", self.phase);
                    return;
                }
                self.open_session(SessionMode::Caller, None).await;
            }
            Command::Stop => {
                self.abort_pending();
                self.disconnect(true).await;
                self.phase = Phase::Idle;
                self.view.notice("Session stopped.");
                info!("Stopped by user");
            }
            Command::CancelBooking => self.cancel_booking().await,
            Command::Dial(booking) => self.dial(booking),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    fn status(&self) -> Status {
        Status {
            phase: self.phase,
            mode: self.live.mode,
            transition_in_flight: self.transition_in_flight,
            transitions_requested: self.transitions_requested,
            booking: self.store.current().cloned(),
            appointment: self.store.appointment().cloned(),
            last_outcome: self.store.last_outcome().map(str::to_string),
        }
    }

    fn dial(&mut self, booking: BookingDetails) {
        let booking = booking.with_status(BookingStatus::Negotiating);
        match self.store.begin(booking) {
            Ok(stored) => {
                let stored = stored.clone();
                self.view.notice(format!("Debug: injected booking for {}", stored.place_name));
                self.publish();
                self.request_transition(SessionMode::ReceptionistFacing, Some(stored));
            }
            Err(e) => {
                warn!("Dial rejected: {}", e);
                self.view.notice(format!("Cannot dial: {}", e));
            }
        }
    }

    async fn cancel_booking(&mut self) {
        match self.store.cancel() {
            Ok(cancelled) => {
                self.view.notice(format!("Booking with {} cancelled.", cancelled.place_name));
                self.publish();
            }
            Err(e) => {
                info!("Nothing to cancel: {}", e);
                self.view.notice("No booking in progress to cancel.");
                return;
            }
        }

        let dialing = self
            .pending
            .as_ref()
            .is_some_and(|p| p.target == SessionMode::ReceptionistFacing);
        if dialing {
            let from = self.pending.as_ref().map(|p| p.from).unwrap_or(SessionMode::Caller);
            self.abort_pending();
            if self.live.is_open() {
                self.phase = Phase::Active(from);
            } else {
                self.open_session(SessionMode::Caller, None).await;
            }
        } else if self.live.mode == Some(SessionMode::ReceptionistFacing) {
            if self.pending.is_none() && self.transition_in_flight {
                // The dial is still connecting; the hang-up supersedes it.
                debug!("Cancel supersedes the dial still in flight");
                self.transition_in_flight = false;
            }
            self.request_transition(SessionMode::Caller, None);
        }
    }

    /// Schedule a switch to `target` unless one is already in flight.
    fn request_transition(&mut self, target: SessionMode, booking: Option<BookingDetails>) -> bool {
        if self.transition_in_flight {
            debug!("Transition to {} ignored, one is already in flight", target);
            return false;
        }
        let from = self.live.mode.unwrap_or(SessionMode::Caller);
        let delay = match target {
            SessionMode::ReceptionistFacing => self.delays.dial,
            SessionMode::Caller => self.delays.hangup,
        };

        self.transition_in_flight = true;
        self.transitions_requested += 1;
        let ticket = self.take_ticket();
        let timer = self.schedule(delay, Timer::TransitionDue(ticket));
        self.pending = Some(PendingTransition {
            ticket,
            from,
            target,
            booking,
            timer,
        });
        self.phase = Phase::Transitioning { from, to: target };
        info!("Transition {} -> {} scheduled in {:?}", from, target, delay);
        true
    }

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::TransitionDue(ticket) => {
                if !self.pending.as_ref().is_some_and(|p| p.ticket == ticket) {
                    debug!("Stale transition timer {}", ticket);
                    return;
                }
                info!("Transition: hanging up current session");
                self.disconnect(false).await;

                let next = self.take_ticket();
                let timer = self.schedule(self.delays.settle, Timer::ReconnectDue(next));
                if let Some(pending) = self.pending.as_mut() {
                    pending.ticket = next;
                    pending.timer = timer;
                }
            }
            Timer::ReconnectDue(ticket) => {
                let Some(pending) = self.pending.take_if(|p| p.ticket == ticket) else {
                    debug!("Stale reconnect timer {}", ticket);
                    return;
                };
                info!("Transition: connecting {}", pending.target);
                self.open_session(pending.target, pending.booking).await;
            }
        }
    }

    /// Connect `mode`, turning any failure into a notice and IDLE.
    async fn open_session(&mut self, mode: SessionMode, booking: Option<BookingDetails>) {
        if let Err(e) = self.connect(mode, booking).await {
            error!("{} connect failed: {}", mode, e);
            self.view.notice(format!("Could not start the {} session: {}", mode, e));
            self.disconnect(true).await;
            if mode == SessionMode::ReceptionistFacing {
                self.fail_unreached_booking();
            }
            self.abort_pending();
            self.phase = Phase::Idle;
            self.publish();
        }
    }

    async fn connect(&mut self, mode: SessionMode, booking: Option<BookingDetails>) -> Result<()> {
        self.disconnect(false).await;

        let setup = match mode {
            SessionMode::Caller => prompts::caller_setup(self.store.last_outcome()),
            SessionMode::ReceptionistFacing => {
                let booking = booking
                    .or_else(|| self.store.mirror().snapshot())
                    .ok_or_else(|| {
                        SessionError::Precondition("no booking record to call about".to_string())
                    })?;
                if booking.status != BookingStatus::Negotiating {
                    return Err(SessionError::Precondition(format!(
                        "booking with {} is {}, not negotiating",
                        booking.place_name, booking.status
                    )));
                }
                prompts::receptionist_setup(&booking)
            }
        };

        self.phase = Phase::Connecting(mode);
        info!("Connecting {} session", mode);

        let mut audio = self.audio.acquire().await?;
        let connection = match self.connector.connect(setup).await {
            Ok(connection) => connection,
            Err(e) => {
                audio.release();
                return Err(e);
            }
        };
        audio.tap().attach(connection.session.clone());

        self.live = LiveResources {
            mode: Some(mode),
            session: Some(connection.session),
            audio: Some(audio),
        };
        self.events = Some(connection.events);
        self.view.update(|v| {
            v.mode = Some(mode);
            if mode == SessionMode::ReceptionistFacing {
                v.view_mode = ViewMode::Phone;
            }
        });
        Ok(())
    }

    /// Idempotent teardown. `reset_ui` also clears the active flag and
    /// volume; a mode swap leaves them alone.
    async fn disconnect(&mut self, reset_ui: bool) {
        self.events = None;
        self.live.release().await;
        if reset_ui {
            self.audio.meter().set(0.0);
            self.view.update(|v| {
                v.active = false;
                v.mode = None;
            });
        }
    }

    async fn handle_event(&mut self, event: Option<SessionEvent>) {
        let event = event.unwrap_or_else(|| SessionEvent::Closed("event stream ended".to_string()));
        match event {
            SessionEvent::Open => self.on_open(),
            SessionEvent::Audio(pcm) => {
                if let Some(audio) = self.live.audio.as_mut() {
                    if let Err(e) = audio.play(&pcm) {
                        warn!("Playback failed: {}", e);
                    }
                }
            }
            SessionEvent::ToolCalls(calls) => self.handle_tool_calls(calls).await,
            SessionEvent::Transcript { speaker, text } => {
                let role = match speaker {
                    Speaker::User => Role::User,
                    Speaker::Model => Role::Assistant,
                };
                self.view.push(role, text);
            }
            SessionEvent::Closed(reason) => self.on_session_lost(format!("closed: {}", reason)).await,
            SessionEvent::Error(reason) => self.on_session_lost(format!("error: {}", reason)).await,
        }
    }

    fn on_open(&mut self) {
        let Some(mode) = self.live.mode else {
            return;
        };
        if let Some(audio) = &self.live.audio {
            audio.tap().set_open(true);
        }
        if self.pending.is_none() {
            self.transition_in_flight = false;
        }
        if !matches!(self.phase, Phase::Transitioning { .. }) {
            self.phase = Phase::Active(mode);
        }
        self.view.update(|v| {
            v.active = true;
            v.mode = Some(mode);
        });
        match mode {
            SessionMode::Caller => self.view.notice("Connected to Sola."),
            SessionMode::ReceptionistFacing => {
                let place = self
                    .store
                    .current()
                    .map(|b| b.place_name.clone())
                    .unwrap_or_default();
                self.view.notice(format!("Call connected to {}.", place));
            }
        }
        info!("{} session open", mode);
        self.maybe_auto_dial();
    }

    async fn handle_tool_calls(&mut self, calls: Vec<ToolCall>) {
        let Some(mode) = self.live.mode else {
            warn!("Tool calls arrived with no open session");
            return;
        };
        let session = self.live.session.clone();
        let mut transition = None;

        for call in calls {
            let dispatched = self.dispatcher.dispatch(mode, &call, &mut self.store).await;
            match &session {
                Some(session) => {
                    if let Err(e) = session.send_tool_response(dispatched.response) {
                        warn!("Response to {} [{}] not delivered: {}", call.name, call.id, e);
                    }
                }
                None => warn!("No session to answer {} [{}]", call.name, call.id),
            }
            if let Some(next) = dispatched.transition {
                if transition.is_none() {
                    transition = Some(next);
                } else {
                    warn!("Extra transition to {} dropped", next.target);
                }
            }
        }

        self.publish();
        if let Some(request) = transition {
            self.request_transition(request.target, request.booking);
        }
        self.maybe_auto_dial();
    }

    async fn on_session_lost(&mut self, reason: String) {
        if self.pending.is_some() {
            info!("Session {} while a transition is pending", reason);
            self.disconnect(false).await;
            return;
        }
        warn!("Session {}", reason);
        self.view.notice(format!("Connection {}", reason));
        self.transition_in_flight = false;
        self.disconnect(true).await;
        self.phase = Phase::Idle;
    }

    /// Dial whenever a negotiating booking exists in an active caller session.
    fn maybe_auto_dial(&mut self) {
        if self.transition_in_flight || self.phase != Phase::Active(SessionMode::Caller) {
            return;
        }
        let Some(booking) = self
            .store
            .current()
            .filter(|b| b.status == BookingStatus::Negotiating)
            .cloned()
        else {
            return;
        };
        info!("Negotiating booking with {} found, dialing", booking.place_name);
        self.request_transition(SessionMode::ReceptionistFacing, Some(booking));
    }

    fn fail_unreached_booking(&mut self) {
        let negotiating = self
            .store
            .current()
            .is_some_and(|b| b.status == BookingStatus::Negotiating);
        if negotiating {
            if let Err(e) = self.store.update(|b| b.status = BookingStatus::Failed) {
                warn!("Could not mark booking failed: {}", e);
            }
            self.store.set_last_outcome("Failed: the call could not be connected");
        }
    }

    /// Cancel any scheduled transition and release the guard.
    fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
            debug!("Pending transition to {} cancelled", pending.target);
        }
        self.transition_in_flight = false;
    }

    fn take_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn schedule(&self, delay: Duration, timer: Timer) -> JoinHandle<()> {
        let tx = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        })
    }

    fn publish(&self) {
        let booking = self.store.current().cloned();
        let appointment = self.store.appointment().cloned();
        self.view.update(|v| {
            v.booking = booking;
            v.appointment = appointment;
        });
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>) -> Option<SessionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioPipeline;
    use crate::codec;
    use crate::prompts::{FIND_PLACES, INITIATE_CALL, REPORT_BOOKING_OUTCOME, SELECT_PROVIDER};
    use crate::testing::{
        sample_places, FakeCalendar, FakeCaptureDevice, FakeConnector, FakePlaybackDevice, FakeSearch,
    };
    use serde_json::{json, Value};

    struct Harness {
        handle: OrchestratorHandle,
        connector: Arc<FakeConnector>,
        capture: Arc<FakeCaptureDevice>,
        playback: Arc<FakePlaybackDevice>,
    }

    fn build(connector: FakeConnector) -> (Orchestrator, Harness) {
        let connector = Arc::new(connector);
        let capture = Arc::new(FakeCaptureDevice::new());
        let playback = Arc::new(FakePlaybackDevice::new());
        let view = SessionView::new();
        let audio = AudioPipeline::new(
            capture.clone(),
            playback.clone(),
            view.volume(),
            codec::INPUT_SAMPLE_RATE,
            codec::OUTPUT_SAMPLE_RATE,
            4096,
        );
        let (calendar, _) = FakeCalendar::new();
        let dispatcher = Dispatcher::new(
            Arc::new(FakeSearch::new(sample_places())),
            Arc::new(calendar),
            view.clone(),
        );
        let (orchestrator, handle) =
            Orchestrator::new(TransitionDelays::default(), connector.clone(), audio, dispatcher, view);
        (
            orchestrator,
            Harness {
                handle,
                connector,
                capture,
                playback,
            },
        )
    }

    fn spawn(connector: FakeConnector) -> Harness {
        let (orchestrator, harness) = build(connector);
        orchestrator.spawn();
        harness
    }

    /// Let every ready task run. Time is paused, so this only returns once the
    /// orchestrator has nothing left to do.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    fn booking_calls() -> Vec<ToolCall> {
        vec![
            call("c1", FIND_PLACES, json!({"query": "salon"})),
            call("c2", SELECT_PROVIDER, json!({"providerId": "3"})),
            call(
                "c3",
                INITIATE_CALL,
                json!({"placeId": "3", "service": "Haircut", "date": "2025-06-01", "time": "15:30"}),
            ),
        ]
    }

    async fn started() -> Harness {
        let h = spawn(FakeConnector::new());
        h.handle.start().unwrap();
        settle().await;
        h
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_caller_session() {
        let h = started().await;
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Active(SessionMode::Caller));
        assert_eq!(h.connector.modes(), vec![SessionMode::Caller]);
        assert_eq!(h.capture.opens(), 1);

        let view = h.handle.view().snapshot();
        assert!(view.active);
        assert_eq!(view.mode, Some(SessionMode::Caller));
        assert!(!h.connector.setup(0).system_instruction.contains("last booking call"));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_waits_for_open_then_streams_in_order() {
        let h = spawn(FakeConnector::manual());
        h.handle.start().unwrap();
        settle().await;
        assert_eq!(h.handle.status().await.unwrap().phase, Phase::Connecting(SessionMode::Caller));

        h.capture.push_block(&[0.25; 8]);
        assert!(h.connector.last_session().audio_blocks().is_empty());

        h.connector.emit(SessionEvent::Open);
        settle().await;
        h.capture.push_block(&[0.25; 8]);
        h.capture.push_block(&[-0.25; 8]);
        let sent = h.connector.last_session().audio_blocks();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, codec::encode(&[0.25; 8]));
        assert_eq!(sent[1].0, codec::encode(&[-0.25; 8]));
        assert_eq!(sent[1].1, codec::INPUT_SAMPLE_RATE);
        assert!(h.handle.view().volume().get() > 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_audio_is_scheduled_back_to_back() {
        let h = started().await;
        h.playback.set_time(1.0);
        h.connector.emit(SessionEvent::Audio(vec![0u8; 2400]));
        h.connector.emit(SessionEvent::Audio(vec![0u8; 2400]));
        settle().await;

        let scheduled = h.playback.scheduled();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].0, 1.0);
        assert!((scheduled[1].0 - 1.05).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn booking_flow_dials_exactly_once_and_returns_to_caller() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        settle().await;

        let caller = h.connector.session(0);
        let ids: Vec<String> = caller.responses().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["c1", "c2", "c3"]);
        assert_eq!(caller.responses()[1].result["phoneNumber"], "+91 91234 56789");

        let status = h.handle.status().await.unwrap();
        assert!(status.transition_in_flight);
        assert_eq!(status.transitions_requested, 1);
        assert_eq!(
            status.phase,
            Phase::Transitioning {
                from: SessionMode::Caller,
                to: SessionMode::ReceptionistFacing
            }
        );
        assert_eq!(h.handle.booking().unwrap().status, BookingStatus::Negotiating);

        // Still ringing.
        advance(2900).await;
        assert_eq!(h.connector.connects(), 1);

        advance(700).await;
        assert_eq!(
            h.connector.modes(),
            vec![SessionMode::Caller, SessionMode::ReceptionistFacing]
        );
        assert!(caller.is_closed());
        assert!(h.connector.setup(1).system_instruction.contains("Style Cuts"));
        assert_eq!(h.connector.max_open(), 1);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Active(SessionMode::ReceptionistFacing));
        assert!(!status.transition_in_flight);
        assert_eq!(status.transitions_requested, 1);
        assert_eq!(h.handle.view().snapshot().view_mode, ViewMode::Phone);

        h.connector.emit(SessionEvent::ToolCalls(vec![call(
            "r1",
            REPORT_BOOKING_OUTCOME,
            json!({"success": true, "finalTime": "16:00"}),
        )]));
        settle().await;
        let receptionist = h.connector.session(1);
        assert_eq!(receptionist.responses()[0].result["status"], "ended");

        advance(2100).await;
        assert_eq!(h.connector.connects(), 3);
        assert_eq!(h.connector.modes()[2], SessionMode::Caller);
        assert!(h.connector.setup(2).system_instruction.contains("Success: Booking confirmed."));
        assert_eq!(h.connector.max_open(), 1);
        assert_eq!(h.connector.open_sessions(), 1);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Active(SessionMode::Caller));
        assert_eq!(status.booking.unwrap().status, BookingStatus::Confirmed);
        assert_eq!(
            status.appointment.unwrap().date_time.to_string(),
            "2025-06-01 16:00:00"
        );
        assert_eq!(status.transitions_requested, 2);
        let view = h.handle.view().snapshot();
        assert_eq!(view.view_mode, ViewMode::Calendar);
        assert!(view.appointment.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn receptionist_connect_without_booking_is_a_precondition_failure() {
        let (mut orchestrator, h) = build(FakeConnector::new());
        orchestrator
            .open_session(SessionMode::ReceptionistFacing, None)
            .await;

        assert_eq!(orchestrator.phase, Phase::Idle);
        assert_eq!(h.connector.connects(), 0);
        assert_eq!(h.capture.opens(), 0);
        let messages = h.handle.view().snapshot().messages;
        assert!(messages.last().unwrap().text.contains("precondition failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn receptionist_connect_requires_negotiating_record() {
        let (mut orchestrator, h) = build(FakeConnector::new());
        let confirmed = debug_booking().with_status(BookingStatus::Confirmed);
        orchestrator
            .open_session(SessionMode::ReceptionistFacing, Some(confirmed))
            .await;
        assert_eq!(orchestrator.phase, Phase::Idle);
        assert_eq!(h.connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receptionist_connect_falls_back_to_mirror() {
        let (mut orchestrator, h) = build(FakeConnector::new());
        orchestrator.store.begin(debug_booking()).unwrap();
        orchestrator
            .open_session(SessionMode::ReceptionistFacing, None)
            .await;
        assert_eq!(orchestrator.phase, Phase::Connecting(SessionMode::ReceptionistFacing));
        assert!(h.connector.setup(0).system_instruction.contains("Debug Salon"));
        orchestrator.disconnect(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_twice_or_while_idle_is_safe() {
        let (mut orchestrator, h) = build(FakeConnector::new());
        orchestrator.disconnect(true).await;
        orchestrator.disconnect(false).await;

        orchestrator.open_session(SessionMode::Caller, None).await;
        orchestrator.disconnect(true).await;
        orchestrator.disconnect(true).await;

        assert_eq!(h.capture.stop_calls(), 1);
        assert_eq!(h.playback.close_calls(), 1);
        assert_eq!(h.connector.session(0).close_count(), 1);
        assert!(!h.handle.view().snapshot().active);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_everything_once() {
        let h = started().await;
        h.handle.stop().unwrap();
        h.handle.stop().unwrap();
        settle().await;

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.mode, None);
        assert_eq!(h.capture.stop_calls(), 1);
        assert_eq!(h.connector.session(0).close_count(), 1);
        assert_eq!(h.handle.view().volume().get(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_dial_cancels_the_transition() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        settle().await;
        h.handle.stop().unwrap();
        advance(5000).await;

        assert_eq!(h.connector.connects(), 1);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.transition_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_returns_to_idle_without_reconnect() {
        let h = started().await;
        h.connector.emit(SessionEvent::Closed("bye".into()));
        settle().await;
        advance(5000).await;

        assert_eq!(h.handle.status().await.unwrap().phase, Phase::Idle);
        assert_eq!(h.connector.connects(), 1);
        assert_eq!(h.capture.stop_calls(), 1);
        assert!(!h.handle.view().snapshot().active);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_during_dial_still_connects_receptionist() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        settle().await;
        h.connector.emit(SessionEvent::Error("socket reset".into()));
        settle().await;
        assert!(h.connector.session(0).is_closed());

        advance(3600).await;
        assert_eq!(h.connector.modes()[1], SessionMode::ReceptionistFacing);
        assert_eq!(
            h.handle.status().await.unwrap().phase,
            Phase::Active(SessionMode::ReceptionistFacing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_receptionist_connect_goes_idle_and_clears_guard() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        settle().await;
        h.connector.fail_next_connect();
        advance(3600).await;

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Idle);
        assert!(!status.transition_in_flight);
        assert_eq!(status.booking.unwrap().status, BookingStatus::Failed);
        assert_eq!(h.connector.open_sessions(), 0);
        assert_eq!(h.capture.stop_calls(), h.capture.opens());

        // No retry on its own.
        advance(10_000).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_aborts_start() {
        let h = spawn(FakeConnector::new());
        h.capture.set_failing(true);
        h.handle.start().unwrap();
        settle().await;

        assert_eq!(h.handle.status().await.unwrap().phase, Phase::Idle);
        assert_eq!(h.connector.connects(), 0);
        assert_eq!(h.playback.close_calls(), 1);
        let messages = h.handle.view().snapshot().messages;
        assert!(messages.last().unwrap().text.contains("audio device error"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_dial_triggers_are_ignored() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        settle().await;
        h.handle.dial(debug_booking()).unwrap();
        settle().await;

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.transitions_requested, 1);
        assert_eq!(status.booking.unwrap().place_name, "Style Cuts");
        advance(3600).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn debug_dial_from_idle_calls_the_sample_salon() {
        let h = spawn(FakeConnector::new());
        h.handle.dial(debug_booking()).unwrap();
        advance(3600).await;

        assert_eq!(h.connector.modes(), vec![SessionMode::ReceptionistFacing]);
        assert!(h.connector.setup(0).system_instruction.contains("Debug Salon"));
        assert_eq!(h.handle.booking().unwrap().place_name, "Debug Salon");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_ringing_stays_with_caller() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        settle().await;
        h.handle.cancel_booking().unwrap();
        advance(5000).await;

        assert_eq!(h.connector.connects(), 1);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Active(SessionMode::Caller));
        assert_eq!(status.booking.unwrap().status, BookingStatus::Failed);
        assert_eq!(status.last_outcome.as_deref(), Some("Failed: cancelled by user"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_call_hangs_up() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        advance(3600).await;
        h.handle.cancel_booking().unwrap();
        advance(2100).await;

        assert_eq!(h.connector.modes()[2], SessionMode::Caller);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Active(SessionMode::Caller));
        assert!(status.appointment.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_receptionist_connects_hangs_up() {
        let h = spawn(FakeConnector::manual());
        h.handle.start().unwrap();
        settle().await;
        h.connector.emit(SessionEvent::Open);
        settle().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        advance(3600).await;
        assert_eq!(
            h.handle.status().await.unwrap().phase,
            Phase::Connecting(SessionMode::ReceptionistFacing)
        );

        h.handle.cancel_booking().unwrap();
        settle().await;
        let status = h.handle.status().await.unwrap();
        assert_eq!(
            status.phase,
            Phase::Transitioning {
                from: SessionMode::ReceptionistFacing,
                to: SessionMode::Caller
            }
        );
        assert_eq!(status.transitions_requested, 2);
        assert_eq!(status.booking.unwrap().status, BookingStatus::Failed);

        // The receptionist session acknowledges late; the hang-up still runs.
        h.connector.emit(SessionEvent::Open);
        advance(2100).await;
        assert_eq!(h.connector.connects(), 3);
        assert_eq!(h.connector.modes()[2], SessionMode::Caller);
        assert!(h.connector.session(1).is_closed());

        h.connector.emit(SessionEvent::Open);
        settle().await;
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Phase::Active(SessionMode::Caller));
        assert!(!status.transition_in_flight);
        assert_eq!(status.last_outcome.as_deref(), Some("Failed: cancelled by user"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_outcome_is_reported_to_next_caller_session() {
        let h = started().await;
        h.connector.emit(SessionEvent::ToolCalls(booking_calls()));
        advance(3600).await;
        h.connector.emit(SessionEvent::ToolCalls(vec![call(
            "r1",
            REPORT_BOOKING_OUTCOME,
            json!({"success": false, "notes": "Closed on Sundays"}),
        )]));
        advance(2100).await;

        assert!(h
            .connector
            .setup(2)
            .system_instruction
            .contains("Failed: Closed on Sundays"));
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.booking.unwrap().status, BookingStatus::Failed);
        assert!(status.appointment.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transcripts_land_in_the_message_log() {
        let h = started().await;
        let mut rx = h.handle.subscribe_messages();
        h.connector.emit(SessionEvent::Transcript {
            speaker: Speaker::User,
            text: "find a salon".into(),
        });
        h.connector.emit(SessionEvent::Transcript {
            speaker: Speaker::Model,
            text: "Sure".into(),
        });
        settle().await;

        let first = rx.recv().await.unwrap();
        assert_eq!((first.role, first.text.as_str()), (Role::User, "find a salon"));
        assert_eq!(rx.recv().await.unwrap().role, Role::Assistant);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_shutdown() {
        let h = started().await;
        h.handle.shutdown().unwrap();
        settle().await;
        assert!(h.connector.session(0).is_closed());
        assert!(matches!(h.handle.status().await, Err(SessionError::Stopped)));
    }
}
