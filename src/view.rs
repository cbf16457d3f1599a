//! Observable session surface for presentation layers.

use crate::booking::{Appointment, BookingDetails};
use crate::places::Place;
use crate::session::SessionMode;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One transcript/log entry.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Local>,
}

/// Which panel a presentation layer should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Map,
    Phone,
    Calendar,
}

#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub mode: Option<SessionMode>,
    pub active: bool,
    pub view_mode: ViewMode,
    pub places: Vec<Place>,
    pub selected_place_id: Option<String>,
    pub booking: Option<BookingDetails>,
    pub appointment: Option<Appointment>,
    pub messages: Vec<Message>,
}

/// Live input level, written from the capture callback without locking.
#[derive(Debug, Clone, Default)]
pub struct VolumeMeter(Arc<AtomicU32>);

impl VolumeMeter {
    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Shared handle to the view state plus a broadcast of appended messages.
#[derive(Clone)]
pub struct SessionView {
    state: Arc<Mutex<ViewState>>,
    messages_tx: broadcast::Sender<Message>,
    volume: VolumeMeter,
}

impl SessionView {
    pub fn new() -> Self {
        let (messages_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(ViewState::default())),
            messages_tx,
            volume: VolumeMeter::default(),
        }
    }

    pub fn volume(&self) -> VolumeMeter {
        self.volume.clone()
    }

    pub fn snapshot(&self) -> ViewState {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.messages_tx.subscribe()
    }

    pub fn update<F: FnOnce(&mut ViewState)>(&self, f: F) {
        f(&mut self.lock());
    }

    pub fn push(&self, role: Role, text: impl Into<String>) {
        let message = {
            let mut state = self.lock();
            let message = Message {
                id: state.messages.len() as u64,
                role,
                text: text.into(),
                timestamp: Local::now(),
            };
            state.messages.push(message.clone());
            message
        };
        // No subscribers is fine.
        let _ = self.messages_tx.send(message);
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.push(Role::System, text);
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SessionView {
    fn default() -> Self {
        Self::new()
    }
}
