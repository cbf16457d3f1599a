//! Booking state store
//!
//! Holds the single in-flight booking record, the appointment derived from a
//! confirmed call, and the remembered outcome of the last call. Every write
//! goes through the status transition table and updates the synchronous
//! [`BookingMirror`] in the same step, so code running outside the
//! orchestrator task (timers, the handle) never observes a lagging copy.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Lifecycle of a booking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Negotiating,
    Confirmed,
    Failed,
}

impl BookingStatus {
    /// Whether the record can move from `self` to `next`.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Negotiating) | (Negotiating, Confirmed) | (Negotiating, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Failed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Negotiating => "negotiating",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The in-flight booking carried across the caller → receptionist handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    pub place_id: String,
    pub place_name: String,
    pub service: String,
    /// Calendar date, `YYYY-MM-DD`.
    pub date: String,
    /// Local time as spoken, usually `HH:MM`.
    pub time: String,
    pub status: BookingStatus,
}

impl BookingDetails {
    pub fn with_status(&self, status: BookingStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// A confirmed appointment. Immutable once created and kept even when the
/// booking record is reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub provider_id: String,
    pub provider_name: String,
    pub date_time: NaiveDateTime,
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    #[error("invalid booking transition {from} -> {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("no booking record")]
    NoBooking,

    #[error("a booking is already in progress for {0}")]
    BookingInProgress(String),
}

/// Synchronously readable shadow of the booking record.
#[derive(Debug, Clone, Default)]
pub struct BookingMirror {
    inner: Arc<RwLock<Option<BookingDetails>>>,
}

impl BookingMirror {
    pub fn snapshot(&self) -> Option<BookingDetails> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, value: Option<BookingDetails>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

/// Authoritative booking state, owned by the orchestrator task.
#[derive(Debug, Default)]
pub struct BookingStore {
    record: Option<BookingDetails>,
    appointment: Option<Appointment>,
    last_outcome: Option<String>,
    mirror: BookingMirror,
}

impl BookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&BookingDetails> {
        self.record.as_ref()
    }

    pub fn mirror(&self) -> BookingMirror {
        self.mirror.clone()
    }

    pub fn appointment(&self) -> Option<&Appointment> {
        self.appointment.as_ref()
    }

    /// Human-readable outcome of the most recent receptionist call.
    pub fn last_outcome(&self) -> Option<&str> {
        self.last_outcome.as_deref()
    }

    pub fn set_last_outcome(&mut self, outcome: impl Into<String>) {
        self.last_outcome = Some(outcome.into());
    }

    /// Replace the record, validating the status transition.
    ///
    /// A first record may start as pending or negotiating; afterwards only
    /// the edges in [`BookingStatus::can_transition_to`] are accepted.
    pub fn write(&mut self, next: BookingDetails) -> Result<&BookingDetails, BookingError> {
        match &self.record {
            None if !next.status.is_terminal() => {}
            None => {
                return Err(BookingError::InvalidTransition {
                    from: BookingStatus::Pending,
                    to: next.status,
                })
            }
            Some(current) if current.status.can_transition_to(next.status) => {}
            Some(current) => {
                return Err(BookingError::InvalidTransition {
                    from: current.status,
                    to: next.status,
                })
            }
        }
        debug!(
            "Booking {} -> {} ({})",
            self.record.as_ref().map(|r| r.status.to_string()).unwrap_or_else(|| "none".into()),
            next.status,
            next.place_name
        );
        self.mirror.set(Some(next.clone()));
        let stored: &BookingDetails = self.record.insert(next);
        Ok(stored)
    }

    /// Start a new booking lifecycle. A terminal record is reset first; a
    /// record that is still pending or negotiating blocks the new one.
    pub fn begin(&mut self, next: BookingDetails) -> Result<&BookingDetails, BookingError> {
        if let Some(current) = &self.record {
            if !current.status.is_terminal() {
                return Err(BookingError::BookingInProgress(current.place_name.clone()));
            }
            self.reset();
        }
        self.write(next)
    }

    /// Read-modify-write of the current record through the transition table.
    pub fn update<F>(&mut self, f: F) -> Result<BookingDetails, BookingError>
    where
        F: FnOnce(&mut BookingDetails),
    {
        let mut next = self.record.clone().ok_or(BookingError::NoBooking)?;
        f(&mut next);
        self.write(next).cloned()
    }

    /// Clear the record. The appointment is independent and survives.
    pub fn reset(&mut self) {
        self.record = None;
        self.mirror.set(None);
    }

    pub fn set_appointment(&mut self, appointment: Appointment) {
        self.appointment = Some(appointment);
    }

    /// User cancellation: negotiating → failed, derived appointment dropped.
    pub fn cancel(&mut self) -> Result<BookingDetails, BookingError> {
        let cancelled = self.update(|d| d.status = BookingStatus::Failed)?;
        self.appointment = None;
        self.last_outcome = Some("Failed: cancelled by user".to_string());
        info!("Booking with {} cancelled", cancelled.place_name);
        Ok(cancelled)
    }
}

/// Parse a `YYYY-MM-DD` date and a spoken time into a local timestamp.
///
/// The date must parse. A time that does not parse falls back to 09:00.
pub fn resolve_date_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let time = parse_time(time).unwrap_or_else(default_time);
    Some(date.and_time(time))
}

fn default_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}

/// Accepts `HH:MM`, `H:MM`, `h:mm am/pm` and `h:mmpm`.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let s = text.trim().to_ascii_lowercase();
    let (clock, meridiem) = if let Some(rest) = s.strip_suffix("am") {
        (rest.trim_end(), Some(false))
    } else if let Some(rest) = s.strip_suffix("pm") {
        (rest.trim_end(), Some(true))
    } else {
        (s.as_str(), None)
    };

    let (h, m) = clock.split_once(':')?;
    if m.len() != 2 || h.is_empty() || h.len() > 2 {
        return None;
    }
    let mut hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;

    match meridiem {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            if pm && hour < 12 {
                hour += 12;
            } else if !pm && hour == 12 {
                hour = 0;
            }
        }
        None if hour > 23 => return None,
        None => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}
