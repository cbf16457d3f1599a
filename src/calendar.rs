//! Calendar insertion collaborator.
//!
//! The shipped sink appends one `VEVENT` per confirmed appointment to a local
//! iCalendar file; anything that can turn an [`Appointment`] into an entry id
//! and link can stand in for it.

use crate::booking::Appointment;
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

/// Length given to every booked appointment.
pub const APPOINTMENT_MINUTES: i64 = 60;

/// Where an inserted appointment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub id: String,
    pub link: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("calendar rejected event: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait CalendarSink: Send + Sync {
    async fn insert(&self, appointment: &Appointment) -> Result<CalendarEntry, CalendarError>;
}

/// A calendar event derived from an appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub summary: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl CalendarEvent {
    pub fn from_appointment(appointment: &Appointment) -> Self {
        let summary = if appointment.provider_name.is_empty() {
            appointment.service_type.clone()
        } else {
            format!("{} at {}", appointment.service_type, appointment.provider_name)
        };
        Self {
            summary,
            start: appointment.date_time,
            end: appointment.date_time + Duration::minutes(APPOINTMENT_MINUTES),
        }
    }

    fn to_ics(&self, uid: &str) -> String {
        const FORMAT: &str = "%Y%m%dT%H%M%S";
        format!(
            "BEGIN:VEVENT\r\nUID:{}\r\nDTSTAMP:{}\r\nDTSTART:{}\r\nDTEND:{}\r\nSUMMARY:{}\r\nDESCRIPTION:Booked by phone\r\nEND:VEVENT\r\n",
            uid,
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            self.start.format(FORMAT),
            self.end.format(FORMAT),
            escape_text(&self.summary),
        )
    }
}

fn escape_text(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}

/// Appends appointments to an `.ics` file, one `VCALENDAR` block per event.
pub struct IcsCalendar {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IcsCalendar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CalendarSink for IcsCalendar {
    async fn insert(&self, appointment: &Appointment) -> Result<CalendarEntry, CalendarError> {
        let event = CalendarEvent::from_appointment(appointment);
        let uid = format!("{}@sola", appointment.id);
        let block = format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//sola//booking//EN\r\n{}END:VCALENDAR\r\n",
            event.to_ics(&uid)
        );

        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(block.as_bytes())
        })
        .await
        .map_err(|e| CalendarError::Rejected(e.to_string()))??;

        info!("Appointment {} written to {}", uid, self.path.display());
        let absolute = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        Ok(CalendarEntry {
            id: uid,
            link: Some(format!("file://{}", absolute.display())),
        })
    }
}
