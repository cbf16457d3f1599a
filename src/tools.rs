//! Tool-call dispatcher
//!
//! Routes each function call from the live session by `(mode, name)`,
//! applies its side effect to the booking store and the view, and produces
//! exactly one correlated [`ToolResponse`]. `initiateCall` and
//! `reportBookingOutcome` additionally ask the orchestrator to switch mode.

use crate::booking::{resolve_date_time, Appointment, BookingDetails, BookingStatus, BookingStore};
use crate::calendar::CalendarSink;
use crate::error::{Result, SessionError};
use crate::places::{Place, PlaceSearch};
use crate::prompts::{FIND_PLACES, INITIATE_CALL, REPORT_BOOKING_OUTCOME, SELECT_PROVIDER};
use crate::session::{SessionMode, ToolCall, ToolResponse};
use crate::view::{SessionView, ViewMode};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const SUCCESS_OUTCOME: &str = "Success: Booking confirmed.";
const DEFAULT_FAILURE_REASON: &str = "Receptionist unavailable";
const UNRESOLVED_TIME_REASON: &str = "the agreed time could not be understood";

/// A mode switch requested by a tool handler. The booking that caused it is
/// carried along so the reconnect never depends on a later read.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub target: SessionMode,
    pub booking: Option<BookingDetails>,
}

/// Result of one dispatched call.
#[derive(Debug)]
pub struct Dispatched {
    pub response: ToolResponse,
    pub transition: Option<TransitionRequest>,
}

type Handled = (Value, Option<TransitionRequest>);

pub struct Dispatcher {
    search: Arc<dyn PlaceSearch>,
    calendar: Arc<dyn CalendarSink>,
    view: SessionView,
    places: Vec<Place>,
    selected_place_id: Option<String>,
}

impl Dispatcher {
    pub fn new(search: Arc<dyn PlaceSearch>, calendar: Arc<dyn CalendarSink>, view: SessionView) -> Self {
        Self {
            search,
            calendar,
            view,
            places: Vec::new(),
            selected_place_id: None,
        }
    }

    pub fn places(&self) -> &[Place] {
        &self.places
    }

    pub fn selected_place_id(&self) -> Option<&str> {
        self.selected_place_id.as_deref()
    }

    /// Execute one call. Never fails: handler errors become an `error` result.
    pub async fn dispatch(
        &mut self,
        mode: SessionMode,
        call: &ToolCall,
        store: &mut BookingStore,
    ) -> Dispatched {
        info!("Tool call {} [{}] in {} mode: {}", call.name, call.id, mode, call.args);

        let handled = match (mode, call.name.as_str()) {
            (SessionMode::Caller, FIND_PLACES) => Ok(self.find_places(&call.args).await),
            (SessionMode::Caller, SELECT_PROVIDER) => self.select_provider(&call.args),
            (SessionMode::Caller, INITIATE_CALL) => self.initiate_call(&call.args, store),
            (SessionMode::ReceptionistFacing, REPORT_BOOKING_OUTCOME) => {
                self.report_outcome(&call.args, store)
            }
            (_, FIND_PLACES | SELECT_PROVIDER | INITIATE_CALL | REPORT_BOOKING_OUTCOME) => Err(
                SessionError::ToolResolution(format!("{} is not available in {} mode", call.name, mode)),
            ),
            (_, other) => Err(SessionError::ToolResolution(format!("unknown tool {}", other))),
        };

        let (result, transition) = match handled {
            Ok(handled) => handled,
            Err(e) => {
                warn!("Tool call {} failed: {}", call.name, e);
                (json!({ "error": e.to_string() }), None)
            }
        };

        Dispatched {
            response: ToolResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                result,
            },
            transition,
        }
    }

    async fn find_places(&mut self, args: &Value) -> Handled {
        let query = arg_str(args, "query").unwrap_or_default();
        self.view.notice(format!("Searching for \"{}\"...", query));

        let places = match self.search.search(&query).await {
            Ok(places) => places,
            Err(e) => {
                warn!("Place search failed: {}", e);
                self.view.notice(format!("Place search failed: {}", e));
                Vec::new()
            }
        };
        info!("findPlaces {:?} -> {} places", query, places.len());

        let selection_gone = self
            .selected_place_id
            .as_ref()
            .is_some_and(|id| !places.iter().any(|p| &p.id == id));
        if selection_gone {
            self.selected_place_id = None;
        }
        self.places = places;

        let listed: Vec<Value> = self
            .places
            .iter()
            .map(|p| json!({ "id": p.id, "name": p.name, "address": p.address, "rating": p.rating }))
            .collect();
        let selected = self.selected_place_id.clone();
        let places = self.places.clone();
        self.view.update(|v| {
            v.places = places;
            v.selected_place_id = selected;
            v.view_mode = ViewMode::Map;
        });

        (json!({ "foundCount": listed.len(), "places": listed }), None)
    }

    fn select_provider(&mut self, args: &Value) -> Result<Handled> {
        let id = arg_str(args, "providerId")
            .ok_or_else(|| SessionError::ToolResolution("providerId is required".to_string()))?;
        let place = self
            .find_place(&id)
            .cloned()
            .ok_or_else(|| SessionError::ToolResolution(format!("unknown provider id {}", id)))?;

        self.selected_place_id = Some(place.id.clone());
        let selected = place.id.clone();
        self.view.update(|v| v.selected_place_id = Some(selected));
        self.view.notice(format!("Selected {}", place.name));

        Ok((
            json!({ "selectedName": place.name, "phoneNumber": place.phone_number }),
            None,
        ))
    }

    fn initiate_call(&mut self, args: &Value, store: &mut BookingStore) -> Result<Handled> {
        let requested = arg_str(args, "placeId");
        let place = self
            .selected_place_id
            .as_deref()
            .and_then(|id| self.find_place(id))
            .or_else(|| requested.as_deref().and_then(|id| self.find_place(id)))
            .or_else(|| self.places.first())
            .cloned()
            .ok_or_else(|| SessionError::ToolResolution("no known place to call".to_string()))?;

        if requested.as_deref().is_some_and(|id| id != place.id) {
            warn!(
                "initiateCall placeId {:?} not used, calling {} ({})",
                requested, place.name, place.id
            );
        }

        let details = BookingDetails {
            place_id: place.id.clone(),
            place_name: place.name.clone(),
            service: arg_str(args, "service").unwrap_or_default(),
            date: arg_str(args, "date").unwrap_or_default(),
            time: arg_str(args, "time").unwrap_or_default(),
            status: BookingStatus::Negotiating,
        };
        let booking = store.begin(details)?.clone();

        self.view.update(|v| v.view_mode = ViewMode::Phone);
        self.view.notice(format!(
            "Calling {} to book {} on {} at {}...",
            booking.place_name, booking.service, booking.date, booking.time
        ));

        Ok((
            json!({ "status": "switching" }),
            Some(TransitionRequest {
                target: SessionMode::ReceptionistFacing,
                booking: Some(booking),
            }),
        ))
    }

    /// Always ends the call: every outcome returns `ended` and asks for the
    /// caller session, even when the record cannot be confirmed.
    fn report_outcome(&mut self, args: &Value, store: &mut BookingStore) -> Result<Handled> {
        let success = arg_bool(args, "success").unwrap_or(false);

        match store.current().cloned() {
            Some(details) if details.status == BookingStatus::Negotiating => {
                let failure = if success {
                    match self.confirm(args, details, store) {
                        Ok(()) => None,
                        Err(e) => {
                            warn!("Could not confirm booking: {}", e);
                            Some(UNRESOLVED_TIME_REASON.to_string())
                        }
                    }
                } else {
                    Some(failure_reason(args))
                };
                if let Some(reason) = failure {
                    if let Err(e) = store.update(|d| d.status = BookingStatus::Failed) {
                        warn!("Could not mark booking failed: {}", e);
                    }
                    self.record_failure(store, &reason);
                }
            }
            Some(details) if details.status.is_terminal() => {
                info!(
                    "reportBookingOutcome after booking with {} was already {}",
                    details.place_name, details.status
                );
            }
            _ => {
                if success {
                    warn!("reportBookingOutcome success without a negotiating booking");
                }
                self.record_failure(store, &failure_reason(args));
            }
        }

        Ok((
            json!({ "status": "ended" }),
            Some(TransitionRequest {
                target: SessionMode::Caller,
                booking: None,
            }),
        ))
    }

    fn record_failure(&self, store: &mut BookingStore, reason: &str) {
        self.view.notice(format!("Booking not made: {}", reason));
        store.set_last_outcome(format!("Failed: {}", reason));
    }

    /// Confirm with the reported slot. An override that does not parse falls
    /// back to the slot that was requested.
    fn confirm(&mut self, args: &Value, details: BookingDetails, store: &mut BookingStore) -> Result<()> {
        let date = arg_str(args, "finalDate")
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| details.date.clone());
        let time = arg_str(args, "finalTime")
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| details.time.clone());

        let (date, time, date_time) = match resolve_date_time(&date, &time) {
            Some(date_time) => (date, time, date_time),
            None => {
                warn!(
                    "Reported slot {} {} unresolvable, keeping {} {}",
                    date, time, details.date, details.time
                );
                let date_time = resolve_date_time(&details.date, &details.time).ok_or_else(|| {
                    SessionError::ToolResolution(format!(
                        "cannot resolve appointment time {} {}",
                        details.date, details.time
                    ))
                })?;
                (details.date, details.time, date_time)
            }
        };

        let confirmed = store.update(|d| {
            d.date = date;
            d.time = time;
            d.status = BookingStatus::Confirmed;
        })?;

        let appointment = Appointment {
            id: Utc::now().timestamp_millis().to_string(),
            provider_id: confirmed.place_id.clone(),
            provider_name: confirmed.place_name.clone(),
            date_time,
            service_type: confirmed.service.clone(),
        };
        store.set_appointment(appointment.clone());
        store.set_last_outcome(SUCCESS_OUTCOME);

        self.view.update(|v| v.view_mode = ViewMode::Calendar);
        self.view.notice(format!(
            "Booking confirmed: {} at {} on {}",
            appointment.service_type,
            appointment.provider_name,
            appointment.date_time.format("%Y-%m-%d %H:%M")
        ));
        self.add_to_calendar(appointment);
        Ok(())
    }

    /// Fire-and-forget; a failure only produces a notice.
    fn add_to_calendar(&self, appointment: Appointment) {
        let calendar = self.calendar.clone();
        let view = self.view.clone();
        tokio::spawn(async move {
            match calendar.insert(&appointment).await {
                Ok(entry) => {
                    info!("Calendar entry {} created", entry.id);
                    view.notice(format!(
                        "Added to calendar: {}",
                        entry.link.unwrap_or(entry.id)
                    ));
                }
                Err(e) => {
                    warn!("Calendar insert failed: {}", e);
                    view.notice(format!("Could not add the appointment to the calendar: {}", e));
                }
            }
        });
    }

    fn find_place(&self, id: &str) -> Option<&Place> {
        self.places.iter().find(|p| p.id == id)
    }
}

fn failure_reason(args: &Value) -> String {
    arg_str(args, "notes")
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string())
}

/// String argument, accepting numbers the model sometimes sends for ids.
fn arg_str(args: &Value, key: &str) -> Option<String> {
    match args.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn arg_bool(args: &Value, key: &str) -> Option<bool> {
    match args.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
