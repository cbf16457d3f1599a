//! System instructions and tool declarations for the two session modes.

use crate::booking::BookingDetails;
use crate::session::{FunctionDeclaration, ResponseModality, SessionMode, SessionSetup};
use serde_json::json;

pub const FIND_PLACES: &str = "findPlaces";
pub const SELECT_PROVIDER: &str = "selectProvider";
pub const INITIATE_CALL: &str = "initiateCall";
pub const REPORT_BOOKING_OUTCOME: &str = "reportBookingOutcome";

/// Setup for the user-facing assistant session.
pub fn caller_setup(last_outcome: Option<&str>) -> SessionSetup {
    SessionSetup {
        mode: SessionMode::Caller,
        system_instruction: caller_instruction(last_outcome),
        tools: caller_tools(),
        response_modality: ResponseModality::Audio,
    }
}

/// Setup for the session that places the call to `booking.place_name`.
pub fn receptionist_setup(booking: &BookingDetails) -> SessionSetup {
    SessionSetup {
        mode: SessionMode::ReceptionistFacing,
        system_instruction: receptionist_instruction(booking),
        tools: receptionist_tools(),
        response_modality: ResponseModality::Audio,
    }
}

pub fn caller_instruction(last_outcome: Option<&str>) -> String {
    let mut text = String::from(
        "You are Sola, a personal booking assistant talking with the user. \
Speak warmly and keep replies short; a casual mix of English and Tamil is welcome.\n\n\
What to do:\n\
- Find services the user asks for (salon, doctor, and so on) with findPlaces.\n\
- When the user picks one, record it with selectProvider.\n\
- Before any booking you need the service, the date and the time. Ask for whatever is missing.\n\
- With all of that in hand, call initiateCall. That hands the conversation over to the phone call.\n\n\
Rules:\n\
- You know the phone numbers of the places you found.\n\
- Never act out the phone call yourself here; initiateCall is the only way to dial.\n",
    );
    if let Some(outcome) = last_outcome {
        text.push_str(&format!(
            "\nThe last booking call ended with: {}. Tell the user how it went.\n",
            outcome
        ));
    }
    text
}

pub fn receptionist_instruction(booking: &BookingDetails) -> String {
    format!(
        "You are Sola and you have just dialed {place}. The line is open and the person \
answering is the receptionist.\n\n\
What to do:\n\
- Speak first, straight away. Open with something like \"Vanakkam, is this {place}?\"\n\
- Ask to book {service} on {date} at {time}.\n\
- Stay polite. If that slot is not available, ask what else they can offer.\n\
- As soon as a time is agreed, or the booking is clearly refused, call reportBookingOutcome.\n\n\
Address the receptionist as Sir or Madam, in a natural, slightly formal phone manner.\n",
        place = booking.place_name,
        service = booking.service,
        date = booking.date,
        time = booking.time,
    )
}

pub fn caller_tools() -> Vec<FunctionDeclaration> {
    vec![
        FunctionDeclaration {
            name: FIND_PLACES.to_string(),
            description: "Search for nearby places such as salons or doctors.".to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "query": {"type": "STRING", "description": "What to search for, e.g. 'salon nearby'"}
                },
                "required": ["query"]
            }),
        },
        FunctionDeclaration {
            name: SELECT_PROVIDER.to_string(),
            description: "Select one provider from the search results.".to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "providerId": {"type": "STRING", "description": "Id of the chosen provider"}
                },
                "required": ["providerId"]
            }),
        },
        FunctionDeclaration {
            name: INITIATE_CALL.to_string(),
            description: "Hand over to the phone session and call the provider's receptionist."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "placeId": {"type": "STRING"},
                    "service": {"type": "STRING", "description": "Service to book"},
                    "date": {"type": "STRING", "description": "YYYY-MM-DD"},
                    "time": {"type": "STRING", "description": "HH:MM"}
                },
                "required": ["placeId", "service", "date", "time"]
            }),
        },
    ]
}

pub fn receptionist_tools() -> Vec<FunctionDeclaration> {
    vec![FunctionDeclaration {
        name: REPORT_BOOKING_OUTCOME.to_string(),
        description: "Report how the phone call ended.".to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "success": {"type": "BOOLEAN"},
                "finalDate": {"type": "STRING", "description": "Agreed date, YYYY-MM-DD"},
                "finalTime": {"type": "STRING", "description": "Agreed time, HH:MM"},
                "notes": {"type": "STRING", "description": "Anything the receptionist said worth keeping"}
            },
            "required": ["success"]
        }),
    }]
}
