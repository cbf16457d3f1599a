//! Sola - voice booking assistant on a dual-mode live session
//!
//! One live model session talks to the user (caller mode) and, once a
//! provider is chosen, is swapped for a session that talks to the
//! provider's receptionist. The [`orchestrator`] owns that swap; the rest of
//! the crate supplies the pieces it wires together.

#![forbid(unsafe_code)]

/// Microphone capture, speaker playback and the per-session audio pipeline
pub mod audio;
/// Booking record, status transitions and the derived appointment
pub mod booking;
/// Calendar sink for confirmed appointments
pub mod calendar;
/// PCM16 encode/decode and level metering
pub mod codec;
pub mod config;
pub mod error;
/// Gemini Live wire protocol
pub mod gemini;
/// WebSocket connector implementing the live session seam
pub mod gemini_client;
pub mod orchestrator;
/// Place search
pub mod places;
/// Per-mode system instructions and tool declarations
pub mod prompts;
pub mod session;
/// Tool-call dispatcher
pub mod tools;
/// Observable state for a front end
pub mod view;

#[cfg(test)]
mod testing;

pub use error::{Result, SessionError};
pub use orchestrator::{Orchestrator, OrchestratorHandle, Phase, Status};
pub use session::SessionMode;
