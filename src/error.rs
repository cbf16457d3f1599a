//! Error taxonomy for the live session core.
//!
//! Every variant maps to one recovery policy: precondition, device and
//! transport failures end the connect attempt (the orchestrator falls back to
//! idle), tool resolution failures become an error result for the remote
//! caller, and collaborator failures degrade to a notice.

use crate::booking::BookingError;
use crate::gemini::GeminiError;

/// Errors surfaced by the orchestrator and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A connect attempt lacked something it needs, e.g. a booking record.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Microphone or speaker could not be acquired.
    #[error("audio device error: {0}")]
    Device(String),

    /// The remote conversation session failed or closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A tool call referenced something that could not be resolved.
    #[error("tool resolution error: {0}")]
    ToolResolution(String),

    /// Place search or calendar insertion failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error(transparent)]
    Booking(#[from] BookingError),

    /// The orchestrator task is no longer running.
    #[error("orchestrator has shut down")]
    Stopped,
}

impl From<GeminiError> for SessionError {
    fn from(e: GeminiError) -> Self {
        SessionError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
