//! Remote conversation session seam.
//!
//! A [`LiveConnector`] opens one session per mode and hands back the send
//! half ([`LiveSession`]) plus a receiver of [`SessionEvent`]s. Sends are
//! synchronous enqueues so the capture callback never blocks on the network.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which role the live session is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Talks to the user and gathers the booking request.
    Caller,
    /// Patched into the "phone call" with the receptionist.
    ReceptionistFacing,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Caller => f.write_str("CALLER"),
            SessionMode::ReceptionistFacing => f.write_str("RECEPTIONIST_FACING"),
        }
    }
}

/// Response modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// A function the remote model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON-schema-like parameter object.
    pub parameters: Value,
}

/// Everything needed to open a session for one mode.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub mode: SessionMode,
    pub system_instruction: String,
    pub tools: Vec<FunctionDeclaration>,
    pub response_modality: ResponseModality,
}

/// A function invocation from the remote model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// The answer to one [`ToolCall`], correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

/// Inbound traffic from an open session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The remote acknowledged the session setup.
    Open,
    /// A PCM16 LE audio fragment at the output sample rate.
    Audio(Vec<u8>),
    /// One message worth of function calls, in arrival order.
    ToolCalls(Vec<ToolCall>),
    Transcript { speaker: Speaker, text: String },
    Closed(String),
    Error(String),
}

/// Send half of an open session.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Queue one block of PCM16 LE audio tagged with its sample rate.
    fn send_audio(&self, pcm: Vec<u8>, sample_rate: u32) -> Result<()>;

    fn send_tool_response(&self, response: ToolResponse) -> Result<()>;

    /// Close the session and wait for the transport to wind down.
    async fn close(&self) -> Result<()>;
}

pub struct LiveConnection {
    pub session: Arc<dyn LiveSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, setup: SessionSetup) -> Result<LiveConnection>;
}
