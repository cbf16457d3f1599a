//! Gemini Live API module
//!
//! Wire types for the BidiGenerateContent websocket protocol: the setup
//! message (instructions, tools, modality), realtime audio input, tool
//! responses, and the server messages that carry audio, transcripts and
//! function calls.

use crate::codec;
use crate::session::{
    FunctionDeclaration, SessionEvent, SessionSetup, Speaker, ToolCall, ToolResponse,
};
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;


/// Speech configuration selecting a prebuilt voice.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireFunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&FunctionDeclaration> for WireFunctionDeclaration {
    fn from(decl: &FunctionDeclaration) -> Self {
        Self {
            name: decl.name.clone(),
            description: decl.description.clone(),
            parameters: decl.parameters.clone(),
        }
    }
}

/// Empty marker object enabling a transcription stream.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct TranscriptionConfig {}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    pub fn new(config: &GeminiClientConfig, setup: &SessionSetup) -> Self {
        let generation_config = GenerationConfig {
            response_modalities: vec![setup.response_modality.as_str().to_string()],
            temperature: config.temperature,
            speech_config: config.voice.as_ref().map(|voice_name| SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice_name.clone(),
                    },
                },
            }),
        };
        let tools = if setup.tools.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: setup.tools.iter().map(Into::into).collect(),
            }]
        };

        Self {
            model: config.model.clone(),
            generation_config: Some(generation_config),
            system_instruction: Some(Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            }),
            tools,
            input_audio_transcription: Some(TranscriptionConfig::default()),
            output_audio_transcription: Some(TranscriptionConfig::default()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseMessage {
    pub function_responses: Vec<FunctionResponse>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponseMessage),
}

impl ClientMessage {
    pub fn audio(pcm: &[u8], sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                data: general_purpose::STANDARD.encode(pcm),
                mime_type: codec::mime_type(sample_rate),
            }),
            audio_stream_end: None,
        })
    }

    pub fn tool_response(response: ToolResponse) -> Self {
        ClientMessage::ToolResponse(ToolResponseMessage {
            function_responses: vec![FunctionResponse {
                id: response.id,
                name: response.name,
                response: serde_json::json!({ "result": response.result }),
            }],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(GeminiError::Serialization)
    }
}

/// Server -> client message. Exactly one field is set per message.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    pub tool_call_cancellation: Option<Value>,
    #[serde(default)]
    pub go_away: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
    #[serde(default)]
    pub interrupted: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Configuration for the Gemini connector
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub url: String,
    pub model: String,
    pub voice: Option<String>,
    pub temperature: Option<f32>,
    /// How long to wait for the socket to flush after asking it to close.
    pub close_timeout: Duration,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: None,
            temperature: None,
            close_timeout: Duration::from_secs(2),
        }
    }
}

impl GeminiClientConfig {
    /// Fill in the websocket URL for an API key.
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.url = format!(
            "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
            api_key
        );
        self
    }
}

/// Parse one server text frame into session events, in delivery order.
pub fn parse_server_message(text: &str) -> Result<Vec<SessionEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(SessionEvent::Open);
    }

    if let Some(content) = message.server_content {
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(SessionEvent::Transcript {
                speaker: Speaker::User,
                text: t.text,
            });
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(SessionEvent::Transcript {
                speaker: Speaker::Model,
                text: t.text,
            });
        }
        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else {
                continue;
            };
            match general_purpose::STANDARD.decode(&inline.data) {
                Ok(bytes) if !bytes.is_empty() => events.push(SessionEvent::Audio(bytes)),
                Ok(_) => {}
                Err(e) => warn!(
                    "Failed to decode inline data ({:?}): {:?}",
                    inline.mime_type, e
                ),
            }
        }
    }

    if let Some(tool_call) = message.tool_call {
        let calls: Vec<ToolCall> = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                args: call.args.unwrap_or_else(|| Value::Object(Default::default())),
            })
            .collect();
        if !calls.is_empty() {
            events.push(SessionEvent::ToolCalls(calls));
        }
    }

    if let Some(cancellation) = message.tool_call_cancellation {
        warn!("Tool call cancellation ignored: {}", cancellation);
    }

    if message.go_away.is_some() {
        events.push(SessionEvent::Closed("server sent goAway".to_string()));
    }

    Ok(events)
}
