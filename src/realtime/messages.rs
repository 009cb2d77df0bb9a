//! # Realtime Wire Messages
//!
//! JSON events exchanged with the hosted realtime service over its WebSocket.
//! Only the subset the bridge needs is modelled:
//!
//! ## Client → Service
//! - `session.update` - configure modalities and turn detection
//! - `input_audio_buffer.append` - base64 audio appended to the input buffer
//! - `input_audio_buffer.clear` / `input_audio_buffer.commit`
//! - `response.create` - ask for a response to the committed input
//!
//! ## Service → Client
//! - `response.output_text.delta` / `response.output_audio.delta`
//! - `response.completed`
//! - `error`
//! - anything else decodes to [`ServerEvent::Unknown`]

use base64::prelude::*;
use serde::{Deserialize, Serialize};

/// Session configuration sent with `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities ("audio", "text")
    pub modalities: Vec<String>,

    /// Turn detection policy
    pub turn_detection: TurnDetection,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Turn detection policy.
///
/// The bridge always uses `None`: the browser decides where a turn ends by
/// sending `stop`, never the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    None,
}

/// Events sent to the realtime service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64-encoded audio for the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Build an append event from raw audio bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }
}

/// Error payload carried by the `error` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Events received from the realtime service.
///
/// Both the current event names and their older beta spellings are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "response.output_text.delta", alias = "response.text.delta")]
    TextDelta { delta: String },

    /// Base64-encoded audio chunk
    #[serde(
        rename = "response.output_audio.delta",
        alias = "response.audio.delta"
    )]
    AudioDelta { delta: String },

    #[serde(rename = "response.completed", alias = "response.done")]
    ResponseCompleted,

    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(other)]
    Unknown,
}

/// Pull the `type` field out of a raw event, for logging events that decode
/// to [`ServerEvent::Unknown`].
pub fn event_kind(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "<untyped>".to_string())
}
