//! Realtime session protocol types
//!
//! This module defines the JSON frames exchanged with the streaming backend
//! over the WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the endpoint (credential in the `apikey` query parameter)
//! 2. Send `session.update` to initialize the session
//! 3. Send `auth` carrying the credential as headers
//! 4. Send `ping` on a fixed interval, expect `pong`
//! 5. Send user turns via `conversation.item.create` followed by `response.create`
//! 6. Receive `response.audio_transcript.delta` / `response.audio.delta` fragments

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::message_accumulator::Role;

/// Session configuration sent once the socket opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Output modalities requested from the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice used for audio responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Turn detection - omitted for manual control
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: None,
            voice: None,
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
            turn_detection: Some(TurnDetection {
                detection_type: "server_vad".to_string(),
            }),
        }
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Model to use for transcription
    pub model: String,
}

/// Turn detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Type of turn detection
    #[serde(rename = "type")]
    pub detection_type: String,
}

/// Error information attached to an `error` frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorInfo {
    /// Error type/code
    #[serde(rename = "type", default)]
    pub error_type: String,

    /// Error code
    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Client Messages (sent TO the backend)
// ============================================================================

/// Headers carried by the auth frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthHeaders {
    pub apikey: String,
    #[serde(rename = "Authorization")]
    pub authorization: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthParams {
    pub headers: AuthHeaders,
}

/// One content part of a conversation item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },

    /// Base64-encoded audio blob
    #[serde(rename = "input_audio")]
    InputAudio { audio: String },
}

/// A conversation item created by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

/// Messages sent from the client to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Initialize/update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Authenticate the channel
    #[serde(rename = "auth")]
    Auth { params: AuthParams },

    /// Add an item to the conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Ask the backend to respond ("go" frame)
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Keepalive
    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    /// Create a session initialization message
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate { session }
    }

    /// Create the auth frame for a credential
    pub fn auth(credential: &str) -> Self {
        Self::Auth {
            params: AuthParams {
                headers: AuthHeaders {
                    apikey: credential.to_string(),
                    authorization: format!("Bearer {}", credential),
                },
            },
        }
    }

    /// Create a user text message
    pub fn user_text(text: &str) -> Self {
        Self::user_item(ContentPart::InputText {
            text: text.to_string(),
        })
    }

    /// Create a user audio message from an encoded blob (e.g. WAV bytes)
    pub fn user_audio(bytes: &[u8]) -> Self {
        Self::user_item(ContentPart::InputAudio {
            audio: STANDARD.encode(bytes),
        })
    }

    fn user_item(part: ContentPart) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem {
                item_type: "message".to_string(),
                role: Role::User,
                content: vec![part],
            },
        }
    }

    /// Whether this message is a user turn that must be followed by `response.create`
    pub fn is_user_message(&self) -> bool {
        matches!(
            self,
            ClientMessage::ConversationItemCreate { item } if item.role == Role::User
        )
    }

    /// Transcript text for a user message
    ///
    /// Text parts are joined; audio-only messages yield a placeholder.
    pub fn transcript_text(&self) -> Option<String> {
        let ClientMessage::ConversationItemCreate { item } = self else {
            return None;
        };
        if item.role != Role::User {
            return None;
        }

        let text: Vec<&str> = item
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::InputText { text } => Some(text.as_str()),
                ContentPart::InputAudio { .. } => None,
            })
            .collect();

        if text.is_empty() {
            Some(VOICE_MESSAGE_PLACEHOLDER.to_string())
        } else {
            Some(text.join("\n"))
        }
    }

    /// Short name used in logs and diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionUpdate { .. } => "session.update",
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::ConversationItemCreate { .. } => "conversation.item.create",
            ClientMessage::ResponseCreate => "response.create",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Transcript content recorded for a user turn that only carried audio
pub const VOICE_MESSAGE_PLACEHOLDER: &str = "[voice message]";

// ============================================================================
// Server Messages (received FROM the backend)
// ============================================================================

/// Messages received from the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Auth frame accepted
    #[serde(rename = "auth.ack")]
    AuthAck,

    /// Session was created
    #[serde(rename = "session.created")]
    SessionCreated,

    /// Session initialization acknowledged
    #[serde(rename = "session.updated")]
    SessionUpdated,

    /// `response.create` acknowledged
    #[serde(rename = "response.created")]
    ResponseCreated,

    /// Base64 audio fragment of the assistant response
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// Text fragment of the assistant response transcript
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    /// Assistant transcript finished for this turn
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },

    /// Server-reported error
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },

    /// Keepalive reply
    #[serde(rename = "pong")]
    Pong,

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Extract the human-readable message of an error frame
    pub fn error_message(&self) -> Option<String> {
        match self {
            ServerMessage::Error { message, error } => Some(
                message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .or_else(|| error.as_ref().map(|e| e.message.clone()))
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "Unknown server error".to_string()),
            ),
            _ => None,
        }
    }

    /// Extract transcript delta if this is a delta message
    pub fn transcript_delta(&self) -> Option<&str> {
        match self {
            ServerMessage::TranscriptDelta { delta } => Some(delta),
            _ => None,
        }
    }

    /// Decode the audio payload of an audio delta
    pub fn audio_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            ServerMessage::AudioDelta { delta } => Some(STANDARD.decode(delta)),
            _ => None,
        }
    }

    /// Short name used in logs and diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthAck => "auth.ack",
            ServerMessage::SessionCreated => "session.created",
            ServerMessage::SessionUpdated => "session.updated",
            ServerMessage::ResponseCreated => "response.created",
            ServerMessage::AudioDelta { .. } => "response.audio.delta",
            ServerMessage::TranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerMessage::TranscriptDone { .. } => "response.audio_transcript.done",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
            ServerMessage::Unknown => "unknown",
        }
    }
}
