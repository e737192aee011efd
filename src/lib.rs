//! voicelink: realtime voice/chat session client
//!
//! A [`ConnectionManager`] keeps a WebSocket session to a streaming backend
//! alive across network interruptions, assembles streamed transcript
//! fragments into role-tagged messages, and sends text or recorded audio
//! turns. [`AudioCaptureController`] records from the microphone alongside it.

pub mod audio;
pub mod connection;
pub mod diagnostics;
mod effects;
pub mod reconnect;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use audio::{AudioBlob, AudioCaptureController, AudioError, AudioPlayback, NullPlayback};
pub use connection::{ConnectionManager, NoticeReceiver, SessionError, SessionStatus};
pub use diagnostics::{Diagnostics, DiagnosticsSummary};
pub use reconnect::{ReconnectAttempt, ReconnectPolicy};
pub use settings::{Endpoint, SessionSettings, SettingsError};
pub use state_machine::{ConnectionState, Notice};
pub use streaming::{
    ClientMessage, Connector, Message, Role, ServerMessage, StreamingError, WsConnector,
};
