//! Realtime streaming module for the voice/chat session
//!
//! This module provides the wire protocol, the socket abstraction and the
//! transcript accumulator used by the connection manager.
//!
//! # Architecture
//!
//! ```text
//! Connector ──▶ Socket { sink, stream }
//!                  │          │
//!     ClientMessage┘          └▶ SocketSignal ──▶ ServerMessage
//!                                                     │
//!                                                     ▼
//!                                           MessageAccumulator
//!                                              (transcript)
//! ```

mod message_accumulator;
mod protocol;
mod transport;

pub use message_accumulator::{Message, MessageAccumulator, Role, Routed};
pub use protocol::{
    AuthHeaders, AuthParams, ClientMessage, ContentPart, ConversationItem, ErrorInfo,
    ServerMessage, SessionConfig, TranscriptionConfig, TurnDetection, VOICE_MESSAGE_PLACEHOLDER,
};
pub use transport::{Connector, FrameSink, FrameStream, Socket, SocketSignal, WsConnector};

/// Errors that can occur on the realtime transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamingError {
    /// Failed to establish the WebSocket connection
    #[error("Failed to connect to realtime endpoint: {0}")]
    ConnectionFailed(String),
    /// The endpoint URL could not be used
    #[error("Invalid realtime endpoint URL: {0}")]
    InvalidUrl(String),
    /// Connection handshake did not complete in time
    #[error("Connection timed out after {0}ms")]
    Timeout(u64),
    /// Failed to write a frame
    #[error("Failed to send frame: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = StreamingError::Timeout(10_000);
        assert!(err.to_string().contains("10000ms"));

        let err = StreamingError::SendFailed("broken pipe".to_string());
        assert!(err.to_string().contains("broken pipe"));
    }
}
