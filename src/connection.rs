//! Caller-facing handle to a realtime session
//!
//! [`ConnectionManager`] owns a background session loop (see `effects.rs`)
//! and talks to it over a channel. State and transcript are published through
//! `watch` channels so reads never wait on the loop; user-visible conditions
//! arrive on the [`NoticeReceiver`] returned by [`ConnectionManager::spawn`].

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::audio::{AudioBlob, AudioPlayback, NullPlayback};
use crate::diagnostics::{Diagnostics, DiagnosticsSummary};
use crate::effects::{Command, Input, Outputs, SessionLoop};
use crate::reconnect::ReconnectAttempt;
use crate::settings::SessionSettings;
use crate::state_machine::{ConnectionState, Notice};
use crate::streaming::{ClientMessage, Connector, Message, MessageAccumulator, StreamingError};

/// Receives [`Notice`]s raised by the session
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,
    #[error("Session has shut down")]
    SessionClosed,
    #[error("Failed to encode frame: {0}")]
    Encode(String),
    #[error("Send failed: {0}")]
    Send(#[from] StreamingError),
}

/// Snapshot of the connection published to observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub attempt: ReconnectAttempt,
}

/// Handle to one realtime session.
/// Dropping it closes the connection and stops the session loop.
pub struct ConnectionManager {
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<SessionStatus>,
    transcript: watch::Receiver<Vec<Message>>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start a session loop on the current tokio runtime. Nothing connects
    /// until [`connect`](Self::connect) is called.
    pub fn spawn(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
    ) -> (Self, NoticeReceiver) {
        Self::spawn_with_playback(settings, connector, Box::new(NullPlayback::default()))
    }

    /// Like [`spawn`](Self::spawn), routing assistant audio to `playback`
    pub fn spawn_with_playback(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        playback: Box<dyn AudioPlayback>,
    ) -> (Self, NoticeReceiver) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (transcript_tx, transcript_rx) = watch::channel(Vec::new());
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let diagnostics = Arc::new(Mutex::new(Diagnostics::new()));

        let accumulator = MessageAccumulator::with_playback(settings.instructions.clone(), playback);
        let session = SessionLoop::new(
            settings,
            connector,
            accumulator,
            Outputs {
                status: status_tx,
                transcript: transcript_tx,
                notices: notice_tx,
                diagnostics: diagnostics.clone(),
            },
            inputs_tx.clone(),
            inputs_rx,
        );
        let task = tokio::spawn(session.run());

        let manager = Self {
            inputs: inputs_tx,
            status: status_rx,
            transcript: transcript_rx,
            diagnostics,
            task: Some(task),
        };
        (manager, notice_rx)
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.inputs
            .send(Input::Command(command))
            .map_err(|_| SessionError::SessionClosed)
    }

    /// Open the connection. No-op while connecting, open, or waiting to reconnect.
    pub fn connect(&self) -> Result<(), SessionError> {
        self.command(Command::Connect)
    }

    /// Send a pre-shaped message. User turns are followed by `response.create`.
    pub async fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Open {
            return Err(SessionError::NotConnected);
        }

        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { message, reply })?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.send(ClientMessage::user_text(text)).await
    }

    /// Send a finished recording as a user audio turn
    pub async fn send_recording(&self, blob: &AudioBlob) -> Result<(), SessionError> {
        log::info!(
            "Sending recording: {}ms, {} bytes",
            blob.duration_ms,
            blob.len()
        );
        self.send(ClientMessage::user_audio(&blob.bytes)).await
    }

    /// Close the connection without reconnecting. Cancels a pending reconnect.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Close and wait for the session loop to finish
    pub async fn shutdown(mut self) {
        let _ = self.command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Session loop ended abnormally: {}", e);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Ordered transcript, without the instruction message
    pub fn transcript(&self) -> Vec<Message> {
        self.transcript.borrow().clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Vec<Message>> {
        self.transcript.clone()
    }

    pub async fn diagnostics(&self) -> DiagnosticsSummary {
        self.diagnostics.lock().await.summary()
    }

    /// Shared diagnostics collector, for event and error history
    pub fn diagnostics_handle(&self) -> Arc<Mutex<Diagnostics>> {
        self.diagnostics.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            // Loop closes the socket and cancels its timers on the way out
            let _ = self.inputs.send(Input::Command(Command::Shutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        assert_eq!(SessionError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            SessionError::from(StreamingError::SendFailed("broken pipe".to_string())).to_string(),
            "Send failed: Failed to send frame: broken pipe"
        );
    }

    #[test]
    fn test_status_serializes() {
        let status = SessionStatus {
            state: ConnectionState::Reconnecting,
            attempt: ReconnectAttempt {
                count: 2,
                last_delay_ms: 2000,
            },
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["attempt"]["count"], 2);
        assert_eq!(json["attempt"]["lastDelayMs"], 2000);
    }
}
