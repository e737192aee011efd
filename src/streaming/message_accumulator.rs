//! Transcript accumulation for the realtime session
//!
//! Folds inbound protocol events into an ordered, role-tagged transcript.
//!
//! # Accumulation Strategy
//!
//! - **Transcript deltas**: appended to the open assistant message, or start a
//!   new streaming assistant message
//! - **Transcript done**: authoritative text replaces the open assistant message
//!   and freezes it
//! - **New message of any role**: freezes the open assistant message first
//! - **Audio deltas**: routed to the playback collaborator, transcript untouched

use serde::{Deserialize, Serialize};

use super::protocol::ServerMessage;
use crate::audio::{AudioPlayback, NullPlayback};

/// Speaker of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub is_streaming: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            is_streaming: false,
        }
    }
}

/// What an inbound event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// The transcript changed
    Transcript,
    /// Audio was handed to the playback collaborator
    Audio,
    /// Nothing to do for this event
    Ignored,
}

/// Accumulates protocol events into an ordered transcript
///
/// The first message is the system/instruction message when one was given;
/// it is excluded from [`MessageAccumulator::transcript`].
pub struct MessageAccumulator {
    messages: Vec<Message>,
    has_instructions: bool,
    playback: Box<dyn AudioPlayback>,
    /// Count of delta events processed
    delta_count: u64,
}

impl Default for MessageAccumulator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MessageAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAccumulator")
            .field("messages", &self.messages)
            .field("delta_count", &self.delta_count)
            .finish()
    }
}

impl MessageAccumulator {
    /// Create an accumulator seeded with optional system instructions
    pub fn new(instructions: Option<String>) -> Self {
        Self::with_playback(instructions, Box::new(NullPlayback::default()))
    }

    /// Create an accumulator that routes audio deltas to `playback`
    pub fn with_playback(instructions: Option<String>, playback: Box<dyn AudioPlayback>) -> Self {
        let mut messages = Vec::new();
        let has_instructions = match instructions {
            Some(text) if !text.is_empty() => {
                messages.push(Message::new(Role::System, text));
                true
            }
            _ => false,
        };

        Self {
            messages,
            has_instructions,
            playback,
            delta_count: 0,
        }
    }

    /// Fold one inbound event into the transcript
    pub fn on_event(&mut self, event: &ServerMessage) -> Routed {
        match event {
            ServerMessage::TranscriptDelta { delta } => {
                if delta.is_empty() {
                    return Routed::Ignored;
                }
                self.push_delta(delta);
                Routed::Transcript
            }
            ServerMessage::TranscriptDone { transcript } => self.finish_turn(transcript.as_deref()),
            ServerMessage::AudioDelta { .. } => match event.audio_bytes() {
                Some(Ok(bytes)) => {
                    self.playback.play(&bytes);
                    Routed::Audio
                }
                Some(Err(e)) => {
                    log::warn!("MessageAccumulator: failed to decode audio delta: {}", e);
                    Routed::Ignored
                }
                None => Routed::Ignored,
            },
            other => {
                log::trace!("MessageAccumulator: ignoring {}", other.kind());
                Routed::Ignored
            }
        }
    }

    fn push_delta(&mut self, delta: &str) {
        self.delta_count += 1;

        if let Some(open) = self.open_turn() {
            open.content.push_str(delta);
        } else {
            self.push(Message {
                role: Role::Assistant,
                content: delta.to_string(),
                is_streaming: true,
            });
        }

        if self.delta_count % 25 == 0 {
            log::debug!(
                "MessageAccumulator: {} deltas, {} messages",
                self.delta_count,
                self.messages.len()
            );
        }
    }

    fn finish_turn(&mut self, transcript: Option<&str>) -> Routed {
        if let Some(open) = self.open_turn() {
            if let Some(text) = transcript {
                if open.content != text {
                    log::debug!(
                        "MessageAccumulator: final transcript replaces {} streamed chars with {}",
                        open.content.len(),
                        text.len()
                    );
                    open.content = text.to_string();
                }
            }
            open.is_streaming = false;
            return Routed::Transcript;
        }

        match transcript {
            Some(text) if !text.is_empty() => {
                self.push(Message::new(Role::Assistant, text));
                Routed::Transcript
            }
            _ => Routed::Ignored,
        }
    }

    /// The assistant message still receiving deltas, if any
    fn open_turn(&mut self) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|m| m.role == Role::Assistant && m.is_streaming)
    }

    /// Append a user message, closing any open assistant turn
    pub fn append_user_message(&mut self, text: &str) {
        self.push(Message::new(Role::User, text));
    }

    fn push(&mut self, message: Message) {
        self.close_open_turn();
        self.messages.push(message);
    }

    fn close_open_turn(&mut self) {
        if let Some(last) = self.messages.last_mut() {
            last.is_streaming = false;
        }
    }

    /// Ordered messages for display, without the instruction message
    pub fn transcript(&self) -> &[Message] {
        if self.has_instructions {
            &self.messages[1..]
        } else {
            &self.messages
        }
    }

    /// Get count of deltas processed
    pub fn delta_count(&self) -> u64 {
        self.delta_count
    }

    /// Clear the conversation, keeping the instruction message
    pub fn reset(&mut self) {
        let keep = usize::from(self.has_instructions);
        self.messages.truncate(keep);
        self.delta_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn delta(text: &str) -> ServerMessage {
        ServerMessage::TranscriptDelta {
            delta: text.to_string(),
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPlayback {
        played: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AudioPlayback for RecordingPlayback {
        fn play(&mut self, pcm: &[u8]) {
            self.played.lock().unwrap().push(pcm.to_vec());
        }
    }

    #[test]
    fn test_new_accumulator_is_empty() {
        let acc = MessageAccumulator::new(Some("You are helpful".to_string()));
        assert!(acc.transcript().is_empty());
        assert_eq!(acc.delta_count(), 0);
    }

    #[test]
    fn test_deltas_merge_into_one_assistant_message() {
        let mut acc = MessageAccumulator::default();
        assert_eq!(acc.on_event(&delta("Hel")), Routed::Transcript);
        assert_eq!(acc.on_event(&delta("lo")), Routed::Transcript);

        assert_eq!(
            acc.transcript(),
            &[Message {
                role: Role::Assistant,
                content: "Hello".to_string(),
                is_streaming: true,
            }]
        );
        assert_eq!(acc.delta_count(), 2);
    }

    #[test]
    fn test_empty_delta_ignored() {
        let mut acc = MessageAccumulator::default();
        assert_eq!(acc.on_event(&delta("")), Routed::Ignored);
        assert!(acc.transcript().is_empty());
    }

    #[test]
    fn test_user_message_closes_streaming_assistant() {
        let mut acc = MessageAccumulator::default();
        acc.on_event(&delta("Working on it"));
        acc.append_user_message("thanks");

        let transcript = acc.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::Assistant);
        assert!(!transcript[0].is_streaming);
        assert_eq!(transcript[1], Message::new(Role::User, "thanks"));
    }

    #[test]
    fn test_delta_after_user_message_starts_new_turn() {
        let mut acc = MessageAccumulator::default();
        acc.on_event(&delta("first"));
        acc.append_user_message("next");
        acc.on_event(&delta("second"));

        let transcript = acc.transcript();
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[0].content, "first");
        assert_eq!(transcript[2].content, "second");
        assert!(transcript[2].is_streaming);
    }

    #[test]
    fn test_transcript_excludes_instructions() {
        let mut acc = MessageAccumulator::new(Some("system prompt".to_string()));
        acc.append_user_message("hi");

        assert_eq!(acc.transcript(), &[Message::new(Role::User, "hi")]);
    }

    #[test]
    fn test_done_replaces_and_freezes() {
        let mut acc = MessageAccumulator::default();
        acc.on_event(&delta("Helo"));
        acc.on_event(&ServerMessage::TranscriptDone {
            transcript: Some("Hello".to_string()),
        });

        assert_eq!(acc.transcript(), &[Message::new(Role::Assistant, "Hello")]);

        // A later delta opens a new turn instead of growing the frozen one
        acc.on_event(&delta("Again"));
        assert_eq!(acc.transcript().len(), 2);
    }

    #[test]
    fn test_done_without_open_turn() {
        let mut acc = MessageAccumulator::default();
        assert_eq!(
            acc.on_event(&ServerMessage::TranscriptDone { transcript: None }),
            Routed::Ignored
        );
        assert_eq!(
            acc.on_event(&ServerMessage::TranscriptDone {
                transcript: Some("Direct".to_string())
            }),
            Routed::Transcript
        );
        assert_eq!(acc.transcript(), &[Message::new(Role::Assistant, "Direct")]);
    }

    #[test]
    fn test_audio_delta_routed_to_playback() {
        let playback = RecordingPlayback::default();
        let played = playback.played.clone();
        let mut acc = MessageAccumulator::with_playback(None, Box::new(playback));

        let routed = acc.on_event(&ServerMessage::AudioDelta {
            delta: "AAEC".to_string(),
        });

        assert_eq!(routed, Routed::Audio);
        assert!(acc.transcript().is_empty());
        assert_eq!(*played.lock().unwrap(), vec![vec![0u8, 1, 2]]);
    }

    #[test]
    fn test_bad_audio_delta_ignored() {
        let mut acc = MessageAccumulator::default();
        let routed = acc.on_event(&ServerMessage::AudioDelta {
            delta: "%%%".to_string(),
        });
        assert_eq!(routed, Routed::Ignored);
    }

    #[test]
    fn test_other_events_ignored() {
        let mut acc = MessageAccumulator::default();
        assert_eq!(acc.on_event(&ServerMessage::Pong), Routed::Ignored);
        assert_eq!(acc.on_event(&ServerMessage::Unknown), Routed::Ignored);
        assert!(acc.transcript().is_empty());
    }

    #[test]
    fn test_reset_keeps_instructions() {
        let mut acc = MessageAccumulator::new(Some("rules".to_string()));
        acc.append_user_message("hi");
        acc.on_event(&delta("hello"));

        acc.reset();

        assert!(acc.transcript().is_empty());
        assert_eq!(acc.delta_count(), 0);
        acc.append_user_message("again");
        assert_eq!(acc.transcript().len(), 1);
    }
}
