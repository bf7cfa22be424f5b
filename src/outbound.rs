//! # Per-Session Outbound Channel
//!
//! Every session owns one outbound channel carrying the events the transport
//! forwards to the client: full messages, incremental stream chunks,
//! transcriptions, synthesized speech and error notices. The core components
//! (pipeline, conversation, registry) write into the sending half; the
//! WebSocket actor drains the receiving half.
//!
//! The channel is unbounded: producers are paced by the engines feeding them
//! (generation throughput, transcription latency), so the queue stays small
//! in practice and the senders never need to suspend.

use crate::conversation::message::{Message, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Events emitted to one session's transport connection.
///
/// Serialized as internally tagged JSON, e.g.
/// `{"event":"transcription","text":"hello world"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// A complete conversation message (welcome, reply status, errors)
    Message {
        id: Uuid,
        sender: String,
        content: String,
    },

    /// One incremental fragment of an in-progress assistant reply. All
    /// fragments of one reply carry the same message id.
    StreamMessage {
        id: Uuid,
        sender: String,
        content: String,
    },

    /// Latest transcription of the session's merged audio
    Transcription { text: String },

    /// One sentence of synthesized speech, base64-encoded audio bytes
    SpeechFile { audio: String },

    /// Out-of-band error notice (missing toolchain, timeouts, ...)
    ErrorMessage { sender: Sender, content: String },
}

/// Sending half handed to the session's components.
///
/// Cloneable so the pipeline, the conversation and the registry can all hold
/// one. A send to a disconnected client is not an error: the event is dropped
/// and logged at debug level.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

/// Create the outbound channel for one session.
pub fn channel() -> (OutboundSender, mpsc::UnboundedReceiver<OutboundEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundSender { tx }, rx)
}

impl OutboundSender {
    pub fn send(&self, event: OutboundEvent) {
        if self.tx.send(event).is_err() {
            debug!("Outbound channel closed, dropping event");
        }
    }

    /// Emit a complete conversation message.
    pub fn message(&self, message: &Message) {
        self.send(OutboundEvent::Message {
            id: message.id,
            sender: message.sender.as_str().to_string(),
            content: message.content.clone(),
        });
    }

    /// Emit one streamed fragment of the reply identified by `id`.
    pub fn stream_chunk(&self, id: Uuid, sender: &str, chunk: &str) {
        self.send(OutboundEvent::StreamMessage {
            id,
            sender: sender.to_string(),
            content: chunk.to_string(),
        });
    }

    pub fn transcription(&self, text: &str) {
        self.send(OutboundEvent::Transcription { text: text.to_string() });
    }

    pub fn speech_file(&self, base64_audio: String) {
        self.send(OutboundEvent::SpeechFile { audio: base64_audio });
    }

    pub fn error_message(&self, message: &str) {
        self.send(OutboundEvent::ErrorMessage {
            sender: Sender::Error,
            content: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::message::{Message, Sender};

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OutboundEvent::Transcription { text: "hello world".to_string() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"transcription""#));
        assert!(json.contains("hello world"));

        let event = OutboundEvent::ErrorMessage {
            sender: Sender::Error,
            content: "ffmpeg missing".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"error_message""#));
        assert!(json.contains(r#""sender":"error""#));
    }

    #[test]
    fn test_message_event_carries_sender_tag() {
        let (tx, mut rx) = channel();
        let message = Message::new(Sender::Info, "Welcome");
        tx.message(&message);

        match rx.try_recv().unwrap() {
            OutboundEvent::Message { id, sender, content } => {
                assert_eq!(id, message.id);
                assert_eq!(sender, "info");
                assert_eq!(content, "Welcome");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_send_after_receiver_dropped_is_swallowed() {
        let (tx, rx) = channel();
        drop(rx);
        // Must not panic or error out
        tx.error_message("client already gone");
    }
}
