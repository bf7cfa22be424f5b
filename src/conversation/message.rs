//! # Conversation Messages
//!
//! The message record shared by the conversation history and the wire. A
//! message is immutable once created; during streaming the assistant reply is
//! accumulated in a local buffer and only appended to the history when the
//! generation engine is exhausted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who emitted a message.
///
/// A closed enum instead of free-form strings, so every consumption site
/// handles the full set exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The synthetic instruction template opening every conversation
    System,
    /// Text typed (or dictated) by the client
    User,
    /// Replies produced by the generation engine
    Assistant,
    /// Failures reported back to the client
    Error,
    /// Informational notices (welcome message, ...)
    Info,
    /// Internal success markers, not meant for display
    Debug,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::System => "system",
            Sender::User => "user",
            Sender::Assistant => "assistant",
            Sender::Error => "error",
            Sender::Info => "info",
            Sender::Debug => "debug",
        }
    }
}

/// One record in a conversation: unique id, emitter and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub content: String,
}

impl Message {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            content: content.into(),
        }
    }

    /// An empty message used as the accumulator for a streamed reply. The id
    /// is allocated up front so every streamed chunk can be tagged with it.
    pub fn empty(sender: Sender) -> Self {
        Self::new(sender, "")
    }
}
