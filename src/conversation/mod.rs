//! # Conversation Layer
//!
//! Message history, prompt construction and the per-session reply flow that
//! streams generated text and per-sentence speech back to the client.

pub mod message;
pub mod prompt;
pub mod session;

pub use message::Sender;
pub use session::ConversationSession;
