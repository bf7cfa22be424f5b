//! # Prompt Construction
//!
//! Templates and flattening for the generation engine. The conversation is
//! kept as a message list; the flattened prompt string is recomputed from the
//! full list before each generation call rather than patched incrementally,
//! so the prompt can never drift from the history.
//!
//! The templates follow the zephyr instruction format expected by the
//! configured GGUF models.

use super::message::Message;

/// Instruction template opening every conversation as the synthetic system
/// message.
pub const SYSTEM_TEMPLATE: &str = "\
[INST] <|system|>
You are a helpful, respectful and honest voice assistant.

You answer questions sent over a chat interface whose users often dictate
their input, so minor transcription mistakes may appear in their messages.
Keep your answers short, under 200 characters if possible. When a question is
asked in a language other than English, answer in that same language.
</s>
";

/// Template wrapping one user turn before it is appended to the history.
const USER_TURN: &str = "\
<|user|>
{PROMPT} </s>

<|assistant|>
";

/// Wrap raw user text in the user-turn template.
pub fn wrap_user_turn(text: &str) -> String {
    USER_TURN.replace("{PROMPT}", text)
}

/// Flatten the full message history into the prompt handed to the engine.
pub fn flatten(messages: &[Message]) -> String {
    messages.iter().map(|message| message.content.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::message::{Message, Sender};

    #[test]
    fn test_user_turn_wrapping() {
        let wrapped = wrap_user_turn("What time is it?");
        assert!(wrapped.contains("<|user|>"));
        assert!(wrapped.contains("What time is it?"));
        assert!(wrapped.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn test_flatten_concatenates_in_order() {
        let messages = vec![
            Message::new(Sender::System, "A"),
            Message::new(Sender::User, "B"),
            Message::new(Sender::Assistant, "C"),
        ];
        assert_eq!(flatten(&messages), "ABC");
    }
}
