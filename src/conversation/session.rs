//! # Conversation Session
//!
//! One chat exchange with one connected client: the message history, the
//! gate-checked intake of user turns and the streamed assistant reply with
//! sentence-level speech synthesis.
//!
//! ## Reply flow:
//! 1. `receive` validates the turn and appends it to the history. It rejects
//!    synchronously while the shared model is still loading, so the client
//!    gets immediate feedback instead of a silent stall.
//! 2. `respond` waits on the readiness gate, flattens the history into a
//!    prompt and streams the engine's reply: every fragment is forwarded to
//!    the client as it arrives, and every completed sentence is synthesized
//!    to speech on the spot.
//! 3. The full reply joins the history only after the stream is exhausted
//!    successfully, so a failed generation never leaves a half-reply behind.
//!
//! Replies are serialized per session: a second `respond` queued behind an
//! in-flight one waits for the reply gate, so two rapid turns never interleave
//! their stream fragments on the wire.

use crate::conversation::message::{Message, Sender};
use crate::conversation::prompt;
use crate::error::{AppError, AppResult};
use crate::generation::SharedModel;
use crate::outbound::OutboundSender;
use crate::speech::SpeechEngine;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Characters that end a speakable sentence.
const SENTENCE_TERMINALS: &[char] = &['.', '!', '?', ':', ';'];

/// Split every complete sentence out of `buffer`, leaving the unterminated
/// remainder in place. Whitespace-only sentences are dropped.
fn drain_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    while let Some(pos) = buffer.find(|c: char| SENTENCE_TERMINALS.contains(&c)) {
        // Terminals are ASCII, so pos + 1 is a valid char boundary
        let remainder = buffer.split_off(pos + 1);
        let sentence = std::mem::replace(buffer, remainder);
        let trimmed = sentence.trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
    }
    sentences
}

/// The conversation state and reply machinery of one session.
pub struct ConversationSession {
    session_id: String,
    model: SharedModel,
    speech: Arc<dyn SpeechEngine>,
    outbound: OutboundSender,

    /// Scratch directory shared with the audio pipeline; speech synthesis
    /// writes its intermediate files here
    scratch_dir: PathBuf,

    /// Full message history, system template first. Locked only for short
    /// snapshot/append windows, never across an await.
    history: Mutex<Vec<Message>>,

    /// Held across one whole `respond` call, serializing replies within the
    /// session so concurrent turns cannot interleave their stream chunks.
    reply_gate: tokio::sync::Mutex<()>,
}

impl ConversationSession {
    pub fn new(
        session_id: impl Into<String>,
        model: SharedModel,
        speech: Arc<dyn SpeechEngine>,
        outbound: OutboundSender,
        scratch_dir: PathBuf,
    ) -> Self {
        let system = Message::new(Sender::System, prompt::SYSTEM_TEMPLATE);
        Self {
            session_id: session_id.into(),
            model,
            speech,
            outbound,
            scratch_dir,
            history: Mutex::new(vec![system]),
            reply_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Take one user turn into the history.
    ///
    /// Rejects immediately with `NotReady` while the generation model is
    /// still loading; the history is not touched in that case. On success an
    /// internal acknowledgment message is returned.
    pub fn receive(&self, text: &str) -> AppResult<Message> {
        if text.trim().is_empty() {
            return Err(AppError::BadRequest("Message text is empty".to_string()));
        }
        if !self.model.is_ready() {
            return Err(AppError::NotReady(
                "The language model is still loading, please try again shortly".to_string(),
            ));
        }

        let turn = Message::new(Sender::User, prompt::wrap_user_turn(text));
        self.history.lock().unwrap().push(turn);
        debug!("Session {} accepted a user turn", self.session_id);
        Ok(Message::new(Sender::Debug, "Message received"))
    }

    /// Generate and stream the assistant reply for the current history.
    ///
    /// Blocks on the readiness gate, so a call racing the model load simply
    /// waits instead of failing, and on the reply gate, so only one reply per
    /// session streams at a time. Stream fragments, sentence audio, the
    /// completed reply and failure notices all go out through the session's
    /// outbound channel as they happen; the returned message is a debug-level
    /// completion marker for the caller to forward.
    pub async fn respond(&self) -> AppResult<Message> {
        let _turn = self.reply_gate.lock().await;

        let engine = self.model.wait_ready().await?;
        let prompt_text = prompt::flatten(&self.history.lock().unwrap());

        // Allocate the reply id up front so every streamed chunk carries it
        let reply = Message::empty(Sender::Assistant);
        let mut full_reply = String::new();
        let mut sentence_buffer = String::new();

        let mut stream = match engine.generate(&prompt_text).await {
            Ok(stream) => stream,
            Err(e) => {
                self.outbound.error_message(&e.to_string());
                return Err(e);
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    self.outbound.stream_chunk(reply.id, reply.sender.as_str(), &chunk);
                    full_reply.push_str(&chunk);
                    sentence_buffer.push_str(&chunk);

                    for sentence in drain_sentences(&mut sentence_buffer) {
                        self.speak(&sentence).await;
                    }
                }
                Err(e) => {
                    // The partial reply is discarded; the history keeps only
                    // complete turns so the next prompt stays well-formed.
                    warn!("Generation failed mid-reply for session {}: {}", self.session_id, e);
                    self.outbound.error_message(&e.to_string());
                    return Err(e);
                }
            }
        }

        // Trailing text without a terminal still gets spoken
        let leftover = std::mem::take(&mut sentence_buffer);
        if !leftover.trim().is_empty() {
            self.speak(leftover.trim()).await;
        }

        let final_reply = Message {
            id: reply.id,
            sender: reply.sender,
            content: full_reply.trim().to_string(),
        };

        // The history entry keeps the turn terminator the prompt format needs
        self.history.lock().unwrap().push(Message {
            id: final_reply.id,
            sender: final_reply.sender,
            content: format!("{}</s>\n\n", final_reply.content),
        });

        self.outbound.message(&final_reply);
        info!(
            "Session {} reply completed ({} chars)",
            self.session_id,
            final_reply.content.len()
        );
        Ok(Message::new(Sender::Debug, "Success"))
    }

    /// Synthesize one sentence and ship it to the client.
    ///
    /// Non-critical by policy: any failure is logged and swallowed so a
    /// broken speech setup never interrupts the text reply.
    async fn speak(&self, sentence: &str) {
        match self.speech.synthesize(sentence, &self.scratch_dir).await {
            Ok(bytes) => self.outbound.speech_file(BASE64.encode(bytes)),
            Err(e) => {
                warn!("Speech synthesis failed for session {}: {}", self.session_id, e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn history_snapshot(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::engine::{FragmentStream, GenerationEngine};
    use crate::outbound::{self, OutboundEvent};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Plays back a fixed chunk script; `Err` entries become engine failures.
    struct ScriptedEngine {
        chunks: Vec<Result<&'static str, &'static str>>,
    }

    #[async_trait]
    impl GenerationEngine for ScriptedEngine {
        async fn generate(&self, _prompt: &str) -> AppResult<FragmentStream> {
            let items: Vec<AppResult<String>> = self
                .chunks
                .iter()
                .map(|chunk| match chunk {
                    Ok(text) => Ok(text.to_string()),
                    Err(msg) => Err(AppError::EngineFailure(msg.to_string())),
                })
                .collect();
            Ok(futures_util::stream::iter(items).boxed())
        }
    }

    /// Emits its chunks with a small delay between them, keeping a reply in
    /// flight long enough for another turn to pile up behind it.
    struct DrippingEngine {
        chunks: Vec<&'static str>,
    }

    #[async_trait]
    impl GenerationEngine for DrippingEngine {
        async fn generate(&self, _prompt: &str) -> AppResult<FragmentStream> {
            let items: Vec<AppResult<String>> =
                self.chunks.iter().map(|chunk| Ok(chunk.to_string())).collect();
            Ok(futures_util::stream::iter(items)
                .then(|item| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    item
                })
                .boxed())
        }
    }

    struct RecordingSpeech {
        sentences: Mutex<Vec<String>>,
    }

    impl RecordingSpeech {
        fn new() -> Arc<Self> {
            Arc::new(Self { sentences: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl SpeechEngine for RecordingSpeech {
        async fn synthesize(&self, text: &str, _scratch_dir: &std::path::Path) -> AppResult<Vec<u8>> {
            self.sentences.lock().unwrap().push(text.to_string());
            Ok(b"RIFF".to_vec())
        }
    }

    struct BrokenSpeech;

    #[async_trait]
    impl SpeechEngine for BrokenSpeech {
        async fn synthesize(&self, _text: &str, _scratch_dir: &std::path::Path) -> AppResult<Vec<u8>> {
            Err(AppError::EngineFailure("no audio device".to_string()))
        }
    }

    fn session_with(
        model: SharedModel,
        speech: Arc<dyn SpeechEngine>,
    ) -> (ConversationSession, UnboundedReceiver<OutboundEvent>, tempfile::TempDir) {
        let scratch = tempfile::tempdir().unwrap();
        let (tx, rx) = outbound::channel();
        let session = ConversationSession::new(
            "test-session",
            model,
            speech,
            tx,
            scratch.path().to_path_buf(),
        );
        (session, rx, scratch)
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_sentence_draining() {
        let mut buffer = "Hello world! How are you? I am".to_string();
        let sentences = drain_sentences(&mut buffer);
        assert_eq!(sentences, vec!["Hello world!", "How are you?"]);
        assert_eq!(buffer, " I am");

        let mut buffer = "no terminal yet".to_string();
        assert!(drain_sentences(&mut buffer).is_empty());
        assert_eq!(buffer, "no terminal yet");
    }

    #[tokio::test]
    async fn test_receive_rejects_while_model_loads() {
        let (session, mut rx, _scratch) = session_with(SharedModel::new(), RecordingSpeech::new());

        match session.receive("hello") {
            Err(AppError::NotReady(_)) => {}
            other => panic!("Expected NotReady, got {:?}", other),
        }

        // History untouched, nothing emitted
        assert_eq!(session.history_snapshot().len(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_streamed_reply_with_sentence_speech() {
        let engine = ScriptedEngine { chunks: vec![Ok("Hel"), Ok("lo!")] };
        let speech = RecordingSpeech::new();
        let (session, mut rx, _scratch) =
            session_with(SharedModel::ready(Arc::new(engine)), speech.clone());

        session.receive("Hi there").unwrap();
        let status = session.respond().await.unwrap();
        assert_eq!(status.sender, Sender::Debug);
        assert_eq!(status.content, "Success");

        let events = drain(&mut rx);

        // Final full message closes the reply
        let reply_id = match events.last().unwrap() {
            OutboundEvent::Message { id, sender, content } => {
                assert_eq!(sender, "assistant");
                assert_eq!(content, "Hello!");
                *id
            }
            other => panic!("Expected final message, got {:?}", other),
        };

        let chunk_ids: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                OutboundEvent::StreamMessage { id, content, .. } => Some((*id, content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(chunk_ids.len(), 2);
        assert_eq!(chunk_ids[0].1, "Hel");
        assert_eq!(chunk_ids[1].1, "lo!");
        // Every chunk of one reply shares the reply's id
        assert!(chunk_ids.iter().all(|(id, _)| *id == reply_id));

        // One complete sentence, one speech emission
        assert_eq!(*speech.sentences.lock().unwrap(), vec!["Hello!"]);
        assert_eq!(
            events.iter().filter(|e| matches!(e, OutboundEvent::SpeechFile { .. })).count(),
            1
        );

        // History: system, user turn, completed reply
        let history = session.history_snapshot();
        assert_eq!(history.len(), 3);
        assert!(history[2].content.contains("Hello!"));
    }

    #[tokio::test]
    async fn test_engine_failure_mid_stream_keeps_history_clean() {
        let engine = ScriptedEngine { chunks: vec![Ok("Partial"), Err("model crashed")] };
        let (session, mut rx, _scratch) =
            session_with(SharedModel::ready(Arc::new(engine)), RecordingSpeech::new());

        session.receive("Hi").unwrap();
        match session.respond().await {
            Err(AppError::EngineFailure(_)) => {}
            other => panic!("Expected EngineFailure, got {:?}", other.map(|_| ())),
        }

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, OutboundEvent::ErrorMessage { .. })));
        assert!(!events.iter().any(|e| matches!(e, OutboundEvent::Message { .. })));

        // The half-reply is not part of the history
        let history = session.history_snapshot();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.sender != Sender::Assistant));
    }

    #[tokio::test]
    async fn test_speech_failure_never_interrupts_the_reply() {
        let engine = ScriptedEngine { chunks: vec![Ok("One. Two.")] };
        let (session, mut rx, _scratch) =
            session_with(SharedModel::ready(Arc::new(engine)), Arc::new(BrokenSpeech));

        session.receive("count").unwrap();
        session.respond().await.unwrap();

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, OutboundEvent::SpeechFile { .. })));
        match events.last().unwrap() {
            OutboundEvent::Message { content, .. } => assert_eq!(content, "One. Two."),
            other => panic!("Expected final message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_back_to_back_turns_stream_one_reply_at_a_time() {
        let engine = DrippingEngine { chunks: vec!["Sure ", "thing."] };
        let (session, mut rx, _scratch) =
            session_with(SharedModel::ready(Arc::new(engine)), RecordingSpeech::new());
        let session = Arc::new(session);

        session.receive("first").unwrap();
        session.receive("second").unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.respond().await }
        });
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.respond().await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // Chunks of one reply stay contiguous; the queued reply only starts
        // streaming after the in-flight one has finished.
        let chunk_ids: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                OutboundEvent::StreamMessage { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(chunk_ids.len(), 4);
        assert_eq!(chunk_ids[0], chunk_ids[1]);
        assert_eq!(chunk_ids[2], chunk_ids[3]);
        assert_ne!(chunk_ids[1], chunk_ids[2]);

        // System prompt, two user turns, two completed replies
        assert_eq!(session.history_snapshot().len(), 5);
    }

    #[tokio::test]
    async fn test_trailing_text_without_terminal_is_spoken() {
        let engine = ScriptedEngine { chunks: vec![Ok("Done. And more")] };
        let speech = RecordingSpeech::new();
        let (session, _rx, _scratch) =
            session_with(SharedModel::ready(Arc::new(engine)), speech.clone());

        session.receive("go").unwrap();
        session.respond().await.unwrap();

        assert_eq!(*speech.sentences.lock().unwrap(), vec!["Done.", "And more"]);
    }
}
