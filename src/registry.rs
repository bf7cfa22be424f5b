//! # Session Registry
//!
//! Process-wide directory of live client sessions. The transport layer calls
//! in with a session id and raw payloads; the registry owns the per-session
//! wiring (scratch directory, audio pipeline, conversation, outbound channel)
//! and routes each payload to the right session.
//!
//! ## Lifecycle:
//! - `on_connect` builds the session and hands the outbound receiver back to
//!   the transport. A duplicate id replaces the previous session outright.
//! - `on_disconnect` tears the session down, purging every scratch artifact.
//!   Calling it twice (or for an unknown id) is harmless.
//! - Dispatches to an id with no live session are logged and dropped; a
//!   racing disconnect must never turn into a client-visible error.

use crate::audio::{AudioPipeline, AudioToolchain};
use crate::conversation::message::{Message, Sender};
use crate::conversation::ConversationSession;
use crate::error::{AppError, AppResult};
use crate::generation::SharedModel;
use crate::outbound::{self, OutboundEvent, OutboundSender};
use crate::speech::SpeechEngine;
use crate::state::AppState;
use crate::transcription::TranscriptionEngine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

/// Everything one live session owns.
struct SessionEntry {
    pipeline: Arc<AudioPipeline>,
    conversation: Arc<ConversationSession>,
    outbound: OutboundSender,

    /// Session scratch directory; dropping the entry removes it and every
    /// fragment or synthesis artifact still inside
    _scratch: TempDir,
}

/// Directory of live sessions plus the shared engines they are built from.
pub struct SessionRegistry {
    state: AppState,
    model: SharedModel,
    toolchain: Arc<dyn AudioToolchain>,
    transcriber: Arc<dyn TranscriptionEngine>,
    speech: Arc<dyn SpeechEngine>,

    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(
        state: AppState,
        model: SharedModel,
        toolchain: Arc<dyn AudioToolchain>,
        transcriber: Arc<dyn TranscriptionEngine>,
        speech: Arc<dyn SpeechEngine>,
    ) -> Self {
        Self {
            state,
            model,
            toolchain,
            transcriber,
            speech,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new session and return the outbound event receiver the
    /// transport drains.
    ///
    /// A session reusing a live id replaces the old one; the replaced
    /// session's scratch directory is cleaned up on the spot.
    pub fn on_connect(&self, session_id: &str) -> AppResult<UnboundedReceiver<OutboundEvent>> {
        let config = self.state.get_config();
        let scratch = tempfile::tempdir()
            .map_err(|e| AppError::Internal(format!("Could not create session scratch dir: {}", e)))?;

        let (tx, rx) = outbound::channel();

        let pipeline = Arc::new(AudioPipeline::new(
            session_id,
            scratch.path().to_path_buf(),
            config.audio.fragment_queue_capacity,
            self.toolchain.clone(),
            self.transcriber.clone(),
        ));

        let conversation = Arc::new(ConversationSession::new(
            session_id,
            self.model.clone(),
            self.speech.clone(),
            tx.clone(),
            scratch.path().to_path_buf(),
        ));

        let entry = Arc::new(SessionEntry {
            pipeline,
            conversation,
            outbound: tx.clone(),
            _scratch: scratch,
        });

        let replaced = self.sessions.lock().unwrap().insert(session_id.to_string(), entry);
        if replaced.is_some() {
            warn!("Session {} reconnected, replacing its previous state", session_id);
        } else {
            self.state.increment_active_sessions();
        }

        tx.message(&Message::new(
            Sender::Info,
            "Connected. Send a message or start talking to begin.",
        ));

        info!("Session {} connected", session_id);
        Ok(rx)
    }

    /// Tear down a session. Idempotent: unknown ids are ignored.
    pub fn on_disconnect(&self, session_id: &str) {
        let removed = self.sessions.lock().unwrap().remove(session_id);

        if let Some(entry) = removed {
            // Purge queued fragments now; the TempDir drop sweeps the rest
            entry.pipeline.renew();
            self.state.decrement_active_sessions();
            info!("Session {} disconnected", session_id);
        }
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        let entry = self.sessions.lock().unwrap().get(session_id).cloned();
        if entry.is_none() {
            warn!("Dropping payload for unknown session {}", session_id);
        }
        entry
    }

    /// Route one streamed audio fragment into the session's pipeline and
    /// report the resulting transcription when it lands within the bounded
    /// wait.
    pub fn dispatch_audio_fragment(&self, session_id: &str, bytes: Vec<u8>) {
        let Some(entry) = self.lookup(session_id) else { return };
        let timeout = self.state.get_config().fragment_timeout();

        let handle = match entry.pipeline.append_fragment(&bytes) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Fragment rejected for session {}: {}", session_id, e);
                entry.outbound.error_message(&e.to_string());
                return;
            }
        };

        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match handle.wait(timeout).await {
                Ok(text) => entry.outbound.transcription(&text),
                Err(e) => {
                    warn!("Fragment transcription failed for session {}: {}", session_id, e);
                    entry.outbound.error_message(&e.to_string());
                }
            }
        });
    }

    /// Route one complete audio file: convert it to the canonical format,
    /// append it to the pipeline and wait out the longer whole-file budget.
    pub fn dispatch_audio_file(&self, session_id: &str, bytes: Vec<u8>) {
        let Some(entry) = self.lookup(session_id) else { return };
        let timeout = self.state.get_config().file_timeout();
        let toolchain = self.toolchain.clone();

        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = transcribe_file(&toolchain, &entry, &bytes, timeout).await {
                warn!("File transcription failed for session {}: {}", session_id, e);
                entry.outbound.error_message(&e.to_string());
            }
        });
    }

    /// Route one user text turn: reset the audio pipeline for the next
    /// utterance, take the turn into the conversation and stream the reply.
    pub fn dispatch_user_message(&self, session_id: &str, text: &str) {
        let Some(entry) = self.lookup(session_id) else { return };

        // A submitted turn closes the current utterance; queued fragments
        // belong to it and must not bleed into the next one
        entry.pipeline.renew();

        match entry.conversation.receive(text) {
            Ok(ack) => debug!("Session {}: {}", session_id, ack.content),
            Err(e) => {
                warn!("Turn rejected for session {}: {}", session_id, e);
                entry.outbound.error_message(&e.to_string());
                return;
            }
        }

        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match entry.conversation.respond().await {
                // The completion marker goes out after the reply itself
                Ok(status) => entry.outbound.message(&status),
                // Failures are already reported through the outbound channel
                Err(e) => error!("Reply failed for session {}: {}", session_id, e),
            }
        });
    }

    /// Number of live sessions, for the metrics surface.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Whether the audio toolchain was found at startup, for the health
    /// surface.
    pub fn toolchain_available(&self) -> bool {
        self.toolchain.is_available()
    }
}

/// Whole-file transcription: save the upload, convert it to the canonical
/// format, run it through the session pipeline and report the text.
async fn transcribe_file(
    toolchain: &Arc<dyn AudioToolchain>,
    entry: &SessionEntry,
    bytes: &[u8],
    timeout: std::time::Duration,
) -> AppResult<()> {
    if bytes.is_empty() {
        return Err(AppError::BadRequest("Audio file is empty".to_string()));
    }
    if !toolchain.is_available() {
        return Err(AppError::MissingCapability(
            "Audio toolchain (ffmpeg) is not installed, transcription unavailable".to_string(),
        ));
    }

    let scratch = entry.pipeline.scratch_dir();
    let upload = scratch.join(format!("upload-{}.bin", uuid::Uuid::new_v4()));
    let converted = scratch.join(format!("converted-{}.wav", uuid::Uuid::new_v4()));

    std::fs::write(&upload, bytes)
        .map_err(|e| AppError::Internal(format!("Could not save uploaded audio: {}", e)))?;

    let conversion = toolchain.convert_to_canonical(&upload, &converted).await;
    crate::audio::purge_file(&upload);
    conversion?;

    let text = entry.pipeline.append_fragment_file(converted)?.wait(timeout).await?;
    entry.outbound.transcription(&text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::toolchain::stub::StubToolchain;
    use crate::config::AppConfig;
    use crate::generation::engine::{FragmentStream, GenerationEngine};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::path::Path;
    use std::time::Duration;

    struct EchoTranscriber;

    #[async_trait]
    impl TranscriptionEngine for EchoTranscriber {
        async fn transcribe(&self, audio_file: &Path) -> AppResult<String> {
            let bytes = std::fs::read(audio_file).map_err(AppError::from)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    struct OneWordEngine;

    #[async_trait]
    impl GenerationEngine for OneWordEngine {
        async fn generate(&self, _prompt: &str) -> AppResult<FragmentStream> {
            Ok(futures_util::stream::iter(vec![Ok("Sure.".to_string())]).boxed())
        }
    }

    struct SilentSpeech;

    #[async_trait]
    impl SpeechEngine for SilentSpeech {
        async fn synthesize(&self, _text: &str, _scratch_dir: &Path) -> AppResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn registry(model: SharedModel) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            AppState::new(AppConfig::default()),
            model,
            Arc::new(StubToolchain::new()),
            Arc::new(EchoTranscriber),
            Arc::new(SilentSpeech),
        ))
    }

    async fn recv_with_timeout(rx: &mut UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound event")
            .expect("outbound channel closed")
    }

    #[tokio::test]
    async fn test_connect_emits_welcome_and_counts_session() {
        let registry = registry(SharedModel::new());
        let mut rx = registry.on_connect("s1").unwrap();

        match recv_with_timeout(&mut rx).await {
            OutboundEvent::Message { sender, content, .. } => {
                assert_eq!(sender, "info");
                assert!(content.contains("Connected"));
            }
            other => panic!("Expected welcome message, got {:?}", other),
        }
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.state.get_metrics_snapshot().active_sessions, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let registry = registry(SharedModel::new());
        let _rx = registry.on_connect("s1").unwrap();

        registry.on_disconnect("s1");
        registry.on_disconnect("s1");
        registry.on_disconnect("never-existed");

        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.state.get_metrics_snapshot().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_session() {
        let registry = registry(SharedModel::new());
        let _rx1 = registry.on_connect("s1").unwrap();
        let _rx2 = registry.on_connect("s1").unwrap();

        assert_eq!(registry.session_count(), 1);
        // The replacement does not double-count the session
        assert_eq!(registry.state.get_metrics_snapshot().active_sessions, 1);

        registry.on_disconnect("s1");
        assert_eq!(registry.state.get_metrics_snapshot().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_fragment_dispatch_reports_transcription() {
        let registry = registry(SharedModel::new());
        let mut rx = registry.on_connect("s1").unwrap();
        let _welcome = recv_with_timeout(&mut rx).await;

        registry.dispatch_audio_fragment("s1", b"hello ".to_vec());
        match recv_with_timeout(&mut rx).await {
            OutboundEvent::Transcription { text } => assert_eq!(text, "hello "),
            other => panic!("Expected transcription, got {:?}", other),
        }

        registry.dispatch_audio_fragment("s1", b"world".to_vec());
        match recv_with_timeout(&mut rx).await {
            OutboundEvent::Transcription { text } => assert_eq!(text, "hello world"),
            other => panic!("Expected transcription, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_dispatch_converts_and_transcribes() {
        let registry = registry(SharedModel::new());
        let mut rx = registry.on_connect("s1").unwrap();
        let _welcome = recv_with_timeout(&mut rx).await;

        registry.dispatch_audio_file("s1", b"whole recording".to_vec());
        match recv_with_timeout(&mut rx).await {
            OutboundEvent::Transcription { text } => assert_eq!(text, "whole recording"),
            other => panic!("Expected transcription, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_session_is_dropped() {
        let registry = registry(SharedModel::new());
        // No session registered; nothing to observe beyond "does not panic"
        registry.dispatch_audio_fragment("ghost", b"data".to_vec());
        registry.dispatch_user_message("ghost", "hello?");
    }

    #[tokio::test]
    async fn test_user_message_before_model_ready_reports_error() {
        let registry = registry(SharedModel::new());
        let mut rx = registry.on_connect("s1").unwrap();
        let _welcome = recv_with_timeout(&mut rx).await;

        registry.dispatch_user_message("s1", "hello");
        match recv_with_timeout(&mut rx).await {
            OutboundEvent::ErrorMessage { content, .. } => {
                assert!(content.contains("still loading"))
            }
            other => panic!("Expected error message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_message_streams_reply_and_resets_pipeline() {
        let registry = registry(SharedModel::ready(Arc::new(OneWordEngine)));
        let mut rx = registry.on_connect("s1").unwrap();
        let _welcome = recv_with_timeout(&mut rx).await;

        // Queue a fragment so the renew on message submit has work to do
        registry.dispatch_audio_fragment("s1", b"dictated text".to_vec());
        let _transcription = recv_with_timeout(&mut rx).await;

        registry.dispatch_user_message("s1", "dictated text");

        let mut saw_chunk = false;
        let mut saw_reply = false;
        loop {
            match recv_with_timeout(&mut rx).await {
                OutboundEvent::StreamMessage { content, .. } => {
                    assert_eq!(content, "Sure.");
                    saw_chunk = true;
                }
                OutboundEvent::Message { sender, content, .. } if sender == "assistant" => {
                    assert_eq!(content, "Sure.");
                    saw_reply = true;
                }
                // The debug completion marker closes the exchange
                OutboundEvent::Message { sender, content, .. } => {
                    assert_eq!(sender, "debug");
                    assert_eq!(content, "Success");
                    break;
                }
                OutboundEvent::SpeechFile { .. } => {}
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert!(saw_chunk);
        assert!(saw_reply);

        // The submitted turn closed the utterance
        let entry = registry.lookup("s1").unwrap();
        assert_eq!(entry.pipeline.fragment_count(), 0);
    }
}
