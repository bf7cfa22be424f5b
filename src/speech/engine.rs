//! # Speech Engine
//!
//! Turns one sentence of text into audio bytes. Synthesis happens per
//! sentence chunk while a reply is still streaming, so a failure here is
//! never allowed to abort the generation flow; the conversation layer logs
//! and moves on to the next sentence.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Text-to-speech capability with a bounded synthesis time.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Synthesize `text` into audio bytes, using `scratch_dir` for any
    /// intermediate file the implementation needs.
    async fn synthesize(&self, text: &str, scratch_dir: &Path) -> AppResult<Vec<u8>>;
}

/// Synthesis via espeak/espeak-ng.
///
/// The binary writes a wav into the session scratch directory; the file is
/// read back, deleted and its bytes returned. The whole round trip is bounded
/// by the configured synthesis timeout.
pub struct EspeakEngine {
    binary: String,
    timeout: Duration,
}

impl EspeakEngine {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SpeechEngine for EspeakEngine {
    async fn synthesize(&self, text: &str, scratch_dir: &Path) -> AppResult<Vec<u8>> {
        let wav_file = scratch_dir.join(format!("{}.wav", Uuid::new_v4()));

        // The timeout below drops the future; kill_on_drop reaps the child
        let run = Command::new(&self.binary)
            .arg("-w")
            .arg(&wav_file)
            .arg(text)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::MissingCapability(format!(
                    "{} not installed or not in PATH",
                    self.binary
                )));
            }
            Ok(Err(e)) => {
                return Err(AppError::EngineFailure(format!(
                    "Failed to run {}: {}",
                    self.binary, e
                )));
            }
            Err(_) => {
                return Err(AppError::Timeout(format!(
                    "Speech synthesis exceeded {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            return Err(AppError::EngineFailure(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let bytes = std::fs::read(&wav_file).map_err(|e| {
            AppError::EngineFailure(format!("Synthesized file {} unreadable: {}", wav_file.display(), e))
        })?;

        if let Err(e) = std::fs::remove_file(&wav_file) {
            warn!("Could not remove synthesized file {}: {}", wav_file.display(), e);
        }

        debug!("Synthesized {} bytes for a {}-char sentence", bytes.len(), text.len());
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_reports_missing_capability() {
        let engine = EspeakEngine::new("definitely-not-a-real-tts-binary", Duration::from_secs(10));
        let scratch = tempfile::tempdir().unwrap();

        match engine.synthesize("Hello!", scratch.path()).await {
            Err(AppError::MissingCapability(msg)) => assert!(msg.contains("not installed")),
            other => panic!("Expected MissingCapability, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_synthesis_timeout_is_bounded() {
        use std::os::unix::fs::PermissionsExt;

        let scratch = tempfile::tempdir().unwrap();
        let slow_binary = scratch.path().join("slow-tts.sh");
        std::fs::write(&slow_binary, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&slow_binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = EspeakEngine::new(
            slow_binary.to_string_lossy().into_owned(),
            Duration::from_millis(50),
        );

        match engine.synthesize("Hello!", scratch.path()).await {
            Err(AppError::Timeout(_)) => {}
            other => panic!("Expected Timeout, got {:?}", other.map(|_| ())),
        }
    }
}
