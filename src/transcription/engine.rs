//! # Transcription Engine
//!
//! The trait every transcription backend implements, plus the default
//! implementation shelling out to the OpenAI whisper CLI. The engine is
//! stateless: it receives a finished audio file and returns its text, or an
//! error the pipeline forwards to the waiting handle.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Stateless speech-to-text capability.
///
/// Implementations may fail or be unavailable; the pipeline treats both as
/// `EngineFailure`/`MissingCapability` and leaves its own state untouched.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe the given audio file and return the recognized text.
    async fn transcribe(&self, audio_file: &Path) -> AppResult<String>;
}

/// Transcription via the `whisper` command line tool.
///
/// The CLI writes a `<stem>.txt` transcript next to the input file; we read
/// it back and delete it. Keeping whisper out of process means a crashed or
/// missing model never takes the server down with it.
pub struct WhisperCliEngine {
    binary: String,
    model: String,
}

impl WhisperCliEngine {
    pub fn new(binary: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl TranscriptionEngine for WhisperCliEngine {
    async fn transcribe(&self, audio_file: &Path) -> AppResult<String> {
        let output_dir = audio_file.parent().ok_or_else(|| {
            AppError::Internal(format!("Audio file {} has no parent directory", audio_file.display()))
        })?;

        debug!("Transcribing {} with model {}", audio_file.display(), self.model);

        let output = Command::new(&self.binary)
            .arg(audio_file)
            .args(["--model", &self.model])
            .args(["--output_format", "txt"])
            .arg("--output_dir")
            .arg(output_dir)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AppError::MissingCapability(format!(
                    "{} not installed or not in PATH",
                    self.binary
                )),
                _ => AppError::Internal(format!("Failed to spawn {}: {}", self.binary, e)),
            })?;

        if !output.status.success() {
            return Err(AppError::EngineFailure(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // whisper names the transcript after the input file's stem
        let transcript_file = audio_file.with_extension("txt");
        let text = std::fs::read_to_string(&transcript_file).map_err(|e| {
            AppError::EngineFailure(format!(
                "Transcript {} missing after transcription: {}",
                transcript_file.display(),
                e
            ))
        })?;

        if let Err(e) = std::fs::remove_file(&transcript_file) {
            warn!("Could not remove transcript artifact {}: {}", transcript_file.display(), e);
        }

        Ok(text.trim().to_string())
    }
}
