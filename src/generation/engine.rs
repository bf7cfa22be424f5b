//! # Generation Engine
//!
//! Streaming text generation behind a trait. The default implementation
//! spawns a llama.cpp-style CLI process and forwards its stdout as a stream
//! of text fragments, so the conversation layer can emit partial replies
//! while the model is still producing.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error};

/// Incremental output of one generation call.
///
/// Each item is a text fragment in generation order; an `Err` item ends the
/// stream and marks the reply as failed.
pub type FragmentStream = BoxStream<'static, AppResult<String>>;

/// Stateless streaming text generation capability.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Start generating a reply for the flattened prompt.
    async fn generate(&self, prompt: &str) -> AppResult<FragmentStream>;
}

/// Generation via a llama.cpp command line binary.
///
/// The child writes its completion to stdout as it is produced; we read it in
/// small chunks and hand each chunk to the stream. The child's lifetime is
/// tied to the reader task, not to the caller's interest in the stream.
pub struct LlamaCliEngine {
    binary: String,
    model_path: String,
}

impl LlamaCliEngine {
    pub fn new(binary: impl Into<String>, model_path: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model_path: model_path.into(),
        }
    }

    /// Cheap startup probe used by the model loader: resolves to an error if
    /// the binary cannot be spawned at all.
    pub async fn probe(&self) -> AppResult<()> {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                AppError::MissingCapability(format!("{} not available: {}", self.binary, e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl GenerationEngine for LlamaCliEngine {
    async fn generate(&self, prompt: &str) -> AppResult<FragmentStream> {
        let mut child = Command::new(&self.binary)
            .args(["-m", &self.model_path])
            .args(["-p", prompt])
            .arg("--no-display-prompt")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AppError::MissingCapability(format!(
                    "{} not installed or not in PATH",
                    self.binary
                )),
                _ => AppError::EngineFailure(format!("Failed to spawn {}: {}", self.binary, e)),
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            AppError::EngineFailure("Generation process has no stdout".to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel::<AppResult<String>>();
        let binary = self.binary.clone();

        // Reader task: pump stdout chunks into the stream, then reap the
        // child. Runs to completion even if the consumer stops listening.
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(Ok(chunk)).is_err() {
                            debug!("Generation consumer gone, draining {}", binary);
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(AppError::EngineFailure(format!(
                            "Error reading {} output: {}",
                            binary, e
                        ))));
                        break;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() => {
                    error!("{} exited with {}", binary, status);
                    let _ = tx.send(Err(AppError::EngineFailure(format!(
                        "{} exited with {}",
                        binary, status
                    ))));
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(AppError::EngineFailure(format!(
                        "Failed to reap {}: {}",
                        binary, e
                    ))));
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
