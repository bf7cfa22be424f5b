//! # Audio Toolchain
//!
//! The external concatenation/conversion capability the pipeline depends on.
//! The production implementation drives ffmpeg; tests substitute a byte-level
//! stub. Availability is probed once and exposed as the outward
//! "audio toolchain available" flag, so every append can fail fast instead of
//! spawning processes that cannot succeed.

use crate::audio::purge_file;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error};

/// External audio concatenation and format conversion.
#[async_trait]
pub trait AudioToolchain: Send + Sync {
    /// Whether the underlying toolchain is usable at all.
    fn is_available(&self) -> bool;

    /// Concatenate `fragments` in order into `output`. On failure the partial
    /// output is discarded.
    async fn concat(&self, fragments: &[PathBuf], output: &Path) -> AppResult<()>;

    /// Convert an arbitrary uploaded audio file into the canonical format the
    /// transcription engine expects.
    async fn convert_to_canonical(&self, input: &Path, output: &Path) -> AppResult<()>;
}

/// ffmpeg-backed toolchain.
///
/// Concatenation goes through the concat demuxer: a `filelist.txt` listing
/// the fragment paths is written next to the output, handed to ffmpeg and
/// purged afterwards.
pub struct FfmpegToolchain {
    binary: String,
    available: bool,
}

impl FfmpegToolchain {
    /// Probe for ffmpeg once and remember the answer.
    pub async fn detect() -> Self {
        let binary = "ffmpeg".to_string();
        let available = Command::new(&binary)
            .arg("-version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false);

        if !available {
            error!("ffmpeg is not installed or not in PATH, audio transcription will be unavailable");
        }

        Self { binary, available }
    }

    async fn run(&self, args: Vec<std::ffi::OsString>, context: &str) -> AppResult<()> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AppError::MissingCapability("ffmpeg not installed or not in PATH".to_string())
                }
                _ => AppError::Internal(format!("Failed to spawn ffmpeg: {}", e)),
            })?;

        if !output.status.success() {
            return Err(AppError::EngineFailure(format!(
                "ffmpeg {} failed with {}: {}",
                context,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl AudioToolchain for FfmpegToolchain {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn concat(&self, fragments: &[PathBuf], output: &Path) -> AppResult<()> {
        let scratch = output.parent().ok_or_else(|| {
            AppError::Internal(format!("Merge output {} has no parent directory", output.display()))
        })?;

        // concat demuxer input: one "file '<path>'" line per fragment
        let list_file = scratch.join("filelist.txt");
        let mut listing = String::new();
        for fragment in fragments {
            listing.push_str(&format!("file '{}'\n", fragment.display()));
        }
        std::fs::write(&list_file, listing)
            .map_err(|e| AppError::Internal(format!("Could not write {}: {}", list_file.display(), e)))?;

        let args: Vec<std::ffi::OsString> = vec![
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_file.clone().into(),
            "-c".into(),
            "copy".into(),
            output.into(),
        ];

        let result = self.run(args, "concat").await;
        purge_file(&list_file);

        if result.is_err() {
            purge_file(output);
        } else {
            debug!("Merged {} fragments into {}", fragments.len(), output.display());
        }

        result
    }

    async fn convert_to_canonical(&self, input: &Path, output: &Path) -> AppResult<()> {
        // 16 kHz mono wav, the format the transcription engine expects
        let args: Vec<std::ffi::OsString> = vec![
            "-i".into(),
            input.into(),
            "-ar".into(),
            "16000".into(),
            "-ac".into(),
            "1".into(),
            output.into(),
        ];

        let result = self.run(args, "convert").await;
        if result.is_err() {
            purge_file(output);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Byte-level toolchain used by pipeline and registry tests: "merging" is
    //! plain concatenation of the fragment files.

    use super::*;

    pub struct StubToolchain {
        pub available: bool,
    }

    impl StubToolchain {
        pub fn new() -> Self {
            Self { available: true }
        }

        pub fn unavailable() -> Self {
            Self { available: false }
        }
    }

    #[async_trait]
    impl AudioToolchain for StubToolchain {
        fn is_available(&self) -> bool {
            self.available
        }

        async fn concat(&self, fragments: &[PathBuf], output: &Path) -> AppResult<()> {
            let mut merged = Vec::new();
            for fragment in fragments {
                let bytes = std::fs::read(fragment)
                    .map_err(|e| AppError::EngineFailure(format!("{}: {}", fragment.display(), e)))?;
                merged.extend_from_slice(&bytes);
            }
            std::fs::write(output, merged).map_err(AppError::from)
        }

        async fn convert_to_canonical(&self, input: &Path, output: &Path) -> AppResult<()> {
            std::fs::copy(input, output).map_err(AppError::from)?;
            Ok(())
        }
    }
}
