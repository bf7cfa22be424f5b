//! # Audio Ingestion & Transcription
//!
//! Per-session streaming audio handling: fragments are written into the
//! session scratch directory, kept in a bounded FIFO queue, merged into one
//! unit per append and transcribed in the background. The external ffmpeg
//! toolchain sits behind the `AudioToolchain` trait.

pub mod pipeline;
pub mod toolchain;

pub use pipeline::AudioPipeline;
pub use toolchain::{AudioToolchain, FfmpegToolchain};

use std::path::Path;
use tracing::warn;

/// Best-effort file deletion. A missing file is fine (renew and cleanup paths
/// race benignly with merge completions); any other failure is logged, never
/// fatal.
pub(crate) fn purge_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not purge {}: {}", path.display(), e);
        }
    }
}

/// Timestamp used in scratch file names. Millisecond resolution, still
/// combined with a per-pipeline sequence number for fragments since fragments
/// can arrive faster than the clock ticks.
pub(crate) fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S%3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_missing_file_is_quiet() {
        let scratch = tempfile::tempdir().unwrap();
        // Must not panic or error
        purge_file(&scratch.path().join("never-existed.webm"));
    }

    #[test]
    fn test_purge_removes_file() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("fragment.webm");
        std::fs::write(&path, b"data").unwrap();
        purge_file(&path);
        assert!(!path.exists());
    }
}
