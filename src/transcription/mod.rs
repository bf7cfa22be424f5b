//! # Transcription Engine Seam
//!
//! Speech-to-text is an external capability: the pipeline only depends on the
//! `TranscriptionEngine` trait, so the whisper CLI implementation can be
//! swapped for anything that turns an audio file into text.

pub mod engine;

pub use engine::{TranscriptionEngine, WhisperCliEngine};
