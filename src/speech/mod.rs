//! # Speech Synthesis Seam
//!
//! Sentence-level text-to-speech behind a trait; the default implementation
//! drives espeak-ng out of process.

pub mod engine;

pub use engine::{EspeakEngine, SpeechEngine};
