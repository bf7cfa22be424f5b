//! # Generation Engine Seam
//!
//! Text generation is an external streaming capability. The conversation
//! layer depends on the `GenerationEngine` trait and on the `SharedModel`
//! readiness gate; the llama.cpp CLI implementation behind them is
//! swappable.

pub mod engine;
pub mod gate;

pub use gate::SharedModel;
