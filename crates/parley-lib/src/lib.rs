//! parley-lib — Voice chat engine.
//!
//! Model streaming, speech rendering, ordered playback, transcript, Kokoro
//! model download and service lifecycle, presets.
//! Depends on parley-core for pure types and text processing.

pub mod completion;
pub mod context;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod manager;
pub mod playback;
pub mod preset;
pub mod renderer;
pub mod transcript;

// Re-export parley-core for convenience
pub use parley_core;
