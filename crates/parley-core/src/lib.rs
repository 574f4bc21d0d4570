//! parley-core — Pure types and text processing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod chunker;
pub mod pcm;
pub mod reorder;
pub mod text_prep;
pub mod types;
