//! Error types for the engine.
//!
//! None of these are fatal to a chat session: the coordinator turns them into
//! transcript notices or log lines and the next turn starts clean.

use std::time::Duration;

use thiserror::Error;

/// Failures talking to the model server.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("failed to parse stream chunk: {0:?}")]
    Malformed(String),
    #[error("no data from server for {0:?}")]
    Timeout(Duration),
}

/// Failure rendering one unit of speech.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Request(String),
    #[error("synthesis server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("synthesis returned no audio")]
    Empty,
    #[error("synthesis took longer than {0:?}")]
    Timeout(Duration),
}

/// Audio output failures.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to open audio output: {0}")]
    NoDevice(String),
    #[error("failed to spawn playback thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Failures provisioning or running the local synthesis server.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model file {file} not found in {dir}; allow downloads or copy it there manually")]
    ModelMissing { file: String, dir: String },
    #[error("download failed: {0}")]
    Download(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },
    #[error("{name} service did not become ready within {secs}s")]
    NotReady { name: String, secs: u64 },
    #[error("invalid service url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Failures reading or writing preset files.
#[derive(Debug, Error)]
pub enum PresetError {
    #[error("preset io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid preset json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no cache directory available for presets")]
    NoDirectory,
}

/// Failures bringing up the speech side at startup.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Renderer(#[from] SynthesisError),
}
