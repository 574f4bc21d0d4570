//! Shared types for the parley voice chat client.
//!
//! Kept free of tokio, reqwest and rodio so the chunking and ordering logic
//! can be reused and tested without an async runtime or audio device.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunker::DEFAULT_MAX_UNIT_LEN;

// ─── Chat types ────────────────────────────────────────────────────────────

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of the chat history sent to the model server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Optional display/API alias (e.g. a persona name for the assistant).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

/// Sampling parameters forwarded to the completion endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: Option<u64>,
    /// `None` leaves generation length to the server.
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            seed: None,
            max_tokens: None,
            stop: Vec::new(),
        }
    }
}

/// A single streaming completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: SamplingParams,
}

/// Chat session configuration.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub system_prompt: String,
    /// API alias attached to user messages.
    pub user_name: Option<String>,
    /// API alias attached to assistant messages.
    pub assistant_name: Option<String>,
    pub params: SamplingParams,
    pub audio_enabled: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: "lmstudio".into(),
            system_prompt: String::new(),
            user_name: None,
            assistant_name: None,
            params: SamplingParams::default(),
            audio_enabled: true,
        }
    }
}

// ─── Speech types ──────────────────────────────────────────────────────────

/// Speech synthesis configuration.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub kokoro_url: String,
    pub voice: String,
    pub speed: f32,
    pub max_unit_len: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            kokoro_url: "http://127.0.0.1:3001".into(),
            voice: "af_bella".into(),
            speed: 1.0,
            max_unit_len: DEFAULT_MAX_UNIT_LEN,
        }
    }
}

/// Text judged complete enough to synthesize, tagged with its position in
/// the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakableUnit {
    pub index: usize,
    pub text: String,
}

/// Decoded audio ready for playback. Samples are interleaved `f32` in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Waveform {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as f64 / self.channels as f64;
        Duration::from_secs_f64(frames / self.sample_rate as f64)
    }
}

/// A rendered waveform together with the index of the unit it voices.
#[derive(Debug, Clone)]
pub struct RenderedAudio {
    pub index: usize,
    pub waveform: Waveform,
}

/// Observable playback state for one reply's audio session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Complete,
    Cancelled,
    /// No audio backend could be opened for this session.
    Unavailable(String),
}

impl PlaybackState {
    /// A session in a finished state accepts no further audio.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PlaybackState::Complete | PlaybackState::Cancelled | PlaybackState::Unavailable(_)
        )
    }
}

/// Playback status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackStatus {
    pub session: u64,
    pub state: PlaybackState,
    /// Rendered units held back waiting for a lower index.
    pub pending: usize,
}

/// How a reply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The model stream ended normally.
    Completed,
    /// The user stopped the reply or sent a new message.
    Interrupted,
    /// The stream failed; `partial` is true when some text had already arrived.
    Failed { message: String, partial: bool },
}

// ─── Model files ───────────────────────────────────────────────────────────

/// Model file definition.
pub struct ModelInfo {
    pub name: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
    pub expected_size: u64,
}

pub const KOKORO_MODEL: ModelInfo = ModelInfo {
    name: "kokoro",
    filename: "kokoro-v1.0.onnx",
    url: "https://github.com/thewh1teagle/kokoro-onnx/releases/download/model-files-v1.0/kokoro-v1.0.onnx",
    expected_size: 326_000_000,
};

pub const KOKORO_VOICES: ModelInfo = ModelInfo {
    name: "kokoro-voices",
    filename: "voices-v1.0.bin",
    url: "https://github.com/thewh1teagle/kokoro-onnx/releases/download/model-files-v1.0/voices-v1.0.bin",
    expected_size: 5_200_000,
};

/// Download progress payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub model: String,
    pub percent: f32,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub status: String, // "downloading" | "complete"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waveform_duration_counts_frames() {
        let w = Waveform::mono(vec![0.0; 24_000], 24_000);
        assert_eq!(w.duration(), Duration::from_secs(1));

        let stereo = Waveform {
            samples: vec![0.0; 48_000],
            sample_rate: 24_000,
            channels: 2,
        };
        assert_eq!(stereo.duration(), Duration::from_secs(1));
    }

    #[test]
    fn finished_states() {
        assert!(PlaybackState::Complete.is_finished());
        assert!(PlaybackState::Unavailable("no device".into()).is_finished());
        assert!(!PlaybackState::Playing.is_finished());
        assert!(!PlaybackState::Idle.is_finished());
    }

    #[test]
    fn chat_message_omits_missing_name() {
        let json = serde_json::to_string(&ChatMessage::new(Role::User, "hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
