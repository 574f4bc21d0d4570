//! Speech rendering — one speakable unit in, one decoded waveform out.
//!
//! [`KokoroRenderer`] talks to a Kokoro server's OpenAI-compatible
//! `/v1/audio/speech` endpoint and asks for raw PCM, which is decoded as it
//! streams in. The coordinator runs several renders at once; ordering is
//! restored later by the playback queue.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::debug;

use parley_core::pcm::{KOKORO_SAMPLE_RATE, PcmAccumulator};
use parley_core::types::Waveform;

use crate::error::SynthesisError;

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechRenderer: Send + Sync {
    async fn render(&self, text: &str, voice: &str, speed: f32) -> Result<Waveform, SynthesisError>;
}

/// Upper bound on one render, request to last byte.
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Renderer backed by a Kokoro HTTP server.
#[derive(Clone)]
pub struct KokoroRenderer {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl KokoroRenderer {
    /// A render that runs past `timeout` fails with
    /// [`SynthesisError::Timeout`] and its unit is skipped.
    pub fn new(kokoro_url: &str, timeout: Duration) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SynthesisError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/v1/audio/speech", kokoro_url.trim_end_matches('/')),
            timeout,
        })
    }

    fn request_error(&self, e: reqwest::Error) -> SynthesisError {
        if e.is_timeout() {
            SynthesisError::Timeout(self.timeout)
        } else {
            SynthesisError::Request(e.to_string())
        }
    }
}

#[async_trait]
impl SpeechRenderer for KokoroRenderer {
    async fn render(&self, text: &str, voice: &str, speed: f32) -> Result<Waveform, SynthesisError> {
        let body = serde_json::json!({
            "input": text,
            "voice": voice,
            "model": "kokoro",
            "response_format": "pcm",
            "stream": true,
            "speed": speed,
        });

        debug!("render: POST {} chars", text.len());

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthesisError::Status { status, body });
        }

        let mut pcm = PcmAccumulator::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.request_error(e))?;
            pcm.push(&chunk);
        }

        if pcm.is_empty() {
            return Err(SynthesisError::Empty);
        }
        Ok(pcm.finish(KOKORO_SAMPLE_RATE))
    }
}
