//! Speech-side handles, created once at startup and handed to the coordinator.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use parley_core::types::{DownloadProgress, VoiceConfig, Waveform};

use crate::error::{SynthesisError, VoiceError};
use crate::manager::KokoroService;
use crate::playback::PlaybackQueue;
use crate::renderer::{DEFAULT_RENDER_TIMEOUT, KokoroRenderer, SpeechRenderer};

/// Where to find (or fetch) models when parley launches Kokoro itself.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub models_dir: PathBuf,
    pub allow_download: bool,
}

pub struct VoiceContext {
    renderer: Arc<dyn SpeechRenderer>,
    playback: PlaybackQueue,
    config: VoiceConfig,
    service: Option<KokoroService>,
}

impl VoiceContext {
    pub fn from_parts(
        renderer: Arc<dyn SpeechRenderer>,
        playback: PlaybackQueue,
        config: VoiceConfig,
    ) -> Self {
        Self {
            renderer,
            playback,
            config,
            service: None,
        }
    }

    /// Connect to Kokoro (launching it when `launch` is set and nothing is
    /// listening yet) and start the playback thread.
    pub async fn startup(
        config: VoiceConfig,
        launch: Option<LaunchOptions>,
        on_progress: impl Fn(DownloadProgress),
    ) -> Result<Self, VoiceError> {
        let mut service = None;

        if let Some(launch) = launch {
            let svc = KokoroService::from_url(&config.kokoro_url)?;
            if svc.is_reachable().await {
                info!("kokoro: already running at {}", config.kokoro_url);
            } else {
                svc.start(&launch.models_dir, launch.allow_download, on_progress)
                    .await?;
                service = Some(svc);
            }
        }

        let renderer = KokoroRenderer::new(&config.kokoro_url, DEFAULT_RENDER_TIMEOUT)?;
        let renderer = Arc::new(renderer);
        let playback = PlaybackQueue::with_default_output()?;

        Ok(Self {
            renderer,
            playback,
            config,
            service,
        })
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub async fn render(&self, text: &str) -> Result<Waveform, SynthesisError> {
        self.renderer
            .render(text, &self.config.voice, self.config.speed)
            .await
    }

    /// Stop any audio and the sidecar this context launched.
    pub async fn shutdown(&self) {
        self.playback.cancel(self.playback.current_session());
        if let Some(service) = &self.service {
            service.stop().await;
        }
    }
}
