//! Kokoro sidecar lifecycle — spawns and monitors the `koko` TTS server

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_core::types::DownloadProgress;

use crate::download;
use crate::error::ServiceError;

const KOKORO_SIDECAR: &str = "koko";

pub const DEFAULT_KOKORO_PORT: u16 = 3001;

/// How long a freshly spawned server gets to load its model.
pub const STARTUP_TIMEOUT_SECS: u64 = 60;

#[derive(Clone)]
pub struct KokoroService {
    host: String,
    port: u16,
    child: Arc<Mutex<Option<Child>>>,
}

impl Default for KokoroService {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_KOKORO_PORT)
    }
}

impl KokoroService {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Service for the server a renderer would talk to at `url`.
    pub fn from_url(url: &str) -> Result<Self, ServiceError> {
        let invalid = |reason: String| ServiceError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("no host".to_string()))?;
        let port = parsed.port_or_known_default().unwrap_or(DEFAULT_KOKORO_PORT);
        Ok(Self::new(host, port))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Address handed to `koko --ip`.
    fn bind_ip(&self) -> &str {
        match self.host.as_str() {
            "localhost" => "127.0.0.1",
            host => host.trim_start_matches('[').trim_end_matches(']'),
        }
    }

    /// Check if the Kokoro port is already responding.
    pub async fn is_reachable(&self) -> bool {
        reqwest::Client::new()
            .get(format!("{}/", self.base_url()))
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .is_ok()
    }

    /// Whether this handle owns a server process that is still alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        let alive = match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            *guard = None;
        }
        alive
    }

    /// Ensure models are on disk, spawn `koko`, and wait until it answers.
    pub async fn start(
        &self,
        models_dir: &Path,
        allow_download: bool,
        on_progress: impl Fn(DownloadProgress),
    ) -> Result<(), ServiceError> {
        let (model, voices) =
            download::ensure_kokoro_models(models_dir, allow_download, on_progress).await?;

        if !self.is_running().await {
            self.spawn(&model, &voices).await?;
        }

        self.wait_for_health(STARTUP_TIMEOUT_SECS).await
    }

    async fn spawn(&self, model_path: &Path, voices_path: &Path) -> Result<(), ServiceError> {
        let binary = resolve_sidecar(KOKORO_SIDECAR)?;
        info!("kokoro: starting {} at {}", binary.display(), self.base_url());

        // koko --model <path> --data <voices> openai --ip 127.0.0.1 --port 3001
        let mut child = tokio::process::Command::new(&binary)
            .arg("--model")
            .arg(model_path)
            .arg("--data")
            .arg(voices_path)
            .args(["openai", "--ip", self.bind_ip(), "--port", &self.port.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::Spawn {
                name: KOKORO_SIDECAR.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[kokoro] {line}");
                }
            });
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    pub async fn wait_for_health(&self, timeout_secs: u64) -> Result<(), ServiceError> {
        let url = format!("{}/", self.base_url());
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ServiceError::NotReady {
                    name: "kokoro".to_string(),
                    secs: timeout_secs,
                });
            }

            match client.get(&url).timeout(Duration::from_secs(1)).send().await {
                Ok(_) => {
                    info!("kokoro: ready at {}", self.base_url());
                    return Ok(());
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }

    pub async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            info!("kokoro: stopping");
            if let Err(e) = child.kill().await {
                warn!("kokoro: kill failed: {e}");
            }
        }
    }

    /// Kill the server without awaiting, for use outside the runtime.
    pub fn stop_sync(&self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Look next to the executable first, then fall back to `PATH`.
fn resolve_sidecar(name: &str) -> Result<PathBuf, ServiceError> {
    let exe = std::env::current_exe()?;
    if let Some(exe_dir) = exe.parent() {
        for candidate in [exe_dir.join(name), exe_dir.join(format!("{name}.exe"))] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Ok(PathBuf::from(name))
}
