//! Kokoro model downloader with progress reporting via callback

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use parley_core::types::{DownloadProgress, KOKORO_MODEL, KOKORO_VOICES, ModelInfo};

use crate::error::ServiceError;

/// `<cache>/lm-studio-tts/models`, if the platform has a cache directory.
pub fn default_models_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.cache_dir().join("lm-studio-tts").join("models"))
}

/// Check if a model file exists under the given models directory
pub fn model_exists(models_dir: &Path, model: &ModelInfo) -> bool {
    models_dir.join(model.filename).is_file()
}

/// Get the path to a model file under the given models directory
pub fn model_path(models_dir: &Path, model: &ModelInfo) -> PathBuf {
    models_dir.join(model.filename)
}

fn progress(model: &ModelInfo, bytes_done: u64, bytes_total: u64, status: &str) -> DownloadProgress {
    let percent = if bytes_total == 0 {
        100.0
    } else {
        (bytes_done as f32 / bytes_total as f32 * 100.0).min(100.0)
    };
    DownloadProgress {
        model: model.name.to_string(),
        percent,
        bytes_done,
        bytes_total,
        status: status.to_string(),
    }
}

/// Download a model with progress reporting.
///
/// An interrupted download leaves a `.partial` file behind; the next attempt
/// resumes it with a `Range` request.
pub async fn download_model(
    models_dir: &Path,
    model: &ModelInfo,
    on_progress: impl Fn(DownloadProgress),
) -> Result<PathBuf, ServiceError> {
    tokio::fs::create_dir_all(models_dir).await?;

    let dest = model_path(models_dir, model);
    if dest.is_file() {
        on_progress(progress(model, model.expected_size, model.expected_size, "complete"));
        return Ok(dest);
    }

    let partial = models_dir.join(format!("{}.partial", model.filename));
    let existing_size = match tokio::fs::metadata(&partial).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => 0,
    };

    let client = reqwest::Client::new();
    let mut req = client.get(model.url);
    if existing_size > 0 {
        info!("download: resuming {} at {existing_size} bytes", model.filename);
        req = req.header("Range", format!("bytes={existing_size}-"));
    }

    let resp = req
        .send()
        .await
        .map_err(|e| ServiceError::Download(format!("request failed: {e}")))?;

    let resumed = resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
    if !resp.status().is_success() {
        return Err(ServiceError::Download(format!(
            "{} returned status {}",
            model.filename,
            resp.status()
        )));
    }

    let total_size = if resumed {
        resp.headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.rsplit('/').next())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(model.expected_size)
    } else {
        resp.content_length().unwrap_or(model.expected_size)
    };

    // A server that ignored the Range header sends the whole file again.
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true);
    if resumed {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let mut file = options.open(&partial).await?;

    let mut bytes_done = if resumed { existing_size } else { 0 };
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ServiceError::Download(format!("stream error: {e}")))?;
        file.write_all(&chunk).await?;
        bytes_done += chunk.len() as u64;
        on_progress(progress(model, bytes_done, total_size, "downloading"));
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, &dest).await?;
    on_progress(progress(model, bytes_done, bytes_done, "complete"));
    info!("download: {} ready ({bytes_done} bytes)", model.filename);

    Ok(dest)
}

/// Make sure the Kokoro model and voices are on disk.
///
/// Returns `(model, voices)` paths. With `allow_download` off, missing files
/// are an error instead of a download.
pub async fn ensure_kokoro_models(
    models_dir: &Path,
    allow_download: bool,
    on_progress: impl Fn(DownloadProgress),
) -> Result<(PathBuf, PathBuf), ServiceError> {
    let model = ensure_model(models_dir, &KOKORO_MODEL, allow_download, &on_progress).await?;
    let voices = ensure_model(models_dir, &KOKORO_VOICES, allow_download, &on_progress).await?;
    Ok((model, voices))
}

async fn ensure_model(
    models_dir: &Path,
    model: &ModelInfo,
    allow_download: bool,
    on_progress: impl Fn(DownloadProgress),
) -> Result<PathBuf, ServiceError> {
    if model_exists(models_dir, model) {
        return Ok(model_path(models_dir, model));
    }
    if !allow_download {
        return Err(ServiceError::ModelMissing {
            file: model.filename.to_string(),
            dir: models_dir.display().to_string(),
        });
    }
    download_model(models_dir, model, on_progress).await
}
