use crate::{
    error::{Result, WorkerError},
    io::{
        crypto::verify_sha256,
        net::stream_to_file,
        paths::models_cache_dir,
        progress::Transfer,
    },
    model::registry::resolve_manifest_url,
};

use reqwest::blocking::Client;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub file: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub backend: String,
    pub sample_rate: u32,
    pub window: usize,
    pub hop: usize,
    pub stems: Vec<String>,
    #[serde(default)]
    pub input_layout: String,
    #[serde(default)]
    pub output_layout: String,
    pub artifacts: Vec<ModelArtifact>,
}

impl ModelManifest {
    /// The ONNX file when present, else the first artifact.
    pub fn primary_artifact(&self) -> Result<&ModelArtifact> {
        self.artifacts
            .iter()
            .find(|a| a.file.ends_with(".onnx"))
            .or_else(|| self.artifacts.first())
            .ok_or_else(|| WorkerError::Model(format!("manifest `{}` lists no artifacts", self.name)))
    }
}

pub struct ModelHandle {
    pub manifest: ModelManifest,
    pub local_path: PathBuf,
}

pub fn ensure_model(
    client: &Client,
    model_name: &str,
    manifest_url_override: Option<&str>,
) -> Result<ModelHandle> {
    let cache_dir = models_cache_dir()?;
    ensure_model_in(client, &cache_dir, model_name, manifest_url_override)
}

/// Fetches the manifest, then makes sure a checksum-verified copy of its
/// primary artifact sits in `cache_dir`.
pub fn ensure_model_in(
    client: &Client,
    cache_dir: &Path,
    model_name: &str,
    manifest_url_override: Option<&str>,
) -> Result<ModelHandle> {
    let manifest_url = match manifest_url_override {
        Some(url) => url.to_string(),
        None => resolve_manifest_url(model_name)?,
    };

    let manifest: ModelManifest = client
        .get(&manifest_url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.json())
        .map_err(|e| WorkerError::Model(format!("manifest {manifest_url}: {e}")))?;

    let a = manifest.primary_artifact()?;
    if a.sha256.len() < 8 {
        return Err(WorkerError::Model(format!(
            "manifest `{}` has a malformed sha256",
            manifest.name
        )));
    }

    fs::create_dir_all(cache_dir)?;
    let ext = Path::new(&a.file)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| format!(".{s}"))
        .unwrap_or_default();
    let file_name = format!("{}-{}{}", manifest.name, &a.sha256[..8], ext);
    let local_path = cache_dir.join(file_name);

    let need_download = !matches!(verify_sha256(&local_path, &a.sha256), Ok(true));
    if need_download {
        tracing::info!(model = %manifest.name, url = %a.url, "downloading model");
        let resp = client
            .get(&a.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| WorkerError::Model(format!("model download {}: {e}", a.url)))?;
        stream_to_file(resp, &local_path, Transfer::Model, None)
            .map_err(|e| WorkerError::Model(format!("model download {}: {e}", a.url)))?;

        if !verify_sha256(&local_path, &a.sha256)? {
            fs::remove_file(&local_path).ok();
            return Err(WorkerError::Checksum {
                path: local_path.display().to_string(),
            });
        }
        if a.size_bytes > 0 {
            let size = fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
            if size != a.size_bytes {
                tracing::warn!(
                    path = %local_path.display(),
                    expected = a.size_bytes,
                    got = size,
                    "model size mismatch"
                );
            }
        }
    } else {
        tracing::debug!(path = %local_path.display(), "model cache hit");
    }

    Ok(ModelHandle {
        manifest,
        local_path,
    })
}
