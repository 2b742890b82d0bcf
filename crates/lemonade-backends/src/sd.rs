//! stable-diffusion.cpp adapter.
//!
//! Image generation has no long-running server: every request spawns the
//! `sd` CLI with a per-request output path, reads the image back, and
//! returns it base64-encoded. The adapter therefore never enters the
//! router's loaded-backend table.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use lemonade_client::HttpClient;
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::{paths, Error, Result, SharedTelemetry};

use crate::backend::{ImageBackend, LoadOptions, WrappedBackend};
use crate::install;

const DEFAULT_VERSION: &str = "master-2c39fd0";

pub struct SdBackend {
    client: HttpClient,
    telemetry: SharedTelemetry,
    model_path: Option<PathBuf>,
    keep_output_files: bool,
}

impl SdBackend {
    pub fn new() -> Self {
        Self {
            client: HttpClient::new(),
            telemetry: SharedTelemetry::new(),
            model_path: None,
            keep_output_files: false,
        }
    }

    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = install::env_override("LEMONADE_SD_BIN") {
            return Ok(path);
        }
        let version = install::pinned_version("sd-cpp", DEFAULT_VERSION);
        let url = format!(
            "https://github.com/leejet/stable-diffusion.cpp/releases/download/{version}/sd-{}-x64.zip",
            if cfg!(windows) { "win" } else { "linux" }
        );
        let exe = if cfg!(windows) { "sd.exe" } else { "sd" };
        install::ensure_archive_installed(&self.client, "sd-cpp", &version, &url, exe).await
    }

    /// SD snapshots hold the weights somewhere inside the repo; find the
    /// first weight file when the resolved path is a directory.
    fn locate_weights(resolved: &PathBuf) -> Option<PathBuf> {
        if resolved.is_file() {
            return Some(resolved.clone());
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        collect_weight_files(resolved, &mut candidates);
        candidates.sort();
        candidates.into_iter().next()
    }
}

fn collect_weight_files(dir: &PathBuf, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_weight_files(&path, out);
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if matches!(ext, "safetensors" | "gguf" | "ckpt") {
                out.push(path);
            }
        }
    }
}

impl Default for SdBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WrappedBackend for SdBackend {
    fn name(&self) -> &str {
        "sd"
    }

    fn recipe(&self) -> Recipe {
        Recipe::SdCpp
    }

    async fn install(&self) -> Result<()> {
        self.resolve_executable().await.map(|_| ())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, options: &LoadOptions) -> Result<()> {
        self.resolve_executable().await?;
        let resolved = descriptor
            .resolved_path
            .clone()
            .filter(|p| p.exists())
            .ok_or_else(|| {
                Error::validation(format!(
                    "image model {} has no files on disk; pull it first",
                    descriptor.name
                ))
            })?;
        self.model_path = Self::locate_weights(&resolved).or(Some(resolved));
        self.keep_output_files = options.keep_image_files;
        Ok(())
    }

    async fn unload(&self) {
        // Nothing to stop: generation is per-request and the adapter never
        // enters the loaded-backend table.
    }

    fn base_url(&self) -> Option<String> {
        None
    }

    fn telemetry(&self) -> SharedTelemetry {
        self.telemetry.clone()
    }

    async fn is_running(&self) -> bool {
        self.model_path.is_some()
    }

    fn as_image(&self) -> Option<&dyn ImageBackend> {
        Some(self)
    }
}

#[async_trait]
impl ImageBackend for SdBackend {
    async fn generate(&self, request: &Value) -> Result<Value> {
        let model = self
            .model_path
            .clone()
            .ok_or_else(|| Error::model_not_loaded("sd"))?;

        let prompt = request
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::validation("image generation requires a 'prompt'"))?;

        let exe = self.resolve_executable().await?;

        let output_dir = paths::cache_dir().join("image_output");
        std::fs::create_dir_all(&output_dir)?;
        let output = output_dir.join(format!("{}.png", uuid::Uuid::new_v4()));

        let mut args: Vec<String> = vec![
            "--model".into(),
            model.display().to_string(),
            "--prompt".into(),
            prompt.to_string(),
            "--output".into(),
            output.display().to_string(),
        ];
        if let Some(size) = request.get("size").and_then(Value::as_str) {
            if let Some((w, h)) = size.split_once('x') {
                args.extend(["-W".into(), w.to_string(), "-H".into(), h.to_string()]);
            }
        }
        if let Some(steps) = request.get("steps").and_then(Value::as_u64) {
            args.extend(["--steps".into(), steps.to_string()]);
        }
        if let Some(cfg) = request.get("cfg_scale").and_then(Value::as_f64) {
            args.extend(["--cfg-scale".into(), cfg.to_string()]);
        }
        if let Some(seed) = request.get("seed").and_then(Value::as_i64) {
            args.extend(["--seed".into(), seed.to_string()]);
        }

        let exit = lemonade_client::run_with_output(&exe, &args, |line| {
            tracing::debug!(target: "sd", "{line}");
            true
        })
        .await?;
        if exit != 0 {
            return Err(Error::process(format!(
                "image generation failed with exit code {exit}"
            )));
        }

        let bytes = std::fs::read(&output)
            .map_err(|e| Error::process(format!("sd produced no output image: {e}")))?;
        if !self.keep_output_files {
            let _ = std::fs::remove_file(&output);
        }

        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(json!({
            "created": chrono::Utc::now().timestamp(),
            "data": [ { "b64_json": b64 } ],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_weights_prefers_files_inside_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("unet")).unwrap();
        std::fs::write(dir.path().join("unet/model.safetensors"), b"w").unwrap();
        std::fs::write(dir.path().join("README.md"), b"doc").unwrap();

        let found = SdBackend::locate_weights(&dir.path().to_path_buf()).unwrap();
        assert!(found.ends_with("unet/model.safetensors"));
    }

    #[tokio::test]
    async fn test_generate_without_prompt_is_rejected() {
        let mut backend = SdBackend::new();
        backend.model_path = Some(PathBuf::from("/tmp/model.safetensors"));
        let err = backend.generate(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
