//! ONNX runtime adapter (ryzenai-serve).
//!
//! Serves ONNX GenAI checkpoints on the NPU, split across NPU+iGPU, or on
//! the CPU depending on the recipe. The only backend family that implements
//! the `/responses` API.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lemonade_client::{ManagedProcess, SpawnOptions};
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::{Error, Result, SharedTelemetry};

use crate::backend::{
    BackendProcess, CompletionBackend, LoadOptions, WrappedBackend, INFERENCE_TIMEOUT,
};
use crate::install;

const DEFAULT_VERSION: &str = "1.6.0";
const READY_TIMEOUT: Duration = Duration::from_secs(300);
const READY_POLL: Duration = Duration::from_millis(250);
const PORT_HINT: u16 = 8101;

pub struct OnnxBackend {
    process: BackendProcess,
    recipe: Recipe,
}

impl OnnxBackend {
    pub fn new(recipe: Recipe) -> Self {
        Self {
            process: BackendProcess::new("ryzenai-serve"),
            recipe,
        }
    }

    fn execution_mode(&self) -> &'static str {
        match self.recipe {
            Recipe::OgaNpu => "npu",
            Recipe::OgaHybrid => "hybrid",
            Recipe::OgaCpu => "cpu",
            _ => "auto",
        }
    }

    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = install::env_override("LEMONADE_RYZENAI_BIN") {
            return Ok(path);
        }
        let version = install::pinned_version("ryzenai", DEFAULT_VERSION);
        let url = format!(
            "https://github.com/amd/ryzen-ai-serve/releases/download/v{version}/ryzenai-serve-{}-x64.zip",
            if cfg!(windows) { "win" } else { "linux" }
        );
        let exe = if cfg!(windows) {
            "ryzenai-serve.exe"
        } else {
            "ryzenai-serve"
        };
        install::ensure_archive_installed(self.process.client(), "ryzenai", &version, &url, exe)
            .await
    }

    /// The server needs the concrete snapshot directory that holds
    /// `genai_config.json`, never the bare cache root.
    fn resolve_snapshot_dir(descriptor: &ModelDescriptor) -> Result<PathBuf> {
        let resolved = descriptor
            .resolved_path
            .clone()
            .filter(|p| p.exists())
            .ok_or_else(|| {
                Error::validation(format!(
                    "model {} has no files on disk; pull it first",
                    descriptor.name
                ))
            })?;
        if resolved.join("genai_config.json").is_file() {
            return Ok(resolved);
        }
        Err(Error::validation(format!(
            "no genai_config.json under {}; the snapshot is incomplete",
            resolved.display()
        )))
    }
}

#[async_trait]
impl WrappedBackend for OnnxBackend {
    fn name(&self) -> &str {
        "ryzenai-serve"
    }

    fn recipe(&self) -> Recipe {
        self.recipe
    }

    async fn install(&self) -> Result<()> {
        self.resolve_executable().await.map(|_| ())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, options: &LoadOptions) -> Result<()> {
        let exe = self.resolve_executable().await?;
        let snapshot = Self::resolve_snapshot_dir(descriptor)?;
        let port = self.process.choose_port(PORT_HINT)?;

        let args: Vec<String> = vec![
            "--model".into(),
            snapshot.display().to_string(),
            "--port".into(),
            port.to_string(),
            "--mode".into(),
            self.execution_mode().into(),
            "--ctx-size".into(),
            options.ctx_size.to_string(),
        ];

        let process = ManagedProcess::spawn(&exe, &args, SpawnOptions::default())?;
        self.process.set_process(process);
        self.process
            .wait_for_ready("/health", READY_TIMEOUT, READY_POLL)
            .await
    }

    async fn unload(&self) {
        self.process.stop().await;
    }

    fn base_url(&self) -> Option<String> {
        Some(self.process.base_url())
    }

    fn telemetry(&self) -> SharedTelemetry {
        self.process.telemetry()
    }

    async fn is_running(&self) -> bool {
        self.process.is_running().await
    }

    fn as_completion(&self) -> Option<&dyn CompletionBackend> {
        Some(self)
    }
}

#[async_trait]
impl CompletionBackend for OnnxBackend {
    async fn chat_completion(&self, request: &Value) -> Result<Value> {
        self.process
            .forward_request("/v1/chat/completions", request, INFERENCE_TIMEOUT)
            .await
    }

    async fn completion(&self, request: &Value) -> Result<Value> {
        self.process
            .forward_request("/v1/completions", request, INFERENCE_TIMEOUT)
            .await
    }

    async fn responses(&self, request: &Value) -> Result<Value> {
        self.process
            .forward_request("/v1/responses", request, INFERENCE_TIMEOUT)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_from_recipe() {
        assert_eq!(OnnxBackend::new(Recipe::OgaNpu).execution_mode(), "npu");
        assert_eq!(OnnxBackend::new(Recipe::OgaHybrid).execution_mode(), "hybrid");
        assert_eq!(OnnxBackend::new(Recipe::OgaCpu).execution_mode(), "cpu");
    }

    #[test]
    fn test_snapshot_dir_requires_genai_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = ModelDescriptor {
            name: "m".into(),
            checkpoint: "org/repo".into(),
            recipe: Recipe::OgaCpu,
            mmproj: None,
            labels: vec![],
            size_gb: 0.0,
            suggested: false,
            source: Default::default(),
            downloaded: true,
            resolved_path: Some(dir.path().to_path_buf()),
        };
        assert!(OnnxBackend::resolve_snapshot_dir(&descriptor).is_err());

        std::fs::write(dir.path().join("genai_config.json"), b"{}").unwrap();
        assert!(OnnxBackend::resolve_snapshot_dir(&descriptor).is_ok());

        descriptor.resolved_path = Some(dir.path().join("missing"));
        assert!(OnnxBackend::resolve_snapshot_dir(&descriptor).is_err());
    }
}
