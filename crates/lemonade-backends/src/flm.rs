//! FastFlowLM adapter.
//!
//! FLM brings its own CLI for model management (`flm pull` / `flm list` /
//! `flm remove`), so this adapter only has to install the CLI, spawn
//! `flm serve`, and forward OpenAI-shaped requests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lemonade_client::{ManagedProcess, SpawnOptions};
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::{paths, Error, Result, SharedTelemetry};

use crate::backend::{
    BackendProcess, CompletionBackend, LoadOptions, WrappedBackend, INFERENCE_TIMEOUT,
};
use crate::install;

const DEFAULT_VERSION: &str = "0.9.12";
const READY_TIMEOUT: Duration = Duration::from_secs(300);
const READY_POLL: Duration = Duration::from_millis(250);
const PORT_HINT: u16 = 8201;

pub struct FlmBackend {
    process: BackendProcess,
}

impl FlmBackend {
    pub fn new() -> Self {
        Self {
            process: BackendProcess::new("flm"),
        }
    }

    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = install::env_override("LEMONADE_FLM_BIN") {
            return Ok(path);
        }
        if let Some(path) = paths::find_flm_executable() {
            return Ok(path);
        }
        let version = install::pinned_version("flm", DEFAULT_VERSION);
        let url = format!(
            "https://github.com/FastFlowLM/FastFlowLM/releases/download/v{version}/flm-{}-x64.zip",
            if cfg!(windows) { "win" } else { "linux" }
        );
        let exe = if cfg!(windows) { "flm.exe" } else { "flm" };
        install::ensure_archive_installed(self.process.client(), "flm", &version, &url, exe).await
    }
}

impl Default for FlmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WrappedBackend for FlmBackend {
    fn name(&self) -> &str {
        "flm"
    }

    fn recipe(&self) -> Recipe {
        Recipe::Flm
    }

    async fn install(&self) -> Result<()> {
        self.resolve_executable().await.map(|_| ())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, _options: &LoadOptions) -> Result<()> {
        let exe = self.resolve_executable().await?;
        if descriptor.checkpoint.is_empty() {
            return Err(Error::validation(format!(
                "FLM model {} has no checkpoint",
                descriptor.name
            )));
        }
        let port = self.process.choose_port(PORT_HINT)?;

        let args: Vec<String> = vec![
            "serve".into(),
            descriptor.checkpoint.clone(),
            "--port".into(),
            port.to_string(),
        ];
        let process = ManagedProcess::spawn(&exe, &args, SpawnOptions::default())?;
        self.process.set_process(process);

        self.process
            .wait_for_ready("/v1/models", READY_TIMEOUT, READY_POLL)
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
impl CompletionBackend for FlmBackend {
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
}
