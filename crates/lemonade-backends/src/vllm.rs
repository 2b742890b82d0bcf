//! vLLM adapter (docker-hosted).
//!
//! The engine runs inside a pinned docker image rather than as a bare
//! binary. `install` checks for the docker CLI and pulls the image if it is
//! missing; `load` runs the container on the host network with the compute
//! devices passed through; readiness is probed via `/v1/models` because a
//! cold container can take minutes to come up.

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

const DEFAULT_IMAGE: &str = "rocm/vllm-dev:rocm7.1_navi_ubuntu24.04_py3.12_pytorch_2.8_vllm_0.10.2rc1";
const CONTAINER_NAME: &str = "lemonade-vllm-server";

// First-time model downloads inside the container are slow; this budget is
// inherited behavior and not configurable.
const READY_TIMEOUT: Duration = Duration::from_secs(600);
const READY_POLL: Duration = Duration::from_secs(2);
const PORT_HINT: u16 = 8501;

pub struct VllmBackend {
    process: BackendProcess,
    image: String,
}

impl VllmBackend {
    pub fn new() -> Self {
        Self {
            process: BackendProcess::new("vllm-server"),
            image: install::pinned_version("vllm", DEFAULT_IMAGE),
        }
    }

    async fn docker_available() -> bool {
        lemonade_client::run_with_output("docker", &["--version".to_string()], |_| true)
            .await
            .map(|code| code == 0)
            .unwrap_or(false)
    }

    async fn image_present(image: &str) -> bool {
        let mut found = false;
        let args = vec!["images".to_string(), "-q".to_string(), image.to_string()];
        let _ = lemonade_client::run_with_output("docker", &args, |line| {
            if !line.trim().is_empty() {
                found = true;
            }
            true
        })
        .await;
        found
    }

    async fn remove_container() {
        for action in [vec!["stop", CONTAINER_NAME], vec!["rm", "-f", CONTAINER_NAME]] {
            let args: Vec<String> = action.iter().map(|s| s.to_string()).collect();
            let _ = lemonade_client::run_with_output("docker", &args, |_| true).await;
        }
    }
}

impl Default for VllmBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WrappedBackend for VllmBackend {
    fn name(&self) -> &str {
        "vllm-server"
    }

    fn recipe(&self) -> Recipe {
        Recipe::Vllm
    }

    async fn install(&self) -> Result<()> {
        if !Self::docker_available().await {
            return Err(Error::config(
                "docker CLI not found; the vllm backend requires docker",
            ));
        }
        if Self::image_present(&self.image).await {
            return Ok(());
        }
        tracing::info!("pulling docker image {} (this may take several minutes)", self.image);
        let args = vec!["pull".to_string(), self.image.clone()];
        let exit = lemonade_client::run_with_output("docker", &args, |line| {
            tracing::debug!(target: "docker", "{line}");
            true
        })
        .await?;
        if exit != 0 {
            return Err(Error::process(format!(
                "docker pull failed for image {}",
                self.image
            )));
        }
        Ok(())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, _options: &LoadOptions) -> Result<()> {
        self.install().await?;
        Self::remove_container().await;

        let port = self.process.choose_port(PORT_HINT)?;
        let hf_cache = paths::hf_cache_dir();

        // Foreground `docker run` so the managed child's lifetime tracks the
        // container's.
        let args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            CONTAINER_NAME.into(),
            "--network=host".into(),
            "--device=/dev/kfd".into(),
            "--device=/dev/dri".into(),
            "-v".into(),
            format!("{}:/root/.cache/huggingface/hub", hf_cache.display()),
            self.image.clone(),
            "vllm".into(),
            "serve".into(),
            descriptor.checkpoint.clone(),
            "--port".into(),
            port.to_string(),
        ];
        let process = ManagedProcess::spawn("docker", &args, SpawnOptions::default())?;
        self.process.set_process(process);

        self.process
            .wait_for_ready("/v1/models", READY_TIMEOUT, READY_POLL)
            .await
    }

    async fn unload(&self) {
        Self::remove_container().await;
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
impl CompletionBackend for VllmBackend {
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
