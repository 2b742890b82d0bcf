//! whisper.cpp adapter.
//!
//! Runs `whisper-server` against a `.bin` model and posts audio to its
//! `/inference` endpoint as multipart form data.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lemonade_client::{ManagedProcess, SpawnOptions};
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::{Error, Result, SharedTelemetry};

use crate::backend::{BackendProcess, LoadOptions, TranscriptionBackend, WrappedBackend};
use crate::install;

const DEFAULT_VERSION: &str = "v1.7.6";
const READY_TIMEOUT: Duration = Duration::from_secs(120);
const READY_POLL: Duration = Duration::from_millis(100);
const PORT_HINT: u16 = 8301;

/// Transcription of a long clip can still take a while on CPU.
const TRANSCRIBE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(600));

pub struct WhisperBackend {
    process: BackendProcess,
}

impl WhisperBackend {
    pub fn new() -> Self {
        Self {
            process: BackendProcess::new("whisper-server"),
        }
    }

    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = install::env_override("LEMONADE_WHISPER_BIN") {
            return Ok(path);
        }
        let version = install::pinned_version("whispercpp", DEFAULT_VERSION);
        let url = format!(
            "https://github.com/ggml-org/whisper.cpp/releases/download/{version}/whisper-bin-{}-x64.zip",
            if cfg!(windows) { "win" } else { "linux" }
        );
        let exe = if cfg!(windows) {
            "whisper-server.exe"
        } else {
            "whisper-server"
        };
        install::ensure_archive_installed(self.process.client(), "whispercpp", &version, &url, exe)
            .await
    }
}

impl Default for WhisperBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WrappedBackend for WhisperBackend {
    fn name(&self) -> &str {
        "whisper-server"
    }

    fn recipe(&self) -> Recipe {
        Recipe::WhisperCpp
    }

    async fn install(&self) -> Result<()> {
        self.resolve_executable().await.map(|_| ())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, _options: &LoadOptions) -> Result<()> {
        let exe = self.resolve_executable().await?;
        let model_path = descriptor
            .resolved_path
            .clone()
            .filter(|p| p.is_file())
            .ok_or_else(|| {
                Error::validation(format!(
                    "whisper model {} has no .bin file on disk; pull it first",
                    descriptor.name
                ))
            })?;
        let port = self.process.choose_port(PORT_HINT)?;

        let args: Vec<String> = vec![
            "--model".into(),
            model_path.display().to_string(),
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
        ];
        let process = ManagedProcess::spawn(&exe, &args, SpawnOptions::default())?;
        self.process.set_process(process);

        self.process
            .wait_for_ready("/", READY_TIMEOUT, READY_POLL)
            .await
    }

    async fn unload(&self) {
        self.process.stop().await;
    }

    fn base_url(&self) -> Option<String> {
        Some(self.process.host_url())
    }

    fn telemetry(&self) -> SharedTelemetry {
        self.process.telemetry()
    }

    async fn is_running(&self) -> bool {
        self.process.is_running().await
    }

    fn as_transcription(&self) -> Option<&dyn TranscriptionBackend> {
        Some(self)
    }
}

#[async_trait]
impl TranscriptionBackend for WhisperBackend {
    async fn transcribe(&self, request: &Value) -> Result<Value> {
        self.process
            .forward_multipart_request("/inference", request, TRANSCRIBE_TIMEOUT)
            .await
    }
}
