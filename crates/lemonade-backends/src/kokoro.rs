//! Kokoro text-to-speech adapter.
//!
//! Runs the kokoro server and forwards `/v1/audio/speech` requests, relaying
//! the synthesized audio back as raw bytes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lemonade_client::{ManagedProcess, SpawnOptions};
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::{Error, Result, SharedTelemetry};

use crate::backend::{BackendProcess, LoadOptions, SpeechBackend, WrappedBackend};
use crate::install;

const DEFAULT_VERSION: &str = "0.2.4";
const READY_TIMEOUT: Duration = Duration::from_secs(120);
const READY_POLL: Duration = Duration::from_millis(250);
const PORT_HINT: u16 = 8401;

pub struct KokoroBackend {
    process: BackendProcess,
}

impl KokoroBackend {
    pub fn new() -> Self {
        Self {
            process: BackendProcess::new("kokoro"),
        }
    }

    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = install::env_override("LEMONADE_KOKORO_BIN") {
            return Ok(path);
        }
        let version = install::pinned_version("kokoro", DEFAULT_VERSION);
        let url = format!(
            "https://github.com/lemonade-sdk/kokoro-server/releases/download/v{version}/kokoro-{}-x64.zip",
            if cfg!(windows) { "win" } else { "linux" }
        );
        let exe = if cfg!(windows) { "kokoro.exe" } else { "kokoro" };
        install::ensure_archive_installed(self.process.client(), "kokoro", &version, &url, exe)
            .await
    }
}

impl Default for KokoroBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WrappedBackend for KokoroBackend {
    fn name(&self) -> &str {
        "kokoro"
    }

    fn recipe(&self) -> Recipe {
        Recipe::Kokoro
    }

    async fn install(&self) -> Result<()> {
        self.resolve_executable().await.map(|_| ())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, _options: &LoadOptions) -> Result<()> {
        let exe = self.resolve_executable().await?;
        let model_path = descriptor
            .resolved_path
            .clone()
            .filter(|p| p.exists())
            .ok_or_else(|| {
                Error::validation(format!(
                    "TTS model {} has no files on disk; pull it first",
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

    fn as_speech(&self) -> Option<&dyn SpeechBackend> {
        Some(self)
    }
}

#[async_trait]
impl SpeechBackend for KokoroBackend {
    async fn speech(&self, request: &Value) -> Result<(Vec<u8>, String)> {
        let bytes = self
            .process
            .forward_bytes_request("/v1/audio/speech", request)
            .await?;
        let content_type = match request.get("response_format").and_then(Value::as_str) {
            Some("mp3") => "audio/mpeg".to_string(),
            _ => "audio/wav".to_string(),
        };
        Ok((bytes, content_type))
    }
}
