//! llama.cpp adapter.
//!
//! Serves GGUF models through `llama-server`. One adapter instance covers
//! three capability profiles depending on the model's labels: plain chat
//! models, embeddings models (`--embedding`) and rerankers (`--rerank`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use lemonade_client::{ManagedProcess, SpawnOptions};
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::telemetry::TelemetryRecord;
use lemonade_core::{Error, Result, SharedTelemetry};

use crate::backend::{
    BackendProcess, CompletionBackend, EmbeddingsBackend, LoadOptions, RerankingBackend,
    WrappedBackend, INFERENCE_TIMEOUT,
};
use crate::install;

const DEFAULT_VERSION: &str = "b6321";
const READY_TIMEOUT: Duration = Duration::from_secs(300);
const READY_POLL: Duration = Duration::from_millis(100);
const PORT_HINT: u16 = 8001;

pub struct LlamaCppBackend {
    process: BackendProcess,
    flavor: String,
    serves_embeddings: bool,
    serves_reranking: bool,
}

impl LlamaCppBackend {
    pub fn new(flavor: impl Into<String>) -> Self {
        Self {
            process: BackendProcess::new("llama-server"),
            flavor: flavor.into(),
            serves_embeddings: false,
            serves_reranking: false,
        }
    }

    async fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(path) = install::env_override("LEMONADE_LLAMACPP_BIN") {
            return Ok(path);
        }
        let version = install::pinned_version("llamacpp", DEFAULT_VERSION);
        let url = archive_url(&version, &self.flavor);
        let exe = if cfg!(windows) {
            "llama-server.exe"
        } else {
            "build/bin/llama-server"
        };
        install::ensure_archive_installed(self.process.client(), "llamacpp", &version, &url, exe)
            .await
    }
}

fn archive_url(version: &str, flavor: &str) -> String {
    let base = "https://github.com/ggml-org/llama.cpp/releases/download";
    let asset = if cfg!(target_os = "macos") {
        format!("llama-{version}-bin-macos-arm64.zip")
    } else if cfg!(windows) {
        format!("llama-{version}-bin-win-{flavor}-x64.zip")
    } else {
        format!("llama-{version}-bin-ubuntu-{flavor}-x64.zip")
    };
    format!("{base}/{version}/{asset}")
}

/// llama-server polls itself and logs every request; keep the health-check
/// chatter out of our logs.
fn health_check_noise(line: &str) -> bool {
    line.contains("GET /health") || line.contains("\"/health\"")
}

/// Pull prompt/decode timing out of llama-server log lines, e.g.
/// `prompt eval time =     93.55 ms /    12 tokens`
/// `       eval time =   1021.11 ms /    45 tokens (22.69 ms per token, 44.07 tokens per second)`
fn parse_timing_line(line: &str) -> Option<TelemetryRecord> {
    let mut record = TelemetryRecord::default();

    if let Some(rest) = line.split("prompt eval time =").nth(1) {
        let ms: f64 = rest.trim().split_whitespace().next()?.parse().ok()?;
        let tokens: u64 = rest.split('/').nth(1)?.trim().split_whitespace().next()?.parse().ok()?;
        record.input_tokens = tokens;
        record.time_to_first_token_s = ms / 1000.0;
        return Some(record);
    }

    if line.contains("tokens per second") && line.contains("eval time =") {
        let rest = line.split("eval time =").nth(1)?;
        let tokens: u64 = rest.split('/').nth(1)?.trim().split_whitespace().next()?.parse().ok()?;
        let tps: f64 = rest
            .split(',')
            .nth(1)?
            .trim()
            .split_whitespace()
            .next()?
            .parse()
            .ok()?;
        record.output_tokens = tokens;
        record.tokens_per_second = tps;
        return Some(record);
    }

    None
}

#[async_trait]
impl WrappedBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama-server"
    }

    fn recipe(&self) -> Recipe {
        Recipe::LlamaCpp
    }

    async fn install(&self) -> Result<()> {
        self.resolve_executable().await.map(|_| ())
    }

    async fn load(&mut self, descriptor: &ModelDescriptor, options: &LoadOptions) -> Result<()> {
        let exe = self.resolve_executable().await?;
        let model_path = descriptor
            .resolved_path
            .clone()
            .filter(|p| p.exists())
            .ok_or_else(|| {
                Error::validation(format!(
                    "model {} has no files on disk; pull it first",
                    descriptor.name
                ))
            })?;

        let port = self.process.choose_port(PORT_HINT)?;
        self.serves_embeddings = descriptor.has_label("embeddings");
        self.serves_reranking = descriptor.has_label("reranking");

        let mut args: Vec<String> = vec![
            "--model".into(),
            model_path.display().to_string(),
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--ctx-size".into(),
            options.ctx_size.to_string(),
            "--no-webui".into(),
            "--jinja".into(),
        ];
        if self.serves_embeddings {
            args.push("--embedding".into());
        }
        if self.serves_reranking {
            args.push("--rerank".into());
        }
        if let Some(mmproj) = &descriptor.mmproj {
            // The projector sits next to the model file in the snapshot.
            let mmproj_path = model_path
                .parent()
                .map(|d| d.join(mmproj))
                .filter(|p| p.exists())
                .ok_or_else(|| {
                    Error::validation(format!("mmproj file {mmproj} not found next to model"))
                })?;
            args.push("--mmproj".into());
            args.push(mmproj_path.display().to_string());
        }

        let telemetry = self.process.telemetry();
        let spawn = SpawnOptions {
            stdout_filter: Some(Arc::new(health_check_noise)),
            stdout_observer: Some(Arc::new(move |line: &str| {
                if let Some(update) = parse_timing_line(line) {
                    telemetry.record(&update);
                }
            })),
            ..Default::default()
        };
        let process = ManagedProcess::spawn(&exe, &args, spawn)?;
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
        // Embedding and reranker builds of llama-server refuse chat routes.
        if self.serves_embeddings || self.serves_reranking {
            None
        } else {
            Some(self)
        }
    }

    fn as_embeddings(&self) -> Option<&dyn EmbeddingsBackend> {
        if self.serves_embeddings {
            Some(self)
        } else {
            None
        }
    }

    fn as_reranking(&self) -> Option<&dyn RerankingBackend> {
        if self.serves_reranking {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl CompletionBackend for LlamaCppBackend {
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

#[async_trait]
impl EmbeddingsBackend for LlamaCppBackend {
    async fn embeddings(&self, request: &Value) -> Result<Value> {
        self.process
            .forward_request("/v1/embeddings", request, INFERENCE_TIMEOUT)
            .await
    }
}

#[async_trait]
impl RerankingBackend for LlamaCppBackend {
    async fn reranking(&self, request: &Value) -> Result<Value> {
        self.process
            .forward_request("/v1/rerank", request, INFERENCE_TIMEOUT)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_chatter_filter() {
        assert!(health_check_noise("request: GET /health 127.0.0.1 200"));
        assert!(!health_check_noise("request: POST /v1/chat/completions"));
    }

    #[test]
    fn test_parse_prompt_timing() {
        let record =
            parse_timing_line("prompt eval time =     93.55 ms /    12 tokens").unwrap();
        assert_eq!(record.input_tokens, 12);
        assert!((record.time_to_first_token_s - 0.09355).abs() < 1e-9);
    }

    #[test]
    fn test_parse_decode_timing() {
        let record = parse_timing_line(
            "eval time =   1021.11 ms /    45 tokens (22.69 ms per token, 44.07 tokens per second)",
        )
        .unwrap();
        assert_eq!(record.output_tokens, 45);
        assert!((record.tokens_per_second - 44.07).abs() < 1e-9);
    }

    #[test]
    fn test_embedding_model_hides_chat_capability() {
        let mut backend = LlamaCppBackend::new("vulkan");
        backend.serves_embeddings = true;
        assert!(backend.as_completion().is_none());
        assert!(backend.as_embeddings().is_some());
    }
}
