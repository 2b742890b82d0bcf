//! The backend adapter contract.
//!
//! Every inference engine the gateway drives is wrapped in an adapter that
//! implements [`WrappedBackend`] plus whichever capability traits the engine
//! actually supports. The router asks for capabilities instead of assuming
//! them, so an embeddings request against an image backend fails with a
//! structured error rather than a confused forward.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;

use lemonade_client::{find_free_port, HttpClient, ManagedProcess};
use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::{Error, Result, SharedTelemetry};

/// Inference requests have no deadline; generation time is open-ended.
pub const INFERENCE_TIMEOUT: Option<Duration> = None;

/// Options influencing how a backend is spawned.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub ctx_size: u32,
    pub do_not_upgrade: bool,
    /// llama.cpp build flavor (vulkan, metal, cpu).
    pub llamacpp_flavor: String,
    /// Keep image-generation output files on disk instead of deleting them
    /// after the response.
    pub keep_image_files: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            ctx_size: 4096,
            do_not_upgrade: true,
            llamacpp_flavor: default_llamacpp_flavor().to_string(),
            keep_image_files: false,
        }
    }
}

pub fn default_llamacpp_flavor() -> &'static str {
    if cfg!(target_os = "macos") {
        "metal"
    } else {
        "vulkan"
    }
}

/// Common contract for a wrapped inference engine.
#[async_trait]
pub trait WrappedBackend: Send + Sync {
    /// Human-readable engine name for logs and errors.
    fn name(&self) -> &str;

    fn recipe(&self) -> Recipe;

    /// Ensure the engine's executable (or image) is present, downloading the
    /// pinned version if needed.
    async fn install(&self) -> Result<()>;

    /// Spawn the engine for `descriptor` and wait until it answers.
    async fn load(&mut self, descriptor: &ModelDescriptor, options: &LoadOptions) -> Result<()>;

    /// Stop the engine and release its port. Takes `&self` because the
    /// router's table shares instances; the table entry is removed before
    /// this is called.
    async fn unload(&self);

    /// Base URL requests are forwarded to, once loaded.
    fn base_url(&self) -> Option<String>;

    fn telemetry(&self) -> SharedTelemetry;

    /// Whether the owned child process is still alive.
    async fn is_running(&self) -> bool;

    // Capability accessors: ask, don't assume.
    fn as_completion(&self) -> Option<&dyn CompletionBackend> {
        None
    }
    fn as_embeddings(&self) -> Option<&dyn EmbeddingsBackend> {
        None
    }
    fn as_reranking(&self) -> Option<&dyn RerankingBackend> {
        None
    }
    fn as_transcription(&self) -> Option<&dyn TranscriptionBackend> {
        None
    }
    fn as_speech(&self) -> Option<&dyn SpeechBackend> {
        None
    }
    fn as_image(&self) -> Option<&dyn ImageBackend> {
        None
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn chat_completion(&self, request: &Value) -> Result<Value>;
    async fn completion(&self, request: &Value) -> Result<Value>;
    /// OpenAI `/responses`; only the ONNX family implements it.
    async fn responses(&self, _request: &Value) -> Result<Value> {
        Err(Error::unsupported("Responses", "this backend"))
    }
}

#[async_trait]
pub trait EmbeddingsBackend: Send + Sync {
    async fn embeddings(&self, request: &Value) -> Result<Value>;
}

#[async_trait]
pub trait RerankingBackend: Send + Sync {
    async fn reranking(&self, request: &Value) -> Result<Value>;
}

#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// `request` carries `file_data` (base64), `filename`, and the optional
    /// transcription fields (`language`, `prompt`, `temperature`, …).
    async fn transcribe(&self, request: &Value) -> Result<Value>;
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Returns the synthesized audio bytes and their content type.
    async fn speech(&self, request: &Value) -> Result<(Vec<u8>, String)>;
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &Value) -> Result<Value>;
}

/// Shared state for adapters that run one HTTP server child process: the
/// chosen port, the process handle, the telemetry accumulator, and the
/// forwarding helpers.
///
/// The process slot sits behind a mutex so `stop` can run through the
/// shared reference the router's table hands out.
pub struct BackendProcess {
    server_name: String,
    port: u16,
    process: tokio::sync::Mutex<Option<ManagedProcess>>,
    telemetry: SharedTelemetry,
    client: HttpClient,
}

impl BackendProcess {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            port: 0,
            process: tokio::sync::Mutex::new(None),
            telemetry: SharedTelemetry::new(),
            client: HttpClient::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn telemetry(&self) -> SharedTelemetry {
        self.telemetry.clone()
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn set_process(&mut self, process: ManagedProcess) {
        *self.process.get_mut() = Some(process);
    }

    /// Pick an unused TCP port, preferring the hint.
    pub fn choose_port(&mut self, hint: u16) -> Result<u16> {
        self.port = find_free_port(hint)?;
        tracing::info!("{} will use port {}", self.server_name, self.port);
        Ok(self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/v1", self.port)
    }

    pub fn host_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub async fn is_running(&self) -> bool {
        match self.process.lock().await.as_ref() {
            Some(p) => p.is_running().await,
            None => false,
        }
    }

    /// Stop the child process, if any.
    pub async fn stop(&self) {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            if let Err(e) = process.stop().await {
                tracing::warn!("{}: stop failed: {e}", self.server_name);
            }
        }
    }

    /// Poll `path` until it answers 200, checking the child is still alive on
    /// every iteration. A dead child aborts immediately with a descriptive
    /// error instead of burning the whole timeout.
    pub async fn wait_for_ready(&self, path: &str, timeout: Duration, poll: Duration) -> Result<()> {
        let url = format!("{}{}", self.host_url(), path);
        tracing::info!("waiting for {} to be ready...", self.server_name);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut iterations: u32 = 0;
        loop {
            {
                let process = self.process.lock().await;
                if let Some(process) = process.as_ref() {
                    if !process.is_running().await {
                        let exit = process.exit_code().await;
                        return Err(Error::process(format!(
                            "{} terminated before becoming ready (exit code {:?}). \
                             This usually means missing drivers or an incompatible \
                             model file; run the backend manually to see its error.",
                            self.server_name, exit
                        )));
                    }
                }
            }

            if self.client.is_reachable(&url, Duration::from_secs(1)).await {
                tracing::info!("{} is ready", self.server_name);
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "{} failed to start within {:?}",
                    self.server_name, timeout
                )));
            }

            iterations += 1;
            if iterations % 100 == 0 {
                tracing::info!("still waiting for {}...", self.server_name);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Synchronous JSON POST to the backend. `endpoint` is relative to the
    /// host root (adapters spell out their own `/v1` prefixes). Non-200
    /// responses are wrapped into the structured error shape with the
    /// backend's status and body.
    pub async fn forward_request(
        &self,
        endpoint: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_running().await {
            return Err(Error::model_not_loaded(self.server_name.clone()));
        }
        let url = format!("{}{}", self.host_url(), endpoint);
        let response = self
            .client
            .post_json(&url, request, &HashMap::new(), timeout)
            .await?;

        if response.status == 200 {
            Ok(serde_json::from_str(&response.body)?)
        } else {
            Err(Error::backend(
                format!("{} request failed", self.server_name),
                response.status,
                response.body,
            ))
        }
    }

    /// POST `request` as multipart form data, decoding base64 `file_data`
    /// into a file part named `file`.
    pub async fn forward_multipart_request(
        &self,
        endpoint: &str,
        request: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_running().await {
            return Err(Error::model_not_loaded(self.server_name.clone()));
        }

        let mut form = reqwest::multipart::Form::new();

        if let Some(data) = request.get("file_data").and_then(Value::as_str) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| Error::validation(format!("invalid base64 file_data: {e}")))?;
            let filename = request
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or("audio.wav")
                .to_string();
            form = form.part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            );
        }

        for field in [
            "model",
            "language",
            "prompt",
            "response_format",
            "temperature",
            "voice",
            "input",
        ] {
            if let Some(value) = request.get(field) {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                form = form.text(field.to_string(), text);
            }
        }

        let url = format!("{}{}", self.host_url(), endpoint);
        let response = self.client.post_multipart(&url, form, timeout).await?;

        if response.status == 200 {
            Ok(serde_json::from_str(&response.body)?)
        } else {
            Err(Error::backend(
                format!("{} request failed", self.server_name),
                response.status,
                response.body,
            ))
        }
    }

    /// POST and collect a raw byte response (TTS audio).
    pub async fn forward_bytes_request(
        &self,
        endpoint: &str,
        request: &Value,
    ) -> Result<Vec<u8>> {
        if !self.is_running().await {
            return Err(Error::model_not_loaded(self.server_name.clone()));
        }
        let url = format!("{}{}", self.host_url(), endpoint);
        let mut bytes = Vec::new();
        let status = self
            .client
            .post_stream(
                &url,
                request.to_string(),
                |chunk| {
                    bytes.extend_from_slice(chunk);
                    true
                },
                INFERENCE_TIMEOUT,
            )
            .await?;
        if status != 200 {
            return Err(Error::backend(
                format!("{} request failed", self.server_name),
                status,
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_shape() {
        let mut process = BackendProcess::new("llama-server");
        process.choose_port(18400).unwrap();
        let url = process.base_url();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.ends_with("/v1"));
    }

    #[tokio::test]
    async fn test_forward_without_process_is_model_not_loaded() {
        let process = BackendProcess::new("llama-server");
        let err = process
            .forward_request("/chat/completions", &serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotLoaded(_)));
    }
}
