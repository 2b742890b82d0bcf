//! Tool-calling orchestrator.
//!
//! Exposes the gateway's non-text endpoints (transcription, image
//! generation, TTS, embeddings, reranking) as tool definitions to a locally
//! loaded LLM, then drives the tool-calling loop: call the model, execute
//! whatever tools it asks for, feed the results back, repeat until the model
//! answers in plain text.

pub mod presets;
pub mod tools;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use lemonade_catalog::{download_model, PullRequest};
use lemonade_client::HttpClient;
use lemonade_core::hardware::HardwareInfo;
use lemonade_core::model::Recipe;
use lemonade_core::{Error, Result};
use lemonade_router::Router;

use presets::Preset;

const DEFAULT_MAX_ITERATIONS: usize = 10;

const SYSTEM_PROMPT: &str = "You are a helpful assistant with access to local AI tools. \
     When the user's request can be fulfilled by one of your tools, call the \
     appropriate tool. Otherwise, respond directly. Always explain what you \
     did after using a tool.";

/// The preset resolved for this machine plus its filtered tool manifest.
#[derive(Debug, Clone, Default)]
struct ActivePreset {
    preset: Preset,
    tools: Vec<Value>,
}

pub struct Orchestrator {
    router: Arc<Router>,
    client: HttpClient,
    active: RwLock<Option<ActivePreset>>,
    max_iterations: usize,
}

impl Orchestrator {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            client: HttpClient::new(),
            active: RwLock::new(None),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Resolve the platform preset for this machine and raise the router's
    /// per-type floors so one full tool-calling session never evicts its own
    /// models. Called once at startup; a failed resolution leaves
    /// orchestration unavailable but the gateway running.
    pub async fn resolve_platform_preset(&self) {
        let presets = match presets::load_presets() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("orchestration unavailable: {e}");
                return;
            }
        };

        let hardware = HardwareInfo::get_cached();
        let Some(preset) = presets::match_preset(&presets, &hardware) else {
            tracing::warn!("no platform preset matched this hardware; orchestration unavailable");
            return;
        };
        tracing::info!(
            "matched preset '{}' ({}); orchestrator model: {}",
            preset.name,
            preset.description,
            preset.orchestrator_model
        );

        let tools = filter_tools(&preset, &hardware);
        tracing::info!("available tools: {}", tools.len());

        let floor = slot_floor(&preset);
        self.router.set_min_loaded_models(floor);

        *self.active.write().await = Some(ActivePreset { preset, tools });
    }

    /// Preset diagnostics for `/system-info` and the response metadata.
    pub async fn preset_info(&self) -> Value {
        match self.active.read().await.as_ref() {
            Some(active) => json!({
                "resolved_preset": active.preset.name,
                "orchestrator_model": active.preset.orchestrator_model,
                "endpoint_models": active.preset.endpoint_models,
                "available_tools": active
                    .tools
                    .iter()
                    .map(|t| t["function"]["name"].clone())
                    .collect::<Vec<_>>(),
            }),
            None => json!({ "resolved_preset": "none" }),
        }
    }

    async fn ensure_model_loaded(&self, model_name: &str) -> Result<()> {
        if self.router.is_model_loaded(model_name).await {
            return Ok(());
        }
        tracing::info!("orchestrator loading model: {model_name}");

        let catalog = self.router.catalog();
        let info = catalog.model_info(model_name).await?;

        // First-time use downloads through the regular pull path.
        if info.recipe != Recipe::Flm && !catalog.is_downloaded(model_name).await {
            tracing::info!("orchestrator downloading model: {model_name}");
            download_model(
                catalog,
                &self.client,
                &PullRequest {
                    model_name: model_name.to_string(),
                    do_not_upgrade: true,
                    ..Default::default()
                },
                None,
            )
            .await?;
        }

        self.router.load_model(model_name, None).await
    }

    /// Run the tool-calling loop for one chat request.
    pub async fn orchestrate(&self, request: &Value) -> Result<Value> {
        let presets_file = presets::load_presets().unwrap_or_default();
        let active = self.active.read().await.clone();

        // Effective preset: request override by name, else the resolved one.
        let (mut preset, active_tools) = match request.get("preset").and_then(Value::as_str) {
            Some(name) => {
                let preset = presets::preset_by_name(&presets_file, name).ok_or_else(|| {
                    Error::validation(format!("unknown preset '{name}'"))
                })?;
                let hardware = HardwareInfo::get_cached();
                let tools = filter_tools(&preset, &hardware);
                (preset, tools)
            }
            None => match active {
                Some(active) => (active.preset, active.tools),
                None => (Preset::default(), Vec::new()),
            },
        };

        if let Some(model) = request.get("orchestrator_model").and_then(Value::as_str) {
            preset.orchestrator_model = model.to_string();
        }
        if preset.orchestrator_model.is_empty() {
            return Err(Error::config(
                "No orchestrator model configured. Either specify 'orchestrator_model' \
                 in the request or ensure a platform preset matches your hardware.",
            ));
        }

        let max_iterations = request
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_iterations);

        // Context carried into tool executors (audio payloads mostly).
        let mut context = json!({});
        if let Some(audio) = request.get("audio_data") {
            context["audio_data"] = audio.clone();
            context["audio_filename"] = request
                .get("audio_filename")
                .cloned()
                .unwrap_or_else(|| json!("audio.wav"));
        }

        self.ensure_model_loaded(&preset.orchestrator_model).await?;

        let mut messages = request
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| Error::validation("Missing 'messages' field in request"))?;

        let has_system = messages
            .first()
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            == Some("system");
        if !has_system {
            messages.insert(0, json!({ "role": "system", "content": SYSTEM_PROMPT }));
        }

        if active_tools.is_empty() {
            tracing::warn!("no tools available for orchestration; answering directly");
        }

        let mut last_response = json!({});
        for iteration in 0..max_iterations {
            let mut llm_request = json!({
                "model": preset.orchestrator_model,
                "messages": messages.clone(),
                "stream": false,
            });
            if !active_tools.is_empty() {
                llm_request["tools"] = Value::Array(active_tools.clone());
            }
            for key in ["temperature", "top_p", "top_k", "repeat_penalty"] {
                if let Some(v) = request.get(key) {
                    llm_request[key] = v.clone();
                }
            }

            tracing::info!(
                "orchestrator iteration {} -> {}",
                iteration + 1,
                preset.orchestrator_model
            );
            last_response = self.router.chat_completion(&llm_request).await?;

            let Some(message) = last_response
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .cloned()
            else {
                tracing::warn!("unexpected chat-completion response shape");
                break;
            };

            let tool_calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if tool_calls.is_empty() {
                break;
            }

            messages.push(message);

            for tool_call in &tool_calls {
                let result = self
                    .execute_tool_call(tool_call, &preset.endpoint_models, &context)
                    .await;
                let tool_call_id = tool_call.get("id").and_then(Value::as_str).unwrap_or("");
                tracing::info!(
                    "tool result for {}: {:.200}",
                    tool_call["function"]["name"].as_str().unwrap_or("?"),
                    result
                );
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": result,
                }));
            }
        }

        if last_response.is_object() {
            let preset_name = if preset.name.is_empty() {
                "none".to_string()
            } else {
                preset.name.clone()
            };
            last_response["orchestration"] = json!({
                "preset": preset_name,
                "orchestrator_model": preset.orchestrator_model,
                "endpoint_models": preset.endpoint_models,
            });
        }
        Ok(last_response)
    }

    async fn execute_tool_call(
        &self,
        tool_call: &Value,
        endpoint_models: &BTreeMap<String, String>,
        context: &Value,
    ) -> String {
        let name = tool_call["function"]["name"].as_str().unwrap_or("");
        let arguments = parse_arguments(&tool_call["function"]);
        tracing::info!("executing tool: {name}");

        let result = match name {
            tools::TRANSCRIBE_AUDIO => {
                self.run_transcribe(&arguments, endpoint_models, context).await
            }
            tools::GENERATE_IMAGE => self.run_generate_image(&arguments, endpoint_models).await,
            tools::TEXT_TO_SPEECH => run_text_to_speech(&arguments, endpoint_models),
            tools::COMPUTE_EMBEDDINGS => self.run_embeddings(&arguments, endpoint_models).await,
            tools::RERANK_DOCUMENTS => self.run_rerank(&arguments, endpoint_models).await,
            other => Err(Error::validation(format!("Unknown tool: {other}"))),
        };

        match result {
            Ok(value) => value.to_string(),
            Err(e) => json!({ "error": e.to_string() }).to_string(),
        }
    }

    async fn run_transcribe(
        &self,
        arguments: &Value,
        endpoint_models: &BTreeMap<String, String>,
        context: &Value,
    ) -> Result<Value> {
        let model = endpoint_model(endpoint_models, "transcription", "transcription")?;
        self.ensure_model_loaded(&model).await?;

        let audio = context.get("audio_data").ok_or_else(|| {
            Error::validation(
                "No audio data provided. Include 'audio_data' (base64) in the orchestrate request.",
            )
        })?;
        let mut request = json!({
            "model": model,
            "file_data": audio,
            "filename": context.get("audio_filename").cloned().unwrap_or(json!("audio.wav")),
        });
        if let Some(language) = arguments.get("language") {
            request["language"] = language.clone();
        }
        self.router.audio_transcriptions(&request).await
    }

    async fn run_generate_image(
        &self,
        arguments: &Value,
        endpoint_models: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let model = endpoint_model(endpoint_models, "image_generation", "image generation")?;
        self.ensure_model_loaded(&model).await?;

        let mut request = json!({
            "model": model,
            "prompt": arguments.get("prompt").cloned().unwrap_or(json!("")),
            "response_format": "b64_json",
        });
        if let (Some(w), Some(h)) = (
            arguments.get("width").and_then(Value::as_u64),
            arguments.get("height").and_then(Value::as_u64),
        ) {
            request["size"] = json!(format!("{w}x{h}"));
        }
        if let Some(steps) = arguments.get("steps") {
            request["steps"] = steps.clone();
        }

        let response = self.router.image_generations(&request).await?;
        Ok(summarize_image_response(&response))
    }

    async fn run_embeddings(
        &self,
        arguments: &Value,
        endpoint_models: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let model = endpoint_model(endpoint_models, "embeddings", "embeddings")?;
        self.ensure_model_loaded(&model).await?;

        let request = json!({
            "model": model,
            "input": arguments.get("input").cloned().unwrap_or(json!("")),
        });
        let response = self.router.embeddings(&request).await?;
        Ok(summarize_embeddings_response(&response, &model))
    }

    async fn run_rerank(
        &self,
        arguments: &Value,
        endpoint_models: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let model = endpoint_model(endpoint_models, "reranking", "reranking")?;
        self.ensure_model_loaded(&model).await?;

        let request = json!({
            "model": model,
            "query": arguments.get("query").cloned().unwrap_or(json!("")),
            "documents": arguments.get("documents").cloned().unwrap_or(json!([])),
        });
        self.router.reranking(&request).await
    }
}

fn endpoint_model(
    endpoint_models: &BTreeMap<String, String>,
    key: &str,
    label: &str,
) -> Result<String> {
    endpoint_models
        .get(key)
        .filter(|m| !m.is_empty())
        .cloned()
        .ok_or_else(|| Error::config(format!("No {label} model configured in preset")))
}

/// TTS is stream-based; the orchestrator confirms the request rather than
/// inlining audio bytes into the conversation.
fn run_text_to_speech(
    arguments: &Value,
    endpoint_models: &BTreeMap<String, String>,
) -> Result<Value> {
    let model = endpoint_model(endpoint_models, "tts", "TTS")?;
    let input = arguments.get("input").and_then(Value::as_str).unwrap_or("");
    let preview: String = input.chars().take(100).collect();
    Ok(json!({
        "status": "success",
        "message": format!(
            "Text-to-speech request prepared for model '{model}'. Input: {preview}"
        ),
    }))
}

/// Tool-call arguments arrive either as an object or a JSON-encoded string.
fn parse_arguments(function: &Value) -> Value {
    match function.get("arguments") {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(json!({})),
        Some(other) => other.clone(),
        None => json!({}),
    }
}

/// Keep the conversation small: images become a count, not inline base64.
fn summarize_image_response(response: &Value) -> Value {
    let image_count = response
        .get("data")
        .and_then(Value::as_array)
        .map(|data| {
            data.iter()
                .filter(|d| d.get("b64_json").is_some() || d.get("url").is_some())
                .count()
        })
        .unwrap_or(0);
    if image_count > 0 {
        json!({
            "status": "success",
            "message": "Image generated successfully.",
            "image_count": image_count,
        })
    } else {
        response.clone()
    }
}

/// Embedding vectors are summarized down to their dimensionality.
fn summarize_embeddings_response(response: &Value, model: &str) -> Value {
    let dimensions = response
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("embedding"))
        .and_then(Value::as_array)
        .map(|e| e.len());
    match dimensions {
        Some(dimensions) => json!({
            "status": "success",
            "dimensions": dimensions,
            "model": model,
        }),
        None => response.clone(),
    }
}

/// Tools whose endpoint model exists in the preset and whose backend family
/// is supported on this machine.
fn filter_tools(preset: &Preset, hardware: &HardwareInfo) -> Vec<Value> {
    let backend_for = |tool_name: &str| -> Recipe {
        match tool_name {
            tools::TRANSCRIBE_AUDIO => Recipe::WhisperCpp,
            tools::GENERATE_IMAGE => Recipe::SdCpp,
            tools::TEXT_TO_SPEECH => Recipe::Kokoro,
            _ => Recipe::LlamaCpp,
        }
    };

    tools::endpoint_tools()
        .into_iter()
        .filter(|tool| {
            let name = tool["function"]["name"].as_str().unwrap_or("");
            let Some(key) = tools::endpoint_key(name) else {
                return false;
            };
            if !preset.endpoint_models.contains_key(key) {
                return false;
            }
            !hardware
                .supported_backends(backend_for(name))
                .backends
                .is_empty()
        })
        .collect()
}

/// Minimum model slots per type so one full tool-calling session keeps all
/// its models resident: the orchestrator LLM plus every endpoint model,
/// bucketed by pool.
fn slot_floor(preset: &Preset) -> usize {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    counts.insert("llm", 1);
    for (key, pool) in [
        ("transcription", "audio"),
        ("tts", "audio"),
        ("image_generation", "image"),
        ("embeddings", "embedding"),
        ("reranking", "reranking"),
    ] {
        if preset.endpoint_models.contains_key(key) {
            *counts.entry(pool).or_insert(0) += 1;
        }
    }
    counts.values().copied().max().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset_with(keys: &[&str]) -> Preset {
        let mut preset = Preset {
            name: "test".into(),
            orchestrator_model: "Qwen3-4B".into(),
            ..Default::default()
        };
        for key in keys {
            preset
                .endpoint_models
                .insert(key.to_string(), format!("{key}-model"));
        }
        preset
    }

    #[test]
    fn test_slot_floor_counts_audio_pool() {
        // transcription + tts share the audio pool: floor of 2.
        assert_eq!(slot_floor(&preset_with(&["transcription", "tts"])), 2);
        assert_eq!(slot_floor(&preset_with(&["embeddings"])), 1);
        assert_eq!(slot_floor(&preset_with(&[])), 1);
    }

    #[test]
    fn test_summarize_image_response() {
        let response = json!({"created": 1, "data": [{"b64_json": "AAAA"}]});
        let summary = summarize_image_response(&response);
        assert_eq!(summary["status"], "success");
        assert_eq!(summary["image_count"], 1);
        assert!(summary.get("data").is_none(), "no inline base64");
    }

    #[test]
    fn test_summarize_embeddings_response() {
        let response = json!({"data": [{"embedding": [0.1, 0.2, 0.3]}]});
        let summary = summarize_embeddings_response(&response, "embed-model");
        assert_eq!(summary["dimensions"], 3);
    }

    #[test]
    fn test_parse_arguments_both_shapes() {
        let as_object = json!({"arguments": {"prompt": "a lemon"}});
        assert_eq!(parse_arguments(&as_object)["prompt"], "a lemon");

        let as_string = json!({"arguments": "{\"prompt\": \"a lemon\"}"});
        assert_eq!(parse_arguments(&as_string)["prompt"], "a lemon");

        let missing = json!({});
        assert_eq!(parse_arguments(&missing), json!({}));
    }

    #[test]
    fn test_filter_tools_requires_endpoint_model() {
        let hardware = HardwareInfo {
            cpu_brand: "test".into(),
            physical_memory_gb: 32.0,
            npu_available: false,
            os: "linux".into(),
        };
        let tools = filter_tools(&preset_with(&["embeddings", "image_generation"]), &hardware);
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["function"]["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&tools::COMPUTE_EMBEDDINGS));
        assert!(names.contains(&tools::GENERATE_IMAGE));
        assert!(!names.contains(&tools::TRANSCRIBE_AUDIO));
    }
}
