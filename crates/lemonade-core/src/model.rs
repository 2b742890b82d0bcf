//! Model descriptor types.
//!
//! A logical model is a name plus a checkpoint (`repo:variant` on the hub, a
//! hub-native identifier for CLI-managed backends, or a local path) plus the
//! recipe — the backend family that serves it. The derived `type` and
//! `device` fields drive eviction pools and availability filtering.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend family serving a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipe {
    /// llama.cpp GGUF runtime (LLM, embeddings, reranking).
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    /// ONNX runtime on CPU.
    #[serde(rename = "oga-cpu")]
    OgaCpu,
    /// ONNX runtime on the NPU.
    #[serde(rename = "oga-npu")]
    OgaNpu,
    /// ONNX runtime split across NPU and iGPU.
    #[serde(rename = "oga-hybrid")]
    OgaHybrid,
    /// whisper.cpp transcription.
    #[serde(rename = "whispercpp")]
    WhisperCpp,
    /// stable-diffusion.cpp image generation.
    #[serde(rename = "sd-cpp")]
    SdCpp,
    /// Kokoro text-to-speech.
    #[serde(rename = "kokoro")]
    Kokoro,
    /// FastFlowLM, managed through its own CLI.
    #[serde(rename = "flm")]
    Flm,
    /// vLLM inside a docker container.
    #[serde(rename = "vllm")]
    Vllm,
}

impl Recipe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recipe::LlamaCpp => "llamacpp",
            Recipe::OgaCpu => "oga-cpu",
            Recipe::OgaNpu => "oga-npu",
            Recipe::OgaHybrid => "oga-hybrid",
            Recipe::WhisperCpp => "whispercpp",
            Recipe::SdCpp => "sd-cpp",
            Recipe::Kokoro => "kokoro",
            Recipe::Flm => "flm",
            Recipe::Vllm => "vllm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llamacpp" => Some(Recipe::LlamaCpp),
            "oga-cpu" => Some(Recipe::OgaCpu),
            "oga-npu" => Some(Recipe::OgaNpu),
            "oga-hybrid" => Some(Recipe::OgaHybrid),
            "whispercpp" => Some(Recipe::WhisperCpp),
            "sd-cpp" => Some(Recipe::SdCpp),
            "kokoro" => Some(Recipe::Kokoro),
            "flm" => Some(Recipe::Flm),
            "vllm" => Some(Recipe::Vllm),
            _ => None,
        }
    }

    /// ONNX runtime family (the only recipes allowed on `/responses`).
    pub fn is_onnx(&self) -> bool {
        matches!(self, Recipe::OgaCpu | Recipe::OgaNpu | Recipe::OgaHybrid)
    }
}

impl Default for Recipe {
    fn default() -> Self {
        Recipe::LlamaCpp
    }
}

impl std::fmt::Display for Recipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a model's descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// Built-in catalog or user registration pointing at the hub.
    #[default]
    Catalog,
    /// Files uploaded through `/add-local-model`; checkpoint is relative to
    /// the hub cache.
    LocalUpload,
    /// Checkpoint is an absolute local path.
    LocalPath,
}

/// Model class, derived from labels and recipe. Partitions the eviction
/// pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Audio,
    Embedding,
    Reranking,
    Image,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Llm => "llm",
            ModelType::Audio => "audio",
            ModelType::Embedding => "embedding",
            ModelType::Reranking => "reranking",
            ModelType::Image => "image",
        }
    }
}

/// Compute device a recipe runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Npu,
    Gpu,
    Hybrid,
}

/// A logical model known to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique key; user-registered names carry a `user.` prefix.
    pub name: String,
    /// `repo:variant`, a CLI-native identifier, or a local path.
    pub checkpoint: String,
    pub recipe: Recipe,
    /// Vision projector filename accompanying a GGUF checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    /// Free-form capability tags: reasoning, vision, embeddings, reranking,
    /// custom.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Declared size in GB, used by the RAM availability filter.
    #[serde(default)]
    pub size_gb: f64,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default)]
    pub source: ModelSource,
    /// Whether all artifacts are present and complete on disk.
    #[serde(default)]
    pub downloaded: bool,
    /// Absolute on-disk location handed to the backend once files exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<PathBuf>,
}

impl ModelDescriptor {
    /// Model class derived from labels first, then recipe.
    pub fn model_type(&self) -> ModelType {
        if self.has_label("embeddings") {
            return ModelType::Embedding;
        }
        if self.has_label("reranking") {
            return ModelType::Reranking;
        }
        match self.recipe {
            Recipe::WhisperCpp | Recipe::Kokoro => ModelType::Audio,
            Recipe::SdCpp => ModelType::Image,
            _ => ModelType::Llm,
        }
    }

    /// Compute device derived from the recipe.
    pub fn device(&self) -> DeviceType {
        match self.recipe {
            Recipe::OgaNpu | Recipe::Flm => DeviceType::Npu,
            Recipe::OgaHybrid => DeviceType::Hybrid,
            Recipe::Vllm => DeviceType::Gpu,
            _ => DeviceType::Cpu,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Split the checkpoint into `(repo_id, variant)`.
    ///
    /// FLM checkpoints use `:` as part of the identifier itself and are never
    /// split; local paths pass through untouched.
    pub fn split_checkpoint(&self) -> (String, Option<String>) {
        if self.recipe == Recipe::Flm || self.source == ModelSource::LocalPath {
            return (self.checkpoint.clone(), None);
        }
        match self.checkpoint.split_once(':') {
            Some((repo, variant)) => (repo.to_string(), Some(variant.to_string())),
            None => (self.checkpoint.clone(), None),
        }
    }

    /// True for user-registered models (`user.` name prefix).
    pub fn is_user_model(&self) -> bool {
        self.name.starts_with("user.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(recipe: Recipe, labels: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            name: "test".into(),
            checkpoint: "org/repo:Q4_K_M".into(),
            recipe,
            mmproj: None,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            size_gb: 1.0,
            suggested: false,
            source: ModelSource::Catalog,
            downloaded: false,
            resolved_path: None,
        }
    }

    #[test]
    fn test_model_type_from_labels() {
        assert_eq!(
            descriptor(Recipe::LlamaCpp, &["embeddings"]).model_type(),
            ModelType::Embedding
        );
        assert_eq!(
            descriptor(Recipe::LlamaCpp, &["reranking"]).model_type(),
            ModelType::Reranking
        );
        assert_eq!(
            descriptor(Recipe::LlamaCpp, &["reasoning"]).model_type(),
            ModelType::Llm
        );
        assert_eq!(
            descriptor(Recipe::WhisperCpp, &[]).model_type(),
            ModelType::Audio
        );
        assert_eq!(descriptor(Recipe::SdCpp, &[]).model_type(), ModelType::Image);
    }

    #[test]
    fn test_device_from_recipe() {
        assert_eq!(descriptor(Recipe::OgaNpu, &[]).device(), DeviceType::Npu);
        assert_eq!(
            descriptor(Recipe::OgaHybrid, &[]).device(),
            DeviceType::Hybrid
        );
        assert_eq!(descriptor(Recipe::Vllm, &[]).device(), DeviceType::Gpu);
        assert_eq!(descriptor(Recipe::LlamaCpp, &[]).device(), DeviceType::Cpu);
    }

    #[test]
    fn test_split_checkpoint() {
        let d = descriptor(Recipe::LlamaCpp, &[]);
        let (repo, variant) = d.split_checkpoint();
        assert_eq!(repo, "org/repo");
        assert_eq!(variant.as_deref(), Some("Q4_K_M"));

        let mut flm = descriptor(Recipe::Flm, &[]);
        flm.checkpoint = "gemma3:4b".into();
        let (repo, variant) = flm.split_checkpoint();
        assert_eq!(repo, "gemma3:4b");
        assert!(variant.is_none());
    }

    #[test]
    fn test_recipe_serde_names() {
        let r: Recipe = serde_json::from_str("\"oga-hybrid\"").unwrap();
        assert_eq!(r, Recipe::OgaHybrid);
        assert_eq!(serde_json::to_string(&Recipe::SdCpp).unwrap(), "\"sd-cpp\"");
    }
}
