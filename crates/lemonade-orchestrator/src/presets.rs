//! Platform preset resolution.
//!
//! `resources/platform_presets.json` holds an ordered list of presets, each
//! with match predicates against the machine's supported backends, the
//! orchestrator model to use, and the endpoint models that satisfy each
//! tool. Matching is first-hit in file order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use lemonade_core::hardware::HardwareInfo;
use lemonade_core::model::Recipe;
use lemonade_core::{paths, Error, Result};

/// Match predicates: each named backend flavor must be supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llamacpp_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flm_backend: Option<String>,
}

/// One platform preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "match", default)]
    pub predicates: PresetMatch,
    #[serde(default)]
    pub orchestrator_model: String,
    /// endpoint key (transcription, image_generation, tts, embeddings,
    /// reranking) → model name.
    #[serde(default)]
    pub endpoint_models: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PresetsFile {
    presets: Vec<Preset>,
}

/// Load the ordered preset list from the resource file.
pub fn load_presets() -> Result<Vec<Preset>> {
    let path = paths::resource_path("resources/platform_presets.json");
    let data = std::fs::read_to_string(&path).map_err(|e| {
        Error::config(format!(
            "could not open platform_presets.json at {}: {e}",
            path.display()
        ))
    })?;
    let file: PresetsFile = serde_json::from_str(&data)
        .map_err(|e| Error::config(format!("invalid platform_presets.json: {e}")))?;
    Ok(file.presets)
}

/// Walk the presets in order; first preset whose every predicate matches a
/// supported backend wins.
pub fn match_preset(presets: &[Preset], hardware: &HardwareInfo) -> Option<Preset> {
    let llamacpp = hardware.supported_backends(Recipe::LlamaCpp).backends;
    let flm = hardware.supported_backends(Recipe::Flm).backends;

    presets
        .iter()
        .find(|preset| {
            if let Some(required) = &preset.predicates.llamacpp_backend {
                if !llamacpp.contains(required) {
                    return false;
                }
            }
            if let Some(required) = &preset.predicates.flm_backend {
                if !flm.contains(required) {
                    return false;
                }
            }
            true
        })
        .cloned()
}

/// Look a preset up by name (per-request override).
pub fn preset_by_name(presets: &[Preset], name: &str) -> Option<Preset> {
    presets.iter().find(|p| p.name == name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware(npu: bool) -> HardwareInfo {
        HardwareInfo {
            cpu_brand: "test".into(),
            physical_memory_gb: 32.0,
            npu_available: npu,
            os: "linux".into(),
        }
    }

    fn presets() -> Vec<Preset> {
        serde_json::from_value::<Vec<Preset>>(serde_json::json!([
            {
                "name": "ryzen-ai",
                "match": {"flm_backend": "npu"},
                "orchestrator_model": "Qwen3-8B-FLM",
                "endpoint_models": {"transcription": "Whisper-Base"}
            },
            {
                "name": "generic-cpu",
                "match": {"llamacpp_backend": "cpu"},
                "orchestrator_model": "Qwen3-4B-GGUF",
                "endpoint_models": {"embeddings": "nomic-embed-v1"}
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_first_hit_wins_with_npu() {
        if std::env::var("RYZENAI_SKIP_PROCESSOR_CHECK").is_ok() {
            return;
        }
        let hit = match_preset(&presets(), &hardware(true)).unwrap();
        assert_eq!(hit.name, "ryzen-ai");
    }

    #[test]
    fn test_falls_through_without_npu() {
        if std::env::var("RYZENAI_SKIP_PROCESSOR_CHECK").is_ok() {
            return;
        }
        let hit = match_preset(&presets(), &hardware(false)).unwrap();
        assert_eq!(hit.name, "generic-cpu");
    }

    #[test]
    fn test_preset_by_name() {
        assert!(preset_by_name(&presets(), "generic-cpu").is_some());
        assert!(preset_by_name(&presets(), "nope").is_none());
    }
}
