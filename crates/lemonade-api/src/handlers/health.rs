//! Health, stats, and system-info handlers.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use lemonade_core::hardware::HardwareInfo;
use lemonade_core::model::Recipe;
use lemonade_core::paths;

use crate::error::ApiResult;
use crate::server::state::ServerState;

pub async fn health_handler(State(state): State<ServerState>) -> Json<Value> {
    let loaded = state.router.loaded_models().await;
    Json(json!({
        "status": "ok",
        "loading": state.router.is_loading(),
        "models_loaded": loaded,
        "pool_limits": state.router.pool_limits(),
        "ctx_size": state.router.ctx_size(),
    }))
}

pub async fn stats_handler(State(state): State<ServerState>) -> Json<Value> {
    Json(state.router.stats().await)
}

#[derive(Debug, Deserialize)]
pub struct SystemInfoQuery {
    #[serde(default)]
    pub verbose: bool,
}

pub async fn system_info_handler(
    State(state): State<ServerState>,
    Query(query): Query<SystemInfoQuery>,
) -> ApiResult<Json<Value>> {
    let hardware = HardwareInfo::get_cached();

    let mut engines = serde_json::Map::new();
    for recipe in [
        Recipe::LlamaCpp,
        Recipe::OgaCpu,
        Recipe::OgaNpu,
        Recipe::OgaHybrid,
        Recipe::WhisperCpp,
        Recipe::SdCpp,
        Recipe::Kokoro,
        Recipe::Flm,
        Recipe::Vllm,
    ] {
        let supported = hardware.supported_backends(recipe);
        engines.insert(supported.recipe, json!(supported.backends));
    }

    let mut info = json!({
        "hardware": hardware.to_json(),
        "inference_engines": engines,
        "orchestration": state.orchestrator.preset_info().await,
    });
    if query.verbose {
        info["cache_dir"] = json!(paths::cache_dir());
        info["hf_cache_dir"] = json!(paths::hf_cache_dir());
        info["flm_executable"] = json!(paths::find_flm_executable());
    }
    Ok(Json(info))
}
