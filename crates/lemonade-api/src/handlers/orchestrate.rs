//! Tool-calling orchestration handler.

use axum::extract::State;
use axum::Json;
use serde_json::Value;

use crate::error::ApiResult;
use crate::server::state::ServerState;

pub async fn orchestrate_handler(
    State(state): State<ServerState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.orchestrator.orchestrate(&request).await?))
}
