//! Image generation handler.

use axum::extract::State;
use axum::Json;
use serde_json::Value;

use crate::error::ApiResult;
use crate::server::state::ServerState;

pub async fn generations_handler(
    State(state): State<ServerState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.router.image_generations(&request).await?))
}
