//! Audio handlers: transcription (multipart in) and speech (audio out).

use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde_json::{json, Value};

use lemonade_core::Error;

use crate::error::{ApiError, ApiResult};
use crate::server::state::ServerState;

/// `POST /audio/transcriptions`: multipart `file` + `model` + optional
/// transcription fields, forwarded to the loaded whisper backend.
pub async fn transcriptions_handler(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut request = json!({});
    let mut have_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::validation(format!("bad multipart body: {e}"))))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(String::from)
                    .unwrap_or_else(|| "audio.wav".to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(Error::validation(format!("upload failed: {e}"))))?;
                request["file_data"] =
                    json!(base64::engine::general_purpose::STANDARD.encode(&data));
                request["filename"] = json!(filename);
                have_file = true;
            }
            "model" | "language" | "prompt" | "response_format" | "temperature" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    request[name] = json!(text);
                }
            }
            _ => {}
        }
    }

    if !have_file {
        return Err(ApiError(Error::validation("a 'file' part is required")));
    }
    if request.get("model").is_none() {
        return Err(ApiError(Error::validation("a 'model' field is required")));
    }

    let response = state.router.audio_transcriptions(&request).await?;
    Ok(Json(response))
}

/// `POST /audio/speech`: JSON in, synthesized audio bytes out.
pub async fn speech_handler(
    State(state): State<ServerState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    if request.get("input").and_then(Value::as_str).unwrap_or("").is_empty() {
        return Err(ApiError(Error::validation("an 'input' field is required")));
    }
    let (bytes, content_type) = state.router.audio_speech(&request).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}
