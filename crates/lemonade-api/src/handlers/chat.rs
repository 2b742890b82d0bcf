//! Inference handlers: chat/completions, completions, responses,
//! embeddings, reranking.

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::error::ApiResult;
use crate::server::state::ServerState;

/// Merge `/params` defaults into a request without overriding fields the
/// caller set explicitly.
async fn apply_param_defaults(state: &ServerState, request: &mut Value) {
    let params = state.params.read().await;
    let (Some(defaults), Some(body)) = (params.as_object(), request.as_object_mut()) else {
        return;
    };
    for (key, value) in defaults {
        body.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// `enable_thinking=false` opts the request out of reasoning by prepending
/// `/no_think` to the last user message.
fn apply_thinking_toggle(request: &mut Value) {
    let disabled = request.get("enable_thinking") == Some(&Value::Bool(false));
    if let Some(body) = request.as_object_mut() {
        body.remove("enable_thinking");
    }
    if !disabled {
        return;
    }
    let Some(messages) = request.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let last_user = messages
        .iter_mut()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"));
    if let Some(message) = last_user {
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            let patched = format!("/no_think {content}");
            message["content"] = Value::String(patched);
        }
    }
}

fn wants_stream(request: &Value) -> bool {
    request.get("stream") == Some(&Value::Bool(true))
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<bytes::Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub async fn chat_completions_handler(
    State(state): State<ServerState>,
    Json(mut request): Json<Value>,
) -> ApiResult<Response> {
    apply_param_defaults(&state, &mut request).await;
    apply_thinking_toggle(&mut request);

    if wants_stream(&request) {
        let rx = state.router.forward_stream("/chat/completions", &request).await?;
        return Ok(sse_response(rx));
    }
    let response = state.router.chat_completion(&request).await?;
    Ok(Json(response).into_response())
}

pub async fn completions_handler(
    State(state): State<ServerState>,
    Json(mut request): Json<Value>,
) -> ApiResult<Response> {
    apply_param_defaults(&state, &mut request).await;

    if wants_stream(&request) {
        let rx = state.router.forward_stream("/completions", &request).await?;
        return Ok(sse_response(rx));
    }
    let response = state.router.completion(&request).await?;
    Ok(Json(response).into_response())
}

pub async fn responses_handler(
    State(state): State<ServerState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.router.responses(&request).await?))
}

pub async fn embeddings_handler(
    State(state): State<ServerState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.router.embeddings(&request).await?))
}

pub async fn reranking_handler(
    State(state): State<ServerState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.router.reranking(&request).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_think_prepended_to_last_user_message() {
        let mut request = json!({
            "enable_thinking": false,
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        });
        apply_thinking_toggle(&mut request);
        assert_eq!(request["messages"][2]["content"], "/no_think second");
        assert_eq!(request["messages"][0]["content"], "first");
        assert!(request.get("enable_thinking").is_none());
    }

    #[test]
    fn test_thinking_enabled_leaves_messages_alone() {
        let mut request = json!({
            "enable_thinking": true,
            "messages": [{"role": "user", "content": "hello"}]
        });
        apply_thinking_toggle(&mut request);
        assert_eq!(request["messages"][0]["content"], "hello");
    }

    #[test]
    fn test_wants_stream() {
        assert!(wants_stream(&json!({"stream": true})));
        assert!(!wants_stream(&json!({"stream": false})));
        assert!(!wants_stream(&json!({})));
    }
}
