//! Route-level tests against an in-process router with an empty catalog.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use lemonade_api::{create_router, ServerState};
use lemonade_catalog::ModelCatalog;
use lemonade_router::{Router, RouterConfig};

fn test_state() -> ServerState {
    // Point the cache root at a scratch directory once for the whole test
    // binary, before any hardware-probe cache write can happen.
    static SCRATCH: std::sync::Once = std::sync::Once::new();
    SCRATCH.call_once(|| {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("LEMONADE_CACHE_DIR", dir.path());
        std::mem::forget(dir);
    });

    let catalog = Arc::new(ModelCatalog::from_values(json!({}), json!({})));
    let router = Arc::new(Router::new(catalog.clone(), RouterConfig::default()));
    ServerState::new(catalog, router)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_served_under_both_prefixes() {
    for prefix in ["/api/v0", "/api/v1"] {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{prefix}/health"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["loading"], false);
        assert!(body["pool_limits"]["llm"].is_number());
    }
}

#[tokio::test]
async fn preflight_answers_204_everywhere() {
    let app = create_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/v1/chat/completions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "*"
    );
}

#[tokio::test]
async fn models_list_is_openai_shaped() {
    let app = create_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/models?show_all=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert!(body["data"].is_array());
}

#[tokio::test]
async fn unknown_model_yields_structured_404() {
    let app = create_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/models/not-a-model")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_found");
    assert!(body["error"]["message"].as_str().unwrap().contains("not-a-model"));
}

#[tokio::test]
async fn chat_with_unknown_model_is_structured_error_not_a_crash() {
    let app = create_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "ghost",
                        "messages": [{"role": "user", "content": "hello"}]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn load_of_unknown_model_is_404() {
    let app = create_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/load")
                .header("content-type", "application/json")
                .body(Body::from(json!({"model_name": "ghost"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_start_empty() {
    let app = create_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["totals"]["output_tokens"], 0);
}
