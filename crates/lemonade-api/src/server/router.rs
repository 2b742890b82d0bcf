//! Route table.
//!
//! Every endpoint is mounted under both `/api/v0` and `/api/v1` (synonyms).
//! CORS is allow-all with a preflight short-circuit: any OPTIONS request
//! gets an empty 204 before routing.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use super::state::ServerState;
use crate::handlers::{audio, chat, health, images, models, orchestrate};
use crate::realtime;

pub fn create_router(state: ServerState) -> Router {
    let api = Router::new()
        .route("/health", get(health::health_handler))
        .route("/models", get(models::list_models_handler))
        .route("/models/:id", get(models::get_model_handler))
        .route("/chat/completions", post(chat::chat_completions_handler))
        .route("/completions", post(chat::completions_handler))
        .route("/responses", post(chat::responses_handler))
        .route("/embeddings", post(chat::embeddings_handler))
        .route("/reranking", post(chat::reranking_handler))
        .route("/pull", post(models::pull_handler))
        .route("/load", post(models::load_handler))
        .route("/unload", post(models::unload_handler))
        .route("/delete", post(models::delete_handler))
        .route("/add-local-model", post(models::add_local_model_handler))
        .route(
            "/params",
            get(models::get_params_handler).post(models::set_params_handler),
        )
        .route("/stats", get(health::stats_handler))
        .route("/system-info", get(health::system_info_handler))
        .route("/audio/transcriptions", post(audio::transcriptions_handler))
        .route("/audio/speech", post(audio::speech_handler))
        .route("/images/generations", post(images::generations_handler))
        .route("/orchestrate", post(orchestrate::orchestrate_handler))
        .route("/ws/realtime", get(realtime::ws_handler));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Model uploads and audio payloads are large; lift the default 2 MB
    // body cap well out of the way.
    const MAX_BODY: usize = 10 * 1024 * 1024 * 1024;

    Router::new()
        .nest("/api/v0", api.clone())
        .nest("/api/v1", api)
        .layer(cors)
        .layer(middleware::from_fn(preflight_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .with_state(state)
}

/// Answer every preflight (any path) with an empty 204 carrying allow-all
/// CORS headers. Sits outside the CORS layer so it sees OPTIONS first.
async fn preflight_middleware(request: axum::extract::Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let headers = response.headers_mut();
        headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
        headers.insert("access-control-allow-methods", HeaderValue::from_static("*"));
        headers.insert("access-control-allow-headers", HeaderValue::from_static("*"));
        return response;
    }
    next.run(request).await
}
