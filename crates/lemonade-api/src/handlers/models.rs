//! Model lifecycle handlers: listing, pull, load/unload, delete, local
//! uploads, and generation-parameter defaults.

use std::convert::Infallible;

use axum::extract::{Multipart, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use lemonade_catalog::{download_model, DownloadProgress, PullRequest, UserModelRegistration};
use lemonade_core::model::{ModelDescriptor, ModelSource, Recipe};
use lemonade_core::{paths, Error};

use crate::error::{ApiError, ApiResult};
use crate::server::state::ServerState;

fn model_to_json(descriptor: &ModelDescriptor) -> Value {
    json!({
        "id": descriptor.name,
        "object": "model",
        "owned_by": "lemonade",
        "checkpoint": descriptor.checkpoint,
        "recipe": descriptor.recipe.as_str(),
        "labels": descriptor.labels,
        "size": descriptor.size_gb,
        "suggested": descriptor.suggested,
        "downloaded": descriptor.downloaded,
        "type": descriptor.model_type().as_str(),
        "device": descriptor.device(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ListModelsQuery {
    #[serde(default)]
    pub show_all: bool,
}

pub async fn list_models_handler(
    State(state): State<ServerState>,
    Query(query): Query<ListModelsQuery>,
) -> Json<Value> {
    let models = if query.show_all {
        state.catalog.supported_models().await
    } else {
        state.catalog.downloaded_models().await
    };
    let data: Vec<Value> = models.values().map(model_to_json).collect();
    Json(json!({ "object": "list", "data": data }))
}

pub async fn get_model_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let descriptor = state.catalog.model_info(&id).await?;
    Ok(Json(model_to_json(&descriptor)))
}

#[derive(Debug, Deserialize)]
pub struct PullBody {
    #[serde(alias = "model_name")]
    pub model: String,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub recipe: Option<String>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub reranking: bool,
    #[serde(default)]
    pub mmproj: Option<String>,
    #[serde(default)]
    pub do_not_upgrade: bool,
    #[serde(default)]
    pub stream: bool,
}

impl PullBody {
    fn into_request(self) -> Result<PullRequest, Error> {
        let recipe = match self.recipe.as_deref() {
            Some(r) => Some(
                Recipe::parse(r).ok_or_else(|| Error::validation(format!("unknown recipe '{r}'")))?,
            ),
            None => None,
        };
        Ok(PullRequest {
            model_name: self.model,
            checkpoint: self.checkpoint,
            recipe,
            reasoning: self.reasoning,
            vision: self.vision,
            embedding: self.embedding,
            reranking: self.reranking,
            mmproj: self.mmproj,
            do_not_upgrade: self.do_not_upgrade,
        })
    }
}

pub async fn pull_handler(
    State(state): State<ServerState>,
    Json(body): Json<PullBody>,
) -> ApiResult<Response> {
    let stream = body.stream;
    let request = body.into_request().map_err(ApiError)?;

    if !stream {
        download_model(&state.catalog, &state.client, &request, None).await?;
        return Ok(Json(json!({ "status": "ok", "model": request.model_name })).into_response());
    }

    Ok(pull_event_stream(state, request).into_response())
}

/// Streaming pull: progress events relayed over SSE. The download runs on
/// its own task and observes cancellation through the closed channel when
/// the client disconnects.
fn pull_event_stream(
    state: ServerState,
    request: PullRequest,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<Value>(32);

    tokio::spawn(async move {
        let progress_tx = tx.clone();
        let mut on_progress = move |progress: &DownloadProgress| -> bool {
            if progress_tx.is_closed() {
                return false; // client went away, cancel the download
            }
            let mut event = serde_json::to_value(progress).unwrap_or_default();
            event["type"] = json!(if progress.complete { "complete" } else { "progress" });
            let _ = progress_tx.try_send(event);
            true
        };

        let result =
            download_model(&state.catalog, &state.client, &request, Some(&mut on_progress)).await;
        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                tracing::info!("pull of {} cancelled by client", request.model_name);
            }
            Err(e) => {
                let _ = tx
                    .send(json!({ "type": "error", "error": e.to_error_json()["error"] }))
                    .await;
            }
        }
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(Event::default().data(event.to_string()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct LoadBody {
    pub model_name: String,
    #[serde(default)]
    pub ctx_size: Option<u32>,
}

pub async fn load_handler(
    State(state): State<ServerState>,
    Json(body): Json<LoadBody>,
) -> ApiResult<Json<Value>> {
    if !state.catalog.model_exists(&body.model_name).await {
        return Err(ApiError(Error::model_not_found(&body.model_name)));
    }
    state.router.load_model(&body.model_name, body.ctx_size).await?;
    Ok(Json(json!({ "status": "ok", "model": body.model_name })))
}

#[derive(Debug, Default, Deserialize)]
pub struct UnloadBody {
    #[serde(default)]
    pub model_name: Option<String>,
}

pub async fn unload_handler(
    State(state): State<ServerState>,
    body: Option<Json<UnloadBody>>,
) -> ApiResult<Json<Value>> {
    let model_name = body.and_then(|Json(b)| b.model_name).filter(|m| !m.is_empty());
    match model_name {
        Some(model) => {
            state.router.unload_model(&model).await?;
            Ok(Json(json!({ "status": "ok", "model": model })))
        }
        None => {
            state.router.unload_all().await;
            Ok(Json(json!({ "status": "ok" })))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    pub model_name: String,
}

pub async fn delete_handler(
    State(state): State<ServerState>,
    Json(body): Json<DeleteBody>,
) -> ApiResult<Json<Value>> {
    // An in-use model is unloaded first so its files are deletable.
    if state.router.is_model_loaded(&body.model_name).await {
        state.router.unload_model(&body.model_name).await?;
    }
    state.catalog.delete_model(&body.model_name).await?;
    Ok(Json(json!({ "status": "ok", "model": body.model_name })))
}

/// Multipart upload of model files plus registration metadata. Files land
/// under the hub cache and the model is registered with
/// `source=local_upload`.
pub async fn add_local_model_handler(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut model_name = String::new();
    let mut recipe = None;
    let mut reasoning = false;
    let mut vision = false;
    let mut embedding = false;
    let mut reranking = false;
    let mut mmproj = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::validation(format!("bad multipart body: {e}"))))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "model_name" => {
                model_name = field.text().await.unwrap_or_default();
            }
            "recipe" => {
                let text = field.text().await.unwrap_or_default();
                recipe = Some(Recipe::parse(&text).ok_or_else(|| {
                    ApiError(Error::validation(format!("unknown recipe '{text}'")))
                })?);
            }
            "reasoning" => reasoning = field.text().await.unwrap_or_default() == "true",
            "vision" => vision = field.text().await.unwrap_or_default() == "true",
            "embeddings" => embedding = field.text().await.unwrap_or_default() == "true",
            "reranking" => reranking = field.text().await.unwrap_or_default() == "true",
            "mmproj" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    mmproj = Some(text);
                }
            }
            "model_files" | "model_files[]" => {
                let filename = field
                    .file_name()
                    .map(String::from)
                    .ok_or_else(|| ApiError(Error::validation("file part missing a filename")))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError(Error::validation(format!("upload failed: {e}"))))?;
                files.push((filename, data.to_vec()));
            }
            _ => {}
        }
    }

    if model_name.is_empty() {
        return Err(ApiError(Error::validation("model_name is required")));
    }
    if !model_name.starts_with("user.") {
        model_name = format!("user.{model_name}");
    }
    let recipe =
        recipe.ok_or_else(|| ApiError(Error::validation("recipe is required")))?;
    if files.is_empty() {
        return Err(ApiError(Error::validation("at least one model file is required")));
    }

    // Store uploads under the hub cache; the checkpoint is the relative
    // path the resolver joins back onto it.
    let clean_name = model_name.trim_start_matches("user.");
    let relative_dir = format!("local_uploads/{clean_name}");
    let upload_dir = paths::hf_cache_dir().join(&relative_dir);
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(|e| ApiError(Error::Io(e.to_string())))?;

    let mut primary_file = None;
    for (filename, data) in &files {
        let dest = upload_dir.join(filename);
        tokio::fs::write(&dest, data)
            .await
            .map_err(|e| ApiError(Error::Io(e.to_string())))?;
        if primary_file.is_none() && filename.to_lowercase().ends_with(".gguf") {
            primary_file = Some(filename.clone());
        }
    }

    // GGUF recipes point at the model file; everything else points at the
    // upload directory.
    let checkpoint = match (recipe, primary_file) {
        (Recipe::LlamaCpp, Some(file)) => format!("{relative_dir}/{file}"),
        _ => relative_dir,
    };

    state
        .catalog
        .register_user_model(&UserModelRegistration {
            model_name: model_name.clone(),
            checkpoint,
            recipe,
            reasoning,
            vision,
            embedding,
            reranking,
            mmproj,
            source: Some(ModelSource::LocalUpload),
        })
        .await?;

    Ok(Json(json!({ "status": "ok", "model": model_name })))
}

pub async fn get_params_handler(State(state): State<ServerState>) -> Json<Value> {
    Json(state.params.read().await.clone())
}

pub async fn set_params_handler(
    State(state): State<ServerState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    if !body.is_object() {
        return Err(ApiError(Error::validation("params must be a JSON object")));
    }
    *state.params.write().await = body.clone();
    Ok(Json(json!({ "status": "ok", "params": body })))
}
