//! Request router and load controller.
//!
//! Owns the loaded-backend table and keeps the rest of the gateway honest:
//! at most one load operation runs at any instant, readers are never blocked
//! by the slow parts of a load, and each model-type pool evicts its
//! least-recently-used entry when a load would exceed the pool's capacity.
//!
//! The serialization protocol: a loader (a) waits until `is_loading` is
//! false, (b) sets it, (c) does the quick pre-work (stale-entry eviction,
//! capacity eviction, adapter construction), (d) runs the slow backend
//! spawn + readiness probe without holding any table lock, (e) swaps the
//! new instance into the table, (f) clears the flag and wakes waiters. The
//! flag is cleared by a drop guard, so every exit path — including errors —
//! wakes the queue. A load path that left the flag set would deadlock the
//! process; the guard makes that impossible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify, RwLock};

use lemonade_backends::{create_backend, LoadOptions, WrappedBackend};
use lemonade_catalog::ModelCatalog;
use lemonade_client::HttpClient;
use lemonade_core::model::{ModelDescriptor, ModelType};
use lemonade_core::telemetry::TelemetryRecord;
use lemonade_core::{Error, Result, SharedTelemetry};

use crate::proxy::{self, StreamMode};

/// Per-pool capacity bounds. The orchestrator can raise an additional floor
/// across all pools so a tool-calling session never evicts its own models.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub llm: usize,
    pub embedding: usize,
    pub reranking: usize,
    pub audio: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            llm: 1,
            embedding: 1,
            reranking: 1,
            audio: 1,
        }
    }
}

impl PoolLimits {
    fn base_capacity(&self, pool: ModelType) -> usize {
        match pool {
            ModelType::Llm => self.llm,
            ModelType::Embedding => self.embedding,
            ModelType::Reranking => self.reranking,
            ModelType::Audio => self.audio,
            // Image backends are stateless and never pooled.
            ModelType::Image => usize::MAX,
        }
    }
}

/// Router configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub ctx_size: u32,
    pub llamacpp_flavor: String,
    pub pool_limits: PoolLimits,
    pub keep_image_files: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            ctx_size: 4096,
            llamacpp_flavor: lemonade_backends::default_llamacpp_flavor().to_string(),
            pool_limits: PoolLimits::default(),
            keep_image_files: false,
        }
    }
}

/// One running backend instance.
pub struct LoadedEntry {
    pub descriptor: ModelDescriptor,
    pub backend: Box<dyn WrappedBackend>,
    last_used: parking_lot::Mutex<Instant>,
}

impl LoadedEntry {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}

/// Adapter factory seam; production uses [`lemonade_backends::create_backend`].
pub type BackendFactory =
    dyn Fn(&ModelDescriptor, &LoadOptions) -> Result<Box<dyn WrappedBackend>> + Send + Sync;

pub struct Router {
    config: RouterConfig,
    catalog: Arc<ModelCatalog>,
    client: HttpClient,
    factory: Box<BackendFactory>,
    table: RwLock<HashMap<String, Arc<LoadedEntry>>>,
    is_loading: parking_lot::Mutex<bool>,
    load_notify: Notify,
    min_floor: AtomicUsize,
    totals: SharedTelemetry,
}

/// Clears `is_loading` and wakes waiters when dropped.
struct LoadGate<'a> {
    router: &'a Router,
}

impl Drop for LoadGate<'_> {
    fn drop(&mut self) {
        *self.router.is_loading.lock() = false;
        self.router.load_notify.notify_waiters();
    }
}

impl Router {
    pub fn new(catalog: Arc<ModelCatalog>, config: RouterConfig) -> Self {
        Self::with_factory(catalog, config, Box::new(|d, o| create_backend(d, o)))
    }

    pub fn with_factory(
        catalog: Arc<ModelCatalog>,
        config: RouterConfig,
        factory: Box<BackendFactory>,
    ) -> Self {
        Self {
            config,
            catalog,
            client: HttpClient::new(),
            factory,
            table: RwLock::new(HashMap::new()),
            is_loading: parking_lot::Mutex::new(false),
            load_notify: Notify::new(),
            min_floor: AtomicUsize::new(0),
            totals: SharedTelemetry::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn ctx_size(&self) -> u32 {
        self.config.ctx_size
    }

    /// True while a load is between gate acquisition and table swap.
    pub fn is_loading(&self) -> bool {
        *self.is_loading.lock()
    }

    /// Raise the minimum capacity of every pool (orchestrator sessions).
    pub fn set_min_loaded_models(&self, floor: usize) {
        let previous = self.min_floor.swap(floor, Ordering::SeqCst);
        if previous != floor {
            tracing::info!("min loaded models per pool: {floor}");
        }
    }

    fn pool_capacity(&self, pool: ModelType) -> usize {
        self.config
            .pool_limits
            .base_capacity(pool)
            .max(self.min_floor.load(Ordering::SeqCst))
    }

    fn load_options(&self, ctx_size: Option<u32>) -> LoadOptions {
        LoadOptions {
            ctx_size: ctx_size.unwrap_or(self.config.ctx_size),
            do_not_upgrade: true,
            llamacpp_flavor: self.config.llamacpp_flavor.clone(),
            keep_image_files: self.config.keep_image_files,
        }
    }

    async fn get_loaded(&self, model_name: &str) -> Option<Arc<LoadedEntry>> {
        self.table.read().await.get(model_name).cloned()
    }

    /// Wait for the load slot. Returns a guard that releases it on drop.
    async fn acquire_load_gate(&self) -> LoadGate<'_> {
        loop {
            let notified = self.load_notify.notified();
            tokio::pin!(notified);
            // Register for a wakeup before checking the flag, so a release
            // between the check and the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut flag = self.is_loading.lock();
                if !*flag {
                    *flag = true;
                    return LoadGate { router: self };
                }
            }
            tracing::info!("another load is in progress, waiting...");
            notified.await;
        }
    }

    /// Load `model_name`, serialized against all other loads and unloads.
    ///
    /// A second load of an already-running model is a no-op. A concurrent
    /// load waits its turn; it never fails because of the contention.
    pub async fn load_model(&self, model_name: &str, ctx_size: Option<u32>) -> Result<()> {
        if let Some(entry) = self.get_loaded(model_name).await {
            if entry.backend.is_running().await {
                return Ok(());
            }
        }

        let _gate = self.acquire_load_gate().await;

        // Re-check: the load we were queued behind may have been for this
        // same model.
        if let Some(entry) = self.get_loaded(model_name).await {
            if entry.backend.is_running().await {
                return Ok(());
            }
            // The process died underneath a table entry; clear it out.
            tracing::warn!("{model_name} has a dead backend process, evicting stale entry");
            self.table.write().await.remove(model_name);
            entry.backend.unload().await;
        }

        let descriptor = self.catalog.model_info(model_name).await?;
        let pool = descriptor.model_type();
        if pool == ModelType::Image {
            // Image generation is served per-request; nothing to keep loaded.
            return Ok(());
        }

        tracing::info!(
            "loading model {model_name} (checkpoint {}, recipe {})",
            descriptor.checkpoint,
            descriptor.recipe
        );

        self.evict_for_capacity(pool).await;

        let options = self.load_options(ctx_size);
        let mut backend = (self.factory)(&descriptor, &options)?;
        backend.install().await?;

        // The slow part: child spawn plus readiness probe, with no table
        // lock held. Readers stay unblocked; waiters stay queued on the gate.
        match backend.load(&descriptor, &options).await {
            Ok(()) => {
                let entry = Arc::new(LoadedEntry {
                    descriptor,
                    backend,
                    last_used: parking_lot::Mutex::new(Instant::now()),
                });
                self.table
                    .write()
                    .await
                    .insert(model_name.to_string(), entry);
                tracing::info!("model {model_name} loaded");
                Ok(())
            }
            Err(e) => {
                tracing::error!("failed to load {model_name}: {e}");
                backend.unload().await;
                Err(e)
            }
        }
    }

    /// Evict least-recently-used entries of `pool` until the incoming load
    /// fits. Runs inside the load gate, as part of the load's critical
    /// section for this pool.
    async fn evict_for_capacity(&self, pool: ModelType) {
        let capacity = self.pool_capacity(pool);
        loop {
            let victim = {
                let table = self.table.read().await;
                let mut in_pool: Vec<(&String, &Arc<LoadedEntry>)> = table
                    .iter()
                    .filter(|(_, e)| e.descriptor.model_type() == pool)
                    .collect();
                if in_pool.len() < capacity {
                    break;
                }
                in_pool.sort_by_key(|(_, e)| e.last_used());
                in_pool.first().map(|(name, _)| (*name).clone())
            };
            let Some(victim) = victim else { break };

            tracing::info!("evicting {victim} to make room in the {} pool", pool.as_str());
            let entry = self.table.write().await.remove(&victim);
            if let Some(entry) = entry {
                entry.backend.unload().await;
            }
        }
    }

    /// Unload one model. Waits for any in-flight load to finish first.
    pub async fn unload_model(&self, model_name: &str) -> Result<()> {
        let _gate = self.acquire_load_gate().await;
        let entry = self.table.write().await.remove(model_name);
        match entry {
            Some(entry) => {
                entry.backend.unload().await;
                tracing::info!("model {model_name} unloaded");
                Ok(())
            }
            None => Err(Error::model_not_loaded(model_name)),
        }
    }

    /// Unload everything (shutdown, or `/unload` with no model named).
    pub async fn unload_all(&self) {
        let _gate = self.acquire_load_gate().await;
        let entries: Vec<_> = self.table.write().await.drain().collect();
        for (name, entry) in entries {
            entry.backend.unload().await;
            tracing::info!("model {name} unloaded");
        }
    }

    /// Resolve a loaded entry for `model_name`, loading it on demand.
    pub async fn ensure_loaded(&self, model_name: &str) -> Result<Arc<LoadedEntry>> {
        if let Some(entry) = self.get_loaded(model_name).await {
            if entry.backend.is_running().await {
                entry.touch();
                return Ok(entry);
            }
        }
        self.load_model(model_name, None).await?;
        let entry = self
            .get_loaded(model_name)
            .await
            .ok_or_else(|| Error::model_not_loaded(model_name))?;
        entry.touch();
        Ok(entry)
    }

    pub async fn is_model_loaded(&self, model_name: &str) -> bool {
        match self.get_loaded(model_name).await {
            Some(entry) => entry.backend.is_running().await,
            None => false,
        }
    }

    fn model_from_request(request: &Value) -> Result<String> {
        request
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .ok_or_else(|| Error::validation("request is missing the 'model' field"))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub async fn chat_completion(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        let completion = entry.backend.as_completion().ok_or_else(|| {
            Error::validation(format!("Model '{model}' does not support chat completions"))
        })?;
        completion.chat_completion(request).await
    }

    pub async fn completion(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        let completion = entry.backend.as_completion().ok_or_else(|| {
            Error::validation(format!("Model '{model}' does not support completions"))
        })?;
        completion.completion(request).await
    }

    pub async fn responses(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let descriptor = self.catalog.model_info(&model).await?;
        if !descriptor.recipe.is_onnx() {
            return Err(Error::unsupported("Responses", descriptor.recipe.as_str()));
        }
        let entry = self.ensure_loaded(&model).await?;
        let completion = entry
            .backend
            .as_completion()
            .ok_or_else(|| Error::unsupported("Responses", descriptor.recipe.as_str()))?;
        completion.responses(request).await
    }

    pub async fn embeddings(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        let embeddings = entry.backend.as_embeddings().ok_or_else(|| {
            Error::unsupported("Embeddings", entry.descriptor.recipe.as_str())
        })?;
        embeddings.embeddings(request).await
    }

    pub async fn reranking(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        let reranking = entry.backend.as_reranking().ok_or_else(|| {
            Error::unsupported("Reranking", entry.descriptor.recipe.as_str())
        })?;
        reranking.reranking(request).await
    }

    pub async fn audio_transcriptions(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        let transcription = entry.backend.as_transcription().ok_or_else(|| {
            Error::unsupported("Audio transcription", entry.descriptor.recipe.as_str())
        })?;
        transcription.transcribe(request).await
    }

    pub async fn audio_speech(&self, request: &Value) -> Result<(Vec<u8>, String)> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        let speech = entry.backend.as_speech().ok_or_else(|| {
            Error::unsupported("Text to speech", entry.descriptor.recipe.as_str())
        })?;
        speech.speech(request).await
    }

    /// Image generation is stateless: a fresh adapter per request, never
    /// entered into the loaded-backend table.
    pub async fn image_generations(&self, request: &Value) -> Result<Value> {
        let model = Self::model_from_request(request)?;
        let descriptor = self.catalog.model_info(&model).await?;
        if descriptor.model_type() != ModelType::Image {
            return Err(Error::unsupported(
                "Image generation",
                descriptor.recipe.as_str(),
            ));
        }

        let options = self.load_options(None);
        let mut backend = (self.factory)(&descriptor, &options)?;
        backend.install().await?;
        backend.load(&descriptor, &options).await?;
        let image = backend
            .as_image()
            .ok_or_else(|| Error::unsupported("Image generation", descriptor.recipe.as_str()))?;
        image.generate(request).await
    }

    /// Open a streaming forward to the model's backend. Returns the channel
    /// the response body reads from; the relay runs on its own task.
    pub async fn forward_stream(
        &self,
        endpoint: &str,
        request: &Value,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let model = Self::model_from_request(request)?;
        let entry = self.ensure_loaded(&model).await?;
        if entry.backend.as_completion().is_none() {
            return Err(Error::validation(format!(
                "Model '{model}' does not support chat completions"
            )));
        }
        let base = entry
            .backend
            .base_url()
            .ok_or_else(|| Error::internal("backend has no HTTP address"))?;
        let url = format!("{base}{endpoint}");

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let client = self.client.clone();
        let body = request.to_string();
        let backend_telemetry = entry.backend.telemetry();
        let totals = self.totals.clone();

        tokio::spawn(async move {
            let on_complete = Box::new(move |telemetry: TelemetryRecord| {
                backend_telemetry.record(&telemetry);
                totals.record(&telemetry);
            });
            let result = proxy::forward_streaming_request(
                &client,
                &url,
                body,
                StreamMode::Sse,
                tx.clone(),
                Some(on_complete),
            )
            .await;
            if let Err(e) = result {
                tracing::error!("streaming forward failed: {e}");
                let frame = format!("data: {}\n\n", e.to_error_json());
                let _ = tx.send(Bytes::from(frame)).await;
                let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
            }
        });

        Ok(rx)
    }

    /// Record telemetry against a loaded model (used by non-streaming paths
    /// that extract usage themselves).
    pub async fn record_telemetry(&self, model_name: &str, telemetry: &TelemetryRecord) {
        if let Some(entry) = self.get_loaded(model_name).await {
            entry.backend.telemetry().record(telemetry);
        }
        self.totals.record(telemetry);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Loaded-models snapshot for `/health`.
    pub async fn loaded_models(&self) -> Vec<Value> {
        let table = self.table.read().await;
        let mut out = Vec::with_capacity(table.len());
        for (name, entry) in table.iter() {
            out.push(json!({
                "model": name,
                "recipe": entry.descriptor.recipe.as_str(),
                "type": entry.descriptor.model_type().as_str(),
                "address": entry.backend.base_url(),
            }));
        }
        out.sort_by_key(|v| v["model"].as_str().map(String::from));
        out
    }

    /// Effective pool limits (configured bound raised to the floor).
    pub fn pool_limits(&self) -> Value {
        json!({
            "llm": self.pool_capacity(ModelType::Llm),
            "embedding": self.pool_capacity(ModelType::Embedding),
            "reranking": self.pool_capacity(ModelType::Reranking),
            "audio": self.pool_capacity(ModelType::Audio),
        })
    }

    /// Aggregate telemetry for `/stats`.
    pub async fn stats(&self) -> Value {
        let table = self.table.read().await;
        let mut models = serde_json::Map::new();
        for (name, entry) in table.iter() {
            let snapshot = entry.backend.telemetry().snapshot();
            models.insert(name.clone(), serde_json::to_value(snapshot).unwrap_or_default());
        }
        json!({
            "totals": serde_json::to_value(self.totals.snapshot()).unwrap_or_default(),
            "models": models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lemonade_backends::CompletionBackend;
    use lemonade_core::model::Recipe;
    use std::sync::atomic::AtomicBool;

    struct MockBackend {
        running: AtomicBool,
        loads: Arc<AtomicUsize>,
        telemetry: SharedTelemetry,
    }

    #[async_trait]
    impl WrappedBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }
        fn recipe(&self) -> Recipe {
            Recipe::LlamaCpp
        }
        async fn install(&self) -> Result<()> {
            Ok(())
        }
        async fn load(&mut self, _d: &ModelDescriptor, _o: &LoadOptions) -> Result<()> {
            // Simulate the slow spawn + readiness window.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn unload(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
        fn base_url(&self) -> Option<String> {
            Some("http://127.0.0.1:9/v1".into())
        }
        fn telemetry(&self) -> SharedTelemetry {
            self.telemetry.clone()
        }
        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn as_completion(&self) -> Option<&dyn CompletionBackend> {
            None
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl WrappedBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }
        fn recipe(&self) -> Recipe {
            Recipe::LlamaCpp
        }
        async fn install(&self) -> Result<()> {
            Ok(())
        }
        async fn load(&mut self, _d: &ModelDescriptor, _o: &LoadOptions) -> Result<()> {
            Err(Error::process("spawn blew up"))
        }
        async fn unload(&self) {}
        fn base_url(&self) -> Option<String> {
            None
        }
        fn telemetry(&self) -> SharedTelemetry {
            SharedTelemetry::new()
        }
        async fn is_running(&self) -> bool {
            false
        }
    }

    fn test_catalog() -> Arc<ModelCatalog> {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("LEMONADE_CACHE_DIR", dir.path());
        std::mem::forget(dir);
        Arc::new(ModelCatalog::from_values(
            json!({
                "model-a": {"checkpoint": "org/model-a:Q4_0", "recipe": "llamacpp"},
                "model-b": {"checkpoint": "org/model-b:Q4_0", "recipe": "llamacpp"},
            }),
            json!({}),
        ))
    }

    fn mock_router(loads: Arc<AtomicUsize>) -> Router {
        Router::with_factory(
            test_catalog(),
            RouterConfig::default(),
            Box::new(move |_, _| {
                Ok(Box::new(MockBackend {
                    running: AtomicBool::new(false),
                    loads: loads.clone(),
                    telemetry: SharedTelemetry::new(),
                }))
            }),
        )
    }

    #[tokio::test]
    async fn test_load_twice_is_a_noop() {
        let loads = Arc::new(AtomicUsize::new(0));
        let router = mock_router(loads.clone());

        router.load_model("model-a", None).await.unwrap();
        router.load_model("model-a", None).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(router.is_model_loaded("model-a").await);
    }

    #[tokio::test]
    async fn test_concurrent_loads_serialize_and_lru_evicts() {
        let loads = Arc::new(AtomicUsize::new(0));
        let router = Arc::new(mock_router(loads.clone()));

        // N_llm = 1: both loads succeed, only the later one survives.
        let a = {
            let router = router.clone();
            tokio::spawn(async move { router.load_model("model-a", None).await })
        };
        let b = {
            let router = router.clone();
            tokio::spawn(async move { router.load_model("model-b", None).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        let loaded = router.loaded_models().await;
        assert_eq!(loaded.len(), 1, "one LLM slot, one survivor");
        assert!(!router.is_loading());
    }

    #[tokio::test]
    async fn test_failed_load_clears_the_gate() {
        let loads = Arc::new(AtomicUsize::new(0));
        let inner_loads = loads.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = calls.clone();

        let router = Router::with_factory(
            test_catalog(),
            RouterConfig::default(),
            Box::new(move |_, _| {
                // First construction fails to load; later ones succeed.
                if calls_in_factory.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Box::new(FailingBackend))
                } else {
                    Ok(Box::new(MockBackend {
                        running: AtomicBool::new(false),
                        loads: inner_loads.clone(),
                        telemetry: SharedTelemetry::new(),
                    }))
                }
            }),
        );

        let err = router.load_model("model-a", None).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert!(!router.is_loading(), "failed load must clear is_loading");

        // A fresh load goes through; nobody is deadlocked on the gate.
        router.load_model("model-a", None).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unload_then_load_starts_fresh_backend() {
        let loads = Arc::new(AtomicUsize::new(0));
        let router = mock_router(loads.clone());

        router.load_model("model-a", None).await.unwrap();
        router.unload_model("model-a").await.unwrap();
        assert!(!router.is_model_loaded("model-a").await);
        router.load_model("model-a", None).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unload_unknown_model_errors() {
        let router = mock_router(Arc::new(AtomicUsize::new(0)));
        let err = router.unload_model("model-a").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotLoaded(_)));
    }

    #[tokio::test]
    async fn test_floor_raises_pool_capacity() {
        let loads = Arc::new(AtomicUsize::new(0));
        let router = mock_router(loads.clone());

        router.set_min_loaded_models(2);
        router.load_model("model-a", None).await.unwrap();
        router.load_model("model-b", None).await.unwrap();
        assert_eq!(router.loaded_models().await.len(), 2);
    }
}
