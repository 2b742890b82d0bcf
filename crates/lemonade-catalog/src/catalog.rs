//! The model catalog.
//!
//! Merges the built-in registry (`resources/server_models.json`) with the
//! user registry (`{cache}/user_models.json`), filters by backend
//! availability, resolves on-disk paths, and tracks download state. The
//! catalog cache is built lazily on first read and mutated incrementally on
//! download/register/delete so readers never see a half-built view.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use lemonade_client::http::PARTIAL_SUFFIX;
use lemonade_core::hardware::HardwareInfo;
use lemonade_core::model::{ModelDescriptor, ModelSource, Recipe};
use lemonade_core::{paths, Error, Result};

use crate::gguf::select_gguf_files;

/// Sidecar marking an in-progress multi-file download.
pub const DOWNLOAD_MANIFEST: &str = ".download_manifest.json";

/// One large FLM model has a hard RAM floor regardless of the 80 % rule.
const LARGE_FLM_MODEL: &str = "gpt-oss-20b-FLM";
const LARGE_FLM_MIN_RAM_GB: f64 = 64.0;

static AVAILABILITY_LOG: Once = Once::new();

#[derive(Default)]
struct Cache {
    valid: bool,
    models: BTreeMap<String, ModelDescriptor>,
}

/// Registration request for a user model.
#[derive(Debug, Clone, Default)]
pub struct UserModelRegistration {
    pub model_name: String,
    pub checkpoint: String,
    pub recipe: Recipe,
    pub reasoning: bool,
    pub vision: bool,
    pub embedding: bool,
    pub reranking: bool,
    pub mmproj: Option<String>,
    pub source: Option<ModelSource>,
}

/// Process-wide model registry.
pub struct ModelCatalog {
    server_models: serde_json::Map<String, Value>,
    user_models: RwLock<serde_json::Map<String, Value>>,
    cache: RwLock<Cache>,
}

impl ModelCatalog {
    /// Load both registries. A missing `server_models.json` is fatal; a
    /// broken `user_models.json` degrades to an empty user registry.
    pub fn load() -> Result<Self> {
        let server_path = paths::resource_path("resources/server_models.json");
        let server_models = read_json_map(&server_path).map_err(|e| {
            Error::config(format!(
                "Failed to load server_models.json from {}: {e}. \
                 This file is required for the server to run.",
                server_path.display()
            ))
        })?;

        let user_path = paths::user_models_file();
        let user_models = if user_path.exists() {
            read_json_map(&user_path).unwrap_or_else(|e| {
                tracing::warn!("could not load user_models.json: {e}");
                serde_json::Map::new()
            })
        } else {
            serde_json::Map::new()
        };

        Ok(Self {
            server_models,
            user_models: RwLock::new(user_models),
            cache: RwLock::new(Cache::default()),
        })
    }

    /// Construct from in-memory registries (tests and embedding scenarios).
    pub fn from_values(server_models: Value, user_models: Value) -> Self {
        Self {
            server_models: server_models.as_object().cloned().unwrap_or_default(),
            user_models: RwLock::new(user_models.as_object().cloned().unwrap_or_default()),
            cache: RwLock::new(Cache::default()),
        }
    }

    /// All models that pass the availability filter, with download status.
    pub async fn supported_models(&self) -> BTreeMap<String, ModelDescriptor> {
        self.build_cache().await;
        self.cache.read().await.models.clone()
    }

    /// Only the models whose artifacts are complete on disk.
    pub async fn downloaded_models(&self) -> BTreeMap<String, ModelDescriptor> {
        self.build_cache().await;
        self.cache
            .read()
            .await
            .models
            .iter()
            .filter(|(_, d)| d.downloaded)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn model_info(&self, name: &str) -> Result<ModelDescriptor> {
        self.build_cache().await;
        self.cache
            .read()
            .await
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::model_not_found(name))
    }

    pub async fn model_exists(&self, name: &str) -> bool {
        self.build_cache().await;
        self.cache.read().await.models.contains_key(name)
    }

    pub async fn is_downloaded(&self, name: &str) -> bool {
        self.build_cache().await;
        self.cache
            .read()
            .await
            .models
            .get(name)
            .map(|d| d.downloaded)
            .unwrap_or(false)
    }

    /// Force the next read to rebuild from disk.
    pub async fn invalidate(&self) {
        self.cache.write().await.valid = false;
    }

    async fn build_cache(&self) {
        {
            if self.cache.read().await.valid {
                return;
            }
        }

        let mut cache = self.cache.write().await;
        if cache.valid {
            return;
        }
        tracing::info!("building models cache...");

        let hardware = HardwareInfo::get_cached();
        let mut all: BTreeMap<String, ModelDescriptor> = BTreeMap::new();

        for (key, value) in &self.server_models {
            if let Some(desc) = descriptor_from_json(key.clone(), value, false) {
                all.insert(desc.name.clone(), desc);
            }
        }
        for (key, value) in self.user_models.read().await.iter() {
            let name = format!("user.{key}");
            if let Some(desc) = descriptor_from_json(name, value, true) {
                all.insert(desc.name.clone(), desc);
            }
        }

        for desc in all.values_mut() {
            desc.resolved_path = resolve_model_path(desc);
        }

        let mut filtered = filter_by_availability(all, &hardware);

        let needs_flm = filtered.values().any(|d| d.recipe == Recipe::Flm);
        let flm_installed = if needs_flm {
            flm_installed_models().await
        } else {
            Vec::new()
        };

        let mut downloaded_count = 0;
        for desc in filtered.values_mut() {
            desc.downloaded = if desc.recipe == Recipe::Flm {
                flm_installed.iter().any(|c| c == &desc.checkpoint)
            } else {
                artifacts_complete(desc)
            };
            if desc.downloaded {
                downloaded_count += 1;
            }
        }

        tracing::info!(
            "cache built: {} models, {} downloaded",
            filtered.len(),
            downloaded_count
        );
        cache.models = filtered;
        cache.valid = true;
    }

    /// Incrementally add a (newly registered) model to a valid cache.
    pub async fn add_model_to_cache(&self, model_name: &str) {
        let entry = {
            let user_models = self.user_models.read().await;
            lookup_registry_entry(&self.server_models, &user_models, model_name)
        };
        let Some((value, is_user)) = entry else {
            tracing::warn!("'{model_name}' not found in any registry");
            return;
        };

        let Some(mut desc) = descriptor_from_json(model_name.to_string(), &value, is_user) else {
            return;
        };
        desc.resolved_path = resolve_model_path(&desc);

        let hardware = HardwareInfo::get_cached();
        let singleton = BTreeMap::from([(desc.name.clone(), desc.clone())]);
        if filter_by_availability(singleton, &hardware).is_empty() {
            tracing::info!("'{model_name}' filtered out by backend availability");
            return;
        }

        desc.downloaded = if desc.recipe == Recipe::Flm {
            flm_installed_models()
                .await
                .iter()
                .any(|c| c == &desc.checkpoint)
        } else {
            artifacts_complete(&desc)
        };

        let mut cache = self.cache.write().await;
        if !cache.valid {
            return; // Next read rebuilds anyway.
        }
        tracing::info!("added '{model_name}' to cache (downloaded={})", desc.downloaded);
        cache.models.insert(desc.name.clone(), desc);
    }

    /// Flip the downloaded flag, recomputing the resolved path when files
    /// just landed on disk.
    pub async fn update_model_in_cache(&self, model_name: &str, downloaded: bool) {
        let mut cache = self.cache.write().await;
        if !cache.valid {
            return;
        }
        if let Some(desc) = cache.models.get_mut(model_name) {
            desc.downloaded = downloaded;
            if downloaded {
                desc.resolved_path = resolve_model_path(desc);
            }
        } else {
            tracing::warn!("'{model_name}' not found in cache");
        }
    }

    /// Drop a deleted model from the cache, or just clear its downloaded
    /// flag when it remains registered.
    pub async fn remove_model_from_cache(&self, model_name: &str) {
        let mut cache = self.cache.write().await;
        if !cache.valid {
            return;
        }
        let remove = cache
            .models
            .get(model_name)
            .map(|d| d.source == ModelSource::LocalUpload)
            .unwrap_or(false);
        if remove {
            cache.models.remove(model_name);
        } else if let Some(desc) = cache.models.get_mut(model_name) {
            desc.downloaded = false;
        }
    }

    /// Register (or re-register) a user model and persist the registry.
    pub async fn register_user_model(&self, reg: &UserModelRegistration) -> Result<()> {
        let clean_name = reg
            .model_name
            .strip_prefix("user.")
            .unwrap_or(&reg.model_name)
            .to_string();

        let mut labels = vec!["custom".to_string()];
        if reg.reasoning {
            labels.push("reasoning".into());
        }
        if reg.vision {
            labels.push("vision".into());
        }
        if reg.embedding {
            labels.push("embeddings".into());
        }
        if reg.reranking {
            labels.push("reranking".into());
        }

        let mut entry = serde_json::json!({
            "checkpoint": reg.checkpoint,
            "recipe": reg.recipe.as_str(),
            "suggested": true,
            "labels": labels,
        });
        if let Some(mmproj) = &reg.mmproj {
            entry["mmproj"] = Value::String(mmproj.clone());
        }
        if let Some(source) = &reg.source {
            entry["source"] = serde_json::to_value(source)?;
        }

        {
            let mut user_models = self.user_models.write().await;
            user_models.insert(clean_name.clone(), entry);
            save_user_models(&user_models)?;
        }

        self.add_model_to_cache(&format!("user.{clean_name}")).await;
        Ok(())
    }

    /// Delete a model's artifacts (and registry entry for user models).
    ///
    /// FLM models are removed through the CLI. Hub models are located by
    /// walking up from `resolved_path` to the `models--*` ancestor, which is
    /// then removed with retries for file-in-use races.
    pub async fn delete_model(&self, model_name: &str) -> Result<()> {
        let info = self.model_info(model_name).await?;
        tracing::info!(
            "deleting model {model_name} (checkpoint {}, recipe {})",
            info.checkpoint,
            info.recipe
        );

        if info.recipe == Recipe::Flm {
            self.delete_flm_model(&info).await?;
        } else {
            let resolved = info.resolved_path.clone().ok_or_else(|| {
                Error::validation("Model has no resolved path, cannot determine files to delete")
            })?;
            let cache_root = find_snapshot_ancestor(&resolved).ok_or_else(|| {
                Error::internal(format!(
                    "Could not find models-- directory in path: {}",
                    resolved.display()
                ))
            })?;
            remove_dir_with_retry(&cache_root).await?;
        }

        if model_name.starts_with("user.") {
            let clean_name = model_name.trim_start_matches("user.");
            let mut user_models = self.user_models.write().await;
            user_models.remove(clean_name);
            save_user_models(&user_models)?;
        }

        self.remove_model_from_cache(model_name).await;
        Ok(())
    }

    async fn delete_flm_model(&self, info: &ModelDescriptor) -> Result<()> {
        if info.checkpoint.is_empty() {
            return Err(Error::validation(
                "FLM model has an empty checkpoint field, cannot delete",
            ));
        }
        let flm = paths::find_flm_executable()
            .ok_or_else(|| Error::process("flm executable not found"))?;
        let args = vec!["remove".to_string(), info.checkpoint.clone()];
        let exit = tokio::time::timeout(
            Duration::from_secs(60),
            lemonade_client::run_with_output(&flm, &args, |_| true),
        )
        .await
        .map_err(|_| Error::timeout("flm remove timed out"))??;
        if exit != 0 {
            return Err(Error::process(format!(
                "flm remove failed with exit code {exit}"
            )));
        }
        Ok(())
    }
}

fn lookup_registry_entry(
    server_models: &serde_json::Map<String, Value>,
    user_models: &serde_json::Map<String, Value>,
    model_name: &str,
) -> Option<(Value, bool)> {
    if let Some(key) = model_name.strip_prefix("user.") {
        return user_models.get(key).map(|v| (v.clone(), true));
    }
    server_models.get(model_name).map(|v| (v.clone(), false))
}

fn descriptor_from_json(name: String, value: &Value, is_user: bool) -> Option<ModelDescriptor> {
    let recipe_str = value.get("recipe").and_then(Value::as_str).unwrap_or("");
    let Some(recipe) = Recipe::parse(recipe_str) else {
        tracing::warn!("model '{name}' has unknown recipe '{recipe_str}', skipping");
        return None;
    };

    let source = value
        .get("source")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
        .unwrap_or_default();

    Some(ModelDescriptor {
        name,
        checkpoint: value
            .get("checkpoint")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        recipe,
        mmproj: value
            .get("mmproj")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        labels: value
            .get("labels")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        size_gb: value.get("size").and_then(Value::as_f64).unwrap_or(0.0),
        suggested: value
            .get("suggested")
            .and_then(Value::as_bool)
            .unwrap_or(is_user),
        source,
        downloaded: false,
        resolved_path: None,
    })
}

/// Resolve the on-disk location handed to the backend.
pub fn resolve_model_path(info: &ModelDescriptor) -> Option<PathBuf> {
    // FLM checkpoints are CLI-native identifiers, used verbatim.
    if info.recipe == Recipe::Flm {
        return Some(PathBuf::from(&info.checkpoint));
    }
    // Absolute local paths pass through.
    if info.source == ModelSource::LocalPath {
        return Some(PathBuf::from(&info.checkpoint));
    }

    let hf_cache = paths::hf_cache_dir();

    // Local uploads live relative to the hub cache.
    if info.source == ModelSource::LocalUpload {
        let normalized = info.checkpoint.replace('\\', "/");
        return Some(hf_cache.join(normalized));
    }

    let (repo_id, variant) = info.split_checkpoint();
    let snapshot = hf_cache.join(paths::snapshot_dir_name(&repo_id));

    if info.recipe.is_onnx() {
        if snapshot.exists() {
            if let Some(config) = find_file_recursive(&snapshot, "genai_config.json") {
                return config.parent().map(Path::to_path_buf);
            }
        }
        return Some(snapshot);
    }

    if info.recipe == Recipe::WhisperCpp {
        if !snapshot.exists() {
            return Some(snapshot);
        }
        let mut bins = collect_files_with_extension(&snapshot, "bin");
        if bins.is_empty() {
            return Some(snapshot);
        }
        bins.sort();
        if let Some(variant) = &variant {
            if let Some(hit) = bins
                .iter()
                .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(variant.as_str()))
            {
                return Some(hit.clone());
            }
        }
        return Some(bins[0].clone());
    }

    if info.recipe == Recipe::LlamaCpp {
        if !snapshot.exists() {
            return Some(snapshot);
        }
        let relative = collect_relative_ggufs(&snapshot);
        if relative.is_empty() {
            return Some(snapshot);
        }
        let variant = variant.unwrap_or_default();
        let chosen = match select_gguf_files(&relative, &variant, None) {
            Ok(sel) => sel.primary,
            // Resolution is lenient where download selection is strict: an
            // unmatched variant falls back to the first file on disk.
            Err(_) => relative[0].clone(),
        };
        return Some(snapshot.join(chosen));
    }

    Some(snapshot)
}

/// Download completeness: the resolved path exists and no in-progress
/// markers (`.partial` files, the download manifest sidecar) remain.
pub fn artifacts_complete(info: &ModelDescriptor) -> bool {
    let Some(resolved) = &info.resolved_path else {
        return false;
    };
    if !resolved.exists() {
        return false;
    }

    let snapshot_dir = if resolved.is_dir() {
        resolved.clone()
    } else {
        match resolved.parent() {
            Some(p) => p.to_path_buf(),
            None => return false,
        }
    };

    if snapshot_dir.join(DOWNLOAD_MANIFEST).exists() {
        return false;
    }

    if resolved.is_dir() {
        if let Ok(entries) = fs::read_dir(&snapshot_dir) {
            for entry in entries.flatten() {
                if entry
                    .path()
                    .to_string_lossy()
                    .ends_with(PARTIAL_SUFFIX)
                {
                    return false;
                }
            }
        }
    } else {
        let mut partial = resolved.as_os_str().to_os_string();
        partial.push(PARTIAL_SUFFIX);
        if PathBuf::from(partial).exists() {
            return false;
        }
    }

    true
}

fn filter_by_availability(
    models: BTreeMap<String, ModelDescriptor>,
    hardware: &HardwareInfo,
) -> BTreeMap<String, ModelDescriptor> {
    let is_macos = hardware.os == "macos";
    let npu = hardware.npu_available();
    let docker = !hardware
        .supported_backends(Recipe::Vllm)
        .backends
        .is_empty();
    let ram_gb = hardware.physical_memory_gb;
    let max_model_gb = ram_gb * 0.8;

    AVAILABILITY_LOG.call_once(|| {
        tracing::info!("backend availability:");
        tracing::info!("  - NPU hardware: {}", if npu { "yes" } else { "no" });
        tracing::info!("  - docker: {}", if docker { "yes" } else { "no" });
        if ram_gb > 0.0 {
            tracing::info!(
                "  - system RAM: {:.1} GB (max model size: {:.1} GB)",
                ram_gb,
                max_model_gb
            );
        }
    });

    models
        .into_iter()
        .filter(|(name, info)| {
            let keep = match info.recipe {
                Recipe::Flm | Recipe::OgaNpu | Recipe::OgaHybrid | Recipe::OgaCpu => npu,
                Recipe::Vllm => docker,
                _ => true,
            };
            if !keep {
                return false;
            }
            // macOS only runs the llama.cpp family.
            if is_macos && info.recipe != Recipe::LlamaCpp {
                return false;
            }
            if ram_gb > 0.0 && info.size_gb > 0.0 && info.size_gb > max_model_gb {
                return false;
            }
            if name == LARGE_FLM_MODEL && ram_gb > 0.0 && ram_gb < LARGE_FLM_MIN_RAM_GB {
                return false;
            }
            true
        })
        .collect()
}

/// `flm list --filter installed --quiet`, parsed into checkpoints.
pub async fn flm_installed_models() -> Vec<String> {
    let Some(flm) = paths::find_flm_executable() else {
        return Vec::new();
    };
    let args: Vec<String> = ["list", "--filter", "installed", "--quiet"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut installed = Vec::new();
    let result = lemonade_client::run_with_output(&flm, &args, |line| {
        let line = line.trim();
        if let Some(checkpoint) = line.strip_prefix("- ") {
            let checkpoint = checkpoint.trim();
            if !checkpoint.is_empty() {
                installed.push(checkpoint.to_string());
            }
        }
        true
    })
    .await;

    if let Err(e) = result {
        tracing::warn!("flm list failed: {e}");
    }
    installed
}

fn save_user_models(user_models: &serde_json::Map<String, Value>) -> Result<()> {
    let path = paths::user_models_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(&Value::Object(user_models.clone()))?;
    fs::write(&path, data)?;
    Ok(())
}

fn read_json_map(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let data = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&data)?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| Error::Serialization(format!("{} is not a JSON object", path.display())))
}

/// Walk up from a resolved path to its `models--*` snapshot root.
pub fn find_snapshot_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(p) = current {
        if let Some(name) = p.file_name() {
            if name.to_string_lossy().starts_with("models--") {
                return Some(p.to_path_buf());
            }
        }
        current = p.parent();
    }
    None
}

async fn remove_dir_with_retry(dir: &Path) -> Result<()> {
    if !dir.exists() {
        tracing::warn!("model cache directory not found (may already be deleted)");
        return Ok(());
    }

    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..3 {
        if attempt > 0 {
            tracing::warn!(
                "delete of {} failed (file in use), retrying in 5s...",
                dir.display()
            );
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                tracing::info!("deleted model files: {}", dir.display());
                return Ok(());
            }
            Err(e) if is_file_in_use(&e) => last_err = Some(e),
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Io(format!(
        "could not delete {}: {}",
        dir.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn is_file_in_use(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        return true;
    }
    let msg = e.to_string().to_lowercase();
    // Windows sharing violations and POSIX busy-text errors.
    msg.contains("being used by another process")
        || msg.contains("resource busy")
        || msg.contains("text file busy")
}

fn find_file_recursive(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_recursive(&path, file_name) {
                return Some(found);
            }
        } else if path.file_name().map(|n| n == file_name).unwrap_or(false) {
            return Some(path);
        }
    }
    None
}

fn collect_files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    collect_recursive(dir, &mut |path| {
        if path
            .extension()
            .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
            .unwrap_or(false)
        {
            out.push(path.to_path_buf());
        }
    });
    out
}

fn collect_relative_ggufs(snapshot: &Path) -> Vec<String> {
    let mut out = Vec::new();
    collect_recursive(snapshot, &mut |path| {
        let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase());
        let is_gguf = name
            .as_deref()
            .map(|n| n.ends_with(".gguf") && !n.contains("mmproj"))
            .unwrap_or(false);
        if is_gguf {
            if let Ok(rel) = path.strip_prefix(snapshot) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    });
    out.sort();
    out
}

fn collect_recursive(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_recursive(&path, visit);
        } else {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gguf_descriptor(checkpoint: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: "m".into(),
            checkpoint: checkpoint.into(),
            recipe: Recipe::LlamaCpp,
            mmproj: None,
            labels: vec![],
            size_gb: 0.0,
            suggested: false,
            source: ModelSource::Catalog,
            downloaded: false,
            resolved_path: None,
        }
    }

    #[test]
    fn test_find_snapshot_ancestor() {
        let path = Path::new("/hub/models--Qwen--Qwen3-GGUF/sub/model.gguf");
        assert_eq!(
            find_snapshot_ancestor(path),
            Some(PathBuf::from("/hub/models--Qwen--Qwen3-GGUF"))
        );
        assert_eq!(find_snapshot_ancestor(Path::new("/tmp/nope")), None);
    }

    #[test]
    fn test_artifacts_complete_detects_markers() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("models--org--repo");
        fs::create_dir_all(&snapshot).unwrap();
        let model = snapshot.join("model.gguf");
        fs::write(&model, b"gguf").unwrap();

        let mut desc = gguf_descriptor("org/repo:Q4_0");
        desc.resolved_path = Some(model.clone());
        assert!(artifacts_complete(&desc));

        // A partial sibling marks it incomplete.
        fs::write(snapshot.join("model.gguf.partial"), b"x").unwrap();
        assert!(!artifacts_complete(&desc));
        fs::remove_file(snapshot.join("model.gguf.partial")).unwrap();

        // So does the download manifest sidecar.
        fs::write(snapshot.join(DOWNLOAD_MANIFEST), b"{}").unwrap();
        assert!(!artifacts_complete(&desc));
    }

    #[test]
    fn test_descriptor_from_json_unknown_recipe_skipped() {
        let value = serde_json::json!({"checkpoint": "x", "recipe": "not-a-recipe"});
        assert!(descriptor_from_json("m".into(), &value, false).is_none());
    }

    #[test]
    fn test_filter_by_availability_respects_ram_cap() {
        let hw = HardwareInfo {
            cpu_brand: "test".into(),
            physical_memory_gb: 16.0,
            npu_available: false,
            os: "linux".into(),
        };
        let mut models = BTreeMap::new();
        let mut small = gguf_descriptor("org/small:Q4_0");
        small.name = "small".into();
        small.size_gb = 4.0;
        let mut huge = gguf_descriptor("org/huge:Q4_0");
        huge.name = "huge".into();
        huge.size_gb = 14.0; // > 80% of 16 GB
        models.insert(small.name.clone(), small);
        models.insert(huge.name.clone(), huge);

        let filtered = filter_by_availability(models, &hw);
        assert!(filtered.contains_key("small"));
        assert!(!filtered.contains_key("huge"));
    }

    #[tokio::test]
    async fn test_register_round_trips_through_model_info() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("LEMONADE_CACHE_DIR", dir.path());

        let catalog = ModelCatalog::from_values(
            serde_json::json!({}),
            serde_json::json!({}),
        );
        catalog
            .register_user_model(&UserModelRegistration {
                model_name: "user.My-Model-GGUF".into(),
                checkpoint: "org/My-Model-GGUF:Q4_0".into(),
                recipe: Recipe::LlamaCpp,
                reasoning: true,
                ..Default::default()
            })
            .await
            .unwrap();

        catalog.invalidate().await;
        let info = catalog.model_info("user.My-Model-GGUF").await.unwrap();
        assert_eq!(info.checkpoint, "org/My-Model-GGUF:Q4_0");
        assert!(info.has_label("custom"));
        assert!(info.has_label("reasoning"));
        assert!(info.suggested);
    }
}
