//! Artifact acquisition.
//!
//! Two modes. Hub mode queries the Hugging Face model-info API, picks the
//! file subset for the recipe + variant, and downloads each file under the
//! snapshot path with a manifest sidecar marking the snapshot incomplete
//! until the last file lands. CLI mode shells out to `flm pull` and maps its
//! stdout progress lines onto the same event shape. Both modes cancel when
//! the progress callback returns false.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use lemonade_client::{DownloadOptions, HttpClient};
use lemonade_core::model::Recipe;
use lemonade_core::{paths, Error, Result};

use crate::catalog::{ModelCatalog, UserModelRegistration, DOWNLOAD_MANIFEST};
use crate::gguf::select_gguf_files;

const HF_BASE: &str = "https://huggingface.co";

/// Minimum interval between progress events for the same file.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// One progress event, shared by both fetch modes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub file: String,
    pub file_index: usize,
    pub total_files: usize,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub percent: u8,
    pub complete: bool,
}

/// Callback fed progress events; returning false cancels the download.
pub type ProgressFn = dyn FnMut(&DownloadProgress) -> bool + Send;

/// A `/pull` request body resolved into fetcher inputs.
#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    pub model_name: String,
    pub checkpoint: Option<String>,
    pub recipe: Option<Recipe>,
    pub reasoning: bool,
    pub vision: bool,
    pub embedding: bool,
    pub reranking: bool,
    pub mmproj: Option<String>,
    pub do_not_upgrade: bool,
}

/// Download (and, for new `user.` names, register) a model.
pub async fn download_model(
    catalog: &ModelCatalog,
    client: &HttpClient,
    req: &PullRequest,
    mut progress: Option<&mut ProgressFn>,
) -> Result<()> {
    let registered = catalog.model_exists(&req.model_name).await;

    let (checkpoint, recipe, mmproj) = if registered {
        let info = catalog.model_info(&req.model_name).await?;
        (
            req.checkpoint.clone().unwrap_or(info.checkpoint),
            req.recipe.unwrap_or(info.recipe),
            req.mmproj.clone().or(info.mmproj),
        )
    } else {
        if !req.model_name.starts_with("user.") {
            return Err(Error::validation(format!(
                "When registering a new model, the model name must include the \
                 `user` namespace, for example `user.Phi-4-Mini-GGUF`. Received: {}",
                req.model_name
            )));
        }
        let checkpoint = req.checkpoint.clone().filter(|c| !c.is_empty()).ok_or_else(|| {
            Error::validation(format!(
                "Model {} is not registered. To register and install it, provide \
                 the `checkpoint` and `recipe` fields, plus the optional \
                 `reasoning` and `mmproj` fields as appropriate.",
                req.model_name
            ))
        })?;
        let recipe = req.recipe.ok_or_else(|| {
            Error::validation(format!(
                "Model {} is not registered; a `recipe` is required.",
                req.model_name
            ))
        })?;
        if recipe == Recipe::LlamaCpp
            && checkpoint.to_lowercase().contains("gguf")
            && !checkpoint.contains(':')
        {
            return Err(Error::validation(
                "A 'variant' is required in the checkpoint field when registering \
                 a GGUF model, as CHECKPOINT:VARIANT. For example: \
                 Qwen/Qwen2.5-Coder-3B-Instruct-GGUF:Q4_0",
            ));
        }
        tracing::info!("registering new user model: {}", req.model_name);
        (checkpoint, recipe, req.mmproj.clone())
    };

    let (repo_id, variant) = split_checkpoint(&checkpoint, recipe);
    tracing::info!(
        "downloading model: {repo_id}{}",
        variant
            .as_deref()
            .map(|v| format!(" (variant: {v})"))
            .unwrap_or_default()
    );

    if std::env::var("LEMONADE_OFFLINE").as_deref() == Ok("1") {
        tracing::info!("offline mode enabled, skipping download");
        return Ok(());
    }

    if req.do_not_upgrade && catalog.is_downloaded(&req.model_name).await {
        tracing::info!("model already downloaded and do_not_upgrade=true, using cached version");
        return Ok(());
    }

    match recipe {
        Recipe::Flm => {
            download_from_flm(&checkpoint, req.do_not_upgrade, progress.as_deref_mut()).await?
        }
        Recipe::LlamaCpp | Recipe::WhisperCpp => {
            download_from_hub(
                client,
                &repo_id,
                variant.as_deref().unwrap_or(""),
                mmproj.as_deref(),
                progress.as_deref_mut(),
            )
            .await?
        }
        _ => download_from_hub(client, &repo_id, "", None, progress.as_deref_mut()).await?,
    }

    // A user.-namespaced pull, or any pull that spelled out a checkpoint,
    // (re-)registers the model.
    if req.model_name.starts_with("user.") || req.checkpoint.is_some() {
        catalog
            .register_user_model(&UserModelRegistration {
                model_name: req.model_name.clone(),
                checkpoint,
                recipe,
                reasoning: req.reasoning,
                vision: req.vision,
                embedding: req.embedding,
                reranking: req.reranking,
                mmproj,
                source: None,
            })
            .await?;
    }

    catalog.update_model_in_cache(&req.model_name, true).await;
    Ok(())
}

fn split_checkpoint(checkpoint: &str, recipe: Recipe) -> (String, Option<String>) {
    if recipe == Recipe::Flm {
        return (checkpoint.to_string(), None);
    }
    match checkpoint.split_once(':') {
        Some((repo, variant)) => (repo.to_string(), Some(variant.to_string())),
        None => (checkpoint.to_string(), None),
    }
}

/// Hub mode: model-info JSON → file subset → per-file downloads under the
/// snapshot path, guarded by the manifest sidecar.
async fn download_from_hub(
    client: &HttpClient,
    repo_id: &str,
    variant: &str,
    mmproj: Option<&str>,
    mut progress: Option<&mut ProgressFn>,
) -> Result<()> {
    let snapshot = paths::hf_cache_dir().join(paths::snapshot_dir_name(repo_id));

    let api_url = format!("{HF_BASE}/api/models/{repo_id}");
    tracing::info!("fetching model info from {api_url}");
    let response = client.get(&api_url, &HashMap::new()).await?;
    if !response.is_success() {
        return Err(Error::network(format!(
            "Failed to fetch model info from the hub: HTTP {}",
            response.status
        )));
    }

    let model_info: serde_json::Value = serde_json::from_str(&response.body)?;
    let repo_files: Vec<String> = model_info
        .get("siblings")
        .and_then(|s| s.as_array())
        .map(|siblings| {
            siblings
                .iter()
                .filter_map(|s| s.get("rfilename").and_then(|f| f.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if repo_files.is_empty() {
        return Err(Error::validation(format!(
            "No files found in repository: {repo_id}"
        )));
    }

    let files_to_download = pick_files(&repo_files, variant, mmproj)?;
    tracing::info!(
        "downloading {} of {} files from {repo_id}",
        files_to_download.len(),
        repo_files.len()
    );

    fs::create_dir_all(&snapshot)?;
    write_manifest(&snapshot, repo_id, &files_to_download)?;

    let total_files = files_to_download.len();
    for (index, filename) in files_to_download.iter().enumerate() {
        let file_index = index + 1;
        let dest = snapshot.join(filename);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if dest.exists() {
            tracing::info!("file already exists, skipping: {filename}");
            let size = fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
            let event = DownloadProgress {
                file: filename.clone(),
                file_index,
                total_files,
                bytes_downloaded: size,
                bytes_total: size,
                percent: 100,
                complete: false,
            };
            if let Some(cb) = progress.as_deref_mut() {
                if !cb(&event) {
                    return Err(Error::Cancelled);
                }
            }
            continue;
        }

        let url = format!("{HF_BASE}/{repo_id}/resolve/main/{filename}");
        tracing::info!("downloading: {filename}");

        let mut last_emit = Instant::now() - PROGRESS_INTERVAL;
        let mut cancelled = false;
        let mut on_bytes = |downloaded: u64, total: u64| -> bool {
            let Some(cb) = progress.as_deref_mut() else {
                return true;
            };
            if last_emit.elapsed() < PROGRESS_INTERVAL && downloaded != total {
                return true;
            }
            last_emit = Instant::now();
            let event = DownloadProgress {
                file: filename.clone(),
                file_index,
                total_files,
                bytes_downloaded: downloaded,
                bytes_total: total,
                percent: if total > 0 {
                    ((downloaded * 100) / total) as u8
                } else {
                    0
                },
                complete: false,
            };
            if !cb(&event) {
                cancelled = true;
                return false;
            }
            true
        };

        let result = client
            .download_file(
                &url,
                &dest,
                Some(&mut on_bytes),
                &HashMap::new(),
                &DownloadOptions::default(),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) if cancelled => {
                tracing::debug!("download aborted after cancellation: {e}");
                return Err(Error::Cancelled);
            }
            Err(e) => {
                return Err(Error::download(format!(
                    "Failed to download {filename}: {e}"
                )))
            }
        }
    }

    clear_manifest(&snapshot);

    if let Some(cb) = progress.as_deref_mut() {
        let _ = cb(&DownloadProgress {
            file_index: total_files,
            total_files,
            percent: 100,
            complete: true,
            ..Default::default()
        });
    }
    tracing::info!("all files downloaded to {}", snapshot.display());
    Ok(())
}

/// File subset for a recipe + variant over the repo listing.
fn pick_files(repo_files: &[String], variant: &str, mmproj: Option<&str>) -> Result<Vec<String>> {
    let has_gguf = repo_files
        .iter()
        .any(|f| f.to_lowercase().ends_with(".gguf"));

    if has_gguf && !variant.is_empty() {
        return Ok(select_gguf_files(repo_files, variant, mmproj)?.all_files());
    }
    if has_gguf {
        let mut selection = select_gguf_files(repo_files, "", None)?.all_files();
        if let Some(mmproj) = mmproj {
            selection.push(mmproj.to_string());
        }
        return Ok(selection);
    }
    // Non-GGUF recipes (ONNX, whisper repos without variants, SD, TTS) take
    // the whole repository.
    Ok(repo_files.to_vec())
}

fn write_manifest(snapshot: &Path, repo_id: &str, files: &[String]) -> Result<()> {
    let manifest = serde_json::json!({
        "repo": repo_id,
        "files": files,
        "started_at": chrono::Utc::now().to_rfc3339(),
    });
    fs::write(
        snapshot.join(DOWNLOAD_MANIFEST),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    Ok(())
}

fn clear_manifest(snapshot: &Path) {
    let path = snapshot.join(DOWNLOAD_MANIFEST);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("could not remove {}: {e}", path.display());
        }
    }
}

/// CLI mode: `flm pull`, progress parsed from its stdout.
async fn download_from_flm(
    checkpoint: &str,
    do_not_upgrade: bool,
    mut progress: Option<&mut ProgressFn>,
) -> Result<()> {
    tracing::info!("pulling FLM model: {checkpoint}");
    let flm = paths::find_flm_executable().ok_or_else(|| {
        Error::process("flm executable not found; install the FLM backend first")
    })?;

    let mut args = vec!["pull".to_string(), checkpoint.to_string()];
    if !do_not_upgrade {
        args.push("--force".to_string());
    }

    let mut state = FlmProgressState::default();
    let exit_code = lemonade_client::run_with_output(&flm, &args, |line| {
        tracing::debug!(target: "flm", "{line}");
        let Some(event) = state.parse_line(line) else {
            return true;
        };
        match progress.as_deref_mut() {
            Some(cb) => cb(&event),
            None => true,
        }
    })
    .await?;

    if exit_code != 0 {
        return Err(Error::process(format!(
            "flm pull failed with exit code {exit_code}"
        )));
    }

    if let Some(cb) = progress.as_deref_mut() {
        let _ = cb(&DownloadProgress {
            file_index: state.total_files,
            total_files: state.total_files,
            percent: 100,
            complete: true,
            ..Default::default()
        });
    }
    tracing::info!("FLM model pull completed");
    Ok(())
}

/// Parser for FLM's stdout progress lines:
/// `[FLM]  Downloading 2/5: model-00002.safetensors`
/// `[FLM]  Downloading: 42.5% (120MB/300MB)`
#[derive(Debug, Default)]
struct FlmProgressState {
    total_files: usize,
    current_file_index: usize,
    current_filename: String,
}

impl FlmProgressState {
    fn parse_line(&mut self, line: &str) -> Option<DownloadProgress> {
        if let Some(rest) = line.strip_prefix("[FLM]  Downloading ") {
            if let Some((counts, filename)) = rest.split_once(": ") {
                if let Some((index, total)) = counts.split_once('/') {
                    self.current_file_index = index.trim().parse().ok()?;
                    self.total_files = total.trim().parse().ok()?;
                    self.current_filename = filename.trim().to_string();
                    return Some(DownloadProgress {
                        file: self.current_filename.clone(),
                        file_index: self.current_file_index,
                        total_files: self.total_files,
                        percent: self.overall_percent(0.0),
                        ..Default::default()
                    });
                }
            }
        }

        if let Some(rest) = line.strip_prefix("[FLM]  Downloading: ") {
            let pct_end = rest.find('%')?;
            let file_percent: f64 = rest[..pct_end].trim().parse().ok()?;

            let (bytes_downloaded, bytes_total) = rest
                .find('(')
                .and_then(|open| {
                    let close = rest.find(')')?;
                    let inner = &rest[open + 1..close];
                    let (down, total) = inner.split_once('/')?;
                    Some((parse_size(down), parse_size(total)))
                })
                .unwrap_or((0, 0));

            return Some(DownloadProgress {
                file: self.current_filename.clone(),
                file_index: self.current_file_index,
                total_files: self.total_files,
                bytes_downloaded,
                bytes_total,
                percent: self.overall_percent(file_percent),
                complete: false,
            });
        }

        None
    }

    fn overall_percent(&self, file_percent: f64) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        let per_file = 100.0 / self.total_files as f64;
        let completed = (self.current_file_index.saturating_sub(1)) as f64 * per_file;
        (completed + (file_percent / 100.0) * per_file) as u8
    }
}

fn parse_size(s: &str) -> u64 {
    let s = s.trim();
    if let Some(mb) = s.strip_suffix("MB") {
        return (mb.trim().parse::<f64>().unwrap_or(0.0) * 1024.0 * 1024.0) as u64;
    }
    if let Some(gb) = s.strip_suffix("GB") {
        return (gb.trim().parse::<f64>().unwrap_or(0.0) * 1024.0 * 1024.0 * 1024.0) as u64;
    }
    s.parse::<f64>().unwrap_or(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_files_gguf_variant() {
        let repo = vec![
            "model-q4_0.gguf".to_string(),
            "model-q8_0.gguf".to_string(),
            "README.md".to_string(),
        ];
        let files = pick_files(&repo, "q4_0", None).unwrap();
        assert_eq!(files, vec!["model-q4_0.gguf"]);
    }

    #[test]
    fn test_pick_files_non_gguf_takes_everything() {
        let repo = vec![
            "genai_config.json".to_string(),
            "model.onnx".to_string(),
            "tokenizer.json".to_string(),
        ];
        let files = pick_files(&repo, "", None).unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_flm_progress_parsing() {
        let mut state = FlmProgressState::default();

        let boundary = state
            .parse_line("[FLM]  Downloading 2/4: model-00002.safetensors")
            .unwrap();
        assert_eq!(boundary.file_index, 2);
        assert_eq!(boundary.total_files, 4);
        assert_eq!(boundary.file, "model-00002.safetensors");

        let progress = state
            .parse_line("[FLM]  Downloading: 50.0% (150MB/300MB)")
            .unwrap();
        assert_eq!(progress.bytes_downloaded, 150 * 1024 * 1024);
        assert_eq!(progress.bytes_total, 300 * 1024 * 1024);
        // Files 1 complete (25%) plus half of file 2 (12.5%).
        assert_eq!(progress.percent, 37);

        assert!(state.parse_line("[FLM]  some other log line").is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1MB"), 1024 * 1024);
        assert_eq!(parse_size("2.5GB"), (2.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert_eq!(parse_size("512"), 512);
    }
}
