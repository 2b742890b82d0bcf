//! End-to-end catalog behavior against a fake on-disk snapshot layout.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde_json::json;

use lemonade_catalog::{resolve_model_path, ModelCatalog, DOWNLOAD_MANIFEST};
use lemonade_core::model::{ModelDescriptor, ModelSource, Recipe};

// These tests point HF_HUB_CACHE at per-test directories; serialize them so
// the env mutation cannot race.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn descriptor(name: &str, checkpoint: &str, recipe: Recipe) -> ModelDescriptor {
    ModelDescriptor {
        name: name.into(),
        checkpoint: checkpoint.into(),
        recipe,
        mmproj: None,
        labels: vec![],
        size_gb: 0.0,
        suggested: false,
        source: ModelSource::Catalog,
        downloaded: false,
        resolved_path: None,
    }
}

fn make_snapshot(hub: &Path, repo: &str, files: &[&str]) {
    let snapshot = hub.join(format!("models--{}", repo.replace('/', "--")));
    for file in files {
        let path = snapshot.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"weights").unwrap();
    }
}

#[test]
fn gguf_variant_resolution_on_disk() {
    let _guard = ENV_LOCK.lock().unwrap();
    let hub = tempfile::tempdir().unwrap();
    std::env::set_var("HF_HUB_CACHE", hub.path());
    make_snapshot(
        hub.path(),
        "Qwen/Qwen3-GGUF",
        &["model-Q4_K_M.gguf", "model-Q8_0.gguf", "mmproj-f16.gguf"],
    );

    // Quantization-suffix variant picks the single matching file.
    let by_suffix = descriptor("m", "Qwen/Qwen3-GGUF:Q4_K_M", Recipe::LlamaCpp);
    let resolved = resolve_model_path(&by_suffix).unwrap();
    assert!(resolved.ends_with("model-Q4_K_M.gguf"));

    // Passing the resolved filename back as the variant lands on the same
    // file.
    let by_name = descriptor("m", "Qwen/Qwen3-GGUF:model-Q4_K_M.gguf", Recipe::LlamaCpp);
    assert_eq!(resolve_model_path(&by_name).unwrap(), resolved);

    // Empty variant takes the first non-mmproj file.
    let no_variant = descriptor("m", "Qwen/Qwen3-GGUF", Recipe::LlamaCpp);
    let first = resolve_model_path(&no_variant).unwrap();
    assert!(first.ends_with("model-Q4_K_M.gguf"));

    std::env::remove_var("HF_HUB_CACHE");
}

#[test]
fn whisper_resolution_picks_named_bin() {
    let _guard = ENV_LOCK.lock().unwrap();
    let hub = tempfile::tempdir().unwrap();
    std::env::set_var("HF_HUB_CACHE", hub.path());
    make_snapshot(
        hub.path(),
        "ggerganov/whisper.cpp",
        &["ggml-base.bin", "ggml-small.bin"],
    );

    let named = descriptor(
        "w",
        "ggerganov/whisper.cpp:ggml-small.bin",
        Recipe::WhisperCpp,
    );
    assert!(resolve_model_path(&named).unwrap().ends_with("ggml-small.bin"));

    std::env::remove_var("HF_HUB_CACHE");
}

#[tokio::test]
async fn downloaded_flag_respects_manifest_sidecar() {
    let _guard = ENV_LOCK.lock().unwrap();
    let hub = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    std::env::set_var("HF_HUB_CACHE", hub.path());
    std::env::set_var("LEMONADE_CACHE_DIR", cache.path());

    make_snapshot(hub.path(), "org/tiny-GGUF", &["tiny-Q4_0.gguf"]);

    let catalog = ModelCatalog::from_values(
        json!({
            "tiny": {"checkpoint": "org/tiny-GGUF:Q4_0", "recipe": "llamacpp"}
        }),
        json!({}),
    );

    assert!(catalog.is_downloaded("tiny").await);

    // Drop the sidecar into the snapshot: the model is no longer complete.
    let snapshot = hub.path().join("models--org--tiny-GGUF");
    fs::write(snapshot.join(DOWNLOAD_MANIFEST), b"{}").unwrap();
    catalog.invalidate().await;
    assert!(!catalog.is_downloaded("tiny").await);

    std::env::remove_var("HF_HUB_CACHE");
}
