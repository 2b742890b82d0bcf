//! Backend executable installation.
//!
//! Backend binaries are downloaded on demand into
//! `{cache}/bin/{backend}/{version}/`, pinned to the version named in
//! `resources/backend_versions.json`. A `LEMONADE_*_BIN` environment
//! variable short-circuits the whole mechanism and points at a
//! developer-local build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use lemonade_client::{DownloadOptions, HttpClient};
use lemonade_core::{paths, Error, Result};

/// Pinned version for `backend`, falling back to `default` when the
/// manifest is missing or silent.
pub fn pinned_version(backend: &str, default: &str) -> String {
    let path = paths::resource_path("resources/backend_versions.json");
    match std::fs::read_to_string(&path) {
        Ok(data) => serde_json::from_str::<Value>(&data)
            .ok()
            .and_then(|v| v.get(backend).and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| default.to_string()),
        Err(e) => {
            tracing::warn!(
                "could not load backend_versions.json ({e}); using default {backend} version {default}"
            );
            default.to_string()
        }
    }
}

/// Developer override: `LEMONADE_<NAME>_BIN` pointing at a local binary.
pub fn env_override(var: &str) -> Option<PathBuf> {
    let value = std::env::var(var).ok()?;
    let path = PathBuf::from(value);
    if path.is_file() {
        Some(path)
    } else {
        tracing::warn!("{var} is set but does not point at a file; ignoring");
        None
    }
}

/// Install directory for one backend version.
pub fn install_dir(backend: &str, version: &str) -> PathBuf {
    paths::downloaded_bin_dir().join(backend).join(version)
}

/// Ensure `exe_relative` exists under the backend's install dir, downloading
/// and extracting `archive_url` if it does not.
pub async fn ensure_archive_installed(
    client: &HttpClient,
    backend: &str,
    version: &str,
    archive_url: &str,
    exe_relative: &str,
) -> Result<PathBuf> {
    let dir = install_dir(backend, version);
    let exe = dir.join(exe_relative);
    if exe.is_file() {
        return Ok(exe);
    }

    tracing::info!("installing {backend} {version} from {archive_url}");
    std::fs::create_dir_all(&dir)?;

    let archive_name = archive_url
        .rsplit('/')
        .next()
        .unwrap_or("backend-archive.zip");
    let archive_path = dir.join(archive_name);

    client
        .download_file(
            archive_url,
            &archive_path,
            None,
            &HashMap::new(),
            &DownloadOptions::default(),
        )
        .await?;

    extract_archive(&archive_path, &dir).await?;
    let _ = std::fs::remove_file(&archive_path);

    if exe.is_file() {
        tracing::info!("{backend} installed at {}", exe.display());
        Ok(exe)
    } else {
        Err(Error::config(format!(
            "{backend} archive did not contain expected executable {exe_relative}"
        )))
    }
}

/// Extract a release archive by shelling out to the platform's tools.
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive.to_string_lossy().to_lowercase();
    let (program, args): (&str, Vec<String>) = if name.ends_with(".tar.gz") || name.ends_with(".tgz")
    {
        (
            "tar",
            vec![
                "-xzf".into(),
                archive.display().to_string(),
                "-C".into(),
                dest.display().to_string(),
            ],
        )
    } else if cfg!(windows) {
        // tar handles zip archives on Windows 10 1903+.
        (
            "tar",
            vec![
                "-xf".into(),
                archive.display().to_string(),
                "-C".into(),
                dest.display().to_string(),
            ],
        )
    } else {
        (
            "unzip",
            vec![
                "-o".into(),
                archive.display().to_string(),
                "-d".into(),
                dest.display().to_string(),
            ],
        )
    };

    let exit = lemonade_client::run_with_output(program, &args, |_| true).await?;
    if exit != 0 {
        return Err(Error::process(format!(
            "extraction of {} failed with exit code {exit}",
            archive.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_version_falls_back() {
        // No resources/ directory in the unit-test working dir.
        let version = pinned_version("definitely-not-a-backend", "v1.2.3");
        assert_eq!(version, "v1.2.3");
    }

    #[test]
    fn test_install_dir_shape() {
        let dir = install_dir("llamacpp", "b4821");
        assert!(dir.ends_with("bin/llamacpp/b4821"));
    }
}
