//! Canonical filesystem locations.
//!
//! Every path the gateway reads or writes is resolved through this module so
//! the precedence rules live in exactly one place. Pure lookup, no side
//! effects.

use std::env;
use std::path::{Path, PathBuf};

/// Cache root: `LEMONADE_CACHE_DIR` overrides, default `~/.cache/lemonade`.
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = env::var("LEMONADE_CACHE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    home_dir().join(".cache").join("lemonade")
}

/// Hugging Face hub cache.
///
/// Precedence: `HF_HUB_CACHE`, then `HF_HOME` with `/hub` appended, then
/// `~/.cache/huggingface/hub`.
pub fn hf_cache_dir() -> PathBuf {
    hf_cache_from(
        env::var("HF_HUB_CACHE").ok().filter(|v| !v.is_empty()),
        env::var("HF_HOME").ok().filter(|v| !v.is_empty()),
    )
}

fn hf_cache_from(hub_cache: Option<String>, hf_home: Option<String>) -> PathBuf {
    if let Some(hub) = hub_cache {
        return PathBuf::from(hub);
    }
    if let Some(home) = hf_home {
        return PathBuf::from(home).join("hub");
    }
    home_dir().join(".cache").join("huggingface").join("hub")
}

/// Where downloaded backend executables live: `{cache}/bin/{backend}/{version}`.
pub fn downloaded_bin_dir() -> PathBuf {
    cache_dir().join("bin")
}

/// User model registry file.
pub fn user_models_file() -> PathBuf {
    cache_dir().join("user_models.json")
}

/// Hardware probe cache file.
pub fn hardware_cache_file() -> PathBuf {
    cache_dir().join("hardware_info.json")
}

/// Directory containing the running executable.
pub fn executable_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Locate a resource file relative to the executable directory.
///
/// System installs put the binary in `/usr/local/bin` and resources under
/// `/usr/local/share/lemonade-server`; that layout is checked before giving
/// up and returning the exe-relative path.
pub fn resource_path(relative: &str) -> PathBuf {
    let exe_dir = executable_dir();
    let local = exe_dir.join(relative);
    if local.exists() {
        return local;
    }

    for share in ["/usr/local/share/lemonade-server", "/usr/share/lemonade-server"] {
        let candidate = Path::new(share).join(relative);
        if candidate.exists() {
            return candidate;
        }
    }

    // Development layout: resources/ at the workspace root.
    if let Ok(cwd) = env::current_dir() {
        let candidate = cwd.join(relative);
        if candidate.exists() {
            return candidate;
        }
    }

    local
}

/// Snapshot directory name for a hub repo: `models--org--name`.
pub fn snapshot_dir_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

/// Find the FLM executable: `PATH` first, then the default install location.
pub fn find_flm_executable() -> Option<PathBuf> {
    let exe = if cfg!(windows) { "flm.exe" } else { "flm" };

    if let Ok(path_var) = env::var("PATH") {
        for dir in env::split_paths(&path_var) {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    // Fall back to the managed install location, which nests the executable
    // under a pinned-version directory.
    let flm_root = downloaded_bin_dir().join("flm");
    let direct = flm_root.join(exe);
    if direct.is_file() {
        return Some(direct);
    }
    if let Ok(entries) = std::fs::read_dir(&flm_root) {
        for entry in entries.flatten() {
            let candidate = entry.path().join(exe);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hf_cache_precedence() {
        let hub = hf_cache_from(Some("/custom/hub".into()), Some("/custom/hf".into()));
        assert_eq!(hub, PathBuf::from("/custom/hub"));

        let home = hf_cache_from(None, Some("/custom/hf".into()));
        assert_eq!(home, PathBuf::from("/custom/hf/hub"));

        let default = hf_cache_from(None, None);
        assert!(default.ends_with(".cache/huggingface/hub"));
    }

    #[test]
    fn test_snapshot_dir_name() {
        assert_eq!(
            snapshot_dir_name("Qwen/Qwen3-0.6B-GGUF"),
            "models--Qwen--Qwen3-0.6B-GGUF"
        );
        assert_eq!(snapshot_dir_name("no-org"), "models--no-org");
    }
}
