//! Hardware probe and its process-wide cache.
//!
//! The probe result feeds the catalog's availability filter and the
//! orchestrator's preset matching. It is built lazily on first read, cached
//! in memory and in one JSON file under the cache root, and only refreshed
//! through `refresh()`.

use std::fs;
use std::process::Command;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::model::Recipe;
use crate::paths;

/// Detected hardware capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cpu_brand: String,
    pub physical_memory_gb: f64,
    pub npu_available: bool,
    pub os: String,
}

/// Backend flavors a recipe can use on this machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedBackends {
    pub recipe: String,
    pub backends: Vec<String>,
}

static HARDWARE_CACHE: Lazy<RwLock<Option<HardwareInfo>>> = Lazy::new(|| RwLock::new(None));

impl HardwareInfo {
    /// Probe the machine directly, bypassing all caches.
    pub fn probe() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let cpu_brand = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();
        let physical_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

        HardwareInfo {
            npu_available: npu_from_cpu_brand(&cpu_brand),
            cpu_brand,
            physical_memory_gb,
            os: std::env::consts::OS.to_string(),
        }
    }

    /// Cached view: in-memory first, then the JSON cache file, then a fresh
    /// probe (which populates both).
    pub fn get_cached() -> Self {
        if let Some(info) = HARDWARE_CACHE.read().clone() {
            return info;
        }

        let mut guard = HARDWARE_CACHE.write();
        if let Some(info) = guard.clone() {
            return info;
        }

        let info = Self::load_cache_file().unwrap_or_else(|| {
            let probed = Self::probe();
            probed.write_cache_file();
            probed
        });
        *guard = Some(info.clone());
        info
    }

    /// Re-probe and overwrite both caches.
    pub fn refresh() -> Self {
        let info = Self::probe();
        info.write_cache_file();
        *HARDWARE_CACHE.write() = Some(info.clone());
        info
    }

    fn load_cache_file() -> Option<Self> {
        let path = paths::hardware_cache_file();
        let data = fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn write_cache_file(&self) {
        let path = paths::hardware_cache_file();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(data) => {
                if let Err(e) = fs::write(&path, data) {
                    tracing::warn!("could not write hardware cache {}: {}", path.display(), e);
                }
            }
            Err(e) => tracing::warn!("could not serialize hardware info: {}", e),
        }
    }

    /// NPU presence, honoring the `RYZENAI_SKIP_PROCESSOR_CHECK` override.
    pub fn npu_available(&self) -> bool {
        if npu_check_skipped() {
            return true;
        }
        self.npu_available
    }

    /// Which backend flavors of `recipe` this machine supports. Empty means
    /// the recipe is unavailable here.
    pub fn supported_backends(&self, recipe: Recipe) -> SupportedBackends {
        let backends: Vec<String> = match recipe {
            Recipe::LlamaCpp => {
                if self.os == "macos" {
                    vec!["metal".into(), "cpu".into()]
                } else {
                    vec!["vulkan".into(), "cpu".into()]
                }
            }
            Recipe::WhisperCpp | Recipe::SdCpp | Recipe::Kokoro => vec!["cpu".into()],
            Recipe::Flm => {
                if self.npu_available() {
                    vec!["npu".into()]
                } else {
                    vec![]
                }
            }
            Recipe::OgaNpu | Recipe::OgaHybrid => {
                if self.npu_available() {
                    vec!["npu".into(), "hybrid".into()]
                } else {
                    vec![]
                }
            }
            Recipe::OgaCpu => {
                if self.npu_available() {
                    // ryzenai-serve ships with the NPU stack
                    vec!["cpu".into()]
                } else {
                    vec![]
                }
            }
            Recipe::Vllm => {
                if docker_available() {
                    vec!["gpu".into()]
                } else {
                    vec![]
                }
            }
        };
        SupportedBackends {
            recipe: recipe.as_str().to_string(),
            backends,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cpu": self.cpu_brand,
            "physical_memory_gb": self.physical_memory_gb,
            "npu": { "available": self.npu_available() },
            "os": self.os,
        })
    }
}

fn npu_check_skipped() -> bool {
    matches!(
        std::env::var("RYZENAI_SKIP_PROCESSOR_CHECK").ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Ryzen AI NPUs identify through the CPU brand string.
fn npu_from_cpu_brand(brand: &str) -> bool {
    let lower = brand.to_lowercase();
    lower.contains("ryzen ai") || lower.contains("ryzen™ ai")
}

fn docker_available() -> bool {
    Command::new("docker")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_npu_from_cpu_brand() {
        assert!(npu_from_cpu_brand("AMD Ryzen AI 9 HX 370"));
        assert!(!npu_from_cpu_brand("Intel(R) Core(TM) i7-9750H"));
        assert!(!npu_from_cpu_brand(""));
    }

    #[test]
    fn test_supported_backends_without_npu() {
        let info = HardwareInfo {
            cpu_brand: "Intel i7".into(),
            physical_memory_gb: 32.0,
            npu_available: false,
            os: "linux".into(),
        };
        // The env override can flip this in a developer shell; only assert
        // when it is not set.
        if std::env::var("RYZENAI_SKIP_PROCESSOR_CHECK").is_err() {
            assert!(info.supported_backends(Recipe::Flm).backends.is_empty());
            assert!(info.supported_backends(Recipe::OgaNpu).backends.is_empty());
        }
        assert_eq!(
            info.supported_backends(Recipe::LlamaCpp).backends,
            vec!["vulkan".to_string(), "cpu".to_string()]
        );
    }
}
