//! Model catalog: registry merge, availability filtering, path resolution,
//! and artifact acquisition.

pub mod catalog;
pub mod download;
pub mod gguf;

pub use catalog::{
    artifacts_complete, find_snapshot_ancestor, flm_installed_models, resolve_model_path,
    ModelCatalog, UserModelRegistration, DOWNLOAD_MANIFEST,
};
pub use download::{download_model, DownloadProgress, ProgressFn, PullRequest};
pub use gguf::{select_gguf_files, GgufSelection};
