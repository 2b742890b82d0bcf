//! HTTP and child-process plumbing shared by the catalog and the backend
//! adapters.

pub mod http;
pub mod process;

pub use http::{DownloadOptions, DownloadSummary, HttpClient, HttpResponse};
pub use process::{find_free_port, run_with_output, ManagedProcess, SpawnOptions};
