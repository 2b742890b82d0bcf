//! Load controller and streaming proxy.

pub mod proxy;
pub mod router;

pub use proxy::{forward_streaming_request, StreamMode};
pub use router::{BackendFactory, LoadedEntry, PoolLimits, Router, RouterConfig};
