//! `lemonade-server`: the local inference gateway.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lemonade_api::ServerState;
use lemonade_catalog::ModelCatalog;
use lemonade_router::{PoolLimits, Router, RouterConfig};

#[derive(Debug, Parser)]
#[command(name = "lemonade-server", about = "Local OpenAI-compatible inference gateway")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Default context size handed to backends.
    #[arg(long, default_value_t = 4096)]
    ctx_size: u32,

    /// llama.cpp build flavor (vulkan, metal, cpu).
    #[arg(long, default_value_t = default_llamacpp_flavor())]
    llamacpp: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum loaded LLMs before LRU eviction kicks in.
    #[arg(long, default_value_t = 1)]
    max_loaded_llms: usize,

    /// Keep generated image files on disk instead of deleting them after
    /// the response.
    #[arg(long, default_value_t = false)]
    keep_image_files: bool,
}

fn default_llamacpp_flavor() -> String {
    if cfg!(target_os = "macos") {
        "metal".to_string()
    } else {
        "vulkan".to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog = Arc::new(ModelCatalog::load().context("failed to load the model catalog")?);

    let router = Arc::new(Router::new(
        catalog.clone(),
        RouterConfig {
            ctx_size: args.ctx_size,
            llamacpp_flavor: args.llamacpp.clone(),
            pool_limits: PoolLimits {
                llm: args.max_loaded_llms,
                ..Default::default()
            },
            keep_image_files: args.keep_image_files,
        },
    ));

    let state = ServerState::new(catalog, router);
    state.orchestrator.resolve_platform_preset().await;

    lemonade_api::serve(state, &args.host, args.port)
        .await
        .context("server exited with an error")?;
    Ok(())
}
