use clap::Parser;
use echo_rpc_server::server::{
    config::{CliArgs, ServerConfig},
    pool::manager::run_service,
    telemetry::init_telemetry,
};
use std::sync::Arc;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = config.max_threads {
        runtime.worker_threads(threads);
    }
    runtime.build()?.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let providers = init_telemetry()?;
    let result = run_service(Arc::new(config)).await;

    match &result {
        Ok(()) => tracing::info!(pid = std::process::id(), "Process exiting"),
        Err(e) => tracing::error!(pid = std::process::id(), "Service failed: {e:#}"),
    }

    providers.shutdown();
    result
}
