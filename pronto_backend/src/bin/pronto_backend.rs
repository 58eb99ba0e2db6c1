use anyhow::{Context, Result};
use flume::unbounded;
use pronto_backend::config::ChatConfig;
use pronto_backend::runtime::BackendRuntime;
use pronto_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pronto_backend=debug")),
        )
        .init();

    let config = ChatConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting chat backend (set PRONTO_BACKEND_TOKEN + optional PRONTO_BACKEND_BIND; auth mode via PRONTO_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
