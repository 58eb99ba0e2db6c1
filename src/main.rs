mod api;
mod ui;

use tracing_subscriber::EnvFilter;

use api::ApiClient;
use ui::app::ChatApp;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pronto=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Pronto terminal client starting...");

    let api_client = ApiClient::from_env();
    tracing::info!("Backend API: {}", api_client.base_url());
    if std::env::var("PRONTO_BACKEND_TOKEN")
        .ok()
        .map(|token| token.trim().is_empty())
        .unwrap_or(true)
    {
        tracing::warn!(
            "PRONTO_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }

    let character = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PRONTO_CHARACTER").ok())
        .filter(|name| !name.trim().is_empty());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        let app = ChatApp::start(api_client, character).await?;
        app.run().await
    });

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
