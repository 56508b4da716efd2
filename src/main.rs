//! stepwise - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the pipeline API.

use stepwise::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepwise=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A missing API key is fatal here, before anything is served.
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, base_url={}",
        config.model, config.base_url
    );

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
