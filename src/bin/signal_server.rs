use anyhow::{Context, Result};
use log::info;
use tokio::net::TcpListener;

use airlift::config::ServerConfig;
use airlift::signaling::signaling_router;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = ServerConfig::from_env()?;
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!("signaling server listening on {}", config.bind_addr());

    axum::serve(listener, signaling_router().into_make_service())
        .await
        .context("signaling server exited")?;
    Ok(())
}
