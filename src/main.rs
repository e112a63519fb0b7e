use anyhow::Context;
use dotenv::dotenv;
use peerlink_server::{Server, ServerEvent, Settings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let settings = Settings::new().context("loading configuration")?;
    info!("Configuration loaded successfully ({})", settings.environment);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.server.workers.max(1) as usize)
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(settings))
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let port = settings.server.port;
    let server = Server::new(settings);

    // Stand-in for the host UI: log what it would display.
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Connected(id)) => info!("Peer {} joined", id),
                Ok(ServerEvent::Message(id, msg)) => info!("Peer {} sent '{}'", id, msg.kind),
                Ok(ServerEvent::Disconnected(id)) => info!("Peer {} left", id),
                Ok(ServerEvent::ServerError(message)) => error!("Server error: {}", message),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} server events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let addr = server.start(port).await.context("starting signaling server")?;
    info!("Peers can connect at ws://{}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    server.stop().await;
    Ok(())
}
