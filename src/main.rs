mod completion;
mod config;
mod discord;
mod entity;
mod relay;
mod store;
mod transport;
mod window;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const INBOUND_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Initializing");

    let config = config::Config::load()?;

    let store = store::SqliteTranscript::open(&config.database_path())
        .await
        .context("Failed to initialize transcript store")?;
    let completion =
        completion::create_completion(&config).context("Failed to initialize completion client")?;
    let transport = discord::DiscordTransport::new();

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

    let bot = discord::Bot::new(&config.discord_token, transport.clone());
    let gateway = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match bot.start(inbound_tx, shutdown.clone()).await {
                Ok(()) => info!("Discord gateway stopped"),
                Err(e) => error!("Discord bot error: {}", e),
            }
            shutdown.cancel();
        }
    });

    let relay = relay::Relay::new(
        relay::RelaySettings::from(&config),
        Arc::new(store),
        Arc::new(completion),
        transport,
    );
    let worker = tokio::spawn(relay.run(inbound_rx, shutdown.clone()));

    info!("Started");

    if let Err(e) = worker.await {
        error!("Processing loop panicked: {}", e);
    }
    shutdown.cancel();
    if let Err(e) = gateway.await {
        error!("Discord gateway task failed: {}", e);
    }

    info!("Terminated");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received interrupt signal, terminating"),
        _ = terminate => info!("Received terminate signal, terminating"),
    }

    shutdown.cancel();
}
