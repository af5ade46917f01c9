use crate::transport::{InboundMessage, ParseMode, Transport, TransportError};
use anyhow::Result;
use async_trait::async_trait;
use serenity::{
    all::{ChannelId, Http},
    prelude::*,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod handler;
mod util;

use handler::Handler;
use util::*;

pub const DISCORD_MAX_LEN: usize = 2000;

/// Outbound half of the Discord gateway. Usable once the gateway reports ready.
#[derive(Default)]
pub struct DiscordTransport {
    http: RwLock<Option<Arc<Http>>>,
}

impl DiscordTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn set_http(&self, http: Arc<Http>) {
        *self.http.write().await = Some(http);
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn send(&self, chat_id: u64, text: &str, mode: ParseMode) -> Result<(), TransportError> {
        let http = self
            .http
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotReady)?;
        let channel = ChannelId::new(chat_id);

        let body = match mode {
            ParseMode::Markdown => text.to_string(),
            ParseMode::Plain => escape_markdown(text),
        };

        for chunk in split_message(&body, DISCORD_MAX_LEN) {
            channel
                .say(&http, &chunk)
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
        }

        Ok(())
    }
}

pub struct Bot {
    token: String,
    transport: Arc<DiscordTransport>,
}

impl Bot {
    pub fn new(token: &str, transport: Arc<DiscordTransport>) -> Self {
        Self {
            token: token.to_string(),
            transport,
        }
    }

    /// Runs the gateway, forwarding inbound messages into `inbound` in arrival
    /// order, until the client fails or `shutdown` is cancelled. Dropping the
    /// client on return closes the gateway; the forwarder stops on cancellation
    /// and drops its end of the queue.
    pub async fn start(
        self,
        inbound: mpsc::Sender<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let handler = Handler {
            transport: self.transport,
            inbound,
            forwarding: Arc::default(),
            shutdown: shutdown.clone(),
        };

        let mut client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await?;

        tokio::select! {
            result = client.start() => result?,
            _ = shutdown.cancelled() => info!("Stopping Discord gateway"),
        }

        Ok(())
    }
}
