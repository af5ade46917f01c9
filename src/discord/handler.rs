use super::DiscordTransport;
use crate::transport::InboundMessage;
use futures_util::{Stream, StreamExt};
use serenity::{
    async_trait,
    collector::MessageCollector,
    model::{channel::Message, gateway::Ready, id::UserId},
    prelude::*,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) struct Handler {
    pub transport: Arc<DiscordTransport>,
    pub inbound: mpsc::Sender<InboundMessage>,
    pub forwarding: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Bot connected as {}", ready.user.name);
        self.transport.set_http(ctx.http.clone()).await;

        // Ready fires again on reconnect; the shard keeps its collector.
        if self.forwarding.swap(true, Ordering::SeqCst) {
            return;
        }

        // Message events are dispatched to separate tasks with no ordering
        // between them. The collector stream is fed by the shard in gateway order.
        let messages = MessageCollector::new(ctx.shard.clone()).stream();
        let forwarder = Forwarder {
            bot_id: ready.user.id,
            inbound: self.inbound.clone(),
            shutdown: self.shutdown.clone(),
        };
        let forwarding = self.forwarding.clone();
        tokio::spawn(async move {
            forwarder.run(messages).await;
            forwarding.store(false, Ordering::SeqCst);
        });
    }
}

/// Forwards messages addressed to the bot into the inbound queue, one at a
/// time and in arrival order. Performs no authorization; that belongs to the
/// processing loop.
struct Forwarder {
    bot_id: UserId,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
}

impl Forwarder {
    async fn run(self, messages: impl Stream<Item = Message>) {
        let mut messages = std::pin::pin!(messages);

        loop {
            let msg = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                msg = messages.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let Some(inbound) = self.inbound_from(&msg) else {
                continue;
            };

            tokio::select! {
                result = self.inbound.send(inbound) => {
                    if let Err(e) = result {
                        warn!("Inbound queue closed, dropping message: {}", e);
                        break;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!("Shutting down, dropping message from {}", msg.author.id);
                    break;
                }
            }
        }

        debug!("Stopped forwarding Discord messages");
    }

    fn inbound_from(&self, msg: &Message) -> Option<InboundMessage> {
        if msg.author.bot || !is_addressed_to(msg, self.bot_id) {
            return None;
        }

        let content = extract_content(msg, self.bot_id);
        Some(InboundMessage {
            sender_id: msg.author.id.get(),
            sender_name: msg.author.name.to_string(),
            chat_id: msg.channel_id.get(),
            text: (!content.is_empty()).then_some(content),
        })
    }
}

fn extract_content(msg: &Message, bot_id: UserId) -> String {
    msg.content
        .replace(&format!("<@{}>", bot_id), "")
        .replace(&format!("<@!{}>", bot_id), "")
        .trim()
        .to_string()
}

fn is_addressed_to(msg: &Message, bot_id: UserId) -> bool {
    msg.guild_id.is_none() || msg.mentions.iter().any(|u| u.id == bot_id)
}
