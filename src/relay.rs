use crate::{
    completion::{Completion, CompletionError},
    config::Config,
    store::{NewMessage, StoreError, TranscriptStore},
    transport::{InboundMessage, ParseMode, Transport},
    window::{WindowParams, build_prompt},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failures that end the current cycle. The sender is told; the loop goes on.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to get conversation history: {0}")]
    ReadHistory(StoreError),
    #[error("failed to save incoming message: {0}")]
    SaveIncoming(StoreError),
    #[error("failed to get response from the model: {0}")]
    Completion(#[from] CompletionError),
    #[error("failed to save outgoing message: {0}")]
    SaveReply(StoreError),
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub owner_id: u64,
    pub max_messages_in_history: u64,
    pub max_tokens_to_generate: u64,
    pub context_length_max: u64,
    pub debug_log_prompts: bool,
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            owner_id: config.owner_id,
            max_messages_in_history: config.max_messages_in_history,
            max_tokens_to_generate: config.max_tokens_to_generate,
            context_length_max: config.context_length_max,
            debug_log_prompts: config.debug_log_prompts,
        }
    }
}

/// The single consumer of inbound messages. One message is processed at a
/// time, start to finish, so the transcript is never read and written by two
/// cycles at once.
pub struct Relay {
    settings: RelaySettings,
    store: Arc<dyn TranscriptStore>,
    completion: Arc<dyn Completion>,
    transport: Arc<dyn Transport>,
}

impl Relay {
    pub fn new(
        settings: RelaySettings,
        store: Arc<dyn TranscriptStore>,
        completion: Arc<dyn Completion>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            store,
            completion,
            transport,
        }
    }

    /// Processes inbound messages until `shutdown` is cancelled or the queue
    /// closes. Cancellation is only observed between cycles; a cycle already
    /// in progress always runs to completion. Returning is the completion
    /// signal for the supervisor.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>, shutdown: CancellationToken) {
        info!("Processing loop started");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!("Inbound queue closed");
                        break;
                    }
                },
            };

            self.handle(message).await;
        }

        inbound.close();
        info!("Processing loop terminated");
    }

    async fn handle(&self, message: InboundMessage) {
        let Some(text) = message.text.as_deref() else {
            return;
        };

        // Unknown senders get no reply at all, not even an error.
        if message.sender_id != self.settings.owner_id {
            warn!("Rejecting message from unknown user {}", message.sender_id);
            return;
        }

        info!("Received new message with {} bytes", text.len());

        match self.process(&message, text).await {
            Ok(reply) => {
                self.deliver(message.chat_id, &reply, ParseMode::Markdown)
                    .await
            }
            Err(e) => {
                error!("{}", e);
                // Error text may carry paths and identifiers; keep it literal.
                let notice = format!("Failed to process your request. ERROR: {}", e);
                self.deliver(message.chat_id, &notice, ParseMode::Plain)
                    .await;
            }
        }
    }

    async fn process(&self, message: &InboundMessage, text: &str) -> Result<String, CycleError> {
        match self.store.prune(self.settings.max_messages_in_history).await {
            Ok(0) => {}
            Ok(deleted) => info!("Deleted {} old message(s) from history", deleted),
            Err(e) => warn!("Failed to delete old messages from the database: {}", e),
        }

        let history = self
            .store
            .read_all()
            .await
            .map_err(CycleError::ReadHistory)?;

        let saved = self
            .store
            .append(NewMessage::human(
                message.sender_id,
                &message.sender_name,
                text,
            ))
            .await
            .map_err(CycleError::SaveIncoming)?;
        debug!("Stored message from {} as row {}", saved.username, saved.id);

        let params = WindowParams::new(
            self.settings.context_length_max,
            self.settings.max_tokens_to_generate,
        );
        let prompt = build_prompt(&history, text, &params);
        debug!(
            "Built prompt from {} history rows: {} turns kept, {} trimmed",
            history.len(),
            prompt.turns,
            prompt.trimmed
        );
        if self.settings.debug_log_prompts {
            info!("==== PROMPT: {}", prompt.text);
        }

        let reply = self
            .completion
            .complete(&prompt.text, self.settings.max_tokens_to_generate)
            .await?;

        self.store
            .append(NewMessage::assistant(&reply))
            .await
            .map_err(CycleError::SaveReply)?;

        Ok(reply)
    }

    /// Send failures are only logged: the send itself is the only channel back
    /// to the user.
    async fn deliver(&self, chat_id: u64, text: &str, mode: ParseMode) {
        match self.transport.send(chat_id, text, mode).await {
            Ok(()) => info!("Sent a message with {} bytes", text.len()),
            Err(e) => error!("Failed to send a message: {}", e),
        }
    }
}
