use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Gateway is not connected yet")]
    NotReady,
    #[error("Failed to send message: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Markdown,
    Plain,
}

/// A message addressed to the relay, as delivered by the chat gateway.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender_id: u64,
    pub sender_name: String,
    pub chat_id: u64,
    pub text: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers `text` to `chat_id`. Never retries.
    async fn send(&self, chat_id: u64, text: &str, mode: ParseMode) -> Result<(), TransportError>;
}
