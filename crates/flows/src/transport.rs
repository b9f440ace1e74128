//! Outbound side effects the engine asks a chat transport to perform.

use async_trait::async_trait;

use parley_common::{ChatId, MessageRef};

/// Inline button as it goes over the wire: the payload has been replaced by
/// a callback token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub token: String,
}

/// A fully rendered prompt ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub image: Option<String>,
    pub keyboard: Vec<Vec<InlineButton>>,
}

impl OutboundMessage {
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            image: None,
            keyboard: Vec::new(),
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.keyboard
            .iter()
            .flatten()
            .map(|button| button.token.as_str())
    }
}

/// Chat transport used by the engine. Every call is fire-and-forget from the
/// engine's point of view: failures are logged, never retried, and never
/// roll back a transition.
#[async_trait]
pub trait FlowTransport: Send + Sync {
    /// Deliver a message. Returns the delivered message's location when the
    /// transport knows it.
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<Option<MessageRef>>;

    /// Dismiss the platform's pending indicator for a button press, optionally
    /// with a short notice.
    async fn acknowledge(&self, callback_id: &str, notice: Option<&str>) -> anyhow::Result<()>;

    /// Delete a previously delivered message.
    async fn delete_message(&self, message: MessageRef) -> anyhow::Result<()>;

    /// Remove the inline keyboard from a previously delivered message.
    async fn clear_keyboard(&self, message: MessageRef) -> anyhow::Result<()>;
}
