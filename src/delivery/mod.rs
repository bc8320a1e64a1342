pub mod queue;
pub mod telegram;

use async_trait::async_trait;

/// A formatted message ready for the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMessage {
    Text { body: String },
    TextWithImage { body: String, image_url: String },
}

impl DeliveryMessage {
    pub fn body(&self) -> &str {
        match self {
            DeliveryMessage::Text { body } => body,
            DeliveryMessage::TextWithImage { body, .. } => body,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            DeliveryMessage::Text { .. } => None,
            DeliveryMessage::TextWithImage { image_url, .. } => Some(image_url),
        }
    }
}

/// Markup dialect understood by the chat transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// HTML subset; only `<b>` is ever emitted.
    #[default]
    Html,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("chat transport request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat API rejected the request ({status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Outbound chat capability.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_text(&self, chat_id: &str, body: &str, mode: ParseMode) -> Result<(), SendError>;

    async fn send_photo(
        &self,
        chat_id: &str,
        image_url: &str,
        caption: &str,
        mode: ParseMode,
    ) -> Result<(), SendError>;
}

/// Route one message to the matching capability.
pub async fn deliver(
    sender: &dyn ChatSender,
    chat_id: &str,
    message: &DeliveryMessage,
) -> Result<(), SendError> {
    match message {
        DeliveryMessage::Text { body } => sender.send_text(chat_id, body, ParseMode::Html).await,
        DeliveryMessage::TextWithImage { body, image_url } => {
            sender
                .send_photo(chat_id, image_url, body, ParseMode::Html)
                .await
        }
    }
}
