use super::{ChatSender, ParseMode, SendError};
use crate::parser::preview;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram Bot API client for the two send capabilities.
pub struct TelegramClient {
    api_base: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct SendPhotoRequest<'a> {
    chat_id: &'a str,
    photo: &'a str,
    caption: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("feedrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<B: Serialize + ?Sized, T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<Option<T>, SendError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.without_url()))?;

        let status = response.status();
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| SendError::Transport(e.without_url()))?;

        if !status.is_success() || !parsed.ok {
            return Err(SendError::Rejected {
                status: status.as_u16(),
                description: parsed
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            });
        }
        Ok(parsed.result)
    }

    /// `getMe`: confirms the token is valid before the stream is opened.
    pub async fn verify(&self) -> Result<BotUser, SendError> {
        let empty = serde_json::Map::new();
        self.call::<_, BotUser>("getMe", &empty)
            .await?
            .ok_or_else(|| SendError::Rejected {
                status: 200,
                description: "getMe returned no bot".to_string(),
            })
    }
}

#[async_trait]
impl ChatSender for TelegramClient {
    async fn send_text(&self, chat_id: &str, body: &str, mode: ParseMode) -> Result<(), SendError> {
        let request = SendMessageRequest {
            chat_id,
            text: body,
            parse_mode: mode.as_str(),
            disable_web_page_preview: false,
        };
        self.call::<_, serde_json::Value>("sendMessage", &request)
            .await?;
        tracing::debug!(preview = %preview(body, 100), "sendMessage ok");
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        image_url: &str,
        caption: &str,
        mode: ParseMode,
    ) -> Result<(), SendError> {
        let request = SendPhotoRequest {
            chat_id,
            photo: image_url,
            caption,
            parse_mode: mode.as_str(),
        };
        self.call::<_, serde_json::Value>("sendPhoto", &request)
            .await?;
        tracing::debug!(image_url, preview = %preview(caption, 100), "sendPhoto ok");
        Ok(())
    }
}
