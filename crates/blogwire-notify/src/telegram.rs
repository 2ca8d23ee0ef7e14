//! Telegram Bot API access through teloxide.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::RequestError;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use teloxide::types::ParseMode;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("invalid telegram api url {url:?}: {source}")]
    ApiUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{method} failed: {source}")]
    Request {
        method: &'static str,
        #[source]
        source: RequestError,
    },
}

pub(crate) fn request_failed(method: &'static str) -> impl FnOnce(RequestError) -> TelegramError {
    move |source| TelegramError::Request { method, source }
}

/// `TELEGRAM_API_BASE` overrides the Bot API endpoint (local bot API server, tests).
pub fn api_url_from_env() -> Result<Option<Url>, TelegramError> {
    match std::env::var("TELEGRAM_API_BASE") {
        Ok(raw) if !raw.trim().is_empty() => Url::parse(raw.trim())
            .map(Some)
            .map_err(|source| TelegramError::ApiUrl { url: raw, source }),
        _ => Ok(None),
    }
}

pub fn bot_for(token: &str, api_url: Option<&Url>) -> Bot {
    let bot = Bot::new(token);
    match api_url {
        Some(url) => bot.set_api_url(url.clone()),
        None => bot,
    }
}

/// Something that can deliver a chat message.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        bot_token: &str,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), TelegramError>;
}

/// Sends through teloxide. Jobs carry their own token, so one `Bot` (and its
/// connection pool) is kept per token.
pub struct TelegramTransport {
    api_url: Option<Url>,
    bots: Mutex<HashMap<String, Bot>>,
}

impl TelegramTransport {
    pub fn new(api_url: Option<Url>) -> Self {
        Self {
            api_url,
            bots: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Result<Self, TelegramError> {
        Ok(Self::new(api_url_from_env()?))
    }

    fn bot(&self, token: &str) -> Bot {
        let mut bots = self.bots.lock().unwrap_or_else(PoisonError::into_inner);
        bots.entry(token.to_string())
            .or_insert_with(|| bot_for(token, self.api_url.as_ref()))
            .clone()
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        bot_token: &str,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<(), TelegramError> {
        let bot = self.bot(bot_token);
        let mut request = bot.send_message(ChatId(chat_id), text);
        if let Some(mode) = parse_mode {
            request = request.parse_mode(mode);
        }
        let sent = request.await.map_err(request_failed("sendMessage"))?;
        debug!(chat_id, message_id = sent.id.0, "message sent");
        Ok(())
    }
}
