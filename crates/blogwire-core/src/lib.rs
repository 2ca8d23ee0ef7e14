//! Core domain model and provenance types for blogwire.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "blogwire-core";

/// Base prepended to bare story paths scraped from Hacker News.
pub const HN_BASE_URL: &str = "https://news.ycombinator.com/";

pub const NO_ARTICLES_MESSAGE: &str = "There are no published articles yet.";

/// Which path created an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArticleSource {
    Manual,
    Scraped,
}

impl ArticleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "Manual",
            Self::Scraped => "Scraped",
        }
    }
}

impl fmt::Display for ArticleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown article source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for ArticleSource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Manual" => Ok(Self::Manual),
            "Scraped" => Ok(Self::Scraped),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Provenance-specific payload. Exactly one title is authoritative per article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source")]
pub enum Provenance {
    Manual {
        title: String,
        content: String,
        author_id: i64,
    },
    Scraped {
        title: String,
        url: String,
    },
}

impl Provenance {
    pub fn source(&self) -> ArticleSource {
        match self {
            Self::Manual { .. } => ArticleSource::Manual,
            Self::Scraped { .. } => ArticleSource::Scraped,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Manual { title, .. } | Self::Scraped { title, .. } => title,
        }
    }
}

/// A persisted article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    #[serde(flatten)]
    pub provenance: Provenance,
    pub picture: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Article {
    pub fn source(&self) -> ArticleSource {
        self.provenance.source()
    }

    pub fn display_title(&self) -> &str {
        self.provenance.title()
    }

    pub fn author_id(&self) -> Option<i64> {
        match &self.provenance {
            Provenance::Manual { author_id, .. } => Some(*author_id),
            Provenance::Scraped { .. } => None,
        }
    }

    pub fn scraped_url(&self) -> Option<&str> {
        match &self.provenance {
            Provenance::Scraped { url, .. } => Some(url),
            Provenance::Manual { .. } => None,
        }
    }
}

/// Insert payload handed to the article store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub provenance: Provenance,
    pub picture: Option<String>,
}

impl NewArticle {
    pub fn manual(author_id: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            provenance: Provenance::Manual {
                title: title.into(),
                content: content.into(),
                author_id,
            },
            picture: None,
        }
    }

    pub fn scraped(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            provenance: Provenance::Scraped {
                title: title.into(),
                url: url.into(),
            },
            picture: None,
        }
    }

    /// Pre-insert phase of the persistence hook.
    pub fn normalize(&mut self) {
        if let Provenance::Scraped { url, .. } = &mut self.provenance {
            *url = normalize_scraped_url(url);
        }
    }
}

pub fn has_protocol_prefix(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Prefix bare scraped paths (e.g. `item?id=1`) with [`HN_BASE_URL`].
///
/// Absolute URLs and the empty string come back unchanged.
pub fn normalize_scraped_url(url: &str) -> String {
    if url.is_empty() || has_protocol_prefix(url) {
        return url.to_string();
    }
    format!("{HN_BASE_URL}{}", url.trim_start_matches('/'))
}

/// Credentials and destination for chat announcements.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: i64,
}

impl TelegramSettings {
    pub fn new(bot_token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id,
        }
    }

    pub fn from_env() -> Self {
        Self {
            bot_token: std::env::var("BOT_TOKEN").unwrap_or_default(),
            chat_id: std::env::var("TELEGRAM_CHAT_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Queued "announce this article" unit of work.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub article_id: i64,
    pub title: String,
    pub bot_token: String,
    pub chat_id: i64,
}

impl NotificationJob {
    pub fn for_article(article: &Article, telegram: &TelegramSettings) -> Self {
        Self {
            article_id: article.id,
            title: article.display_title().to_string(),
            bot_token: telegram.bot_token.clone(),
            chat_id: telegram.chat_id,
        }
    }
}

impl fmt::Debug for NotificationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationJob")
            .field("article_id", &self.article_id)
            .field("title", &self.title)
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

pub fn notification_text(article_id: i64, title: &str) -> String {
    format!("New article published:\n\n#{article_id}. {title}")
}

/// Reconcile the newest article of each provenance stream.
///
/// Manual wins only with a strictly greater id; equal ids fall to Scraped.
pub fn pick_latest(manual: Option<Article>, scraped: Option<Article>) -> Option<Article> {
    match (manual, scraped) {
        (Some(manual), Some(scraped)) => {
            if manual.id > scraped.id {
                Some(manual)
            } else {
                Some(scraped)
            }
        }
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}

pub fn latest_article_reply(latest: Option<&Article>) -> String {
    match latest {
        Some(article) => format!(
            "The latest published article: \n#{}. {}",
            article.id,
            article.display_title()
        ),
        None => NO_ARTICLES_MESSAGE.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
