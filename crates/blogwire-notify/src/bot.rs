//! Bot commands and the teloxide dispatcher that serves them.

use blogwire_core::{latest_article_reply, pick_latest, Article, ArticleSource, TelegramSettings};
use blogwire_storage::{ArticleStore, StoreError};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::payloads::{DeleteWebhookSetters, SendMessageSetters, SetMyCommandsSetters};
use teloxide::prelude::*;
use teloxide::types::{BotCommandScope, Me};
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::telegram::{bot_for, request_failed, ParseMode, TelegramError};

pub const STARTUP_MESSAGE: &str = "Bot is starting...";

#[derive(BotCommands, Clone, Copy, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    #[command(description = "Welcome message.")]
    Start,
    #[command(description = "Show available commands.")]
    Help,
    #[command(description = "Get the latest article from the blog.")]
    Latest,
}

/// Reads the command from the first word only, so `/help me please` and
/// `/latest@this_bot` both match. Mentions of other bots do not.
pub fn parse_command(text: &str, bot_username: &str) -> Option<Command> {
    let first = text.split_whitespace().next()?;
    Command::parse(first, bot_username).ok()
}

pub fn start_text(sender_name: Option<&str>) -> String {
    let name = sender_name
        .map(html::escape)
        .unwrap_or_else(|| "there".to_string());
    format!("Hello, <b>{name}!</b> Welcome to <b><i>The Blog Articles.</i></b>")
}

pub fn help_text() -> String {
    "/start - Welcome message.\n/latest - Get the latest article from the blog.".to_string()
}

/// Read side of `/latest`: newest article across both provenance streams.
#[derive(Clone)]
pub struct LatestArticleQuery {
    store: ArticleStore,
}

impl LatestArticleQuery {
    pub fn new(store: ArticleStore) -> Self {
        Self { store }
    }

    pub async fn latest(&self) -> Result<Option<Article>, StoreError> {
        let manual = self.store.latest(ArticleSource::Manual).await?;
        let scraped = self.store.latest(ArticleSource::Scraped).await?;
        Ok(pick_latest(manual, scraped))
    }

    pub async fn reply(&self) -> Result<String, StoreError> {
        let latest = self.latest().await?;
        Ok(latest_article_reply(latest.as_ref()))
    }
}

/// Builds HTML replies for parsed commands.
#[derive(Clone)]
pub struct CommandHandler {
    latest: LatestArticleQuery,
}

impl CommandHandler {
    pub fn new(store: ArticleStore) -> Self {
        Self {
            latest: LatestArticleQuery::new(store),
        }
    }

    pub async fn reply(
        &self,
        command: Command,
        sender_name: Option<&str>,
    ) -> Result<String, StoreError> {
        match command {
            Command::Start => Ok(start_text(sender_name)),
            Command::Help => Ok(help_text()),
            Command::Latest => {
                let reply = self.latest.reply().await?;
                Ok(html::escape(&reply))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error("BOT_TOKEN is not set")]
    MissingToken,
    #[error(transparent)]
    Telegram(#[from] TelegramError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn answer(bot: Bot, msg: Message, command: Command, handler: CommandHandler) -> HandlerResult {
    debug!(chat_id = msg.chat.id.0, ?command, "handling command");
    let sender = msg.from.as_ref().map(|user| user.full_name());
    let reply = handler.reply(command, sender.as_deref()).await?;
    bot.send_message(msg.chat.id, reply)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// Long-polling bot: announces startup, drops any webhook with its pending
/// updates, registers the command menu, then dispatches until Ctrl-C.
pub struct BotRunner {
    bot: Bot,
    settings: TelegramSettings,
    handler: CommandHandler,
}

impl BotRunner {
    pub fn new(
        settings: TelegramSettings,
        handler: CommandHandler,
        api_url: Option<Url>,
    ) -> Result<Self, BotError> {
        if settings.bot_token.is_empty() {
            return Err(BotError::MissingToken);
        }
        Ok(Self {
            bot: bot_for(&settings.bot_token, api_url.as_ref()),
            settings,
            handler,
        })
    }

    pub async fn prepare(&self) -> Result<(), BotError> {
        if self.settings.chat_id != 0 {
            self.bot
                .send_message(ChatId(self.settings.chat_id), STARTUP_MESSAGE)
                .parse_mode(ParseMode::Html)
                .await
                .map_err(request_failed("sendMessage"))?;
        }
        self.bot
            .delete_webhook()
            .drop_pending_updates(true)
            .await
            .map_err(request_failed("deleteWebhook"))?;
        self.bot
            .set_my_commands(Command::bot_commands())
            .scope(BotCommandScope::AllPrivateChats)
            .await
            .map_err(request_failed("setMyCommands"))?;
        info!("bot ready");
        Ok(())
    }

    pub async fn run(self) -> Result<(), BotError> {
        self.prepare().await?;

        let tree = Update::filter_message()
            .filter_map(|msg: Message, me: Me| {
                msg.text()
                    .and_then(|text| parse_command(text, me.username()))
            })
            .endpoint(answer);

        Dispatcher::builder(self.bot, tree)
            .dependencies(dptree::deps![self.handler])
            .default_handler(|_update| async {})
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;

        info!("bot stopped");
        Ok(())
    }
}
