//! Telegram delivery: article announcements, the notification worker and the bot.

mod bot;
mod dispatch;
mod telegram;

pub use bot::{
    help_text, parse_command, start_text, BotError, BotRunner, Command, CommandHandler,
    LatestArticleQuery, STARTUP_MESSAGE,
};
pub use dispatch::{
    render_notification, DispatchError, NotificationDispatcher, NotificationWorker, WorkOutcome,
    WorkerConfig,
};
pub use telegram::{
    api_url_from_env, bot_for, ChatTransport, ParseMode, TelegramError, TelegramTransport,
};

pub const CRATE_NAME: &str = "blogwire-notify";
