use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use blogwire_core::TelegramSettings;
use blogwire_notify::{
    api_url_from_env, BotRunner, CommandHandler, NotificationDispatcher, NotificationWorker,
    TelegramTransport, WorkerConfig,
};
use blogwire_storage::{sqlite_article_store, Database, SqliteJobQueue};
use blogwire_sync::{import_from_env, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "blogwire")]
#[command(about = "Blog articles backend with Telegram announcements")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or update the database schema.
    Migrate,
    /// Run the REST API.
    Serve,
    /// Deliver queued article announcements.
    Worker,
    /// Run the Telegram bot (long polling, stops on Ctrl-C).
    Bot,
    /// Scrape Hacker News into the exchange file.
    Scrape,
    /// Import the exchange file into the article store.
    Import {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Scrape then import, once.
    Sync,
    /// Run scrape+import on the configured cron schedule.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("BLOGWIRE_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn open_database() -> Result<Database> {
    let url = SyncConfig::from_env().database_url;
    let db = Database::connect(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    db.migrate().await.context("migrating database")?;
    Ok(db)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Migrate => {
            open_database().await?;
            println!("migrations applied");
        }
        Commands::Serve => blogwire_web::serve_from_env().await?,
        Commands::Worker => {
            let db = open_database().await?;
            let transport = TelegramTransport::from_env().context("configuring telegram")?;
            let worker = NotificationWorker::new(
                Arc::new(SqliteJobQueue::new(&db)),
                NotificationDispatcher::new(Arc::new(transport)),
                WorkerConfig::from_env(),
            );
            worker.run(shutdown_signal()).await?;
        }
        Commands::Bot => {
            let settings = TelegramSettings::from_env();
            if settings.bot_token.is_empty() {
                bail!("BOT_TOKEN must be set to run the bot");
            }
            let db = open_database().await?;
            let store = sqlite_article_store(&db, settings.clone());
            let api_url = api_url_from_env().context("configuring telegram")?;
            BotRunner::new(settings, CommandHandler::new(store), api_url)?
                .run()
                .await?;
        }
        Commands::Scrape => {
            let config = SyncConfig::from_env();
            let db = open_database().await?;
            let pipeline =
                SyncPipeline::new(config, sqlite_article_store(&db, TelegramSettings::from_env()))?;
            let written = pipeline.scrape().await?;
            println!("scraped {written} stories");
        }
        Commands::Import { file } => {
            let summary = import_from_env(file).await?;
            println!(
                "import complete: rows={} imported={} duplicates={} notification_failures={} file_missing={}",
                summary.rows,
                summary.imported,
                summary.skipped_duplicates,
                summary.notification_failures,
                summary.file_missing
            );
        }
        Commands::Sync => {
            let summary = blogwire_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} scraped={} imported={} duplicates={} exchange_file={}",
                summary.run_id,
                summary.scraped_stories,
                summary.import.imported,
                summary.import.skipped_duplicates,
                summary.exchange_file
            );
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            let cron = config.sync_cron.clone();
            let db = open_database().await?;
            let store = sqlite_article_store(&db, TelegramSettings::from_env());
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled; set BLOGWIRE_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running");
            shutdown_signal().await;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
