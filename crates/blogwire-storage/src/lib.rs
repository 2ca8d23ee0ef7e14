//! SQLite persistence for articles, users and the notification job queue.

mod articles;
mod queue;
mod users;

use std::str::FromStr;
use std::sync::Arc;

use blogwire_core::{Article, TelegramSettings};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

pub use articles::{ArticleFilter, ArticleStore, ArticleUpdate, PersistenceHook};
pub use queue::{JobStatus, NotificationQueue, QueueError, QueuedJob, SqliteJobQueue};
pub use users::{
    NewUser, Profile, User, UserStore, UserUpdate, MIN_PASSWORD_LEN, RESET_TOKEN_TTL_HOURS,
};

pub const CRATE_NAME: &str = "blogwire-storage";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        is_staff INTEGER NOT NULL DEFAULT 0,
        password_hash TEXT NOT NULL,
        date_joined TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_tokens (
        key TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS password_reset_tokens (
        token_digest TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
        image TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL CHECK (source IN ('Manual', 'Scraped')),
        title TEXT NOT NULL DEFAULT '',
        content TEXT NOT NULL DEFAULT '',
        scraped_title TEXT,
        scraped_url TEXT,
        picture TEXT,
        user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS articles_scraped_url_unique ON articles (scraped_url) WHERE scraped_url IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS articles_source_id_idx ON articles (source, id)",
    r#"
    CREATE TABLE IF NOT EXISTS notification_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        article_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        bot_token TEXT NOT NULL,
        chat_id INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        available_at INTEGER NOT NULL,
        locked_at INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS notification_jobs_ready_idx ON notification_jobs (status, available_at)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("article {0} is scraped and cannot be edited")]
    ReadOnly(i64),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("scraped url {0:?} is already stored")]
    DuplicateUrl(String),
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("article {} stored but notification enqueue failed: {source}", .article.id)]
    NotificationEnqueue {
        article: Box<Article>,
        #[source]
        source: QueueError,
    },
}

/// Shared connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// so the data lives as long as the pool.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Article store whose hook enqueues into the `notification_jobs` table of `db`.
pub fn sqlite_article_store(db: &Database, telegram: TelegramSettings) -> ArticleStore {
    let queue = SqliteJobQueue::new(db);
    ArticleStore::new(db.clone(), PersistenceHook::new(Arc::new(queue), telegram))
}
