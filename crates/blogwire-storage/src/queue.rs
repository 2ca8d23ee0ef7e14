use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blogwire_core::NotificationJob;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::Database;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// A job claimed from the queue. `attempts` counts this claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: i64,
    pub attempts: u32,
    pub job: NotificationJob,
}

/// Durable at-least-once queue of notification jobs.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn enqueue(&self, job: NotificationJob) -> Result<i64, QueueError>;

    /// Claim the oldest ready job, if any.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    async fn complete(&self, job_id: i64) -> Result<(), QueueError>;

    /// Record a failed attempt. `retry_at = None` marks the job permanently failed.
    async fn fail(
        &self,
        job_id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError>;

    /// Return jobs stuck in `running` longer than `lease` to `pending`.
    async fn requeue_stale(&self, lease: Duration) -> Result<u64, QueueError>;
}

#[async_trait]
impl<T: NotificationQueue + ?Sized> NotificationQueue for Arc<T> {
    async fn enqueue(&self, job: NotificationJob) -> Result<i64, QueueError> {
        (**self).enqueue(job).await
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        (**self).dequeue().await
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        (**self).complete(job_id).await
    }

    async fn fail(
        &self,
        job_id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        (**self).fail(job_id, error, retry_at).await
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        (**self).requeue_stale(lease).await
    }
}

/// Queue backed by the `notification_jobs` table.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<QueuedJob>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, article_id, title, bot_token, chat_id, attempts
              FROM notification_jobs
             WHERE status = ?
             ORDER BY id
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(queued_job_from_row).collect()
    }

    pub async fn last_error(&self, job_id: i64) -> Result<Option<String>, QueueError> {
        let row = sqlx::query("SELECT last_error FROM notification_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("last_error")?,
            None => None,
        })
    }
}

fn queued_job_from_row(row: &SqliteRow) -> Result<QueuedJob, QueueError> {
    let attempts: i64 = row.try_get("attempts")?;
    Ok(QueuedJob {
        id: row.try_get("id")?,
        attempts: attempts.max(0) as u32,
        job: NotificationJob {
            article_id: row.try_get("article_id")?,
            title: row.try_get("title")?,
            bot_token: row.try_get("bot_token")?,
            chat_id: row.try_get("chat_id")?,
        },
    })
}

#[async_trait]
impl NotificationQueue for SqliteJobQueue {
    async fn enqueue(&self, job: NotificationJob) -> Result<i64, QueueError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO notification_jobs
                (article_id, title, bot_token, chat_id, status, attempts, available_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(job.article_id)
        .bind(&job.title)
        .bind(&job.bot_token)
        .bind(job.chat_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT id, article_id, title, bot_token, chat_id, attempts
              FROM notification_jobs
             WHERE status = 'pending' AND available_at <= ?
             ORDER BY available_at, id
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut claimed = queued_job_from_row(&row)?;

        let updated = sqlx::query(
            r#"
            UPDATE notification_jobs
               SET status = 'running', attempts = attempts + 1, locked_at = ?
             WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(claimed.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        claimed.attempts += 1;
        Ok(Some(claimed))
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE notification_jobs SET status = 'done', locked_at = NULL, last_error = NULL WHERE id = ?",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        match retry_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    UPDATE notification_jobs
                       SET status = 'pending', locked_at = NULL, last_error = ?, available_at = ?
                     WHERE id = ?
                    "#,
                )
                .bind(error)
                .bind(at.timestamp_millis())
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE notification_jobs SET status = 'failed', locked_at = NULL, last_error = ? WHERE id = ?",
                )
                .bind(error)
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn requeue_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(lease_ms);
        let result = sqlx::query(
            r#"
            UPDATE notification_jobs
               SET status = 'pending', locked_at = NULL
             WHERE status = 'running' AND locked_at <= ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
