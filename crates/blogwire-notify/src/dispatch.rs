use std::sync::Arc;
use std::time::Duration;

use blogwire_core::{notification_text, BackoffPolicy, NotificationJob};
use blogwire_storage::{NotificationQueue, QueueError};
use chrono::Utc;
use teloxide::utils::html;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::telegram::{ChatTransport, ParseMode, TelegramError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no bot token configured for article {0}")]
    MissingToken(i64),
    #[error(transparent)]
    Send(#[from] TelegramError),
}

/// Only HTML gets markup; any other mode sends the plain text.
pub fn render_notification(job: &NotificationJob, parse_mode: Option<ParseMode>) -> String {
    match parse_mode {
        Some(ParseMode::Html) => format!(
            "<b>New article published:</b>\n\n#{}. {}",
            job.article_id,
            html::escape(&job.title)
        ),
        _ => notification_text(job.article_id, &job.title),
    }
}

/// Sends one announcement per job. Never retries; the worker decides.
#[derive(Clone)]
pub struct NotificationDispatcher {
    transport: Arc<dyn ChatTransport>,
    parse_mode: Option<ParseMode>,
}

impl NotificationDispatcher {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            parse_mode: Some(ParseMode::Html),
        }
    }

    pub fn with_parse_mode(mut self, parse_mode: Option<ParseMode>) -> Self {
        self.parse_mode = parse_mode;
        self
    }

    pub async fn dispatch(&self, job: &NotificationJob) -> Result<(), DispatchError> {
        if job.bot_token.is_empty() {
            return Err(DispatchError::MissingToken(job.article_id));
        }
        let text = render_notification(job, self.parse_mode);
        self.transport
            .send_message(&job.bot_token, job.chat_id, &text, self.parse_mode)
            .await?;
        info!(article_id = job.article_id, chat_id = job.chat_id, "article announced");
        Ok(())
    }
}

/// `backoff.max_retries` is the whole retry budget: a job gets one delivery
/// plus that many retries before it is marked failed.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub lease: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            lease: Duration::from_secs(300),
            backoff: BackoffPolicy {
                max_retries: 4,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(300),
            },
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let env_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        let max_attempts = std::env::var("WORKER_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_attempts())
            .max(1);
        Self {
            poll_interval: env_u64("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            lease: env_u64("WORKER_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
            backoff: BackoffPolicy {
                max_retries: max_attempts.saturating_sub(1) as usize,
                ..defaults.backoff
            },
        }
    }

    /// Deliveries a job may consume, first try included.
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.backoff.max_retries)
            .unwrap_or(u32::MAX)
            .saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Idle,
    Delivered { job_id: i64 },
    Retrying { job_id: i64, attempts: u32 },
    Failed { job_id: i64, attempts: u32 },
}

/// Drains the notification queue through a dispatcher.
pub struct NotificationWorker {
    queue: Arc<dyn NotificationQueue>,
    dispatcher: NotificationDispatcher,
    config: WorkerConfig,
}

impl NotificationWorker {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        dispatcher: NotificationDispatcher,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            config,
        }
    }

    /// Claim and handle at most one job.
    pub async fn run_once(&self) -> Result<WorkOutcome, QueueError> {
        let Some(claimed) = self.queue.dequeue().await? else {
            return Ok(WorkOutcome::Idle);
        };

        let err = match self.dispatcher.dispatch(&claimed.job).await {
            Ok(()) => {
                self.queue.complete(claimed.id).await?;
                return Ok(WorkOutcome::Delivered { job_id: claimed.id });
            }
            Err(err) => err.to_string(),
        };

        if claimed.attempts >= self.config.max_attempts() {
            error!(
                job_id = claimed.id,
                article_id = claimed.job.article_id,
                attempts = claimed.attempts,
                error = %err,
                "notification failed permanently"
            );
            self.queue.fail(claimed.id, &err, None).await?;
            return Ok(WorkOutcome::Failed {
                job_id: claimed.id,
                attempts: claimed.attempts,
            });
        }

        let delay = self
            .config
            .backoff
            .delay_for_attempt(claimed.attempts.saturating_sub(1) as usize);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        warn!(
            job_id = claimed.id,
            attempts = claimed.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "notification failed, retrying"
        );
        self.queue.fail(claimed.id, &err, Some(retry_at)).await?;
        Ok(WorkOutcome::Retrying {
            job_id: claimed.id,
            attempts: claimed.attempts,
        })
    }

    /// Work until `shutdown` resolves. Stale leases are reclaimed once per idle poll.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), QueueError>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts(),
            "notification worker started"
        );
        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.run_once() => outcome?,
            };
            if outcome != WorkOutcome::Idle {
                continue;
            }

            let requeued = self.queue.requeue_stale(self.config.lease).await?;
            if requeued > 0 {
                warn!(requeued, "requeued stale notification jobs");
                continue;
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("notification worker stopped");
        Ok(())
    }
}
