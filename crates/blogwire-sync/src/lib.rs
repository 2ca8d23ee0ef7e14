//! Scrape → exchange file → import pipeline and its scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use blogwire_core::{normalize_scraped_url, NewArticle, TelegramSettings};
use blogwire_scraper::{
    read_exchange_file, write_exchange_file, ExchangeError, ScrapeConfig, ScrapedStory,
    StoriesSpider,
};
use blogwire_storage::{sqlite_article_store, ArticleStore, Database, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "blogwire-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scrape: ScrapeConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://blogwire.db?mode=rwc".to_string()),
            scrape: ScrapeConfig::from_env(),
            scheduler_enabled: std::env::var("BLOGWIRE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
        }
    }

    pub fn exchange_file(&self) -> &Path {
        &self.scrape.exchange_file
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub rows: usize,
    pub imported: usize,
    pub skipped_duplicates: usize,
    pub notification_failures: usize,
    pub file_missing: bool,
}

/// Inserts scraped stories whose URL is not stored yet.
#[derive(Clone)]
pub struct ScrapeImporter {
    store: ArticleStore,
}

impl ScrapeImporter {
    pub fn new(store: ArticleStore) -> Self {
        Self { store }
    }

    /// A missing file is logged and reported in the summary, not raised.
    pub async fn import_file(&self, path: &Path) -> Result<ImportSummary> {
        let rows = match read_exchange_file(path) {
            Ok(rows) => rows,
            Err(ExchangeError::Missing(missing)) => {
                warn!(path = %missing.display(), "exchange file not found; nothing imported");
                return Ok(ImportSummary {
                    file_missing: true,
                    ..Default::default()
                });
            }
            Err(err) => return Err(err).context("reading exchange file"),
        };

        let summary = self.import_rows(rows).await?;
        info!(
            path = %path.display(),
            rows = summary.rows,
            imported = summary.imported,
            duplicates = summary.skipped_duplicates,
            "data imported successfully"
        );
        Ok(summary)
    }

    /// Rows are compared by their stored (normalized) URL, so re-importing the
    /// same file never duplicates. Same title with a different URL is a new row.
    /// Empty fields are stored as they are; an empty URL dedups like any other.
    pub async fn import_rows(&self, rows: Vec<ScrapedStory>) -> Result<ImportSummary> {
        let mut summary = ImportSummary {
            rows: rows.len(),
            ..Default::default()
        };

        for row in rows {
            let title = row.title.trim();
            let url = row.url.trim();

            if self
                .store
                .scraped_url_exists(&normalize_scraped_url(url))
                .await
                .context("checking for an existing scraped url")?
            {
                summary.skipped_duplicates += 1;
                continue;
            }

            match self.store.create(NewArticle::scraped(title, url)).await {
                Ok(_) => summary.imported += 1,
                // Lost a race with a concurrent import of the same URL.
                Err(StoreError::DuplicateUrl(_)) => summary.skipped_duplicates += 1,
                Err(StoreError::NotificationEnqueue { article, source }) => {
                    error!(article_id = article.id, error = %source, "imported article without notification");
                    summary.imported += 1;
                    summary.notification_failures += 1;
                }
                Err(err) => return Err(err).context("inserting scraped article"),
            }
        }

        Ok(summary)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scraped_stories: usize,
    pub exchange_file: String,
    pub import: ImportSummary,
}

pub struct SyncPipeline {
    config: SyncConfig,
    spider: StoriesSpider,
    importer: ScrapeImporter,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: ArticleStore) -> Result<Self> {
        let spider = StoriesSpider::new(&config.scrape).context("building stories spider")?;
        Ok(Self {
            config,
            spider,
            importer: ScrapeImporter::new(store),
        })
    }

    pub fn importer(&self) -> &ScrapeImporter {
        &self.importer
    }

    /// Scrape into the exchange file, overwriting it.
    pub async fn scrape(&self) -> Result<usize> {
        let stories = self.spider.crawl().await.context("crawling stories")?;
        let path = self.config.exchange_file().to_path_buf();
        let written = write_exchange_file(&path, &stories)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), stories = written, "exchange file written");
        Ok(written)
    }

    pub async fn import(&self) -> Result<ImportSummary> {
        self.importer.import_file(self.config.exchange_file()).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let scraped_stories = self.scrape().await?;
        let import = self.import().await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scraped_stories,
            exchange_file: self.config.exchange_file().display().to_string(),
            import,
        })
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        scraped = summary.scraped_stories,
                        imported = summary.import.imported,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn open_article_store(database_url: &str) -> Result<ArticleStore> {
    let db = Database::connect(database_url)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;
    db.migrate().await.context("migrating database")?;
    Ok(sqlite_article_store(&db, TelegramSettings::from_env()))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = open_article_store(&config.database_url).await?;
    SyncPipeline::new(config, store)?.run_once().await
}

pub async fn import_from_env(path: Option<PathBuf>) -> Result<ImportSummary> {
    let config = SyncConfig::from_env();
    let store = open_article_store(&config.database_url).await?;
    let path = path.unwrap_or_else(|| config.exchange_file().to_path_buf());
    ScrapeImporter::new(store).import_file(&path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use blogwire_core::ArticleSource;
    use blogwire_storage::{ArticleFilter, JobStatus, SqliteJobQueue};
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (ArticleStore, SqliteJobQueue) {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let store = sqlite_article_store(&db, TelegramSettings::new("t", 1));
        (store, SqliteJobQueue::new(&db))
    }

    fn write_csv(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("stories.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn importing_twice_does_not_duplicate() {
        let (store, queue) = setup().await;
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "title,url\nRust 2.0,https://example.com/rust\nAsk HN: editors?,item?id=2\n",
        );
        let importer = ScrapeImporter::new(store.clone());

        let first = importer.import_file(&path).await.unwrap();
        assert_eq!(first.imported, 2);
        let second = importer.import_file(&path).await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped_duplicates, 2);

        assert_eq!(store.count(&ArticleFilter::default()).await.unwrap(), 2);
        assert_eq!(queue.jobs_with_status(JobStatus::Pending).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn imported_rows_are_scraped_and_normalized() {
        let (store, _queue) = setup().await;
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "title,url\nAsk HN: editors?,item?id=2\n");
        ScrapeImporter::new(store.clone()).import_file(&path).await.unwrap();

        let latest = store.latest(ArticleSource::Scraped).await.unwrap().unwrap();
        assert_eq!(latest.display_title(), "Ask HN: editors?");
        assert_eq!(latest.scraped_url(), Some("https://news.ycombinator.com/item?id=2"));
    }

    #[tokio::test]
    async fn same_title_with_new_url_is_imported() {
        let (store, _queue) = setup().await;
        let importer = ScrapeImporter::new(store);
        let summary = importer
            .import_rows(vec![
                ScrapedStory {
                    title: "Same".into(),
                    url: "https://a.example/1".into(),
                },
                ScrapedStory {
                    title: "Same".into(),
                    url: "https://a.example/2".into(),
                },
                ScrapedStory {
                    title: "Same".into(),
                    url: "https://a.example/1".into(),
                },
                ScrapedStory {
                    title: "".into(),
                    url: "https://a.example/3".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                rows: 4,
                imported: 3,
                skipped_duplicates: 1,
                notification_failures: 0,
                file_missing: false,
            }
        );
    }

    #[tokio::test]
    async fn row_without_url_is_imported_once() {
        let (store, queue) = setup().await;
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "title,url
No link story,
");
        let importer = ScrapeImporter::new(store.clone());

        let first = importer.import_file(&path).await.unwrap();
        assert_eq!(first.imported, 1);
        let second = importer.import_file(&path).await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.skipped_duplicates, 1);

        assert_eq!(store.count(&ArticleFilter::default()).await.unwrap(), 1);
        let stored = store.latest(ArticleSource::Scraped).await.unwrap().unwrap();
        assert_eq!(stored.display_title(), "No link story");
        assert_eq!(stored.scraped_url(), Some(""));
        assert_eq!(queue.jobs_with_status(JobStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_exchange_file_is_not_an_error() {
        let (store, _queue) = setup().await;
        let dir = tempdir().unwrap();
        let summary = ScrapeImporter::new(store.clone())
            .import_file(&dir.path().join("stories.csv"))
            .await
            .unwrap();
        assert!(summary.file_missing);
        assert_eq!(store.count(&ArticleFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pipeline_scrapes_writes_and_imports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<table><tr class="athing"><td><span class="titleline"><a href="item?id=77">Fresh story</a></span></td></tr></table>"#,
            ))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let config = SyncConfig {
            database_url: "sqlite::memory:".into(),
            scrape: ScrapeConfig {
                start_url: format!("{}/", server.uri()),
                max_pages: 3,
                page_delay: Duration::ZERO,
                user_agent: "blogwire-test".into(),
                http_timeout_secs: 5,
                exchange_file: dir.path().join("stories.csv"),
            },
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".into(),
        };
        let (store, _queue) = setup().await;
        let pipeline = Arc::new(SyncPipeline::new(config, store.clone()).unwrap());

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.scraped_stories, 1);
        assert_eq!(summary.import.imported, 1);
        assert!(dir.path().join("stories.csv").exists());
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }
}
