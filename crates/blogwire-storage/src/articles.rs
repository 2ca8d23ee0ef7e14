use std::sync::Arc;

use blogwire_core::{Article, ArticleSource, NewArticle, NotificationJob, Provenance, TelegramSettings};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{error, info};

use crate::queue::{NotificationQueue, QueueError};
use crate::{Database, StoreError};

const ARTICLE_COLUMNS: &str =
    "id, source, title, content, scraped_title, scraped_url, picture, user_id, created_at";

/// Runs around every article insert: URL normalization before the row is
/// written, notification enqueue after it is committed. Updates never reach it.
#[derive(Clone)]
pub struct PersistenceHook {
    queue: Arc<dyn NotificationQueue>,
    telegram: TelegramSettings,
}

impl PersistenceHook {
    pub fn new(queue: Arc<dyn NotificationQueue>, telegram: TelegramSettings) -> Self {
        Self { queue, telegram }
    }

    pub fn before_insert(&self, new: &mut NewArticle) {
        new.normalize();
    }

    pub async fn after_insert(&self, article: &Article) -> Result<i64, QueueError> {
        info!(
            article_id = article.id,
            title = article.display_title(),
            "article created; queueing notification"
        );
        self.queue
            .enqueue(NotificationJob::for_article(article, &self.telegram))
            .await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    /// Case-insensitive substring of the display title.
    pub title: Option<String>,
    pub limit: Option<i64>,
    pub offset: i64,
}

/// Editable fields of a manual article. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct ArticleUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub picture: Option<String>,
}

#[derive(Clone)]
pub struct ArticleStore {
    db: Database,
    hook: PersistenceHook,
}

impl ArticleStore {
    pub fn new(db: Database, hook: PersistenceHook) -> Self {
        Self { db, hook }
    }

    pub async fn create(&self, mut new: NewArticle) -> Result<Article, StoreError> {
        self.hook.before_insert(&mut new);

        let created_at = Utc::now();
        let (title, content, scraped_title, scraped_url, user_id) = match &new.provenance {
            Provenance::Manual {
                title,
                content,
                author_id,
            } => (title.as_str(), content.as_str(), None, None, Some(*author_id)),
            Provenance::Scraped { title, url } => {
                ("", "", Some(title.as_str()), Some(url.as_str()), None)
            }
        };

        let mut tx = self.db.pool().begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO articles
                (source, title, content, scraped_title, scraped_url, picture, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.provenance.source().as_str())
        .bind(title)
        .bind(content)
        .bind(scraped_title)
        .bind(scraped_url)
        .bind(new.picture.as_deref())
        .bind(user_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await;
        let result = match result {
            Ok(result) => result,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::DuplicateUrl(
                    scraped_url.unwrap_or_default().to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        tx.commit().await?;

        let article = Article {
            id: result.last_insert_rowid(),
            provenance: new.provenance,
            picture: new.picture,
            created_at,
        };

        if let Err(source) = self.hook.after_insert(&article).await {
            error!(article_id = article.id, error = %source, "notification enqueue failed");
            return Err(StoreError::NotificationEnqueue {
                article: Box::new(article),
                source,
            });
        }
        Ok(article)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Article>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    /// Newest first.
    pub async fn list(&self, filter: &ArticleFilter) -> Result<Vec<Article>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ARTICLE_COLUMNS}
              FROM articles
             WHERE ?1 IS NULL
                OR instr(lower(CASE source WHEN 'Manual' THEN title ELSE scraped_title END), lower(?1)) > 0
             ORDER BY id DESC
             LIMIT ?2 OFFSET ?3
            "#
        ))
        .bind(filter.title.as_deref())
        .bind(filter.limit.unwrap_or(-1))
        .bind(filter.offset.max(0))
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(article_from_row).collect()
    }

    pub async fn count(&self, filter: &ArticleFilter) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
              FROM articles
             WHERE ?1 IS NULL
                OR instr(lower(CASE source WHEN 'Manual' THEN title ELSE scraped_title END), lower(?1)) > 0
            "#,
        )
        .bind(filter.title.as_deref())
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.try_get("total")?)
    }

    /// Most recent article of one provenance stream, by id.
    pub async fn latest(&self, source: ArticleSource) -> Result<Option<Article>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE source = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(source.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(article_from_row).transpose()
    }

    pub async fn scraped_url_exists(&self, url: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM articles WHERE scraped_url = ?) AS found")
            .bind(url)
            .fetch_one(self.db.pool())
            .await?;
        let found: i64 = row.try_get("found")?;
        Ok(found != 0)
    }

    pub async fn update_manual(&self, id: i64, update: ArticleUpdate) -> Result<Article, StoreError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))?;
        if current.source() != ArticleSource::Manual {
            return Err(StoreError::ReadOnly(id));
        }

        sqlx::query(
            r#"
            UPDATE articles
               SET title = COALESCE(?, title),
                   content = COALESCE(?, content),
                   picture = COALESCE(?, picture)
             WHERE id = ?
            "#,
        )
        .bind(update.title.as_deref())
        .bind(update.content.as_deref())
        .bind(update.picture.as_deref())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))
    }

    /// Replaces the picture reference of a manual article.
    pub async fn set_picture(&self, id: i64, picture: &str) -> Result<Article, StoreError> {
        self.update_manual(
            id,
            ArticleUpdate {
                picture: Some(picture.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM articles WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn article_from_row(row: &SqliteRow) -> Result<Article, StoreError> {
    let id: i64 = row.try_get("id")?;
    let source: String = row.try_get("source")?;
    let source: ArticleSource = source
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("article {id}: {e}")))?;

    let provenance = match source {
        ArticleSource::Manual => {
            let author_id: Option<i64> = row.try_get("user_id")?;
            Provenance::Manual {
                title: row.try_get("title")?,
                content: row.try_get("content")?,
                author_id: author_id
                    .ok_or_else(|| StoreError::Corrupt(format!("manual article {id} has no author")))?,
            }
        }
        ArticleSource::Scraped => {
            let title: Option<String> = row.try_get("scraped_title")?;
            let url: Option<String> = row.try_get("scraped_url")?;
            Provenance::Scraped {
                title: title.unwrap_or_default(),
                url: url.unwrap_or_default(),
            }
        }
    };

    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(Article {
        id,
        provenance,
        picture: row.try_get("picture")?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobStatus, QueuedJob, SqliteJobQueue};
    use crate::users::{NewUser, UserStore};
    use async_trait::async_trait;
    use std::time::Duration;

    struct BrokenQueue;

    #[async_trait]
    impl NotificationQueue for BrokenQueue {
        async fn enqueue(&self, _job: NotificationJob) -> Result<i64, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
        async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
            Ok(None)
        }
        async fn complete(&self, _job_id: i64) -> Result<(), QueueError> {
            Ok(())
        }
        async fn fail(
            &self,
            _job_id: i64,
            _error: &str,
            _retry_at: Option<DateTime<Utc>>,
        ) -> Result<(), QueueError> {
            Ok(())
        }
        async fn requeue_stale(&self, _lease: Duration) -> Result<u64, QueueError> {
            Ok(0)
        }
    }

    async fn setup() -> (Database, ArticleStore, SqliteJobQueue) {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let queue = SqliteJobQueue::new(&db);
        let hook = PersistenceHook::new(
            Arc::new(queue.clone()),
            TelegramSettings::new("bot-token", -1001),
        );
        (db.clone(), ArticleStore::new(db, hook), queue)
    }

    async fn author(db: &Database) -> i64 {
        UserStore::new(db.clone())
            .create_user(NewUser {
                email: "admin@user.com".into(),
                password: "admin12345".into(),
                username: "Admin".into(),
                first_name: String::new(),
                last_name: String::new(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn scraped_paths_are_normalized_before_insert() {
        let (_db, store, _queue) = setup().await;
        let created = store
            .create(NewArticle::scraped("Show HN: a thing", "item?id=100"))
            .await
            .unwrap();
        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(
            stored.scraped_url(),
            Some("https://news.ycombinator.com/item?id=100")
        );

        let absolute = store
            .create(NewArticle::scraped("Elsewhere", "https://example.com/post"))
            .await
            .unwrap();
        assert_eq!(absolute.scraped_url(), Some("https://example.com/post"));
    }

    #[tokio::test]
    async fn each_create_enqueues_exactly_one_job_with_the_provenance_title() {
        let (db, store, queue) = setup().await;
        let user = author(&db).await;
        let manual = store.create(NewArticle::manual(user, "Django", "")).await.unwrap();
        let scraped = store
            .create(NewArticle::scraped("Launch HN", "item?id=5"))
            .await
            .unwrap();

        let pending = queue.jobs_with_status(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].job.article_id, manual.id);
        assert_eq!(pending[0].job.title, "Django");
        assert_eq!(pending[1].job.article_id, scraped.id);
        assert_eq!(pending[1].job.title, "Launch HN");
        assert_eq!(pending[1].job.bot_token, "bot-token");
        assert_eq!(pending[1].job.chat_id, -1001);
    }

    #[tokio::test]
    async fn updates_do_not_enqueue() {
        let (db, store, queue) = setup().await;
        let user = author(&db).await;
        let article = store.create(NewArticle::manual(user, "Draft", "v1")).await.unwrap();
        let updated = store
            .update_manual(
                article.id,
                ArticleUpdate {
                    title: Some("Final".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.display_title(), "Final");
        assert_eq!(queue.jobs_with_status(JobStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scraped_articles_are_read_only() {
        let (_db, store, _queue) = setup().await;
        let article = store
            .create(NewArticle::scraped("Ask HN", "item?id=1"))
            .await
            .unwrap();
        let err = store
            .update_manual(article.id, ArticleUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly(id) if id == article.id));
    }

    #[tokio::test]
    async fn enqueue_failure_keeps_the_row() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let store = ArticleStore::new(
            db,
            PersistenceHook::new(Arc::new(BrokenQueue), TelegramSettings::default()),
        );

        let err = store
            .create(NewArticle::scraped("Kept", "item?id=2"))
            .await
            .unwrap_err();
        let article = match err {
            StoreError::NotificationEnqueue { article, .. } => article,
            other => panic!("expected enqueue failure, got {other:?}"),
        };
        assert!(store.get(article.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn latest_is_per_source_and_by_id() {
        let (db, store, _queue) = setup().await;
        let user = author(&db).await;
        assert!(store.latest(ArticleSource::Manual).await.unwrap().is_none());

        store.create(NewArticle::manual(user, "One", "")).await.unwrap();
        let scraped = store.create(NewArticle::scraped("Two", "item?id=2")).await.unwrap();
        let manual = store.create(NewArticle::manual(user, "Three", "")).await.unwrap();

        assert_eq!(store.latest(ArticleSource::Manual).await.unwrap().unwrap().id, manual.id);
        assert_eq!(store.latest(ArticleSource::Scraped).await.unwrap().unwrap().id, scraped.id);
    }

    #[tokio::test]
    async fn list_filters_by_display_title_and_paginates() {
        let (db, store, _queue) = setup().await;
        let user = author(&db).await;
        store.create(NewArticle::manual(user, "Python tips", "")).await.unwrap();
        store.create(NewArticle::scraped("Why PYTHON is slow", "item?id=3")).await.unwrap();
        store.create(NewArticle::scraped("Rust 2.0", "item?id=4")).await.unwrap();

        let filter = ArticleFilter {
            title: Some("python".into()),
            ..Default::default()
        };
        let found = store.list(&filter).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].display_title(), "Why PYTHON is slow");
        assert_eq!(store.count(&filter).await.unwrap(), 2);

        let page = store
            .list(&ArticleFilter {
                title: None,
                limit: Some(1),
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].display_title(), "Why PYTHON is slow");
    }

    #[tokio::test]
    async fn scraped_url_lookup_matches_stored_value() {
        let (_db, store, _queue) = setup().await;
        store.create(NewArticle::scraped("A", "item?id=9")).await.unwrap();
        assert!(store
            .scraped_url_exists("https://news.ycombinator.com/item?id=9")
            .await
            .unwrap());
        assert!(!store.scraped_url_exists("item?id=9").await.unwrap());
    }

    #[tokio::test]
    async fn second_insert_of_a_scraped_url_is_a_duplicate() {
        let (_db, store, queue) = setup().await;
        store.create(NewArticle::scraped("First", "item?id=7")).await.unwrap();
        let err = store
            .create(NewArticle::scraped("Second", "https://news.ycombinator.com/item?id=7"))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, StoreError::DuplicateUrl(url) if url == "https://news.ycombinator.com/item?id=7"),
            "{err:?}"
        );
        assert_eq!(queue.jobs_with_status(JobStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_articles_never_collide_on_url() {
        let (db, store, _queue) = setup().await;
        let user = author(&db).await;
        store.create(NewArticle::manual(user, "A", "")).await.unwrap();
        store.create(NewArticle::manual(user, "B", "")).await.unwrap();
        assert_eq!(store.count(&ArticleFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn picture_reference_is_replaced_on_manual_articles_only() {
        let (db, store, _queue) = setup().await;
        let user = author(&db).await;
        let manual = store.create(NewArticle::manual(user, "Pic", "")).await.unwrap();
        let updated = store
            .set_picture(manual.id, "uploads/articles/pic.png")
            .await
            .unwrap();
        assert_eq!(updated.picture.as_deref(), Some("uploads/articles/pic.png"));
        assert_eq!(updated.display_title(), "Pic");

        let scraped = store.create(NewArticle::scraped("HN", "item?id=11")).await.unwrap();
        assert!(matches!(
            store.set_picture(scraped.id, "x.png").await.unwrap_err(),
            StoreError::ReadOnly(_)
        ));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_went_away() {
        let (_db, store, _queue) = setup().await;
        let article = store.create(NewArticle::scraped("Gone", "item?id=8")).await.unwrap();
        assert!(store.delete(article.id).await.unwrap());
        assert!(!store.delete(article.id).await.unwrap());
    }
}
