//! Hacker News story scraper and the CSV exchange file it produces.

mod exchange;
mod fetch;

use std::path::PathBuf;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub use exchange::{read_exchange_file, write_exchange_file, ExchangeError};
pub use fetch::{
    classify_reqwest_error, classify_status, FetchError, FetchedPage, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "blogwire-scraper";

/// One row of the exchange file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedStory {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid page url {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub start_url: String,
    pub max_pages: usize,
    pub page_delay: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub exchange_file: PathBuf,
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self {
            start_url: std::env::var("SCRAPE_START_URL")
                .unwrap_or_else(|_| blogwire_core::HN_BASE_URL.to_string()),
            max_pages: std::env::var("SCRAPE_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            page_delay: Duration::from_millis(
                std::env::var("SCRAPE_PAGE_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
            user_agent: std::env::var("BLOGWIRE_USER_AGENT")
                .unwrap_or_else(|_| "blogwire-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("BLOGWIRE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            exchange_file: std::env::var("EXCHANGE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("stories.csv")),
        }
    }
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn story_from_row(row: ElementRef<'_>, link: &Selector) -> Option<ScrapedStory> {
    let anchor = row.select(link).next()?;
    let title = text_or_none(anchor.text().collect::<String>())?;
    let url = anchor
        .value()
        .attr("href")
        .and_then(|href| text_or_none(href.to_string()))?;
    Some(ScrapedStory { title, url })
}

/// Stories of one listing page. Hrefs are kept verbatim; bare `item?id=` paths
/// are normalized when the article is stored.
pub fn parse_stories(html: &str) -> Result<Vec<ScrapedStory>, ScrapeError> {
    let document = Html::parse_document(html);
    let rows = selector(".athing")?;
    let link = selector("span.titleline > a")?;
    Ok(document
        .select(&rows)
        .filter_map(|row| story_from_row(row, &link))
        .collect())
}

/// Absolute URL behind the page's "More" link, if any.
pub fn next_page_url(html: &str, page_url: &str) -> Result<Option<String>, ScrapeError> {
    let document = Html::parse_document(html);
    let more = selector("a.morelink")?;
    let Some(href) = document
        .select(&more)
        .next()
        .and_then(|a| a.value().attr("href"))
    else {
        return Ok(None);
    };

    let base = Url::parse(page_url).map_err(|source| ScrapeError::Url {
        url: page_url.to_string(),
        source,
    })?;
    let next = base.join(href).map_err(|source| ScrapeError::Url {
        url: href.to_string(),
        source,
    })?;
    Ok(Some(next.to_string()))
}

/// Walks the front page and its "More" links.
#[derive(Debug, Clone)]
pub struct StoriesSpider {
    http: HttpFetcher,
    start_url: String,
    max_pages: usize,
    page_delay: Duration,
}

impl StoriesSpider {
    pub fn new(config: &ScrapeConfig) -> Result<Self, ScrapeError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            http,
            start_url: config.start_url.clone(),
            max_pages: config.max_pages.max(1),
            page_delay: config.page_delay,
        })
    }

    /// A failure on the first page is an error; a failure on a later page ends
    /// the crawl with what was collected so far.
    pub async fn crawl(&self) -> Result<Vec<ScrapedStory>, ScrapeError> {
        let mut stories = Vec::new();
        let mut next = Some(self.start_url.clone());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages > 0 {
                tokio::time::sleep(self.page_delay).await;
            }

            let page = match self.http.fetch_text(&url).await {
                Ok(page) => page,
                Err(err) if pages > 0 => {
                    warn!(%url, error = %err, "stopping pagination");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            pages += 1;

            let found = parse_stories(&page.body)?;
            info!(%url, stories = found.len(), page = pages, "scraped listing page");
            stories.extend(found);

            if pages >= self.max_pages {
                break;
            }
            next = next_page_url(&page.body, &page.final_url)?;
        }

        Ok(stories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FRONT_PAGE: &str = r#"
        <html><body><table>
          <tr class="athing" id="1">
            <td class="title"><span class="titleline">
              <a href="https://example.com/rust">Rust 2.0 released</a>
              <span class="sitebit comhead">(<a href="from?site=example.com">example.com</a>)</span>
            </span></td>
          </tr>
          <tr class="athing" id="2">
            <td class="title"><span class="titleline"><a href="item?id=2">Ask HN: Favourite editor?</a></span></td>
          </tr>
          <tr class="athing" id="3">
            <td class="title"><span class="titleline"><a href="item?id=3">   </a></span></td>
          </tr>
          <tr><td><a class="morelink" href="news?p=2" rel="next">More</a></td></tr>
        </table></body></html>
    "#;

    const LAST_PAGE: &str = r#"
        <html><body><table>
          <tr class="athing" id="31">
            <td class="title"><span class="titleline"><a href="https://example.org/b">Page two story</a></span></td>
          </tr>
        </table></body></html>
    "#;

    fn config(start_url: String, max_pages: usize) -> ScrapeConfig {
        ScrapeConfig {
            start_url,
            max_pages,
            page_delay: Duration::ZERO,
            user_agent: "blogwire-test".into(),
            http_timeout_secs: 5,
            exchange_file: PathBuf::from("stories.csv"),
        }
    }

    #[test]
    fn parses_title_links_and_skips_blank_rows() {
        let stories = parse_stories(FRONT_PAGE).unwrap();
        assert_eq!(
            stories,
            vec![
                ScrapedStory {
                    title: "Rust 2.0 released".into(),
                    url: "https://example.com/rust".into()
                },
                ScrapedStory {
                    title: "Ask HN: Favourite editor?".into(),
                    url: "item?id=2".into()
                },
            ]
        );
    }

    #[test]
    fn more_link_resolves_against_the_page() {
        assert_eq!(
            next_page_url(FRONT_PAGE, "https://news.ycombinator.com/").unwrap(),
            Some("https://news.ycombinator.com/news?p=2".to_string())
        );
        assert_eq!(next_page_url(LAST_PAGE, "https://news.ycombinator.com/news?p=2").unwrap(), None);
    }

    #[tokio::test]
    async fn crawl_follows_more_until_it_runs_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LAST_PAGE))
            .mount(&server)
            .await;

        let spider = StoriesSpider::new(&config(format!("{}/", server.uri()), 10)).unwrap();
        let stories = spider.crawl().await.unwrap();
        assert_eq!(stories.len(), 3);
        assert_eq!(stories[2].title, "Page two story");
    }

    #[tokio::test]
    async fn crawl_respects_page_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
            .mount(&server)
            .await;

        let spider = StoriesSpider::new(&config(format!("{}/", server.uri()), 1)).unwrap();
        assert_eq!(spider.crawl().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn later_page_failure_keeps_earlier_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FRONT_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let spider = StoriesSpider::new(&config(format!("{}/", server.uri()), 10)).unwrap();
        assert_eq!(spider.crawl().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn first_page_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let spider = StoriesSpider::new(&config(format!("{}/", server.uri()), 10)).unwrap();
        let err = spider.crawl().await.unwrap_err();
        assert!(matches!(
            err,
            ScrapeError::Fetch(FetchError::HttpStatus { status: 403, .. })
        ));
    }
}
