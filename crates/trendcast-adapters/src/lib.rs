//! Source adapter contracts + HTTP and fixture-directory collection sessions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info};
use trendcast_core::{RawTrend, SourceDescriptor};
use trendcast_storage::{FetchError, HttpClientConfig, HttpFetcher};
use url::Url;

pub const CRATE_NAME: &str = "trendcast-adapters";

pub const RESULTS_ROW_SELECTOR: &str = "tbody tr";
pub const NEXT_PAGE_SELECTOR: &str = r#"a[rel="next"]"#;

/// User agents rotated per collection run; one is chosen when the session starts.
pub const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

pub fn pick_user_agent() -> &'static str {
    let idx = rand::rng().random_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

pub const DEFAULT_VIEWPORT: Viewport = Viewport {
    width: 1920,
    height: 1080,
};

/// Identity and bounds fixed for the lifetime of one collection session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub user_agent: String,
    pub viewport: Viewport,
    pub navigation_timeout: Duration,
    pub content_wait: Duration,
}

impl SessionProfile {
    /// Profile with a user agent drawn from the rotation pool.
    pub fn rotated(navigation_timeout: Duration, content_wait: Duration) -> Self {
        Self {
            user_agent: pick_user_agent().to_string(),
            viewport: DEFAULT_VIEWPORT,
            navigation_timeout,
            content_wait,
        }
    }

    /// Upper bound on a single visit: navigation plus the wait for results.
    pub fn visit_budget(&self) -> Duration {
        self.navigation_timeout + self.content_wait
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("session could not start: {0}")]
    Launch(String),
    #[error("{label}: timed out after {after:?}")]
    Timeout { label: String, after: Duration },
    #[error("{label}: results container not found")]
    ResultsMissing { label: String },
    #[error("no source visited yet")]
    NotNavigated,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Starts the per-run collection session (one identity for every source in the run).
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn CollectionSession>, AdapterError>;
}

#[async_trait]
pub trait CollectionSession: Send {
    /// Navigate to `source` and return the raw rows visible on arrival.
    async fn visit(&mut self, source: &SourceDescriptor) -> Result<Vec<RawTrend>, AdapterError>;

    /// Ask the current source for its next page of rows; `Ok(None)` once the
    /// "more" affordance is gone.
    async fn load_more(&mut self) -> Result<Option<Vec<RawTrend>>, AdapterError>;

    async fn close(&mut self);
}

/// Rows and pagination link parsed out of one results page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPage {
    pub rows: Vec<RawTrend>,
    pub has_results_container: bool,
    pub next_href: Option<String>,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

/// Text of a cell split the way a browser lays out block children: one trimmed line per text node.
fn cell_lines(cell: ElementRef<'_>) -> Vec<String> {
    cell.text()
        .flat_map(|t| t.lines())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn looks_like_volume(line: &str) -> bool {
    line.contains('+') && (line.contains('K') || line.contains('M'))
}

fn is_all_digits(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}

/// Pull `(term, volumeText)` pairs out of every results row with at least two cells.
pub fn extract_trend_rows(html: &str) -> Result<ParsedPage, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector(RESULTS_ROW_SELECTOR)?;
    let cell_sel = selector("td")?;
    let next_sel = selector(NEXT_PAGE_SELECTOR)?;

    let mut page = ParsedPage::default();
    for row in document.select(&row_sel) {
        page.has_results_container = true;
        let cells: Vec<_> = row.select(&cell_sel).collect();
        if cells.len() < 2 {
            continue;
        }

        let mut term: Option<String> = None;
        let mut volume_text: Option<String> = None;
        for cell in cells {
            let lines = cell_lines(cell);
            if lines.is_empty() {
                continue;
            }
            if let Some(volume_line) = lines.iter().find(|l| looks_like_volume(l)) {
                if volume_text.is_none() {
                    volume_text = Some(volume_line.clone());
                }
                continue;
            }
            let joined = lines.join("\n");
            if term.is_none() && joined.chars().count() > 2 && !is_all_digits(&joined) {
                term = Some(lines[0].clone());
            }
        }

        if let (Some(term), Some(volume_text)) = (term, volume_text) {
            page.rows.push(RawTrend { term, volume_text });
        }
    }

    page.next_href = document
        .select(&next_sel)
        .find(|a| a.value().attr("aria-disabled") != Some("true") && a.value().attr("disabled").is_none())
        .and_then(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(str::to_string);

    Ok(page)
}

fn rows_or_missing(page: &ParsedPage, label: &str) -> Result<(), AdapterError> {
    if page.has_results_container {
        Ok(())
    } else {
        Err(AdapterError::ResultsMissing {
            label: label.to_string(),
        })
    }
}

/// Launches sessions that fetch result pages over plain HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpSessionLauncher {
    pub base: HttpClientConfig,
}

#[async_trait]
impl SessionLauncher for HttpSessionLauncher {
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn CollectionSession>, AdapterError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: profile.navigation_timeout,
            user_agent: Some(profile.user_agent.clone()),
            ..self.base.clone()
        })
        .map_err(|e| AdapterError::Launch(e.to_string()))?;
        info!(user_agent = %profile.user_agent, "http session started");
        Ok(Box::new(HttpSession {
            fetcher,
            cursor: None,
        }))
    }
}

#[derive(Debug, Clone)]
struct PageCursor {
    label: String,
    location: String,
    next_href: Option<String>,
}

pub struct HttpSession {
    fetcher: HttpFetcher,
    cursor: Option<PageCursor>,
}

impl HttpSession {
    async fn open(&mut self, label: &str, url: &str) -> Result<Vec<RawTrend>, AdapterError> {
        let response = self.fetcher.fetch_text(url).await?;
        let page = extract_trend_rows(&response.body)?;
        rows_or_missing(&page, label)?;
        debug!(label, rows = page.rows.len(), next = ?page.next_href, "page parsed");
        self.cursor = Some(PageCursor {
            label: label.to_string(),
            location: response.final_url,
            next_href: page.next_href,
        });
        Ok(page.rows)
    }
}

/// Resolve a `next` href against the URL the current page was served from.
pub fn resolve_next(location: &str, href: &str) -> Result<Url, AdapterError> {
    let base = Url::parse(location)
        .map_err(|e| AdapterError::Message(format!("bad page url {location}: {e}")))?;
    base.join(href)
        .map_err(|e| AdapterError::Message(format!("bad next link {href}: {e}")))
}

#[async_trait]
impl CollectionSession for HttpSession {
    async fn visit(&mut self, source: &SourceDescriptor) -> Result<Vec<RawTrend>, AdapterError> {
        self.open(&source.label, &source.endpoint).await
    }

    async fn load_more(&mut self) -> Result<Option<Vec<RawTrend>>, AdapterError> {
        let cursor = self.cursor.clone().ok_or(AdapterError::NotNavigated)?;
        let Some(href) = cursor.next_href else {
            return Ok(None);
        };
        let next = resolve_next(&cursor.location, &href)?;
        self.open(&cursor.label, next.as_str()).await.map(Some)
    }

    async fn close(&mut self) {
        self.cursor = None;
        debug!("http session closed");
    }
}

/// Launches sessions that read saved result pages from a directory, one `<slug>.html` per label.
#[derive(Debug, Clone)]
pub struct FixtureSessionLauncher {
    dir: PathBuf,
}

impl FixtureSessionLauncher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

pub fn label_slug(label: &str) -> String {
    let slug = label
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    slug.split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[async_trait]
impl SessionLauncher for FixtureSessionLauncher {
    async fn launch(&self, _profile: &SessionProfile) -> Result<Box<dyn CollectionSession>, AdapterError> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Err(AdapterError::Launch(format!(
                "fixture directory {} does not exist",
                self.dir.display()
            )));
        }
        Ok(Box::new(FixtureSession {
            dir: self.dir.clone(),
            cursor: None,
        }))
    }
}

pub struct FixtureSession {
    dir: PathBuf,
    cursor: Option<PageCursor>,
}

impl FixtureSession {
    async fn open(&mut self, label: &str, file: &Path) -> Result<Vec<RawTrend>, AdapterError> {
        let html = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| AdapterError::Message(format!("reading {}: {e}", file.display())))?;
        let page = extract_trend_rows(&html)?;
        rows_or_missing(&page, label)?;
        self.cursor = Some(PageCursor {
            label: label.to_string(),
            location: file.display().to_string(),
            next_href: page.next_href,
        });
        Ok(page.rows)
    }
}

#[async_trait]
impl CollectionSession for FixtureSession {
    async fn visit(&mut self, source: &SourceDescriptor) -> Result<Vec<RawTrend>, AdapterError> {
        let file = self.dir.join(format!("{}.html", label_slug(&source.label)));
        self.open(&source.label, &file).await
    }

    async fn load_more(&mut self) -> Result<Option<Vec<RawTrend>>, AdapterError> {
        let cursor = self.cursor.clone().ok_or(AdapterError::NotNavigated)?;
        let Some(href) = cursor.next_href else {
            return Ok(None);
        };
        // Only the file name is honoured so links cannot escape the fixture directory.
        let Some(name) = Path::new(&href).file_name() else {
            return Ok(None);
        };
        let file = self.dir.join(name);
        self.open(&cursor.label, &file).await.map(Some)
    }

    async fn close(&mut self) {
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
        <html><body><table><tbody>
          <tr><td><input type="checkbox"></td><td><div>Hurricane Milton</div><div>Started 5 hours ago</div></td><td><div>2M+</div><div>searches</div></td></tr>
          <tr><td>12</td><td>Lakers</td><td>50K+</td></tr>
          <tr><td>ab</td><td>500K+</td></tr>
          <tr><td>no volume here</td><td>1234</td></tr>
          <tr><td>lonely</td></tr>
        </tbody></table>
        <a rel="next" href="?page=2">More</a>
        </body></html>"#;

    #[test]
    fn extracts_term_and_volume_cells() {
        let page = extract_trend_rows(TABLE).unwrap();
        assert!(page.has_results_container);
        assert_eq!(
            page.rows,
            vec![
                RawTrend::new("Hurricane Milton", "2M+"),
                RawTrend::new("Lakers", "50K+"),
            ]
        );
        assert_eq!(page.next_href.as_deref(), Some("?page=2"));
    }

    #[test]
    fn page_without_table_has_no_results_container() {
        let page = extract_trend_rows("<html><body><p>Please wait</p></body></html>").unwrap();
        assert!(!page.has_results_container);
        assert!(rows_or_missing(&page, "Canada").is_err());
    }

    #[test]
    fn disabled_next_link_counts_as_exhausted() {
        let html = r#"<table><tbody><tr><td>storm</td><td>5K+</td></tr></tbody></table>
            <a rel="next" aria-disabled="true" href="?page=3">More</a>"#;
        let page = extract_trend_rows(html).unwrap();
        assert_eq!(page.rows.len(), 1);
        assert!(page.next_href.is_none());
    }

    #[test]
    fn user_agent_comes_from_rotation_pool() {
        for _ in 0..16 {
            assert!(USER_AGENTS.contains(&pick_user_agent()));
        }
        let profile = SessionProfile::rotated(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(profile.viewport, DEFAULT_VIEWPORT);
        assert_eq!(profile.visit_budget(), Duration::from_secs(40));
    }

    #[test]
    fn next_link_resolves_against_served_url() {
        let next = resolve_next("https://trends.test/trending?geo=CA&hours=24", "?page=2").unwrap();
        assert_eq!(next.as_str(), "https://trends.test/trending?page=2");

        let next = resolve_next("https://trends.test/a/b", "/trending/page/3").unwrap();
        assert_eq!(next.as_str(), "https://trends.test/trending/page/3");

        assert!(matches!(
            resolve_next("not a url", "?page=2"),
            Err(AdapterError::Message(_))
        ));
    }

    #[test]
    fn label_slugs_are_file_safe() {
        assert_eq!(label_slug("United States"), "united-states");
        assert_eq!(label_slug("  Global "), "global");
    }
}
