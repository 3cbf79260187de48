//! Source adapter contracts, page loaders and the per-site event adapters.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use evscrape_core::{Event, ValidationError};
use evscrape_storage::{FetchError, PageFetcher};
use scraper::{ElementRef, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use evscrape_storage::FetchedPage;

mod iloveqatar;
mod qatar_museums;
mod visit_qatar;

pub use iloveqatar::{split_date_time, DateTimeParts, ILoveQatar};
pub use qatar_museums::QatarMuseums;
pub use visit_qatar::VisitQatar;

pub const CRATE_NAME: &str = "evscrape-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no fixture page registered for {0}")]
    MissingFixture(String),
    #[error("{source_id}: none of {attempted} listing page(s) could be loaded and parsed")]
    NoPages { source_id: String, attempted: usize },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// What one listing page yields: events complete on the listing itself,
/// detail pages still to visit, and the total page count when the site
/// advertises one.
#[derive(Debug, Default)]
pub struct ListingPage {
    pub events: Vec<Event>,
    pub detail_urls: Vec<String>,
    pub page_count: Option<usize>,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;

    fn listing_url(&self, page: usize) -> String;

    fn parse_listing(&self, page: &FetchedPage) -> Result<ListingPage, AdapterError>;

    fn parse_detail(&self, _page: &FetchedPage) -> Result<Option<Event>, AdapterError> {
        Ok(None)
    }
}

#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, source_id: &str, url: &str) -> Result<FetchedPage, AdapterError>;
}

pub struct HttpPageLoader {
    fetcher: PageFetcher,
}

impl HttpPageLoader {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl PageLoader for HttpPageLoader {
    async fn load(&self, source_id: &str, url: &str) -> Result<FetchedPage, AdapterError> {
        Ok(self.fetcher.fetch_page(source_id, url).await?)
    }
}

#[derive(Debug, Deserialize)]
struct FixtureManifest {
    #[serde(default)]
    pages: Vec<FixtureManifestPage>,
}

#[derive(Debug, Deserialize)]
struct FixtureManifestPage {
    url: String,
    file: String,
}

/// Serves pages from disk, keyed by URL, for offline runs and tests.
#[derive(Debug, Default, Clone)]
pub struct FixturePageLoader {
    pages: HashMap<String, PathBuf>,
}

impl FixturePageLoader {
    /// Reads a `pages.yaml` manifest; `file` entries resolve relative to it.
    pub fn from_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let manifest: FixtureManifest =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self {
            pages: manifest
                .pages
                .into_iter()
                .map(|p| (p.url, base.join(p.file)))
                .collect(),
        })
    }

    pub fn with_page(mut self, url: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        self.pages.insert(url.into(), file.into());
        self
    }
}

#[async_trait]
impl PageLoader for FixturePageLoader {
    async fn load(&self, _source_id: &str, url: &str) -> Result<FetchedPage, AdapterError> {
        let path = self
            .pages
            .get(url)
            .ok_or_else(|| AdapterError::MissingFixture(url.to_string()))?;
        let body = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Ok(FetchedPage::from_text(url, body))
    }
}

/// Walks an adapter's listing pages (and their detail pages) up to `max_pages`.
///
/// Individual page and item failures are logged and skipped. The adapter
/// only fails as a whole when no listing page could be loaded and parsed.
pub async fn collect_events(
    adapter: &dyn SourceAdapter,
    loader: &dyn PageLoader,
    max_pages: usize,
) -> Result<Vec<Event>, AdapterError> {
    let source_id = adapter.source_id();
    let mut events = Vec::new();
    let mut page_limit: Option<usize> = None;
    let mut attempted = 0usize;
    let mut parsed = 0usize;

    for page_no in 1..=max_pages.max(1) {
        if page_limit.is_some_and(|limit| page_no > limit) {
            debug!(source_id, page_no, "reached last advertised listing page");
            break;
        }
        let url = adapter.listing_url(page_no);
        attempted += 1;

        let page = match loader.load(source_id, &url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(source_id, page_no, %url, error = %err, "listing page could not be loaded");
                continue;
            }
        };
        let listing = match adapter.parse_listing(&page) {
            Ok(listing) => listing,
            Err(err) => {
                warn!(source_id, page_no, %url, error = %err, "listing page could not be parsed");
                continue;
            }
        };
        parsed += 1;
        if listing.page_count.is_some() {
            page_limit = listing.page_count;
        }
        events.extend(listing.events);

        for detail_url in listing.detail_urls {
            let detail = match loader.load(source_id, &detail_url).await {
                Ok(detail) => detail,
                Err(err) => {
                    warn!(source_id, url = %detail_url, error = %err, "detail page could not be loaded");
                    continue;
                }
            };
            match adapter.parse_detail(&detail) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => {
                    warn!(source_id, url = %detail_url, error = %err, "detail page could not be parsed");
                }
            }
        }
    }

    if parsed == 0 {
        return Err(AdapterError::NoPages {
            source_id: source_id.to_string(),
            attempted,
        });
    }
    info!(source_id, events = events.len(), pages = parsed, "source collected");
    Ok(events)
}

pub fn all_adapters() -> Vec<Box<dyn SourceAdapter>> {
    vec![Box::new(ILoveQatar), Box::new(QatarMuseums), Box::new(VisitQatar)]
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    all_adapters()
        .into_iter()
        .find(|adapter| adapter.source_id() == source_id)
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector `{css}`: {e}")))
}

pub(crate) fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn inner_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn first_element<'a>(
    scope: ElementRef<'a>,
    css: &str,
) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next())
}

pub(crate) fn all_elements<'a>(scope: ElementRef<'a>, css: &str) -> Result<Vec<ElementRef<'a>>, AdapterError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).collect())
}

pub(crate) fn first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    Ok(first_element(scope, css)?.and_then(|el| text_or_none(inner_text(el))))
}

pub(crate) fn first_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    Ok(first_element(scope, css)?
        .and_then(|el| el.value().attr(attr))
        .and_then(|v| text_or_none(v.to_string())))
}

pub(crate) fn strip_label(text: &str, label: &str) -> String {
    let text = text.trim();
    text.strip_prefix(label).unwrap_or(text).trim().to_string()
}

pub(crate) fn absolute_url(base: &str, href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base_url = reqwest::Url::parse(base).ok()?;
    base_url.join(href).ok().map(|u| u.to_string())
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| text_or_none(s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evscrape_core::EventFields;

    struct PagedAdapter;

    impl SourceAdapter for PagedAdapter {
        fn source_id(&self) -> &'static str {
            "paged"
        }

        fn display_name(&self) -> &'static str {
            "Paged"
        }

        fn listing_url(&self, page: usize) -> String {
            format!("https://paged.test/list/{page}")
        }

        fn parse_listing(&self, page: &FetchedPage) -> Result<ListingPage, AdapterError> {
            if page.body == "garbage" {
                return Err(AdapterError::Message("unparseable".into()));
            }
            let event = Event::new(EventFields {
                title: Some(page.body.clone()),
                start_date: Some("1 Jan".into()),
                source: Some("paged".into()),
                ..Default::default()
            })?;
            Ok(ListingPage {
                events: vec![event],
                detail_urls: vec!["https://paged.test/missing-detail".into()],
                page_count: Some(2),
            })
        }
    }

    struct MapLoader(HashMap<String, String>);

    #[async_trait]
    impl PageLoader for MapLoader {
        async fn load(&self, _source_id: &str, url: &str) -> Result<FetchedPage, AdapterError> {
            self.0
                .get(url)
                .map(|body| FetchedPage::from_text(url, body.clone()))
                .ok_or_else(|| AdapterError::MissingFixture(url.to_string()))
        }
    }

    fn loader(pages: &[(&str, &str)]) -> MapLoader {
        MapLoader(
            pages
                .iter()
                .map(|(u, b)| (u.to_string(), b.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn driver_stops_at_advertised_page_count_and_skips_failed_details() {
        let pages = loader(&[
            ("https://paged.test/list/1", "first"),
            ("https://paged.test/list/2", "second"),
            ("https://paged.test/list/3", "third"),
        ]);
        let events = collect_events(&PagedAdapter, &pages, 10).await.unwrap();
        let titles = events.iter().map(|e| e.title()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn driver_skips_bad_pages_but_keeps_good_ones() {
        let pages = loader(&[
            ("https://paged.test/list/1", "garbage"),
            ("https://paged.test/list/2", "second"),
        ]);
        let events = collect_events(&PagedAdapter, &pages, 2).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn driver_fails_when_no_listing_page_loads() {
        let err = collect_events(&PagedAdapter, &loader(&[]), 3).await.unwrap_err();
        assert!(matches!(err, AdapterError::NoPages { attempted: 3, .. }));
    }

    #[test]
    fn registry_knows_every_adapter() {
        for id in ["iloveqatar", "qmuseums", "visitqatar"] {
            assert_eq!(adapter_for_source(id).map(|a| a.source_id()), Some(id));
        }
        assert!(adapter_for_source("nope").is_none());
    }

    #[test]
    fn url_and_label_helpers() {
        assert_eq!(
            absolute_url("https://qm.org.qa/en/calendar/?page=1", "/en/visit/x").as_deref(),
            Some("https://qm.org.qa/en/visit/x")
        );
        assert_eq!(strip_label("Date: 25 December 2023", "Date:"), "25 December 2023");
        assert_eq!(strip_label("25 December", "Date:"), "25 December");
        assert_eq!(clean_text("  a \n\t b  "), "a b");
    }
}
