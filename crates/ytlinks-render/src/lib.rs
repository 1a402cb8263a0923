//! Render backend seam: browsing sessions over rendered HTML snapshots.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "ytlinks-render";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no fixture page for {url}")]
    MissingPage { url: String },
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("session error: {0}")]
    Session(String),
}

/// Owned snapshot of one element from a rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageElement {
    tag: String,
    text: String,
    attributes: BTreeMap<String, String>,
    html: String,
}

impl PageElement {
    fn from_element(element: ElementRef<'_>) -> Self {
        let text = element
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            tag: element.value().name().to_string(),
            text,
            attributes: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            html: element.html(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Visible text with whitespace collapsed.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn outer_html(&self) -> &str {
        &self.html
    }
}

/// Factory for isolated browsing sessions.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError>;
}

/// One browsing session. Lookups are fail-soft: a bad selector or a
/// missing page yields nothing rather than an error.
#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;

    fn current_url(&self) -> Option<&str>;

    fn title(&self) -> String;

    fn page_source(&self) -> &str;

    fn locate(&self, selector: &str) -> Vec<PageElement>;

    fn locate_within(&self, parent: &PageElement, selector: &str) -> Vec<PageElement>;

    fn text(&self, element: &PageElement) -> String {
        element.text().to_string()
    }

    fn attribute(&self, element: &PageElement, name: &str) -> Option<String> {
        element.attribute(name).map(ToString::to_string)
    }

    async fn click(&mut self, element: &PageElement) -> bool;

    async fn close(&mut self) -> Result<(), RenderError>;
}

/// Close a session, logging rather than propagating a failed teardown.
pub async fn release_session(mut session: Box<dyn RenderSession>) {
    let url = session.current_url().map(ToString::to_string);
    match session.close().await {
        Ok(()) => debug!(url = url.as_deref(), "session closed"),
        Err(err) => warn!(url = url.as_deref(), error = %err, "failed to close session"),
    }
}

/// Where rendered HTML comes from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, RenderError>;
}

/// Backend whose sessions hold rendered HTML snapshots fetched from a [`PageSource`].
#[derive(Debug)]
pub struct HtmlBackend<S> {
    source: Arc<S>,
}

impl<S> HtmlBackend<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }
}

#[async_trait]
impl<S: PageSource + 'static> RenderBackend for HtmlBackend<S> {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        Ok(Box::new(HtmlSession {
            source: Arc::clone(&self.source),
            page: None,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct LoadedPage {
    url: String,
    html: String,
}

pub struct HtmlSession<S> {
    source: Arc<S>,
    page: Option<LoadedPage>,
    closed: bool,
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(err) => {
            warn!(selector, error = %err, "invalid selector");
            None
        }
    }
}

fn select_elements(document: &Html, selector: &str) -> Vec<PageElement> {
    let Some(sel) = parse_selector(selector) else {
        return Vec::new();
    };
    document.select(&sel).map(PageElement::from_element).collect()
}

#[async_trait]
impl<S: PageSource + 'static> RenderSession for HtmlSession<S> {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        if self.closed {
            return Err(RenderError::Session("navigate on a closed session".to_string()));
        }
        self.page = None;
        let html = self.source.fetch_html(url).await?;
        self.page = Some(LoadedPage {
            url: url.to_string(),
            html,
        });
        Ok(())
    }

    fn current_url(&self) -> Option<&str> {
        self.page.as_ref().map(|p| p.url.as_str())
    }

    fn title(&self) -> String {
        self.locate("title")
            .into_iter()
            .next()
            .map(|el| el.text().to_string())
            .unwrap_or_default()
    }

    fn page_source(&self) -> &str {
        self.page.as_ref().map(|p| p.html.as_str()).unwrap_or_default()
    }

    fn locate(&self, selector: &str) -> Vec<PageElement> {
        let Some(page) = &self.page else {
            return Vec::new();
        };
        select_elements(&Html::parse_document(&page.html), selector)
    }

    fn locate_within(&self, parent: &PageElement, selector: &str) -> Vec<PageElement> {
        select_elements(&Html::parse_fragment(parent.outer_html()), selector)
    }

    /// Snapshots have no live DOM: a click is acknowledged when a page is
    /// loaded, and the content is already fully rendered.
    async fn click(&mut self, element: &PageElement) -> bool {
        let loaded = self.page.is_some() && !self.closed;
        debug!(tag = element.tag(), loaded, "click on snapshot element");
        loaded
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        if self.closed {
            return Err(RenderError::Session("session already closed".to_string()));
        }
        self.closed = true;
        self.page = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct BrowserlessConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub headless: bool,
    pub page_load_timeout: Duration,
}

impl Default for BrowserlessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            token: None,
            headless: true,
            page_load_timeout: Duration::from_secs(15),
        }
    }
}

/// Fetches fully rendered HTML through the Browserless `/content` API.
/// Every call runs in its own remote browser context.
#[derive(Debug)]
pub struct BrowserlessSource {
    client: reqwest::Client,
    endpoint: Url,
    page_load_timeout: Duration,
}

pub fn content_endpoint(config: &BrowserlessConfig) -> Result<Url, RenderError> {
    let raw = format!("{}/content", config.base_url.trim_end_matches('/'));
    let mut endpoint = Url::parse(&raw).map_err(|source| RenderError::InvalidUrl {
        url: raw.clone(),
        source,
    })?;
    {
        let mut query = endpoint.query_pairs_mut();
        if let Some(token) = &config.token {
            query.append_pair("token", token);
        }
        query.append_pair(
            "launch",
            &serde_json::json!({ "headless": config.headless }).to_string(),
        );
    }
    Ok(endpoint)
}

impl BrowserlessSource {
    pub fn new(config: &BrowserlessConfig) -> Result<Self, RenderError> {
        // Leave headroom over the in-browser navigation timeout for the render itself.
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.page_load_timeout + Duration::from_secs(15))
            .build()?;
        let endpoint = content_endpoint(config)?;
        info!(
            base_url = %config.base_url,
            headless = config.headless,
            "browserless source initialized"
        );
        Ok(Self {
            client,
            endpoint,
            page_load_timeout: config.page_load_timeout,
        })
    }
}

#[async_trait]
impl PageSource for BrowserlessSource {
    async fn fetch_html(&self, url: &str) -> Result<String, RenderError> {
        let body = serde_json::json!({
            "url": url,
            "gotoOptions": {
                "timeout": self.page_load_timeout.as_millis() as u64,
                "waitUntil": "networkidle2",
            },
        });

        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RenderError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let html = resp.text().await?;
        info!(url, bytes = html.len(), fetcher = "browserless", "fetched rendered page");
        Ok(html)
    }
}

/// Fixture manifest describing a captured set of rendered pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteManifest {
    pub fixture_id: String,
    pub captured_from_url: String,
    pub pages: Vec<SitePage>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitePage {
    pub url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_html: Option<String>,
}

/// In-memory page source keyed by URL; unknown URLs fail to load.
#[derive(Debug, Clone, Default)]
pub struct StaticSite {
    pages: HashMap<String, String>,
}

fn page_key(url: &str) -> &str {
    url.trim_end_matches('/')
}

impl StaticSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, html: impl Into<String>) -> Self {
        self.insert(url, html);
        self
    }

    pub fn insert(&mut self, url: &str, html: impl Into<String>) {
        self.pages.insert(page_key(url).to_string(), html.into());
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Load `site.json` from a fixture directory, reading any page bodies
    /// referenced by relative path.
    pub fn load_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let manifest_path = dir.as_ref().join("site.json");
        let manifest = load_site_manifest(&manifest_path)?;
        let base = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut site = Self::new();
        for page in &manifest.pages {
            let html = match (&page.inline_html, &page.path) {
                (Some(inline), _) => inline.clone(),
                (None, Some(rel_path)) => {
                    let raw_path = base.join(rel_path);
                    fs::read_to_string(&raw_path)
                        .with_context(|| format!("reading fixture page {}", raw_path.display()))?
                }
                (None, None) => {
                    anyhow::bail!("fixture page {} has neither path nor inline_html", page.url)
                }
            };
            site.insert(&page.url, html);
        }
        info!(
            fixture_id = %manifest.fixture_id,
            pages = site.len(),
            "loaded fixture site"
        );
        Ok(site)
    }
}

pub fn load_site_manifest(path: impl AsRef<Path>) -> anyhow::Result<SiteManifest> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl PageSource for StaticSite {
    async fn fetch_html(&self, url: &str) -> Result<String, RenderError> {
        self.pages
            .get(page_key(url))
            .cloned()
            .ok_or_else(|| RenderError::MissingPage {
                url: url.to_string(),
            })
    }
}
