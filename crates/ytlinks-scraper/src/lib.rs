//! Channel resolution and social-link extraction against a render backend.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use ytlinks_core::{normalize_platform, PlatformLink, ResolvedChannel};
use ytlinks_render::{release_session, BackoffPolicy, RenderBackend, RenderError, RenderSession};

pub const CRATE_NAME: &str = "ytlinks-scraper";

pub const DEFAULT_PLATFORM_ROOT: &str = "https://www.youtube.com";

const SEARCH_RESULT_SELECTOR: &str = r#"a[href*="/@"]"#;
const MORE_BUTTON_SELECTOR: &str = "tp-yt-paper-button";
const DESCRIPTION_LINK_SELECTOR: &str = "#description a";
const LINK_ENTRY_SELECTOR: &str = "#links-section yt-channel-external-link-view-model";
const LINK_ENTRY_TITLE_SELECTOR: &str = ".ytChannelExternalLinkViewModelTitle";
const LINK_ENTRY_ANCHOR_SELECTOR: &str = "a";

/// Decides whether a loaded page is the platform's "no such channel" page.
pub trait NotFoundSignature: Send + Sync {
    fn is_not_found(&self, title: &str, page_source: &str) -> bool;
}

/// Substring markers checked against the page title and the raw markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSignature {
    #[serde(default)]
    pub title_markers: Vec<String>,
    #[serde(default)]
    pub body_markers: Vec<String>,
}

impl Default for MarkerSignature {
    fn default() -> Self {
        Self {
            title_markers: vec!["404".to_string()],
            body_markers: vec!["This channel".to_string()],
        }
    }
}

impl NotFoundSignature for MarkerSignature {
    fn is_not_found(&self, title: &str, page_source: &str) -> bool {
        self.title_markers.iter().any(|m| title.contains(m.as_str()))
            || self.body_markers.iter().any(|m| page_source.contains(m.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct ScraperSettings {
    pub platform_root: String,
    /// Wait after a navigation before scanning, for remote rendering to finish.
    pub settle_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            platform_root: DEFAULT_PLATFORM_ROOT.to_string(),
            settle_delay: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ScraperSettings {
    fn root(&self) -> &str {
        self.platform_root.trim_end_matches('/')
    }
}

/// Trim and drop all whitespace: `" Real Channel "` becomes `RealChannel`.
pub fn normalize_alias(alias: &str) -> String {
    alias.split_whitespace().collect()
}

pub fn profile_url(platform_root: &str, alias: &str) -> String {
    format!(
        "{}/@{}",
        platform_root.trim_end_matches('/'),
        normalize_alias(alias)
    )
}

pub fn search_url(platform_root: &str, alias: &str) -> Result<String, RenderError> {
    let base = format!("{}/results", platform_root.trim_end_matches('/'));
    Url::parse_with_params(&base, &[("search_query", alias)])
        .map(String::from)
        .map_err(|source| RenderError::InvalidUrl { url: base, source })
}

/// Resolve root-relative hrefs against the platform root; others pass through.
pub fn absolutize(href: &str, platform_root: &str) -> String {
    if !href.starts_with('/') {
        return href.to_string();
    }
    Url::parse(platform_root)
        .and_then(|root| root.join(href))
        .map(String::from)
        .unwrap_or_else(|_| format!("{}{}", platform_root.trim_end_matches('/'), href))
}

/// Unwrap a redirect-wrapper link to the target carried in its `q`
/// parameter. Anything else, including unparseable wrappers, is returned
/// unchanged.
pub fn unwrap_redirect(url: &str) -> String {
    if !url.contains("redirect") {
        return url.to_string();
    }
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .query_pairs()
                .find(|(key, _)| key == "q")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|target| !target.is_empty())
        .unwrap_or_else(|| url.to_string())
}

pub struct ChannelResolver {
    backend: Arc<dyn RenderBackend>,
    settings: ScraperSettings,
    signature: Arc<dyn NotFoundSignature>,
}

impl ChannelResolver {
    pub fn new(backend: Arc<dyn RenderBackend>, settings: ScraperSettings) -> Self {
        Self {
            backend,
            settings,
            signature: Arc::new(MarkerSignature::default()),
        }
    }

    pub fn with_signature(mut self, signature: Arc<dyn NotFoundSignature>) -> Self {
        self.signature = signature;
        self
    }

    /// Resolve an alias to a channel URL. Never fails: exhausted retries
    /// come back as [`ResolvedChannel::Error`].
    pub async fn resolve(&self, alias: &str) -> ResolvedChannel {
        let span = info_span!("resolve_channel", alias);
        self.resolve_with_retries(alias).instrument(span).await
    }

    async fn resolve_with_retries(&self, alias: &str) -> ResolvedChannel {
        if normalize_alias(alias).is_empty() {
            warn!("blank alias, nothing to resolve");
            return ResolvedChannel::NotFound;
        }

        let max_attempts = self.settings.backoff.max_retries;
        let mut failures = 0usize;
        while failures < max_attempts {
            match self.attempt(alias).await {
                Ok(resolved) => return resolved,
                Err(err) => {
                    failures += 1;
                    error!(
                        attempt = failures,
                        max_attempts,
                        error = %err,
                        "resolution attempt failed"
                    );
                    if failures < max_attempts {
                        let delay = self.settings.backoff.delay_for_attempt(failures);
                        info!(delay_ms = delay.as_millis() as u64, "retrying resolution");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(max_attempts, "resolution retries exhausted");
        ResolvedChannel::Error
    }

    async fn attempt(&self, alias: &str) -> Result<ResolvedChannel, RenderError> {
        let mut session = self.backend.open_session().await?;
        let outcome = self.probe(session.as_mut(), alias).await;
        release_session(session).await;
        outcome
    }

    async fn probe(
        &self,
        session: &mut dyn RenderSession,
        alias: &str,
    ) -> Result<ResolvedChannel, RenderError> {
        let root = self.settings.root();
        let guess = profile_url(root, alias);

        match session.navigate(&guess).await {
            Ok(()) if !self.signature.is_not_found(&session.title(), session.page_source()) => {
                info!(channel_url = %guess, "found channel at direct url");
                return Ok(ResolvedChannel::Found(guess));
            }
            Ok(()) => debug!(url = %guess, "direct url is a not-found page"),
            Err(err) => debug!(url = %guess, error = %err, "direct url failed to load"),
        }

        info!("direct url missed, falling back to search");
        let search = search_url(root, alias)?;
        if let Err(err) = session.navigate(&search).await {
            warn!(url = %search, error = %err, "search page failed to load, channel not found");
            return Ok(ResolvedChannel::NotFound);
        }
        tokio::time::sleep(self.settings.settle_delay).await;

        let found = session
            .locate(SEARCH_RESULT_SELECTOR)
            .iter()
            .filter_map(|el| session.attribute(el, "href"))
            .find(|href| href.contains("/@"));

        match found {
            Some(href) => {
                let channel_url = absolutize(&href, root);
                info!(channel_url = %channel_url, "found channel via search");
                Ok(ResolvedChannel::Found(channel_url))
            }
            None => {
                warn!("channel not found");
                Ok(ResolvedChannel::NotFound)
            }
        }
    }
}

pub struct LinkExtractor {
    backend: Arc<dyn RenderBackend>,
    settings: ScraperSettings,
}

impl LinkExtractor {
    pub fn new(backend: Arc<dyn RenderBackend>, settings: ScraperSettings) -> Self {
        Self { backend, settings }
    }

    /// Collect platform links from a channel's description and its
    /// official-links section. Never fails: whatever was gathered before a
    /// problem is returned.
    pub async fn extract(&self, channel_url: &str) -> Vec<PlatformLink> {
        let span = info_span!("extract_links", channel_url);
        self.extract_inner(channel_url).instrument(span).await
    }

    async fn extract_inner(&self, channel_url: &str) -> Vec<PlatformLink> {
        let mut session = match self.backend.open_session().await {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "could not open session");
                return Vec::new();
            }
        };

        let mut links = Vec::new();
        self.collect(session.as_mut(), channel_url, &mut links).await;
        release_session(session).await;

        info!(links = links.len(), "extracted links");
        links
    }

    async fn collect(
        &self,
        session: &mut dyn RenderSession,
        channel_url: &str,
        links: &mut Vec<PlatformLink>,
    ) {
        let base = channel_url.trim_end_matches('/');

        let featured = format!("{base}/featured");
        if let Err(err) = session.navigate(&featured).await {
            warn!(url = %featured, error = %err, "featured page failed to load");
            return;
        }

        self.expand_description(session).await;

        for anchor in session.locate(DESCRIPTION_LINK_SELECTOR) {
            let text = session.text(&anchor);
            let href = session.attribute(&anchor, "href");
            if let Some(link) = self.classify(&text, href) {
                links.push(link);
            }
        }
        debug!(links = links.len(), "description scanned");

        let about = format!("{base}/about");
        if let Err(err) = session.navigate(&about).await {
            warn!(url = %about, error = %err, "about page failed to load");
            return;
        }
        tokio::time::sleep(self.settings.settle_delay).await;

        for entry in session.locate(LINK_ENTRY_SELECTOR) {
            let Some(title) = session
                .locate_within(&entry, LINK_ENTRY_TITLE_SELECTOR)
                .into_iter()
                .next()
            else {
                debug!("link entry without title, skipping");
                continue;
            };
            let Some(anchor) = session
                .locate_within(&entry, LINK_ENTRY_ANCHOR_SELECTOR)
                .into_iter()
                .next()
            else {
                debug!("link entry without anchor, skipping");
                continue;
            };
            let text = session.text(&title);
            let href = session.attribute(&anchor, "href");
            if let Some(link) = self.classify(&text, href) {
                links.push(link);
            }
        }
    }

    async fn expand_description(&self, session: &mut dyn RenderSession) {
        let button = session
            .locate(MORE_BUTTON_SELECTOR)
            .into_iter()
            .find(|el| session.text(el).to_lowercase().contains("more"));
        let Some(button) = button else {
            return;
        };
        if session.click(&button).await {
            tokio::time::sleep(self.settings.settle_delay).await;
        } else {
            debug!("description expand click did nothing");
        }
    }

    fn classify(&self, text: &str, href: Option<String>) -> Option<PlatformLink> {
        let href = href.filter(|h| !h.trim().is_empty())?;
        let url = unwrap_redirect(&absolutize(href.trim(), self.settings.root()));
        let platform = normalize_platform(text, &url)?;
        Some(PlatformLink { platform, url })
    }
}
