//! The crawler (C4): `WarmURL` — one HTTP GET, cache-status inspection,
//! cache-warm HEAD probing, link extraction, outcome classification.
//!
//! Link extraction reuses the teacher's cached-`Selector` pattern from
//! `service::discovery::PageDiscovery::extract_links`; outcome classification
//! is new, built directly from spec §4.4/§7.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::domain::models::CacheStatus;
use crate::error::{CrawlError, Result};

const CACHE_STATUS_HEADERS: &[&str] = &["CF-Cache-Status", "X-Cache-Status", "X-Cache"];
const MAX_DISCOVERED_LINKS: usize = 1000;
const PROBE_DELAYS: &[Duration] = &[Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)];

#[derive(Debug, Clone)]
pub struct WarmOptions {
    pub find_links: bool,
    pub referer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub status_code: u16,
    pub response_ms: u32,
    pub cache_status: CacheStatus,
    pub content_type: Option<String>,
    pub discovered_links: Vec<String>,
}

/// The narrow interface spec §9 asks for: a seam the worker pool depends
/// on by trait object rather than concrete type, so tests can substitute a
/// double without standing up a real HTTP server.
#[async_trait]
pub trait WarmsUrls: Send + Sync {
    async fn warm_url(&self, url: &Url, options: &WarmOptions, cancel: &CancellationToken) -> Result<CrawlResult>;
}

pub struct Crawler {
    client: Client,
}

#[async_trait]
impl WarmsUrls for Crawler {
    async fn warm_url(&self, url: &Url, options: &WarmOptions, cancel: &CancellationToken) -> Result<CrawlResult> {
        Crawler::warm_url(self, url, options, cancel).await
    }
}

impl Crawler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch `url`, classify the outcome, and (for a warmable miss) issue up
    /// to three HEAD probes to confirm the cache filled. Cooperates with
    /// `cancel` so a cancelled job or deadline tears the request down rather
    /// than leaving it to run to completion in the background.
    pub async fn warm_url(&self, url: &Url, options: &WarmOptions, cancel: &CancellationToken) -> Result<CrawlResult> {
        let start = Instant::now();

        let mut builder = self.client.get(url.clone());
        if let Some(referer) = &options.referer {
            builder = builder.header(reqwest::header::REFERER, referer);
        }

        let response = tokio::select! {
            result = builder.send() => result.map_err(classify_transport_error)?,
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cache_status = read_cache_status(&response);

        classify_status(status)?;

        let body = if options.find_links && is_html(&content_type) {
            tokio::select! {
                result = response.text() => Some(result.map_err(classify_transport_error)?),
                _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
            }
        } else {
            None
        };

        let discovered_links = match &body {
            Some(html) => extract_links(html, url),
            None => Vec::new(),
        };

        let response_ms = start.elapsed().as_millis() as u32;

        let cache_status = if cache_status.is_warmable() {
            self.probe_until_warm(url, cancel).await.unwrap_or(cache_status)
        } else {
            cache_status
        };

        Ok(CrawlResult {
            status_code: status.as_u16(),
            response_ms,
            cache_status,
            content_type,
            discovered_links,
        })
    }

    /// Up to 3 HEAD probes, spaced by 1s/2s/3s, stopping the moment the
    /// cache reports hot. `BYPASS`/`DYNAMIC` responses never reach here —
    /// the caller only probes on a `Miss`/`Expired` first response.
    async fn probe_until_warm(&self, url: &Url, cancel: &CancellationToken) -> Option<CacheStatus> {
        let mut last = None;
        for delay in PROBE_DELAYS {
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = cancel.cancelled() => return last,
            }

            let response = tokio::select! {
                result = self.client.head(url.clone()).send() => result.ok()?,
                _ = cancel.cancelled() => return last,
            };
            let status = read_cache_status(&response);
            last = Some(status);
            if matches!(status, CacheStatus::Hit | CacheStatus::Stale | CacheStatus::Revalidated) {
                break;
            }
        }
        last
    }
}

fn read_cache_status(response: &reqwest::Response) -> CacheStatus {
    for header_name in CACHE_STATUS_HEADERS {
        if let Some(value) = response.headers().get(*header_name).and_then(|v| v.to_str().ok()) {
            return CacheStatus::from_header_value(value);
        }
    }
    CacheStatus::None
}

fn is_html(content_type: &Option<String>) -> bool {
    content_type.as_deref().is_some_and(|ct| ct.contains("text/html"))
}

/// Map an HTTP status code to the spec §4.4 outcome taxonomy. `Ok(())` means
/// the fetch itself succeeded and the caller should proceed to inspect the
/// body/cache status.
fn classify_status(status: StatusCode) -> Result<()> {
    match status {
        s if s.is_success() || s.is_redirection() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            Err(CrawlError::Blocked(format!("status {status}")))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(CrawlError::Permanent(format!("status {status}"))),
        s if s.is_server_error() => Err(CrawlError::Transient(format!("status {status}"))),
        s => Err(CrawlError::Permanent(format!("status {s}"))),
    }
}

fn classify_transport_error(err: reqwest::Error) -> CrawlError {
    if err.is_timeout() {
        CrawlError::Timeout(err.to_string())
    } else {
        CrawlError::Transient(err.to_string())
    }
}

/// Extract absolute, same-registrable-domain links from an HTML document,
/// stripping fragments. Grounded in the teacher's
/// `PageDiscovery::extract_links` (cached `Selector`, fragment-stripping).
fn extract_links(html: &str, base_url: &Url) -> Vec<String> {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    let selector = SELECTOR.get_or_init(|| Selector::parse("a[href]").unwrap());

    let base_host = base_url.host_str();

    Html::parse_document(html)
        .select(selector)
        .filter_map(|a| a.value().attr("href"))
        .filter(|raw| !raw.starts_with('#'))
        .filter_map(|raw| base_url.join(raw).ok())
        .filter(|link| link.host_str() == base_host)
        .map(|mut u| {
            u.set_fragment(None);
            u.to_string()
        })
        .take(MAX_DISCOVERED_LINKS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_same_host_links_and_strips_fragments() {
        let base_url = Url::parse("https://example.com").unwrap();
        let html = r##"
            <html><body>
                <a href="/relative">Relative</a>
                <a href="https://other.com/absolute">Off-site</a>
                <a href="#fragment">Fragment Only</a>
                <a href="/page#section">Page with Fragment</a>
            </body></html>
        "##;
        let links = extract_links(html, &base_url);
        assert_eq!(links.len(), 2);
        assert!(links.contains(&"https://example.com/relative".to_string()));
        assert!(links.contains(&"https://example.com/page".to_string()));
        assert!(!links.iter().any(|l| l.contains("other.com")));
    }

    #[test]
    fn classifies_status_codes_per_taxonomy() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(matches!(classify_status(StatusCode::FORBIDDEN), Err(CrawlError::Blocked(_))));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS), Err(CrawlError::Blocked(_))));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), Err(CrawlError::Permanent(_))));
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY), Err(CrawlError::Transient(_))));
    }

    #[tokio::test]
    async fn warm_url_reports_cache_status_from_header() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("CF-Cache-Status", "DYNAMIC")
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create_async()
            .await;

        let client = Client::new();
        let crawler = Crawler::new(client);
        let url = Url::parse(&server.url()).unwrap();
        let cancel = CancellationToken::new();

        let result = crawler
            .warm_url(&url, &WarmOptions { find_links: false, referer: None }, &cancel)
            .await
            .unwrap();

        assert_eq!(result.status_code, 200);
        assert_eq!(result.cache_status, CacheStatus::Dynamic);
    }

    #[tokio::test]
    async fn warm_url_fails_blocked_on_429() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/").with_status(429).create_async().await;

        let client = Client::new();
        let crawler = Crawler::new(client);
        let url = Url::parse(&server.url()).unwrap();
        let cancel = CancellationToken::new();

        let result = crawler
            .warm_url(&url, &WarmOptions { find_links: false, referer: None }, &cancel)
            .await;

        assert!(matches!(result, Err(CrawlError::Blocked(_))));
    }
}
