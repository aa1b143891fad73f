//! Sitemap/link discovery orchestration (C5): `Discover`.
//!
//! Ties robots.txt parsing, sitemap streaming (with early termination at
//! `max_pages`), include/exclude glob filtering, and a homepage fallback
//! together, then hands the resulting pages to the task queue via
//! `TaskRepository::enqueue_batch`. Generalises the teacher's
//! `PageDiscovery::discover` BFS (which followed links from a start URL)
//! into a sitemap-driven discoverer; link-following survives as C4's
//! `find_links` path, which re-enqueues through the same queue instead of
//! walking in-process.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use glob::Pattern;
use reqwest::Client;
use url::Url;
use uuid::Uuid;

use crate::domain::models::{NewPage, SourceType};
use crate::repository::domain_repository::DomainRepository;
use crate::repository::task_repository::{EnqueueItem, TaskRepository};
use crate::service::robots::{self, RobotsPolicy};
use crate::service::sitemap::{self, SitemapEntry};

const ENQUEUE_BATCH_SIZE: usize = 200;
/// Sitemaps nested inside a sitemap index this deep are not followed
/// further; real-world indexes are rarely more than one level deep.
const MAX_SITEMAP_INDEX_DEPTH: usize = 3;

pub struct DiscoveryOptions {
    pub max_pages: i32,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

pub struct Discoverer {
    client: Client,
    user_agent: String,
}

impl Discoverer {
    pub fn new(client: Client, user_agent: String) -> Self {
        Self { client, user_agent }
    }

    /// Discover URLs for `base_url` and enqueue them onto `job_id`. Returns
    /// the number of tasks actually created.
    pub async fn discover(
        &self,
        task_repo: &TaskRepository,
        domain_repo: &DomainRepository,
        job_id: Uuid,
        domain_id: Uuid,
        base_url: &Url,
        options: &DiscoveryOptions,
    ) -> Result<i64> {
        let policy = robots::fetch_robots(&self.client, base_url, &self.user_agent).await;

        if let Err(e) = domain_repo
            .update_robots(
                domain_id,
                &policy.raw,
                &policy.sitemap_urls,
                &policy.disallows,
                policy.crawl_delay_seconds,
            )
            .await
        {
            log::warn!("failed to persist robots policy for domain {domain_id}: {e:#}");
        }

        let mut sitemap_urls: VecDeque<String> = policy.sitemap_urls.iter().cloned().collect();
        if sitemap_urls.is_empty() {
            let default = base_url.join("/sitemap.xml").context("failed to build default sitemap URL")?;
            sitemap_urls.push_back(default.to_string());
        }

        let include = compile_patterns(&options.include_paths);
        let exclude = compile_patterns(&options.exclude_paths);

        let mut batch: Vec<EnqueueItem> = Vec::new();
        let mut enqueued_total: i64 = 0;
        let mut depth = 0usize;

        'sitemaps: while let Some(sitemap_url) = sitemap_urls.pop_front() {
            if enqueued_total >= options.max_pages as i64 {
                break;
            }
            let Ok(url) = Url::parse(&sitemap_url) else { continue };
            let Ok(text) = sitemap::fetch(&self.client, &url).await else { continue };

            if sitemap::SitemapFormat::detect(&text) == sitemap::SitemapFormat::PlainText {
                for loc in sitemap::extract_plain_text_urls(&text) {
                    if enqueued_total + batch.len() as i64 >= options.max_pages as i64 {
                        break 'sitemaps;
                    }
                    if let Some(item) = self.build_item(&loc, base_url, &policy, &include, &exclude, SourceType::Sitemap) {
                        batch.push(item);
                    }
                }
                enqueued_total += self
                    .flush_batch(task_repo, job_id, domain_id, &mut batch, false)
                    .await?;
                continue;
            }

            let mut nested = Vec::new();
            let budget_remaining = (options.max_pages as i64 - enqueued_total).max(0) as usize;
            sitemap::stream_xml(&text, |entry| {
                match entry {
                    SitemapEntry::Url { loc, priority } => {
                        if let Some(item) =
                            self.build_item_with_priority(&loc, priority, base_url, &policy, &include, &exclude, SourceType::Sitemap)
                        {
                            batch.push(item);
                        }
                    }
                    SitemapEntry::NestedSitemap(loc) => {
                        if depth < MAX_SITEMAP_INDEX_DEPTH {
                            nested.push(loc);
                        }
                    }
                }
                batch.len() < budget_remaining.max(ENQUEUE_BATCH_SIZE)
            });

            enqueued_total += self
                .flush_batch(task_repo, job_id, domain_id, &mut batch, false)
                .await?;

            if !nested.is_empty() {
                depth += 1;
                for loc in nested {
                    sitemap_urls.push_back(loc);
                }
            }
        }

        // End of discovery: whatever survived filtering but didn't fill a
        // full batch must still be enqueued, not dropped on the floor.
        enqueued_total += self
            .flush_batch(task_repo, job_id, domain_id, &mut batch, true)
            .await?;

        if enqueued_total == 0 {
            enqueued_total = self.enqueue_homepage_fallback(task_repo, job_id, domain_id, base_url).await?;
        }

        Ok(enqueued_total)
    }

    fn build_item(
        &self,
        loc: &str,
        base_url: &Url,
        policy: &RobotsPolicy,
        include: &[Pattern],
        exclude: &[Pattern],
        source: SourceType,
    ) -> Option<EnqueueItem> {
        self.build_item_with_priority(loc, None, base_url, policy, include, exclude, source)
    }

    fn build_item_with_priority(
        &self,
        loc: &str,
        priority: Option<f64>,
        base_url: &Url,
        policy: &RobotsPolicy,
        include: &[Pattern],
        exclude: &[Pattern],
        source: SourceType,
    ) -> Option<EnqueueItem> {
        let url = Url::parse(loc).ok()?;
        if url.host_str() != base_url.host_str() {
            return None;
        }
        let path = url.path().to_string();

        if robots::is_disallowed(policy, &path) {
            return None;
        }
        if !include.is_empty() && !include.iter().any(|p| p.matches(&path)) {
            return None;
        }
        if exclude.iter().any(|p| p.matches(&path)) {
            return None;
        }

        Some(EnqueueItem {
            page: NewPage {
                path,
                priority_score: priority.unwrap_or(0.5).clamp(0.0, 1.0),
                discovered_from: source,
            },
            source_url: Some(loc.to_string()),
        })
    }

    /// Flush `batch` once it reaches `ENQUEUE_BATCH_SIZE`, or unconditionally
    /// when `force` is set (the end-of-run drain, where a partial remainder
    /// must not be silently dropped).
    async fn flush_batch(
        &self,
        task_repo: &TaskRepository,
        job_id: Uuid,
        domain_id: Uuid,
        batch: &mut Vec<EnqueueItem>,
        force: bool,
    ) -> Result<i64> {
        if batch.is_empty() {
            return Ok(0);
        }
        if !force && batch.len() < ENQUEUE_BATCH_SIZE {
            return Ok(0);
        }
        let items = std::mem::take(batch);
        task_repo.enqueue_batch(job_id, domain_id, items).await
    }

    async fn enqueue_homepage_fallback(
        &self,
        task_repo: &TaskRepository,
        job_id: Uuid,
        domain_id: Uuid,
        base_url: &Url,
    ) -> Result<i64> {
        log::info!("no sitemap URLs survived filtering for job {job_id}, falling back to homepage");
        let item = EnqueueItem {
            page: NewPage {
                path: "/".to_string(),
                priority_score: 0.5,
                discovered_from: SourceType::Fallback,
            },
            source_url: Some(base_url.to_string()),
        };
        task_repo.enqueue_batch(job_id, domain_id, vec![item]).await
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_item_rejects_off_host_and_disallowed_paths() {
        let discoverer = Discoverer::new(Client::new(), "CacheWarmerBot".into());
        let base = Url::parse("https://example.com").unwrap();
        let policy = RobotsPolicy {
            raw: String::new(),
            sitemap_urls: vec![],
            disallows: vec!["/admin".into()],
            crawl_delay_seconds: 0,
        };

        assert!(discoverer
            .build_item("https://example.com/about", &base, &policy, &[], &[], SourceType::Sitemap)
            .is_some());
        assert!(discoverer
            .build_item("https://other.com/about", &base, &policy, &[], &[], SourceType::Sitemap)
            .is_none());
        assert!(discoverer
            .build_item("https://example.com/admin/secret", &base, &policy, &[], &[], SourceType::Sitemap)
            .is_none());
    }

    #[test]
    fn build_item_honours_include_exclude_globs() {
        let discoverer = Discoverer::new(Client::new(), "CacheWarmerBot".into());
        let base = Url::parse("https://example.com").unwrap();
        let policy = RobotsPolicy::default();
        let include = compile_patterns(&["/blog/*".to_string()]);
        let exclude = compile_patterns(&["/blog/drafts/*".to_string()]);

        assert!(discoverer
            .build_item("https://example.com/blog/post-1", &base, &policy, &include, &exclude, SourceType::Sitemap)
            .is_some());
        assert!(discoverer
            .build_item("https://example.com/about", &base, &policy, &include, &exclude, SourceType::Sitemap)
            .is_none());
        assert!(discoverer
            .build_item("https://example.com/blog/drafts/x", &base, &policy, &include, &exclude, SourceType::Sitemap)
            .is_none());
    }
}
