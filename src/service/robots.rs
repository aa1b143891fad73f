//! robots.txt parsing: `Sitemap:`, `Crawl-delay:`, `Disallow:`/`Allow:`.
//!
//! An unparsable or missing robots.txt is not an error — it's treated as
//! "no restrictions, no crawl-delay, no sitemap directive", and discovery
//! falls back to `/sitemap.xml` directly.

use reqwest::Client;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsPolicy {
    pub raw: String,
    pub sitemap_urls: Vec<String>,
    pub disallows: Vec<String>,
    pub crawl_delay_seconds: i32,
}

/// Fetch and parse `{base}/robots.txt`. Any network or parse failure yields
/// the empty (permissive) policy rather than propagating an error.
pub async fn fetch_robots(client: &Client, base_url: &Url, user_agent: &str) -> RobotsPolicy {
    let robots_url = match base_url.join("/robots.txt") {
        Ok(u) => u,
        Err(_) => return RobotsPolicy::default(),
    };

    let body = match client.get(robots_url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => body,
            Err(_) => return RobotsPolicy::default(),
        },
        _ => return RobotsPolicy::default(),
    };

    parse_robots(&body, user_agent)
}

/// Parse robots.txt text, scoping `Disallow`/`Allow`/`Crawl-delay` to blocks
/// matching `user_agent` or the wildcard `*` block. `Sitemap:` directives
/// are global and order-preserved regardless of which block they appear in.
pub fn parse_robots(text: &str, user_agent: &str) -> RobotsPolicy {
    let mut policy = RobotsPolicy {
        raw: text.to_string(),
        ..RobotsPolicy::default()
    };
    let mut current_agents: Vec<String> = Vec::new();
    let mut applies_to_us = false;

    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                current_agents.push(value.to_ascii_lowercase());
                applies_to_us = current_agents
                    .iter()
                    .any(|a| a == "*" || user_agent.to_ascii_lowercase().contains(a.as_str()));
            }
            "sitemap" => {
                policy.sitemap_urls.push(value.to_string());
            }
            "disallow" if applies_to_us && !value.is_empty() => {
                policy.disallows.push(value.to_string());
            }
            "crawl-delay" if applies_to_us => {
                if let Ok(secs) = value.parse::<f64>() {
                    policy.crawl_delay_seconds = policy.crawl_delay_seconds.max(secs.ceil() as i32);
                }
            }
            "allow" | "disallow" => {
                // directive for a block that doesn't apply to us; reset
                // agent accumulation so the next User-agent starts cleanly
                current_agents.clear();
            }
            _ => {}
        }
    }

    policy
}

/// True if `path` (origin-relative, starting with `/`) is disallowed by any
/// recorded prefix.
pub fn is_disallowed(policy: &RobotsPolicy, path: &str) -> bool {
    policy.disallows.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sitemap_directives_in_order() {
        let text = "User-agent: *\nSitemap: https://example.com/sitemap1.xml\nSitemap: https://example.com/sitemap2.xml\n";
        let policy = parse_robots(text, "CacheWarmerBot");
        assert_eq!(
            policy.sitemap_urls,
            vec![
                "https://example.com/sitemap1.xml",
                "https://example.com/sitemap2.xml"
            ]
        );
    }

    #[test]
    fn scopes_disallow_to_matching_user_agent() {
        let text = "User-agent: BadBot\nDisallow: /private\n\nUser-agent: *\nDisallow: /admin\n";
        let policy = parse_robots(text, "CacheWarmerBot");
        assert_eq!(policy.disallows, vec!["/admin".to_string()]);
        assert!(is_disallowed(&policy, "/admin/secret"));
        assert!(!is_disallowed(&policy, "/private"));
    }

    #[test]
    fn parses_crawl_delay() {
        let text = "User-agent: *\nCrawl-delay: 2\n";
        let policy = parse_robots(text, "CacheWarmerBot");
        assert_eq!(policy.crawl_delay_seconds, 2);
    }

    #[test]
    fn empty_text_yields_permissive_policy() {
        let policy = parse_robots("", "CacheWarmerBot");
        assert!(policy.disallows.is_empty());
        assert_eq!(policy.crawl_delay_seconds, 0);
    }

    #[tokio::test]
    async fn fetch_robots_falls_back_to_permissive_on_404() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/robots.txt").with_status(404).create_async().await;

        let client = Client::new();
        let base = Url::parse(&server.url()).unwrap();
        let policy = fetch_robots(&client, &base, "CacheWarmerBot").await;
        assert_eq!(policy, RobotsPolicy::default());
    }
}
