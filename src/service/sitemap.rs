//! Sitemap and sitemap-index parsing, streamed with early termination.
//!
//! Generalises the teacher's `extractor::sitemap` module (which parsed a
//! whole document into a `Vec<String>`) into a push-based streaming parser:
//! sitemaps can list hundreds of thousands of URLs, and spec §4.5 requires
//! stopping as soon as `max_pages` is reached rather than materialising the
//! whole thing first.

use anyhow::{Context, Result};
use quick_xml::events::Event;
use reqwest::Client;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitemapFormat {
    Xml,
    PlainText,
}

impl SitemapFormat {
    pub fn detect(text: &str) -> Self {
        if text.contains("<loc>") || text.contains("<urlset") || text.contains("<sitemapindex") {
            SitemapFormat::Xml
        } else {
            SitemapFormat::PlainText
        }
    }
}

/// One entry read from a sitemap: a page `<loc>`, or a nested sitemap's
/// `<loc>` inside a `<sitemapindex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapEntry {
    Url { loc: String, priority: Option<f64> },
    NestedSitemap(String),
}

/// Stream `text` (either a `<urlset>` or a `<sitemapindex>`) and invoke
/// `on_entry` for each entry found, stopping as soon as `on_entry` returns
/// `false` (the caller has reached its budget).
pub fn stream_xml(text: &str, mut on_entry: impl FnMut(SitemapEntry) -> bool) {
    let mut reader = quick_xml::Reader::from_str(text);
    let mut buf = Vec::new();
    let mut in_loc = false;
    let mut in_priority = false;
    let mut current_loc: Option<String> = None;
    let mut current_priority: Option<f64> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"loc" => in_loc = true,
                b"priority" => in_priority = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"priority" => in_priority = false,
                b"url" => {
                    if let Some(loc) = current_loc.take() {
                        let keep_going = on_entry(SitemapEntry::Url {
                            loc,
                            priority: current_priority.take(),
                        });
                        if !keep_going {
                            return;
                        }
                    }
                    current_priority = None;
                }
                b"sitemap" => {
                    if let Some(loc) = current_loc.take() {
                        if !on_entry(SitemapEntry::NestedSitemap(loc)) {
                            return;
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_loc {
                    if let Ok(txt) = e.decode() {
                        current_loc = Some(txt.to_string());
                    }
                } else if in_priority {
                    if let Ok(txt) = e.decode() {
                        current_priority = txt.parse().ok();
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!("sitemap XML parse error at {}: {e}", reader.buffer_position());
                break;
            }
            _ => {}
        }
        buf.clear();
    }
}

pub fn extract_plain_text_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|token| Url::parse(token).ok())
        .map(|url| url.to_string())
        .collect()
}

pub async fn fetch(client: &Client, url: &Url) -> Result<String> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("failed to fetch sitemap {url}"))?;
    resp.text()
        .await
        .with_context(|| format!("failed to read sitemap body from {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_xml_format() {
        assert_eq!(SitemapFormat::detect("<loc>https://example.com</loc>"), SitemapFormat::Xml);
    }

    #[test]
    fn detects_plain_text_format() {
        assert_eq!(
            SitemapFormat::detect("https://example.com\nhttps://test.com"),
            SitemapFormat::PlainText
        );
    }

    #[test]
    fn streams_urlset_entries() {
        let xml = r#"<urlset>
            <url><loc>https://example.com/</loc><priority>0.8</priority></url>
            <url><loc>https://example.com/about</loc></url>
        </urlset>"#;

        let mut entries = Vec::new();
        stream_xml(xml, |e| {
            entries.push(e);
            true
        });

        assert_eq!(
            entries,
            vec![
                SitemapEntry::Url { loc: "https://example.com/".into(), priority: Some(0.8) },
                SitemapEntry::Url { loc: "https://example.com/about".into(), priority: None },
            ]
        );
    }

    #[test]
    fn streams_sitemap_index_entries() {
        let xml = r#"<sitemapindex>
            <sitemap><loc>https://example.com/sitemap1.xml</loc></sitemap>
            <sitemap><loc>https://example.com/sitemap2.xml</loc></sitemap>
        </sitemapindex>"#;

        let mut entries = Vec::new();
        stream_xml(xml, |e| {
            entries.push(e);
            true
        });

        assert_eq!(
            entries,
            vec![
                SitemapEntry::NestedSitemap("https://example.com/sitemap1.xml".into()),
                SitemapEntry::NestedSitemap("https://example.com/sitemap2.xml".into()),
            ]
        );
    }

    #[test]
    fn stops_early_when_callback_returns_false() {
        let xml = r#"<urlset>
            <url><loc>https://example.com/1</loc></url>
            <url><loc>https://example.com/2</loc></url>
            <url><loc>https://example.com/3</loc></url>
        </urlset>"#;

        let mut seen = 0;
        stream_xml(xml, |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn extracts_plain_text_urls() {
        let text = "https://example.com/a\nhttps://example.com/b\n";
        let urls = extract_plain_text_urls(text);
        assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
    }
}
