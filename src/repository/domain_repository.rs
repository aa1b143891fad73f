//! Domain (host) lookup, creation, and robots.txt cache.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::models::Domain;

pub struct DomainRepository {
    pool: PgPool,
}

impl DomainRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the domain row on first sight, or return the existing one.
    /// `name` must already be lowercased/punycode-normalised by the caller.
    pub async fn get_or_create(&self, name: &str) -> Result<Domain> {
        if let Some(existing) = self.get_by_name(name).await? {
            return Ok(existing);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO domains (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, robots_raw, robots_sitemap_urls, robots_disallows,
                      robots_crawl_delay_seconds, robots_fetched_at
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert domain")?;

        Ok(row_to_domain(row))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Domain>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, robots_raw, robots_sitemap_urls, robots_disallows,
                   robots_crawl_delay_seconds, robots_fetched_at
            FROM domains
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch domain")?;

        Ok(row.map(row_to_domain))
    }

    /// Persist a freshly-parsed robots.txt for a domain.
    pub async fn update_robots(
        &self,
        domain_id: Uuid,
        raw: &str,
        sitemap_urls: &[String],
        disallows: &[String],
        crawl_delay_seconds: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE domains
            SET robots_raw = $1,
                robots_sitemap_urls = $2,
                robots_disallows = $3,
                robots_crawl_delay_seconds = $4,
                robots_fetched_at = $5
            WHERE id = $6
            "#,
        )
        .bind(raw)
        .bind(sitemap_urls)
        .bind(disallows)
        .bind(crawl_delay_seconds)
        .bind(Utc::now())
        .bind(domain_id)
        .execute(&self.pool)
        .await
        .context("failed to update robots cache")?;

        Ok(())
    }
}

fn row_to_domain(row: sqlx::postgres::PgRow) -> Domain {
    Domain {
        id: row.get("id"),
        name: row.get("name"),
        robots_raw: row.get("robots_raw"),
        robots_sitemap_urls: row.get("robots_sitemap_urls"),
        robots_disallows: row.get("robots_disallows"),
        robots_crawl_delay_seconds: row.get("robots_crawl_delay_seconds"),
        robots_fetched_at: row.get("robots_fetched_at"),
    }
}
