//! Page storage: upsert-on-`(domain_id, path)` semantics backing `EnqueueBatch`.

use anyhow::{Context, Result};
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::domain::models::{NewPage, Page};

/// Matches the teacher's batch-insert chunk size for `QueryBuilder`-built
/// multi-row statements (Postgres caps bind parameters at 65535; this stays
/// well clear of that regardless of column count).
const CHUNK_SIZE: usize = 100;

pub struct PageRepository {
    pool: PgPool,
}

impl PageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a page, or return the existing row's id if `(domain_id, path)`
    /// already exists. Does not overwrite `priority_score`/`discovered_from`
    /// on conflict — the first discovery of a page wins.
    pub async fn upsert(&self, domain_id: Uuid, page: &NewPage) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO pages (domain_id, path, priority_score, discovered_from)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path
            RETURNING id
            "#,
        )
        .bind(domain_id)
        .bind(&page.path)
        .bind(page.priority_score)
        .bind(page.discovered_from)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert page")?;

        Ok(row.get("id"))
    }

    /// Upsert a batch of pages for one domain in a single transaction,
    /// chunked the way the teacher's `insert_batch` chunks `QueryBuilder`
    /// statements. Returns `(page_id, was_new)` pairs in input order.
    pub async fn upsert_batch(
        &self,
        domain_id: Uuid,
        pages: &[NewPage],
    ) -> Result<Vec<(Uuid, bool)>> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut results = Vec::with_capacity(pages.len());

        for chunk in pages.chunks(CHUNK_SIZE) {
            let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO pages (domain_id, path, priority_score, discovered_from) ",
            );
            qb.push_values(chunk, |mut b, page| {
                b.push_bind(domain_id)
                    .push_bind(&page.path)
                    .push_bind(page.priority_score)
                    .push_bind(page.discovered_from);
            });
            qb.push(
                " ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path \
                 RETURNING id, (xmax = 0) AS was_new",
            );

            let rows = qb
                .build()
                .fetch_all(&mut *tx)
                .await
                .context("failed to upsert page batch")?;

            for row in rows {
                let id: Uuid = row.get("id");
                let was_new: bool = row.get("was_new");
                results.push((id, was_new));
            }
        }

        tx.commit().await?;
        Ok(results)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Page>> {
        let row = sqlx::query(
            r#"
            SELECT id, domain_id, path, priority_score, discovered_from, created_at
            FROM pages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch page")?;

        Ok(row.map(|row| Page {
            id: row.get("id"),
            domain_id: row.get("domain_id"),
            path: row.get("path"),
            priority_score: row.get("priority_score"),
            discovered_from: row.get("discovered_from"),
            created_at: row.get("created_at"),
        }))
    }

    pub async fn count_by_domain(&self, domain_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pages WHERE domain_id = $1")
            .bind(domain_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to count pages")?;
        Ok(row.get("n"))
    }
}
