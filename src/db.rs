use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to Postgres and run embedded migrations.
///
/// Pool size is capped well below typical server connection limits so the
/// engine leaves headroom for whatever else shares the database (see
/// spec's connection-pool note in the concurrency model).
pub async fn init_db(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(60)
        .connect(database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    log::info!("database ready");
    Ok(pool)
}
