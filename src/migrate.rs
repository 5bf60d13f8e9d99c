use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // One row per purchased line item. UNIQUE(source_file, line_no) makes
    // re-ingesting the same ticket an upsert instead of a duplicate.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS purchases (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            source_file TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            product_name TEXT NOT NULL,
            price REAL,
            barcode TEXT,
            trip_date TEXT NOT NULL,
            trip_id TEXT NOT NULL,
            grams REAL,
            grams_basis TEXT,
            UNIQUE(source_file, line_no)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Resolution cache: one row per distinct normalized product name.
    // Written with INSERT OR IGNORE so the first writer wins and a rerun
    // never re-spends oracle budget on an already-resolved name.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_cache (
            product_name TEXT PRIMARY KEY,
            food_id TEXT,
            rationale TEXT NOT NULL DEFAULT '',
            grams_in_name REAL,
            model TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Transcribed receipt images, keyed by content hash so renamed or
    // re-scanned files are not transcribed twice.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receipt_files (
            dedup_hash TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            n_rows INTEGER NOT NULL,
            transcribed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_purchases_trip_id ON purchases(trip_id)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_purchases_product_name ON purchases(product_name)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_purchases_trip_date ON purchases(trip_date)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
