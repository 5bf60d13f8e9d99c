//! Database statistics and health overview.
//!
//! Provides a quick summary of pipeline state: purchase and trip counts,
//! match-cache coverage, and per-source breakdowns. Used by `blens stats`
//! to give confidence that ingestion and resolution are progressing.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-source breakdown of purchase and trip counts.
struct SourceStats {
    source: String,
    purchase_count: i64,
    trip_count: i64,
    last_trip_date: Option<String>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_purchases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM purchases")
        .fetch_one(&pool)
        .await?;

    let total_trips: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT trip_id) FROM purchases")
        .fetch_one(&pool)
        .await?;

    let distinct_names: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT product_name) FROM purchases")
            .fetch_one(&pool)
            .await?;

    let resolved_names: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT p.product_name)
         FROM purchases p
         JOIN match_cache m ON m.product_name = p.product_name",
    )
    .fetch_one(&pool)
    .await?;

    let matched_names: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT p.product_name)
         FROM purchases p
         JOIN match_cache m ON m.product_name = p.product_name
         WHERE m.food_id IS NOT NULL",
    )
    .fetch_one(&pool)
    .await?;

    let transcribed_images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipt_files")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("BasketLens — Database Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Purchases:   {}", total_purchases);
    println!("  Trips:       {}", total_trips);
    println!("  Images done: {}", transcribed_images);
    println!(
        "  Resolved:    {} / {} names ({}%)",
        resolved_names,
        distinct_names,
        if distinct_names > 0 {
            (resolved_names * 100) / distinct_names
        } else {
            0
        }
    );
    println!(
        "  Matched:     {} / {} names ({}%)",
        matched_names,
        distinct_names,
        if distinct_names > 0 {
            (matched_names * 100) / distinct_names
        } else {
            0
        }
    );

    // Per-source breakdown
    let source_rows = sqlx::query(
        r#"
        SELECT
            source,
            COUNT(*) AS purchase_count,
            COUNT(DISTINCT trip_id) AS trip_count,
            MAX(trip_date) AS last_trip_date
        FROM purchases
        GROUP BY source
        ORDER BY purchase_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let source_stats: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            purchase_count: row.get("purchase_count"),
            trip_count: row.get("trip_count"),
            last_trip_date: row.get("last_trip_date"),
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<12} {:>10} {:>8}   {}",
            "SOURCE", "PURCHASES", "TRIPS", "LAST TRIP"
        );
        println!("  {}", "-".repeat(48));

        for s in &source_stats {
            println!(
                "  {:<12} {:>10} {:>8}   {}",
                s.source,
                s.purchase_count,
                s.trip_count,
                s.last_trip_date.as_deref().unwrap_or("never")
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
