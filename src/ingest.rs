//! Ticket ingestion: one CSV per shopping trip → purchase rows.
//!
//! Ticket files are named after the trip date (`YYYY_MM_DD*.csv`) and hold
//! one line item per row. Ingestion is idempotent: rows are keyed by
//! `(source_file, line_no)` and re-running over the same directory inserts
//! nothing new. Non-food lines (totals, discounts, deposits) and rows with
//! a negative price are dropped at the door so they never reach resolution.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::models::PurchaseRow;

/// Receipt lines that are bookkeeping rather than food: totals, taxes,
/// payment methods, promo tags ("21EME A 1/2 PRIX", "2+1 GRATUIT"), and
/// scanner artifacts such as quantity-only lines ("2 X"), weight
/// placeholders ("0,600 KG X") and bare barcodes. Matched against the
/// uppercased product name.
fn non_food_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^\s*(?:",
            r"TOTAL|SOUS[- ]?TOTAL|SUBTOTAL|REMISE|REDUCTION|RISTOURNE|PROMOTIE|KORTINGS?|",
            r"RETOUR|COUPON|TVA|BTW|CARTE|BANCONTACT|VISA|MASTERCARD|MAESTRO|MONNAIE|",
            r"VIDANGE|STATIEGELD|BON\s|AVANTAGE|ESPECES|RENDU|TICKET|",
            r"NUTRI.?BOOST|\d+EME\s+[AÀ]|\d+E\s+[AÀ]|\d+\+\d+\s+GRATUIT|",
            r"[A-Z]+\s+[AÀ]\s+\d+/\d+",
            r")",
            r"|^\s*\d+\s*X\s*$",
            r"|^\s*0,\d+\s*KG\s*X",
            r"|^\s*\d{6,}\s*$",
        ))
        .unwrap()
    })
}

pub fn is_non_food(product_name: &str) -> bool {
    non_food_re().is_match(product_name)
}

/// Extract the trip date from a ticket filename stem (`2023_04_15_lidl` →
/// `2023-04-15`). Some older exports transposed day and month; when the
/// middle field cannot be a month and the last one can, the two are swapped.
pub fn trip_date_from_filename(stem: &str) -> Option<String> {
    let parts: Vec<u32> = stem
        .split('_')
        .take(3)
        .filter_map(|p| p.parse::<u32>().ok())
        .collect();
    if parts.len() != 3 {
        return None;
    }

    let year = parts[0] as i32;
    let (mut month, mut day) = (parts[1], parts[2]);
    if month > 12 && day <= 12 {
        std::mem::swap(&mut month, &mut day);
    }

    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Outcome counters for one ingestion pass.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub files: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped: u64,
}

/// Run the `ingest tickets` command.
pub async fn run_ingest_tickets(config: &Config) -> Result<()> {
    let Some(tickets) = &config.adapters.tickets else {
        bail!("No [adapters.tickets] section in config. Set adapters.tickets.dir.");
    };

    if !tickets.dir.is_dir() {
        bail!("Ticket directory not found: {}", tickets.dir.display());
    }

    let pool = db::connect(config).await?;
    let files = collect_files(&tickets.dir, &tickets.include_globs)?;

    let mut stats = IngestStats::default();
    for path in &files {
        let rel = relative_name(&tickets.dir, path);

        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(trip_date) = trip_date_from_filename(stem) else {
            eprintln!(
                "Warning: skipping {} (filename does not start with YYYY_MM_DD)",
                rel
            );
            continue;
        };

        let rows = parse_ticket_file(path, &rel, &trip_date, &mut stats)?;
        stats.files += 1;

        for row in rows {
            if insert_purchase(&pool, &row).await? {
                stats.inserted += 1;
            } else {
                stats.duplicates += 1;
            }
        }
    }

    println!("ingest tickets");
    println!("  files: {}", stats.files);
    println!("  rows inserted: {}", stats.inserted);
    println!("  rows already present: {}", stats.duplicates);
    println!("  rows skipped: {}", stats.skipped);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Walk a directory and return the files matching the include globs,
/// sorted for a deterministic ingestion order.
pub fn collect_files(dir: &Path, include_globs: &[String]) -> Result<Vec<PathBuf>> {
    let globs = build_globset(include_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path());
        if globs.is_match(rel) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn relative_name(dir: &Path, path: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Parse one ticket CSV into purchase rows. Requires a `product_name`
/// column; `price` and `barcode` are optional.
fn parse_ticket_file(
    path: &Path,
    rel: &str,
    trip_date: &str,
    stats: &mut IngestStats,
) -> Result<Vec<PurchaseRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open ticket CSV: {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let Some(name_col) = col("product_name") else {
        bail!(
            "Ticket CSV {} is missing required column 'product_name'",
            path.display()
        );
    };
    let price_col = col("price");
    let barcode_col = col("barcode");

    let trip_id = format!("{}/{}", trip_date, rel);

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Corrupt row {} in {}", i + 2, rel))?;
        let line_no = (i + 2) as i64; // 1-based, header is line 1

        let product_name = record
            .get(name_col)
            .unwrap_or("")
            .trim()
            .to_uppercase();
        if product_name.is_empty() {
            stats.skipped += 1;
            continue;
        }

        let price = price_col
            .and_then(|c| record.get(c))
            .and_then(|v| v.trim().replace(',', ".").parse::<f64>().ok());

        // Discounts come through as negative prices; they are not purchases
        if is_non_food(&product_name) || price.map(|p| p < 0.0).unwrap_or(false) {
            stats.skipped += 1;
            continue;
        }

        let barcode = barcode_col
            .and_then(|c| record.get(c))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        rows.push(PurchaseRow {
            id: uuid::Uuid::new_v4().to_string(),
            source: "tickets".to_string(),
            source_file: rel.to_string(),
            line_no,
            product_name,
            price,
            barcode,
            trip_date: trip_date.to_string(),
            trip_id: trip_id.clone(),
        });
    }

    Ok(rows)
}

/// Insert one purchase row; returns `false` when `(source_file, line_no)`
/// was already present.
pub async fn insert_purchase(pool: &SqlitePool, row: &PurchaseRow) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO purchases
            (id, source, source_file, line_no, product_name, price, barcode, trip_date, trip_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.source)
    .bind(&row.source_file)
    .bind(row.line_no)
    .bind(&row.product_name)
    .bind(row.price)
    .bind(&row.barcode)
    .bind(&row.trip_date)
    .bind(&row.trip_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Year component of a `YYYY-MM-DD` trip date.
pub fn year_of(trip_date: &str) -> Option<i32> {
    NaiveDate::parse_from_str(trip_date, "%Y-%m-%d")
        .ok()
        .map(|d| d.year())
}
