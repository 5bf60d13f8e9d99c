//! Receipt image ingestion: vision transcription → purchase rows.
//!
//! Each image is content-hashed before any oracle call; a hash already in
//! `receipt_files` is skipped, so interrupted runs resume where they left
//! off and renamed files are not transcribed twice. Transcription runs on
//! the same bounded worker pool as resolution. A malformed transcription
//! skips that image only and leaves it eligible for the next run.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db;
use crate::ingest::{self, collect_files, insert_purchase, trip_date_from_filename};
use crate::models::PurchaseRow;
use crate::oracle::{self, Oracle, OracleError, ReceiptLine};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Counters for one transcription pass.
#[derive(Debug, Default, Clone)]
pub struct OcrStats {
    pub images: u64,
    pub transcribed: u64,
    pub already_done: u64,
    pub failed: u64,
    pub rows_inserted: u64,
}

/// Run the `ingest ocr` command.
pub async fn run_ingest_ocr(config: &Config, reporter: Box<dyn ProgressReporter>) -> Result<()> {
    let Some(receipts) = &config.adapters.receipts else {
        bail!("No [adapters.receipts] section in config. Set adapters.receipts.dir.");
    };

    if !receipts.dir.is_dir() {
        bail!("Receipt directory not found: {}", receipts.dir.display());
    }

    if !config.oracle.is_enabled() {
        bail!("Oracle provider is disabled. Set [oracle] provider in config.");
    }

    let pool = db::connect(config).await?;
    let oracle: Arc<dyn Oracle> = Arc::from(oracle::create_oracle(&config.oracle)?);
    let files = collect_files(&receipts.dir, &receipts.include_globs)?;

    let stats = transcribe_all(
        &pool,
        oracle,
        &receipts.dir,
        files,
        config.oracle.concurrency,
        Arc::from(reporter),
    )
    .await?;

    println!("ingest ocr");
    println!("  images: {}", stats.images);
    println!("  transcribed: {}", stats.transcribed);
    println!("  already done: {}", stats.already_done);
    println!("  failed: {}", stats.failed);
    println!("  rows inserted: {}", stats.rows_inserted);
    println!("ok");

    pool.close().await;
    Ok(())
}

async fn transcribe_all(
    pool: &SqlitePool,
    oracle: Arc<dyn Oracle>,
    dir: &Path,
    files: Vec<std::path::PathBuf>,
    concurrency: usize,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<OcrStats> {
    let total = files.len() as u64;
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let done = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();

    for path in files {
        let pool = pool.clone();
        let oracle = oracle.clone();
        let rel = relative_name(dir, &path);
        let semaphore = semaphore.clone();
        let done = done.clone();
        let reporter = reporter.clone();

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return Ok(ImageOutcome::Failed);
            };
            let outcome = transcribe_one(&pool, oracle.as_ref(), &path, &rel).await;
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            reporter.report(ProgressEvent::Transcribing { n, total });
            outcome
        });
    }

    let mut stats = OcrStats {
        images: total,
        ..Default::default()
    };

    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok(ImageOutcome::Transcribed { rows }) => {
                stats.transcribed += 1;
                stats.rows_inserted += rows;
            }
            Ok(ImageOutcome::AlreadyDone) => stats.already_done += 1,
            Ok(ImageOutcome::Failed) => stats.failed += 1,
            Err(e) => {
                eprintln!("Warning: transcription task failed: {}", e);
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

enum ImageOutcome {
    Transcribed { rows: u64 },
    AlreadyDone,
    Failed,
}

async fn transcribe_one(
    pool: &SqlitePool,
    oracle: &dyn Oracle,
    path: &Path,
    rel: &str,
) -> Result<ImageOutcome> {
    let bytes = tokio::fs::read(path).await?;
    let digest = file_digest(&bytes);

    if is_transcribed(pool, &digest).await? {
        return Ok(ImageOutcome::AlreadyDone);
    }

    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(ImageOutcome::Failed);
    };
    let Some(trip_date) = trip_date_from_filename(stem) else {
        eprintln!(
            "Warning: skipping {} (filename does not start with YYYY_MM_DD)",
            rel
        );
        return Ok(ImageOutcome::Failed);
    };

    let lines = match oracle.transcribe_receipt(&bytes, mime_for_path(path)).await {
        Ok(lines) => lines,
        Err(OracleError::Malformed { reason, .. }) => {
            // This image stays pending; the run continues with the rest
            eprintln!("Warning: malformed transcription for {}: {}", rel, reason);
            return Ok(ImageOutcome::Failed);
        }
        Err(e) => {
            eprintln!("Warning: transcription failed for {}: {}", rel, e);
            return Ok(ImageOutcome::Failed);
        }
    };

    let rows = insert_receipt_rows(pool, rel, &trip_date, &lines).await?;
    mark_transcribed(pool, &digest, rel, rows).await?;

    Ok(ImageOutcome::Transcribed { rows })
}

/// Insert the transcribed line items as purchase rows with source `"ocr"`.
pub async fn insert_receipt_rows(
    pool: &SqlitePool,
    rel: &str,
    trip_date: &str,
    lines: &[ReceiptLine],
) -> Result<u64> {
    let trip_id = format!("{}/{}", trip_date, rel);
    let mut inserted = 0u64;

    for (i, line) in lines.iter().enumerate() {
        let product_name = line.product_name.trim().to_uppercase();
        if product_name.is_empty() {
            continue;
        }
        if ingest::is_non_food(&product_name) || line.price.map(|p| p < 0.0).unwrap_or(false) {
            continue;
        }

        let row = PurchaseRow {
            id: uuid::Uuid::new_v4().to_string(),
            source: "ocr".to_string(),
            source_file: rel.to_string(),
            line_no: (i + 1) as i64,
            product_name,
            price: line.price,
            barcode: line.barcode.clone(),
            trip_date: trip_date.to_string(),
            trip_id: trip_id.clone(),
        };
        if insert_purchase(pool, &row).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// SHA-256 of the image content, hex-encoded. Keyed on content, not path,
/// so moving or renaming an image does not re-transcribe it.
pub fn file_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub async fn is_transcribed(pool: &SqlitePool, digest: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 AS present FROM receipt_files WHERE dedup_hash = ?")
        .bind(digest)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("present") == 1).unwrap_or(false))
}

async fn mark_transcribed(pool: &SqlitePool, digest: &str, rel: &str, n_rows: u64) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO receipt_files (dedup_hash, path, n_rows, transcribed_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(digest)
    .bind(rel)
    .bind(n_rows as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

fn relative_name(dir: &Path, path: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CanonicalFood;
    use crate::oracle::Selection;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use sqlx::Row;

    struct StubVision;

    #[async_trait]
    impl Oracle for StubVision {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn select_match(
            &self,
            _product_name: &str,
            _candidates: &[CanonicalFood],
        ) -> Result<Selection, OracleError> {
            Err(OracleError::Disabled)
        }

        async fn transcribe_receipt(
            &self,
            _image: &[u8],
            _mime: &str,
        ) -> Result<Vec<ReceiptLine>, OracleError> {
            Ok(vec![ReceiptLine {
                product_name: "lait entier 1l".to_string(),
                price: Some(1.29),
                barcode: None,
            }])
        }
    }

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            db: crate::config::DbConfig {
                path: tmp.path().join("blens.sqlite"),
            },
            reference: crate::config::ReferenceConfig {
                foods_csv: tmp.path().join("foods.csv"),
                drv_csv: tmp.path().join("drv.csv"),
            },
            oracle: Default::default(),
            retrieval: Default::default(),
            quantity: Default::default(),
            report: Default::default(),
            adapters: Default::default(),
        };
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        (tmp, pool)
    }

    #[test]
    fn digest_depends_on_content_only() {
        assert_eq!(file_digest(b"abc"), file_digest(b"abc"));
        assert_ne!(file_digest(b"abc"), file_digest(b"abd"));
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(mime_for_path(Path::new("r/2023_01_02.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("r/2023_01_02.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("r/2023_01_02.jpeg")), "image/jpeg");
    }

    #[tokio::test]
    async fn dedup_hash_marks_images_done() {
        let (_tmp, pool) = test_pool().await;
        let digest = file_digest(b"fake image bytes");

        assert!(!is_transcribed(&pool, &digest).await.unwrap());
        mark_transcribed(&pool, &digest, "2023_01_02.jpg", 3)
            .await
            .unwrap();
        assert!(is_transcribed(&pool, &digest).await.unwrap());
    }

    #[tokio::test]
    async fn images_transcribed_once_across_runs() {
        let (tmp, pool) = test_pool().await;
        let dir = tmp.path().join("receipts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("2023_01_02.jpg"), b"fake image bytes").unwrap();

        let files = collect_files(&dir, &["**/*.jpg".to_string()]).unwrap();
        let oracle: Arc<dyn Oracle> = Arc::new(StubVision);
        let reporter: Arc<dyn ProgressReporter> = Arc::new(NoProgress);

        let stats = transcribe_all(&pool, oracle.clone(), &dir, files.clone(), 2, reporter.clone())
            .await
            .unwrap();
        assert_eq!(stats.transcribed, 1);
        assert_eq!(stats.rows_inserted, 1);

        // Second pass over the same image is a checkpoint hit
        let stats = transcribe_all(&pool, oracle, &dir, files, 2, reporter)
            .await
            .unwrap();
        assert_eq!(stats.transcribed, 0);
        assert_eq!(stats.already_done, 1);
    }

    #[tokio::test]
    async fn receipt_rows_filtered_and_inserted() {
        let (_tmp, pool) = test_pool().await;
        let lines = vec![
            ReceiptLine {
                product_name: "lait entier 1l".to_string(),
                price: Some(1.29),
                barcode: Some("5400112".to_string()),
            },
            ReceiptLine {
                product_name: "REMISE FIDELITE".to_string(),
                price: Some(-0.50),
                barcode: None,
            },
            ReceiptLine {
                product_name: "TOTAL".to_string(),
                price: Some(12.34),
                barcode: None,
            },
        ];

        let n = insert_receipt_rows(&pool, "2023_01_02.jpg", "2023-01-02", &lines)
            .await
            .unwrap();
        assert_eq!(n, 1);

        let row = sqlx::query("SELECT product_name, source, trip_id FROM purchases")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("product_name"), "LAIT ENTIER 1L");
        assert_eq!(row.get::<String, _>("source"), "ocr");
        assert_eq!(
            row.get::<String, _>("trip_id"),
            "2023-01-02/2023_01_02.jpg"
        );
    }
}
