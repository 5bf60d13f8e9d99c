//! Disambiguation resolver: product names → cached canonical matches.
//!
//! For every distinct product name in the purchase table the resolver
//! produces exactly one [`MatchResult`], consulting the oracle at most once
//! per name. The cache is the primary cost-control mechanism: a rerun over
//! an unchanged purchase set performs zero oracle calls.
//!
//! Resolution runs on a bounded worker pool (at most `oracle.concurrency`
//! in-flight calls). Cache writes are atomic per key — `INSERT OR IGNORE`
//! then read-back — so interrupting a run mid-flight leaves the cache valid
//! and resumable, and the first writer wins on a duplicate key.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db;
use crate::models::MatchResult;
use crate::oracle::{self, Oracle, OracleError, Selection};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::reference::ReferenceStore;
use crate::retriever::Retriever;

/// Cache key normalization: product names are matched case-insensitively
/// and ignoring surrounding whitespace.
pub fn normalize_key(product_name: &str) -> String {
    product_name.trim().to_uppercase()
}

/// Counters for one resolution pass.
#[derive(Debug, Default, Clone)]
pub struct ResolveStats {
    pub total: u64,
    pub matched: u64,
    pub no_match: u64,
    pub shortlist_empty: u64,
    pub oracle_failures: u64,
}

/// Run the `resolve` command: resolve every distinct unresolved product name.
pub async fn run_resolve(
    config: &Config,
    limit: Option<usize>,
    dry_run: bool,
    reporter: Box<dyn ProgressReporter>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut names = pending_names(&pool, limit).await?;

    if dry_run {
        println!("resolve (dry-run)");
        println!("  names needing resolution: {}", names.len());
        pool.close().await;
        return Ok(());
    }

    if names.is_empty() {
        println!("resolve");
        println!("  all product names resolved");
        pool.close().await;
        return Ok(());
    }

    if !config.oracle.is_enabled() {
        bail!("Oracle provider is disabled. Set [oracle] provider in config.");
    }

    let store = Arc::new(ReferenceStore::load(config)?);
    let retriever = Arc::new(Retriever::build(&store));
    let oracle: Arc<dyn Oracle> = Arc::from(oracle::create_oracle(&config.oracle)?);

    // Deterministic work order
    names.sort();

    let stats = resolve_names(
        &pool,
        oracle,
        retriever,
        store,
        names,
        config.retrieval.candidate_k,
        config.oracle.concurrency,
        Arc::from(reporter),
    )
    .await?;

    println!("resolve");
    println!("  resolved: {}", stats.total);
    println!("  matched: {}", stats.matched);
    println!("  no match: {}", stats.no_match);
    println!("  shortlist empty: {}", stats.shortlist_empty);
    println!("  oracle failures: {}", stats.oracle_failures);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Distinct normalized product names with no cache entry yet.
pub async fn pending_names(pool: &SqlitePool, limit: Option<usize>) -> Result<Vec<String>> {
    // No limit binds i64::MAX rather than relying on a sentinel cast
    let limit_val = limit.map_or(i64::MAX, |l| l as i64);

    let rows = sqlx::query(
        r#"
        SELECT DISTINCT p.product_name
        FROM purchases p
        LEFT JOIN match_cache m ON m.product_name = p.product_name
        WHERE m.product_name IS NULL
        ORDER BY p.product_name
        LIMIT ?
        "#,
    )
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| normalize_key(&row.get::<String, _>("product_name")))
        .collect())
}

/// Resolve a batch of names on a bounded worker pool.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_names(
    pool: &SqlitePool,
    oracle: Arc<dyn Oracle>,
    retriever: Arc<Retriever>,
    store: Arc<ReferenceStore>,
    names: Vec<String>,
    candidate_k: usize,
    concurrency: usize,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<ResolveStats> {
    let total = names.len() as u64;
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let done = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();

    for name in names {
        let pool = pool.clone();
        let oracle = oracle.clone();
        let retriever = retriever.clone();
        let store = store.clone();
        let semaphore = semaphore.clone();
        let done = done.clone();
        let reporter = reporter.clone();

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return Ok(Outcome::Skipped);
            };
            let outcome = resolve_one(&pool, oracle.as_ref(), &retriever, &store, &name, candidate_k)
                .await;
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            reporter.report(ProgressEvent::Resolving { n, total });
            outcome
        });
    }

    let mut stats = ResolveStats {
        total,
        ..Default::default()
    };

    while let Some(joined) = tasks.join_next().await {
        match joined? {
            Ok(Outcome::Matched) => stats.matched += 1,
            Ok(Outcome::NoMatch) => stats.no_match += 1,
            Ok(Outcome::ShortlistEmpty) => {
                stats.no_match += 1;
                stats.shortlist_empty += 1;
            }
            Ok(Outcome::OracleFailed) => {
                stats.no_match += 1;
                stats.oracle_failures += 1;
            }
            Ok(Outcome::CacheHit) | Ok(Outcome::Skipped) => {}
            Err(e) => {
                // A storage error on one name degrades that name only
                eprintln!("Warning: resolution task failed: {}", e);
            }
        }
    }

    Ok(stats)
}

enum Outcome {
    CacheHit,
    Matched,
    NoMatch,
    ShortlistEmpty,
    OracleFailed,
    Skipped,
}

async fn resolve_one(
    pool: &SqlitePool,
    oracle: &dyn Oracle,
    retriever: &Retriever,
    store: &ReferenceStore,
    name: &str,
    candidate_k: usize,
) -> Result<Outcome> {
    // Another run (or a racing worker) may have resolved this key already
    if cached_match(pool, name).await?.is_some() {
        return Ok(Outcome::CacheHit);
    }

    let candidates = retriever.retrieve(name, candidate_k);

    if candidates.is_empty() {
        // Fast path: nothing lexically plausible, never spend an oracle call
        let result = MatchResult::non_match(name, "no lexical candidates", oracle.model_name());
        insert_match(pool, &result).await?;
        return Ok(Outcome::ShortlistEmpty);
    }

    let foods: Vec<_> = retriever
        .lookup(store, &candidates)
        .into_iter()
        .cloned()
        .collect();

    let (result, outcome) = match oracle.select_match(name, &foods).await {
        Ok(Selection::Pick {
            index,
            grams,
            rationale,
        }) => {
            let food = &foods[index];
            let result = MatchResult {
                product_name: name.to_string(),
                food_id: Some(food.food_id.clone()),
                rationale: rationale.unwrap_or_default(),
                grams_in_name: grams,
                model: oracle.model_name().to_string(),
                created_at: chrono::Utc::now().timestamp(),
            };
            (result, Outcome::Matched)
        }
        Ok(Selection::NoMatch { rationale }) => {
            let reason = rationale.unwrap_or_else(|| "oracle: none of these".to_string());
            (
                MatchResult::non_match(name, reason, oracle.model_name()),
                Outcome::NoMatch,
            )
        }
        Err(OracleError::Malformed { reason, raw }) => {
            // Keep the raw response on stderr for audit, downgrade to non-match
            eprintln!("Warning: malformed oracle output for '{}': {}", name, reason);
            eprintln!("  raw: {}", raw.replace('\n', " "));
            (
                MatchResult::non_match(name, format!("malformed oracle output: {}", reason), oracle.model_name()),
                Outcome::OracleFailed,
            )
        }
        Err(e) => {
            // Transient failure with retries exhausted inside the provider;
            // this name degrades to a non-match, the run continues
            eprintln!("Warning: oracle call failed for '{}': {}", name, e);
            (
                MatchResult::non_match(name, format!("oracle unavailable: {}", e), oracle.model_name()),
                Outcome::OracleFailed,
            )
        }
    };

    insert_match(pool, &result).await?;
    Ok(outcome)
}

/// Fetch a cached match result by normalized product name.
pub async fn cached_match(pool: &SqlitePool, product_name: &str) -> Result<Option<MatchResult>> {
    let key = normalize_key(product_name);
    let row = sqlx::query(
        "SELECT product_name, food_id, rationale, grams_in_name, model, created_at
         FROM match_cache WHERE product_name = ?",
    )
    .bind(&key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| MatchResult {
        product_name: row.get("product_name"),
        food_id: row.get("food_id"),
        rationale: row.get("rationale"),
        grams_in_name: row.get("grams_in_name"),
        model: row.get("model"),
        created_at: row.get("created_at"),
    }))
}

/// Write-once cache insert: the first writer wins, later writers are no-ops.
pub async fn insert_match(pool: &SqlitePool, result: &MatchResult) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO match_cache
            (product_name, food_id, rationale, grams_in_name, model, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(normalize_key(&result.product_name))
    .bind(&result.food_id)
    .bind(&result.rationale)
    .bind(result.grams_in_name)
    .bind(&result.model)
    .bind(result.created_at)
    .execute(pool)
    .await?;

    Ok(())
}
