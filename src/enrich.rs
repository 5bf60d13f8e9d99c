//! Enrichment: purchase rows joined with matches, grams, and nutrients.
//!
//! Each purchase row becomes an [`EnrichedPurchase`]: the cached match (if
//! any), the estimated purchased mass with its basis, and the nutrient
//! contribution `per-100g value × grams / 100`. Non-matched rows carry a
//! zero contribution but stay in the output so purchase-frequency views
//! still see them. The estimated grams and basis are written back to the
//! purchase table so they survive across runs.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::QuantityConfig;
use crate::models::{EnrichedPurchase, GramsBasis, MatchResult, PurchaseRow};
use crate::quantity;
use crate::reference::ReferenceStore;

/// Load all purchase rows in deterministic order.
pub async fn load_purchases(pool: &SqlitePool) -> Result<Vec<PurchaseRow>> {
    let rows = sqlx::query(
        "SELECT id, source, source_file, line_no, product_name, price, barcode, trip_date, trip_id
         FROM purchases
         ORDER BY trip_date, source_file, line_no",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PurchaseRow {
            id: row.get("id"),
            source: row.get("source"),
            source_file: row.get("source_file"),
            line_no: row.get("line_no"),
            product_name: row.get("product_name"),
            price: row.get("price"),
            barcode: row.get("barcode"),
            trip_date: row.get("trip_date"),
            trip_id: row.get("trip_id"),
        })
        .collect())
}

/// Load the entire match cache keyed by normalized product name.
pub async fn load_match_cache(pool: &SqlitePool) -> Result<HashMap<String, MatchResult>> {
    let rows = sqlx::query(
        "SELECT product_name, food_id, rationale, grams_in_name, model, created_at
         FROM match_cache",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let result = MatchResult {
                product_name: row.get("product_name"),
                food_id: row.get("food_id"),
                rationale: row.get("rationale"),
                grams_in_name: row.get("grams_in_name"),
                model: row.get("model"),
                created_at: row.get("created_at"),
            };
            (result.product_name.clone(), result)
        })
        .collect())
}

/// Enrich every purchase row and persist grams/basis back to the table.
pub async fn enrich_all(
    pool: &SqlitePool,
    store: &ReferenceStore,
    quantity_config: &QuantityConfig,
) -> Result<Vec<EnrichedPurchase>> {
    let purchases = load_purchases(pool).await?;
    let cache = load_match_cache(pool).await?;

    let mut enriched = Vec::with_capacity(purchases.len());
    for purchase in purchases {
        let row = enrich_one(purchase, &cache, store, quantity_config);
        persist_grams(pool, &row).await?;
        enriched.push(row);
    }

    Ok(enriched)
}

/// Enrich a single purchase row against the cache and reference store.
pub fn enrich_one(
    purchase: PurchaseRow,
    cache: &HashMap<String, MatchResult>,
    store: &ReferenceStore,
    quantity_config: &QuantityConfig,
) -> EnrichedPurchase {
    let key = crate::resolver::normalize_key(&purchase.product_name);
    let cached = cache.get(&key);
    let food = cached
        .and_then(|m| m.food_id.as_deref())
        .and_then(|id| store.get(id));

    // A quantity token in the name wins; the oracle's extracted weight is a
    // fallback for spellings the token regex misses. Both count as explicit.
    let (grams, grams_basis) = match quantity::grams_from_name(&purchase.product_name) {
        Some(g) => (g, GramsBasis::Explicit),
        None => match cached.and_then(|m| m.grams_in_name).filter(|g| *g > 0.0) {
            Some(g) => (g, GramsBasis::Explicit),
            None => quantity::estimate_grams(&purchase.product_name, food, quantity_config),
        },
    };

    let contribution = match food {
        Some(food) => food
            .nutrients_per_100g
            .iter()
            .map(|(name, per_100g)| (name.clone(), per_100g * grams / 100.0))
            .collect(),
        None => HashMap::new(),
    };

    EnrichedPurchase {
        food_id: food.map(|f| f.food_id.clone()),
        food_description: food.map(|f| f.description.clone()),
        grams,
        grams_basis,
        contribution,
        purchase,
    }
}

async fn persist_grams(pool: &SqlitePool, row: &EnrichedPurchase) -> Result<()> {
    sqlx::query("UPDATE purchases SET grams = ?, grams_basis = ? WHERE id = ?")
        .bind(row.grams)
        .bind(row.grams_basis.as_str())
        .bind(&row.purchase.id)
        .execute(pool)
        .await?;
    Ok(())
}
