//! Core data models used throughout BasketLens.
//!
//! These types represent the purchase rows, canonical foods, match results,
//! and aggregated nutrient tables that flow through the pipeline.

use std::collections::HashMap;

/// One purchased line item, as produced by an ingestion adapter.
#[derive(Debug, Clone)]
pub struct PurchaseRow {
    pub id: String,
    /// Which adapter produced the row: `"tickets"` or `"ocr"`.
    pub source: String,
    pub source_file: String,
    pub line_no: i64,
    /// Free-text product name, uppercased and trimmed.
    pub product_name: String,
    pub price: Option<f64>,
    pub barcode: Option<String>,
    /// Trip date as `YYYY-MM-DD`.
    pub trip_date: String,
    /// `<trip_date>/<source_file>` — one ticket file is one trip.
    pub trip_id: String,
}

/// One entry in the nutrient reference store.
#[derive(Debug, Clone)]
pub struct CanonicalFood {
    pub food_id: String,
    pub description: String,
    pub category: String,
    /// Per-food default serving size in grams, if the reference carries one.
    pub portion_grams: Option<f64>,
    /// Nutrient name → amount per 100 g.
    pub nutrients_per_100g: HashMap<String, f64>,
}

/// Daily reference value for one nutrient.
#[derive(Debug, Clone)]
pub struct ReferenceValue {
    pub nutrient: String,
    pub unit: String,
    pub drv: f64,
}

/// The cached outcome of resolving one distinct product name.
///
/// `food_id = None` means "no confident match": the row still counts in
/// purchase-frequency views but contributes nothing to nutrient totals.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub product_name: String,
    pub food_id: Option<String>,
    /// Free-text audit trail: why this match (or non-match) was chosen.
    pub rationale: String,
    /// Weight the oracle read out of the product name, if any.
    pub grams_in_name: Option<f64>,
    pub model: String,
    pub created_at: i64,
}

impl MatchResult {
    pub fn non_match(product_name: &str, rationale: impl Into<String>, model: &str) -> Self {
        Self {
            product_name: product_name.to_string(),
            food_id: None,
            rationale: rationale.into(),
            grams_in_name: None,
            model: model.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Provenance of an estimated purchase mass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GramsBasis {
    /// A quantity token was found in the product name itself.
    Explicit,
    /// No token; a category or global default serving was used.
    Default,
}

impl GramsBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            GramsBasis::Explicit => "explicit",
            GramsBasis::Default => "default",
        }
    }
}

/// A purchase row joined with its match, estimated grams, and the resulting
/// nutrient contribution (`per-100g value × grams / 100`).
#[derive(Debug, Clone)]
pub struct EnrichedPurchase {
    pub purchase: PurchaseRow,
    pub food_id: Option<String>,
    pub food_description: Option<String>,
    pub grams: f64,
    pub grams_basis: GramsBasis,
    /// Zero vector (empty map) when `food_id` is `None`.
    pub contribution: HashMap<String, f64>,
}

/// Summed nutrients for one shopping trip, rescaled to the daily-energy
/// reference.
#[derive(Debug, Clone)]
pub struct TripNutrients {
    pub trip_id: String,
    pub trip_date: String,
    pub year: i32,
    pub n_items: usize,
    pub n_matched: usize,
    /// Summed energy in kcal before rescaling, kept for the report.
    pub raw_kcal: f64,
    /// Nutrient totals after multiplying by `reference_kcal / raw_kcal`.
    pub normalized: HashMap<String, f64>,
}

/// Yearly mean intake for one nutrient, expressed against its DRV.
#[derive(Debug, Clone)]
pub struct YearlyNutrient {
    pub year: i32,
    pub nutrient: String,
    pub unit: String,
    /// Mean of the normalized per-trip value across all included trips.
    pub mean_per_reference_day: f64,
    pub drv: Option<f64>,
    pub pct_drv: Option<f64>,
    /// Top contributing foods by cumulative raw contribution, descending.
    pub top_foods: Vec<(String, f64)>,
}

/// Purchase count for one matched food (the "most bought" view).
#[derive(Debug, Clone)]
pub struct FoodCount {
    pub food_id: String,
    pub description: String,
    pub count: i64,
}
