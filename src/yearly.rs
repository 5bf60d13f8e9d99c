//! Yearly summaries: mean intake per reference day against DRVs.
//!
//! Each normalized trip counts as one reference day. The yearly mean for a
//! nutrient is the plain mean of that nutrient across the year's included
//! trips, expressed as a percentage of the adult daily reference value when
//! the DRV table carries one. Top-foods views rank by cumulative raw
//! contribution (before rescaling) so the list answers "which purchases
//! drove this nutrient", with ties broken on `food_id` for stable output.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ingest::year_of;
use crate::models::{EnrichedPurchase, FoodCount, TripNutrients, YearlyNutrient};
use crate::reference::ReferenceStore;

/// Build the per-year, per-nutrient summary, sorted by year then nutrient.
pub fn yearly_summary(
    trips: &[TripNutrients],
    rows: &[EnrichedPurchase],
    store: &ReferenceStore,
    top_n: usize,
) -> Vec<YearlyNutrient> {
    let mut by_year: BTreeMap<i32, Vec<&TripNutrients>> = BTreeMap::new();
    for trip in trips {
        by_year.entry(trip.year).or_default().push(trip);
    }

    // Only purchases from included trips count toward top foods
    let included: HashSet<&str> = trips.iter().map(|t| t.trip_id.as_str()).collect();
    let contributions = contributions_by_year(rows, &included);

    let mut summary = Vec::new();
    for (year, year_trips) in by_year {
        let n = year_trips.len() as f64;

        for nutrient in store.nutrient_names() {
            let total: f64 = year_trips
                .iter()
                .map(|t| t.normalized.get(nutrient).copied().unwrap_or(0.0))
                .sum();
            let mean = total / n;

            let reference = store.drv(nutrient);
            let drv = reference.map(|r| r.drv);
            let unit = reference.map(|r| r.unit.clone()).unwrap_or_default();
            let pct_drv = drv.filter(|d| *d > 0.0).map(|d| mean / d * 100.0);

            summary.push(YearlyNutrient {
                year,
                nutrient: nutrient.clone(),
                unit,
                mean_per_reference_day: mean,
                drv,
                pct_drv,
                top_foods: top_foods_for(&contributions, year, nutrient, store, top_n),
            });
        }
    }

    summary
}

/// (year, nutrient, food_id) → cumulative raw contribution.
fn contributions_by_year(
    rows: &[EnrichedPurchase],
    included_trips: &HashSet<&str>,
) -> HashMap<(i32, String, String), f64> {
    let mut totals: HashMap<(i32, String, String), f64> = HashMap::new();
    for row in rows {
        if !included_trips.contains(row.purchase.trip_id.as_str()) {
            continue;
        }
        let (Some(food_id), Some(year)) = (&row.food_id, year_of(&row.purchase.trip_date)) else {
            continue;
        };
        for (nutrient, amount) in &row.contribution {
            *totals
                .entry((year, nutrient.clone(), food_id.clone()))
                .or_insert(0.0) += amount;
        }
    }
    totals
}

fn top_foods_for(
    contributions: &HashMap<(i32, String, String), f64>,
    year: i32,
    nutrient: &str,
    store: &ReferenceStore,
    top_n: usize,
) -> Vec<(String, f64)> {
    let mut ranked: Vec<(&str, f64)> = contributions
        .iter()
        .filter(|((y, n, _), _)| *y == year && n == nutrient)
        .map(|((_, _, food_id), total)| (food_id.as_str(), *total))
        .collect();

    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    ranked.truncate(top_n);

    ranked
        .into_iter()
        .map(|(food_id, total)| {
            let label = store
                .get(food_id)
                .map(|f| f.description.clone())
                .unwrap_or_else(|| food_id.to_string());
            (label, total)
        })
        .collect()
}

/// Count purchases per matched food across all rows, most bought first.
pub fn most_bought(rows: &[EnrichedPurchase], store: &ReferenceStore) -> Vec<FoodCount> {
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for row in rows {
        if let Some(food_id) = &row.food_id {
            *counts.entry(food_id.clone()).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<FoodCount> = counts
        .into_iter()
        .map(|(food_id, count)| FoodCount {
            description: store
                .get(&food_id)
                .map(|f| f.description.clone())
                .unwrap_or_else(|| food_id.clone()),
            food_id,
            count,
        })
        .collect();

    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.food_id.cmp(&b.food_id)));
    ranked
}
