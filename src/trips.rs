//! Per-trip nutrient aggregation and energy normalization.
//!
//! Summing a basket directly answers "what was bought", not "what was
//! eaten per day". Rescaling every trip so its energy equals the daily
//! reference (2500 kcal by default) turns each basket into a comparable
//! reference day: nutrient ratios within the trip are preserved and trips
//! of different sizes weigh equally in yearly means. Trips whose summed
//! energy is zero or negative cannot be rescaled and are excluded with a
//! diagnostic.

use std::collections::{BTreeMap, HashMap};

use crate::ingest::year_of;
use crate::models::{EnrichedPurchase, TripNutrients};
use crate::reference::ENERGY;

/// Aggregate enriched purchases into normalized per-trip nutrient totals.
///
/// Returns the included trips sorted by `trip_id` plus the ids of trips
/// excluded for non-positive energy.
pub fn aggregate_trips(
    rows: &[EnrichedPurchase],
    reference_kcal: f64,
) -> (Vec<TripNutrients>, Vec<String>) {
    // BTreeMap keeps trip order deterministic
    let mut by_trip: BTreeMap<String, Vec<&EnrichedPurchase>> = BTreeMap::new();
    for row in rows {
        by_trip
            .entry(row.purchase.trip_id.clone())
            .or_default()
            .push(row);
    }

    let mut trips = Vec::with_capacity(by_trip.len());
    let mut excluded = Vec::new();

    for (trip_id, items) in by_trip {
        let trip_date = items[0].purchase.trip_date.clone();
        let Some(year) = year_of(&trip_date) else {
            excluded.push(trip_id);
            continue;
        };

        let mut totals: HashMap<String, f64> = HashMap::new();
        let mut n_matched = 0usize;
        for item in &items {
            if item.food_id.is_some() {
                n_matched += 1;
            }
            for (nutrient, amount) in &item.contribution {
                *totals.entry(nutrient.clone()).or_insert(0.0) += amount;
            }
        }

        let raw_kcal = totals.get(ENERGY).copied().unwrap_or(0.0);
        if raw_kcal <= 0.0 {
            eprintln!(
                "Warning: excluding trip {} (summed energy {:.1} kcal, cannot rescale)",
                trip_id, raw_kcal
            );
            excluded.push(trip_id);
            continue;
        }

        let scale = reference_kcal / raw_kcal;
        let normalized = totals
            .into_iter()
            .map(|(nutrient, total)| (nutrient, total * scale))
            .collect();

        trips.push(TripNutrients {
            trip_id,
            trip_date,
            year,
            n_items: items.len(),
            n_matched,
            raw_kcal,
            normalized,
        });
    }

    (trips, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GramsBasis, PurchaseRow};

    fn row(trip_id: &str, trip_date: &str, contribution: &[(&str, f64)]) -> EnrichedPurchase {
        let matched = !contribution.is_empty();
        EnrichedPurchase {
            purchase: PurchaseRow {
                id: uuid::Uuid::new_v4().to_string(),
                source: "tickets".to_string(),
                source_file: "t.csv".to_string(),
                line_no: 2,
                product_name: "X".to_string(),
                price: None,
                barcode: None,
                trip_date: trip_date.to_string(),
                trip_id: trip_id.to_string(),
            },
            food_id: matched.then(|| "f001".to_string()),
            food_description: None,
            grams: 100.0,
            grams_basis: GramsBasis::Default,
            contribution: contribution
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    #[test]
    fn trip_energy_rescales_to_reference() {
        let rows = vec![
            row("t1", "2023-04-15", &[("Energy", 500.0), ("Protein", 20.0)]),
            row("t1", "2023-04-15", &[("Energy", 750.0), ("Protein", 10.0)]),
        ];
        let (trips, excluded) = aggregate_trips(&rows, 2500.0);

        assert!(excluded.is_empty());
        assert_eq!(trips.len(), 1);
        let trip = &trips[0];
        assert_eq!(trip.raw_kcal, 1250.0);
        assert_eq!(trip.year, 2023);
        // Scale factor 2: energy hits the reference exactly, ratios preserved
        assert!((trip.normalized["Energy"] - 2500.0).abs() < 1e-9);
        assert!((trip.normalized["Protein"] - 60.0).abs() < 1e-9);
    }

    #[test]
    fn zero_energy_trip_excluded() {
        let rows = vec![
            row("t1", "2023-04-15", &[("Energy", 500.0)]),
            row("t2", "2023-04-16", &[]),
        ];
        let (trips, excluded) = aggregate_trips(&rows, 2500.0);
        assert_eq!(trips.len(), 1);
        assert_eq!(excluded, vec!["t2".to_string()]);
    }

    #[test]
    fn matched_and_item_counts() {
        let rows = vec![
            row("t1", "2023-04-15", &[("Energy", 500.0)]),
            row("t1", "2023-04-15", &[]),
        ];
        let (trips, _) = aggregate_trips(&rows, 2500.0);
        assert_eq!(trips[0].n_items, 2);
        assert_eq!(trips[0].n_matched, 1);
    }

    #[test]
    fn trips_sorted_by_id() {
        let rows = vec![
            row("2023-04-16/b.csv", "2023-04-16", &[("Energy", 100.0)]),
            row("2023-04-15/a.csv", "2023-04-15", &[("Energy", 100.0)]),
        ];
        let (trips, _) = aggregate_trips(&rows, 2500.0);
        assert_eq!(trips[0].trip_id, "2023-04-15/a.csv");
        assert_eq!(trips[1].trip_id, "2023-04-16/b.csv");
    }
}
