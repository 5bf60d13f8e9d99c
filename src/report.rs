//! Report generation: the read side of the pipeline.
//!
//! `blens report` joins everything ingested and resolved so far and writes
//! five CSV files under the configured output directory. Output is fully
//! deterministic for a given database and reference: rows are sorted,
//! nutrient columns follow the reference order, and floats are written
//! with fixed precision, so re-running over unchanged inputs produces
//! byte-identical files.

use anyhow::{bail, Context, Result};
use sqlx::Row;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db;
use crate::enrich;
use crate::models::{EnrichedPurchase, FoodCount, TripNutrients, YearlyNutrient};
use crate::reference::ReferenceStore;
use crate::trips;
use crate::yearly;

/// Run the `report` command. `year` restricts the report to trips from
/// that calendar year.
pub async fn run_report(config: &Config, year: Option<i32>) -> Result<()> {
    let pool = db::connect(config).await?;

    let n_purchases: i64 = sqlx::query("SELECT COUNT(*) AS n FROM purchases")
        .fetch_one(&pool)
        .await?
        .get("n");
    if n_purchases == 0 {
        bail!("No purchases ingested. Run `blens ingest` first.");
    }

    let store = ReferenceStore::load(config)?;
    let mut rows = enrich::enrich_all(&pool, &store, &config.quantity).await?;
    if let Some(year) = year {
        rows.retain(|r| crate::ingest::year_of(&r.purchase.trip_date) == Some(year));
        if rows.is_empty() {
            bail!("No purchases in year {}.", year);
        }
    }
    let (trip_rows, excluded) = trips::aggregate_trips(&rows, config.report.reference_kcal);
    let summary = yearly::yearly_summary(&trip_rows, &rows, &store, config.report.top_foods);
    let bought = yearly::most_bought(&rows, &store);

    let out_dir = &config.report.out_dir;
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;

    let written = [
        write_enriched(out_dir, &rows, &store)?,
        write_trips(out_dir, &trip_rows, &store)?,
        write_yearly(out_dir, &summary)?,
        write_top_foods(out_dir, &summary)?,
        write_most_bought(out_dir, &bought)?,
    ];

    println!("report");
    println!("  purchases: {}", n_purchases);
    println!(
        "  trips included: {} (excluded: {})",
        trip_rows.len(),
        excluded.len()
    );
    if let (Some(first), Some(last)) = (
        trip_rows.first().map(|t| t.year),
        trip_rows.last().map(|t| t.year),
    ) {
        println!("  years: {}-{}", first.min(last), first.max(last));
    }
    for path in &written {
        println!("  wrote {}", path.display());
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

fn fmt(v: f64) -> String {
    format!("{:.4}", v)
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(fmt).unwrap_or_default()
}

/// One row per purchase with its match, grams, and nutrient contribution.
fn write_enriched(
    out_dir: &Path,
    rows: &[EnrichedPurchase],
    store: &ReferenceStore,
) -> Result<PathBuf> {
    let path = out_dir.join("enriched_purchases.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec![
        "trip_date",
        "trip_id",
        "source",
        "source_file",
        "line_no",
        "product_name",
        "price",
        "food_id",
        "food_description",
        "grams",
        "grams_basis",
    ]
    .into_iter()
    .map(String::from)
    .collect::<Vec<_>>();
    header.extend(store.nutrient_names().iter().cloned());
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.purchase.trip_date.clone(),
            row.purchase.trip_id.clone(),
            row.purchase.source.clone(),
            row.purchase.source_file.clone(),
            row.purchase.line_no.to_string(),
            row.purchase.product_name.clone(),
            fmt_opt(row.purchase.price),
            row.food_id.clone().unwrap_or_default(),
            row.food_description.clone().unwrap_or_default(),
            fmt(row.grams),
            row.grams_basis.as_str().to_string(),
        ];
        for nutrient in store.nutrient_names() {
            record.push(fmt(row.contribution.get(nutrient).copied().unwrap_or(0.0)));
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(path)
}

/// One row per included trip with normalized nutrient totals.
fn write_trips(
    out_dir: &Path,
    trip_rows: &[TripNutrients],
    store: &ReferenceStore,
) -> Result<PathBuf> {
    let path = out_dir.join("trip_nutrients.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec![
        "trip_id",
        "trip_date",
        "year",
        "n_items",
        "n_matched",
        "raw_kcal",
    ]
    .into_iter()
    .map(String::from)
    .collect::<Vec<_>>();
    header.extend(store.nutrient_names().iter().cloned());
    writer.write_record(&header)?;

    for trip in trip_rows {
        let mut record = vec![
            trip.trip_id.clone(),
            trip.trip_date.clone(),
            trip.year.to_string(),
            trip.n_items.to_string(),
            trip.n_matched.to_string(),
            fmt(trip.raw_kcal),
        ];
        for nutrient in store.nutrient_names() {
            record.push(fmt(trip.normalized.get(nutrient).copied().unwrap_or(0.0)));
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(path)
}

fn write_yearly(out_dir: &Path, summary: &[YearlyNutrient]) -> Result<PathBuf> {
    let path = out_dir.join("yearly_summary.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record([
        "year",
        "nutrient",
        "unit",
        "mean_per_reference_day",
        "drv",
        "pct_drv",
    ])?;

    for entry in summary {
        writer.write_record([
            entry.year.to_string(),
            entry.nutrient.clone(),
            entry.unit.clone(),
            fmt(entry.mean_per_reference_day),
            fmt_opt(entry.drv),
            fmt_opt(entry.pct_drv),
        ])?;
    }

    writer.flush()?;
    Ok(path)
}

fn write_top_foods(out_dir: &Path, summary: &[YearlyNutrient]) -> Result<PathBuf> {
    let path = out_dir.join("top_foods.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record(["year", "nutrient", "rank", "food", "contribution"])?;

    for entry in summary {
        for (rank, (food, total)) in entry.top_foods.iter().enumerate() {
            writer.write_record([
                entry.year.to_string(),
                entry.nutrient.clone(),
                (rank + 1).to_string(),
                food.clone(),
                fmt(*total),
            ])?;
        }
    }

    writer.flush()?;
    Ok(path)
}

fn write_most_bought(out_dir: &Path, bought: &[FoodCount]) -> Result<PathBuf> {
    let path = out_dir.join("most_bought.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    writer.write_record(["rank", "food_id", "description", "count"])?;

    for (rank, food) in bought.iter().enumerate() {
        writer.write_record([
            (rank + 1).to_string(),
            food.food_id.clone(),
            food.description.clone(),
            food.count.to_string(),
        ])?;
    }

    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::YearlyNutrient;

    #[test]
    fn yearly_csv_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let summary = vec![YearlyNutrient {
            year: 2023,
            nutrient: "Protein".to_string(),
            unit: "g".to_string(),
            mean_per_reference_day: 50.0,
            drv: Some(50.0),
            pct_drv: Some(100.0),
            top_foods: vec![("Milk".to_string(), 123.4)],
        }];

        let path = write_yearly(tmp.path(), &summary).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.starts_with("year,nutrient,unit,"));
        assert!(body.contains("2023,Protein,g,50.0000,50.0000,100.0000"));

        let path = write_top_foods(tmp.path(), &summary).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("2023,Protein,1,Milk,123.4000"));
    }

    #[test]
    fn missing_drv_leaves_fields_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let summary = vec![YearlyNutrient {
            year: 2023,
            nutrient: "Zinc".to_string(),
            unit: String::new(),
            mean_per_reference_day: 1.5,
            drv: None,
            pct_drv: None,
            top_foods: Vec::new(),
        }];

        let path = write_yearly(tmp.path(), &summary).unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("2023,Zinc,,1.5000,,\n"));
    }
}
