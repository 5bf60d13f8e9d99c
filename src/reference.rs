//! Nutrient reference store.
//!
//! An immutable lookup of canonical foods (per-100g nutrient values) and
//! adult daily reference values, loaded once per run from two CSV files.
//! A missing or corrupt reference is fatal — no useful output can be
//! produced without it.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::config::Config;
use crate::models::{CanonicalFood, ReferenceValue};

/// Name of the energy nutrient column (kcal per 100 g).
pub const ENERGY: &str = "Energy";

/// Columns of the foods CSV that are not nutrient values.
const FIXED_COLUMNS: [&str; 4] = ["food_id", "description", "category", "portion_grams"];

pub struct ReferenceStore {
    foods: Vec<CanonicalFood>,
    by_id: HashMap<String, usize>,
    drv: HashMap<String, ReferenceValue>,
    /// Nutrient column names in foods-CSV header order, for stable report
    /// output. Taken from the header, not from any row's parsed values, so
    /// a blank cell cannot drop a nutrient from the whole run.
    nutrient_names: Vec<String>,
}

impl ReferenceStore {
    pub fn load(config: &Config) -> Result<Self> {
        let (foods, nutrient_names) = load_foods(&config.reference.foods_csv)?;
        let drv = load_drv(&config.reference.drv_csv)?;

        if foods.is_empty() {
            bail!(
                "Reference store is empty: {}",
                config.reference.foods_csv.display()
            );
        }

        let mut by_id = HashMap::with_capacity(foods.len());
        for (i, food) in foods.iter().enumerate() {
            // Duplicate food_id rows keep the first occurrence
            by_id.entry(food.food_id.clone()).or_insert(i);
        }

        Ok(Self {
            foods,
            by_id,
            drv,
            nutrient_names,
        })
    }

    pub fn foods(&self) -> &[CanonicalFood] {
        &self.foods
    }

    pub fn get(&self, food_id: &str) -> Option<&CanonicalFood> {
        self.by_id.get(food_id).map(|&i| &self.foods[i])
    }

    pub fn drv(&self, nutrient: &str) -> Option<&ReferenceValue> {
        self.drv.get(nutrient)
    }

    pub fn nutrient_names(&self) -> &[String] {
        &self.nutrient_names
    }

    pub fn len(&self) -> usize {
        self.foods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.foods.is_empty()
    }
}

/// Load the foods CSV, returning the rows plus the nutrient column names
/// in header order.
fn load_foods(path: &Path) -> Result<(Vec<CanonicalFood>, Vec<String>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open foods CSV: {}", path.display()))?;

    let headers = reader.headers()?.clone();
    for required in ["food_id", "description"] {
        if !headers.iter().any(|h| h == required) {
            bail!(
                "Foods CSV {} is missing required column '{}'",
                path.display(),
                required
            );
        }
    }

    let col = |name: &str| headers.iter().position(|h| h == name);
    let id_col = col("food_id").unwrap();
    let desc_col = col("description").unwrap();
    let cat_col = col("category");
    let portion_col = col("portion_grams");

    let nutrient_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !FIXED_COLUMNS.contains(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    let nutrient_names: Vec<String> = nutrient_cols.iter().map(|(_, n)| n.clone()).collect();

    let mut foods = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("Corrupt foods CSV row {}", line + 2))?;

        let food_id = record.get(id_col).unwrap_or("").trim().to_string();
        if food_id.is_empty() {
            bail!("Foods CSV row {} has an empty food_id", line + 2);
        }

        let mut nutrients = HashMap::with_capacity(nutrient_cols.len());
        for (i, name) in &nutrient_cols {
            if let Some(raw) = record.get(*i) {
                if let Ok(v) = raw.trim().parse::<f64>() {
                    nutrients.insert(name.clone(), v);
                }
            }
        }

        foods.push(CanonicalFood {
            food_id,
            description: record.get(desc_col).unwrap_or("").trim().to_string(),
            category: cat_col
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .trim()
                .to_string(),
            portion_grams: portion_col
                .and_then(|i| record.get(i))
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| *v > 0.0),
            nutrients_per_100g: nutrients,
        });
    }

    Ok((foods, nutrient_names))
}

fn load_drv(path: &Path) -> Result<HashMap<String, ReferenceValue>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open DRV CSV: {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let (nutrient_col, unit_col, drv_col) = match (col("nutrient"), col("unit"), col("drv")) {
        (Some(n), Some(u), Some(d)) => (n, u, d),
        _ => bail!(
            "DRV CSV {} must have columns: nutrient, unit, drv",
            path.display()
        ),
    };

    let mut table = HashMap::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Corrupt DRV CSV row {}", line + 2))?;
        let nutrient = record.get(nutrient_col).unwrap_or("").trim().to_string();
        if nutrient.is_empty() {
            continue;
        }
        let unit = record.get(unit_col).unwrap_or("").trim().to_string();
        let drv = record
            .get(drv_col)
            .and_then(|v| v.trim().parse::<f64>().ok());

        if let Some(drv) = drv {
            table.entry(nutrient.clone()).or_insert(ReferenceValue {
                nutrient,
                unit,
                drv,
            });
        }
    }

    Ok(table)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Config, DbConfig, ReferenceConfig};

    pub(crate) fn write_reference(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let foods = dir.join("foods.csv");
        std::fs::write(
            &foods,
            "food_id,description,category,portion_grams,Energy,Protein,Sugars\n\
             f001,\"Apples, raw, with skin\",Fruits,150,52,0.3,10.4\n\
             f002,\"Chips, paprika flavor\",Snacks,,536,6.6,2.3\n\
             f003,\"Milk, whole, 3.25% fat\",Dairy,244,61,3.2,5.1\n\
             f001,\"Apples, duplicate row\",Fruits,150,99,9.9,9.9\n",
        )
        .unwrap();

        let drv = dir.join("drv.csv");
        std::fs::write(
            &drv,
            "nutrient,unit,drv\n\
             Energy,kcal,2500\n\
             Protein,g,50\n\
             Sugars,g,90\n",
        )
        .unwrap();

        (foods, drv)
    }

    fn store_from(dir: &Path) -> ReferenceStore {
        let (foods_csv, drv_csv) = write_reference(dir);
        let config = Config {
            db: DbConfig {
                path: dir.join("db.sqlite"),
            },
            reference: ReferenceConfig {
                foods_csv,
                drv_csv,
            },
            oracle: Default::default(),
            retrieval: Default::default(),
            quantity: Default::default(),
            report: Default::default(),
            adapters: Default::default(),
        };
        ReferenceStore::load(&config).unwrap()
    }

    #[test]
    fn loads_foods_and_drv() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_from(tmp.path());
        assert_eq!(store.len(), 4);
        let apple = store.get("f001").unwrap();
        assert_eq!(apple.category, "Fruits");
        assert_eq!(apple.portion_grams, Some(150.0));
        assert_eq!(apple.nutrients_per_100g.get(ENERGY), Some(&52.0));
        assert_eq!(store.drv("Protein").unwrap().drv, 50.0);
    }

    #[test]
    fn duplicate_food_id_keeps_first() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_from(tmp.path());
        // Second f001 row exists in the list but lookup resolves to the first
        assert_eq!(
            store.get("f001").unwrap().description,
            "Apples, raw, with skin"
        );
    }

    #[test]
    fn missing_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            db: DbConfig {
                path: tmp.path().join("db.sqlite"),
            },
            reference: ReferenceConfig {
                foods_csv: tmp.path().join("nope.csv"),
                drv_csv: tmp.path().join("nope2.csv"),
            },
            oracle: Default::default(),
            retrieval: Default::default(),
            quantity: Default::default(),
            report: Default::default(),
            adapters: Default::default(),
        };
        assert!(ReferenceStore::load(&config).is_err());
    }

    #[test]
    fn nutrient_names_follow_header_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_from(tmp.path());
        assert_eq!(store.nutrient_names(), &["Energy", "Protein", "Sugars"]);
    }

    #[test]
    fn blank_cell_in_first_row_keeps_the_column() {
        let tmp = tempfile::tempdir().unwrap();
        let foods = tmp.path().join("foods.csv");
        // f001 has no Sugars value; the column must still be reported
        std::fs::write(
            &foods,
            "food_id,description,category,portion_grams,Energy,Sugars\n\
             f001,\"Apples, raw\",Fruits,150,52,\n\
             f002,\"Candy, hard\",Snacks,,380,95\n",
        )
        .unwrap();
        let drv = tmp.path().join("drv.csv");
        std::fs::write(&drv, "nutrient,unit,drv\nEnergy,kcal,2500\n").unwrap();

        let config = Config {
            db: DbConfig {
                path: tmp.path().join("db.sqlite"),
            },
            reference: ReferenceConfig {
                foods_csv: foods,
                drv_csv: drv,
            },
            oracle: Default::default(),
            retrieval: Default::default(),
            quantity: Default::default(),
            report: Default::default(),
            adapters: Default::default(),
        };
        let store = ReferenceStore::load(&config).unwrap();

        assert_eq!(store.nutrient_names(), &["Energy", "Sugars"]);
        // The blank cell itself stays absent from that row's values
        assert!(store
            .get("f001")
            .unwrap()
            .nutrients_per_100g
            .get("Sugars")
            .is_none());
        assert_eq!(
            store.get("f002").unwrap().nutrients_per_100g.get("Sugars"),
            Some(&95.0)
        );
    }
}
