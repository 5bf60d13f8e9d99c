//! Quantity normalization: estimated purchased mass from a product name.
//!
//! Product names often carry an embedded quantity token ("175G", "1.5KG",
//! "2X250G", "0,600 KG"). When present, that token is authoritative and the
//! basis is reported as `explicit`. When absent, the estimate falls back to
//! the matched food's portion size, then a category default, then the global
//! default, with basis `default`. Volume units convert to grams at unit
//! density. The basis flag travels with every purchase row so the report can
//! distinguish measured from estimated mass; it never weights the totals.

use regex::Regex;
use std::sync::OnceLock;

use crate::config::QuantityConfig;
use crate::models::{CanonicalFood, GramsBasis};

/// Quantity token: optional `N x` multiplier, a number with comma or dot
/// decimals, then a mass/volume unit. The unit must be adjacent so stray
/// numbers (prices, percentages) never count as quantities.
fn quantity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:(\d+)\s*x\s*)?(\d+(?:[.,]\d+)?)\s*(KG|GR|G|L|DL|CL|ML)\b").unwrap()
    })
}

/// Grams per one unit of each recognized abbreviation. Volume is treated as
/// grams at unit density (1 ml = 1 g).
fn unit_to_grams(unit: &str) -> f64 {
    match unit.to_ascii_uppercase().as_str() {
        "KG" => 1000.0,
        "L" => 1000.0,
        "DL" => 100.0,
        "CL" => 10.0,
        _ => 1.0, // G, GR, ML
    }
}

/// Extract an explicit quantity in grams from a product name, if present.
pub fn grams_from_name(product_name: &str) -> Option<f64> {
    let caps = quantity_re().captures(product_name)?;

    let multiplier = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(1.0);
    let amount: f64 = caps.get(2)?.as_str().replace(',', ".").parse().ok()?;
    let unit = caps.get(3)?.as_str();

    let grams = multiplier * amount * unit_to_grams(unit);
    (grams > 0.0).then_some(grams)
}

/// Estimate the purchased mass for one row.
///
/// Fallback chain when the name carries no quantity token:
/// matched food's `portion_grams` → category default → global default.
pub fn estimate_grams(
    product_name: &str,
    food: Option<&CanonicalFood>,
    config: &QuantityConfig,
) -> (f64, GramsBasis) {
    if let Some(grams) = grams_from_name(product_name) {
        return (grams, GramsBasis::Explicit);
    }

    if let Some(food) = food {
        if let Some(portion) = food.portion_grams {
            return (portion, GramsBasis::Default);
        }
        if let Some(&grams) = config.category_defaults.get(&food.category) {
            return (grams, GramsBasis::Default);
        }
    }

    (config.default_grams, GramsBasis::Default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn food(category: &str, portion: Option<f64>) -> CanonicalFood {
        CanonicalFood {
            food_id: "f1".to_string(),
            description: "Test food".to_string(),
            category: category.to_string(),
            portion_grams: portion,
            nutrients_per_100g: HashMap::new(),
        }
    }

    #[test]
    fn explicit_grams_token() {
        let cfg = QuantityConfig::default();
        let (grams, basis) = estimate_grams("LAYS PAPRIKA CHIPS 175G", None, &cfg);
        assert_eq!(grams, 175.0);
        assert_eq!(basis, GramsBasis::Explicit);
    }

    #[test]
    fn kilograms_convert() {
        assert_eq!(grams_from_name("RIZ BASMATI 1.5KG"), Some(1500.0));
        assert_eq!(grams_from_name("POULET 0,600 KG"), Some(600.0));
    }

    #[test]
    fn volume_at_unit_density() {
        assert_eq!(grams_from_name("LAIT ENTIER 1L"), Some(1000.0));
        assert_eq!(grams_from_name("CREME 25CL"), Some(250.0));
        assert_eq!(grams_from_name("SAUCE 330ML"), Some(330.0));
    }

    #[test]
    fn multiplier_prefix() {
        assert_eq!(grams_from_name("YAOURT 2X250G"), Some(500.0));
        assert_eq!(grams_from_name("COLA 6 X 33CL"), Some(1980.0));
    }

    #[test]
    fn first_unit_adjacent_token_wins() {
        // "250G" is the first number adjacent to a unit; the bare "12" is not
        assert_eq!(grams_from_name("12 GRAINS BREAD 250G SLICED"), Some(250.0));
    }

    #[test]
    fn bare_numbers_are_not_quantities() {
        assert_eq!(grams_from_name("COUPON 21EME A 1/2 PRIX"), None);
        assert_eq!(grams_from_name("APPEL"), None);
    }

    #[test]
    fn fallback_to_portion_grams() {
        let cfg = QuantityConfig::default();
        let f = food("Fruits", Some(150.0));
        let (grams, basis) = estimate_grams("APPEL", Some(&f), &cfg);
        assert_eq!(grams, 150.0);
        assert_eq!(basis, GramsBasis::Default);
        assert!(grams > 0.0);
    }

    #[test]
    fn fallback_to_category_default() {
        let mut cfg = QuantityConfig::default();
        cfg.category_defaults.insert("Dairy".to_string(), 250.0);
        let f = food("Dairy", None);
        let (grams, basis) = estimate_grams("FROMAGE FRAIS", Some(&f), &cfg);
        assert_eq!(grams, 250.0);
        assert_eq!(basis, GramsBasis::Default);
    }

    #[test]
    fn fallback_to_global_default() {
        let cfg = QuantityConfig::default();
        let (grams, basis) = estimate_grams("MYSTERY ITEM", None, &cfg);
        assert_eq!(grams, 100.0);
        assert_eq!(basis, GramsBasis::Default);
    }
}
