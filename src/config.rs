use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub quantity: QuantityConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReferenceConfig {
    /// Foods CSV: food_id, description, category, portion_grams, nutrient columns.
    pub foods_csv: PathBuf,
    /// DRV CSV: nutrient, unit, drv.
    pub drv_csv: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// `"openrouter"` or `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Vision model used for receipt transcription.
    #[serde(default)]
    pub vision_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of concurrently in-flight oracle calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            vision_model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
        }
    }
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Shortlist length shown to the disambiguation oracle.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_candidate_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuantityConfig {
    /// Fallback grams when neither the name, the food, nor the category
    /// provides a serving size.
    #[serde(default = "default_grams")]
    pub default_grams: f64,
    /// Per-category default serving sizes in grams.
    #[serde(default)]
    pub category_defaults: HashMap<String, f64>,
}

impl Default for QuantityConfig {
    fn default() -> Self {
        Self {
            default_grams: default_grams(),
            category_defaults: HashMap::new(),
        }
    }
}

fn default_grams() -> f64 {
    100.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// Daily energy reference every trip is rescaled to, in kcal.
    #[serde(default = "default_reference_kcal")]
    pub reference_kcal: f64,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    /// Length of the top-contributing-foods list per nutrient.
    #[serde(default = "default_top_foods")]
    pub top_foods: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            reference_kcal: default_reference_kcal(),
            out_dir: default_out_dir(),
            top_foods: default_top_foods(),
        }
    }
}

fn default_reference_kcal() -> f64 {
    2500.0
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_top_foods() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdaptersConfig {
    pub tickets: Option<TicketsAdapterConfig>,
    pub receipts: Option<ReceiptsAdapterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TicketsAdapterConfig {
    /// Directory holding one CSV per shopping trip, named `YYYY_MM_DD*.csv`.
    pub dir: PathBuf,
    #[serde(default = "default_ticket_globs")]
    pub include_globs: Vec<String>,
}

fn default_ticket_globs() -> Vec<String> {
    vec!["**/*.csv".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReceiptsAdapterConfig {
    /// Directory holding receipt images to transcribe.
    pub dir: PathBuf,
    #[serde(default = "default_receipt_globs")]
    pub include_globs: Vec<String>,
}

fn default_receipt_globs() -> Vec<String> {
    vec!["**/*.jpg".to_string(), "**/*.jpeg".to_string(), "**/*.png".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.candidate_k == 0 {
        anyhow::bail!("retrieval.candidate_k must be >= 1");
    }

    if config.quantity.default_grams <= 0.0 {
        anyhow::bail!("quantity.default_grams must be > 0");
    }

    if config.report.reference_kcal <= 0.0 {
        anyhow::bail!("report.reference_kcal must be > 0");
    }

    if config.oracle.concurrency == 0 {
        anyhow::bail!("oracle.concurrency must be >= 1");
    }

    if config.oracle.is_enabled() && config.oracle.model.is_none() {
        anyhow::bail!(
            "oracle.model must be specified when provider is '{}'",
            config.oracle.provider
        );
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openrouter" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be disabled or openrouter.",
            other
        ),
    }

    Ok(config)
}
