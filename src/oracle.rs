//! Oracle provider abstraction and implementations.
//!
//! Defines the [`Oracle`] trait — the narrow typed seam in front of the
//! external language/vision model — and concrete implementations:
//! - **[`DisabledOracle`]** — returns errors; used when no provider is configured.
//! - **[`OpenRouterOracle`]** — calls the OpenRouter chat-completions API with
//!   retry and backoff.
//!
//! The oracle is used for two things: selecting one canonical food from a
//! candidate shortlist, and transcribing a receipt image into line items.
//! Responses are parsed defensively; the oracle's response shape never leaks
//! into downstream types.
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network errors are retried with exponential
//! backoff (1s, 2s, 4s, ... capped at 2^5); other 4xx responses and
//! unparseable bodies fail immediately as [`OracleError::Malformed`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::config::OracleConfig;
use crate::models::CanonicalFood;

const DEFAULT_URL: &str = "https://openrouter.ai/api/v1";

/// Error kinds at the oracle seam.
///
/// `Transient` is worth retrying; `Malformed` is not — the caller downgrades
/// it to a non-match (or skips the image) and keeps the raw body for audit.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transient oracle error: {0}")]
    Transient(String),
    #[error("malformed oracle output: {reason}")]
    Malformed { reason: String, raw: String },
    #[error("oracle provider is disabled")]
    Disabled,
}

/// The oracle's answer to "which of these candidates is this product?".
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Zero-based index into the candidate shortlist.
    Pick {
        index: usize,
        grams: Option<f64>,
        rationale: Option<String>,
    },
    /// Explicit "none of these".
    NoMatch { rationale: Option<String> },
}

/// One line item transcribed from a receipt image.
#[derive(Debug, Clone)]
pub struct ReceiptLine {
    pub product_name: String,
    pub price: Option<f64>,
    pub barcode: Option<String>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Returns the model identifier used for disambiguation.
    fn model_name(&self) -> &str;

    /// Select one candidate (or none) for a product name.
    async fn select_match(
        &self,
        product_name: &str,
        candidates: &[CanonicalFood],
    ) -> Result<Selection, OracleError>;

    /// Transcribe a receipt image into line items.
    async fn transcribe_receipt(
        &self,
        image: &[u8],
        mime: &str,
    ) -> Result<Vec<ReceiptLine>, OracleError>;
}

/// Create the appropriate [`Oracle`] based on configuration.
///
/// # Errors
///
/// Returns an error for unknown provider names or if the provider cannot be
/// initialized (missing model or API key).
pub fn create_oracle(config: &OracleConfig) -> Result<Box<dyn Oracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledOracle)),
        "openrouter" => Ok(Box::new(OpenRouterOracle::new(config)?)),
        other => bail!("Unknown oracle provider: {}", other),
    }
}

// ============ Disabled Oracle ============

/// A no-op oracle that always returns errors.
///
/// Commands that need the oracle (`resolve`, `ingest ocr`) fail fast with a
/// configuration hint when this provider is active.
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    fn model_name(&self) -> &str {
        "disabled"
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
        Err(OracleError::Disabled)
    }
}

// ============ OpenRouter Oracle ============

const SELECT_PROMPT: &str = "You are a nutrition database assistant. You receive one product name \
from a grocery receipt (often abbreviated French/Dutch/English labels) and a numbered list of \
candidate food database entries. Pick the single best candidate, or answer none if no candidate \
is appropriate.\n\
Common receipt terms: PATE = pasta (not pâté), POULET = chicken, SAUMON = salmon, OEUFS = eggs, \
LAIT = milk, BEURRE = butter, FROMAGE = cheese, BOEUF = beef, BIO = organic.\n\
Also extract the weight in grams if the product name mentions one \
(400G -> 400, 1.5KG -> 1500, 0,600 Kg -> 600, 1L -> 1000); use null otherwise.\n\
Respond ONLY with a valid JSON object, no markdown fences, no explanation:\n\
{\"action\": \"match\", \"index\": <0-based candidate index>, \"grams\": <number|null>, \"reason\": \"<short>\"}\n\
or\n\
{\"action\": \"none\", \"reason\": \"<short>\"}";

const TRANSCRIBE_PROMPT: &str = "You are a receipt OCR system. Extract ALL products from this \
receipt image.\n\
Return ONLY a valid JSON array, nothing else. No markdown, no explanations.\n\
Format: [{\"product_name\": \"...\", \"price\": \"...\", \"barcode\": \"...\"}, ...]\n\
Rules: extract exact product names as printed; include duplicates; prices like \"3.50\"; \
barcode empty string if not visible; if kg-priced, keep the unit in product_name.";

/// Oracle backed by the OpenRouter chat-completions API.
///
/// Requires the `OPENROUTER_API_KEY` environment variable. Disambiguation
/// uses `oracle.model`; receipt transcription uses `oracle.vision_model`
/// (falling back to `oracle.model`).
pub struct OpenRouterOracle {
    model: String,
    vision_model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenRouterOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.model required for OpenRouter provider"))?;
        let vision_model = config.vision_model.clone().unwrap_or_else(|| model.clone());
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_URL.to_string());

        if std::env::var("OPENROUTER_API_KEY").is_err() {
            bail!("OPENROUTER_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            vision_model,
            url,
            max_retries: config.max_retries,
            client,
        })
    }

    /// POST a chat-completions request with retry/backoff and return the
    /// assistant message content.
    async fn chat(&self, body: serde_json::Value) -> Result<String, OracleError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| OracleError::Transient("OPENROUTER_API_KEY not set".to_string()))?;

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.url))
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            OracleError::Transient(format!("response body error: {}", e))
                        })?;
                        let content = json
                            .get("choices")
                            .and_then(|c| c.get(0))
                            .and_then(|c| c.get("message"))
                            .and_then(|m| m.get("content"))
                            .and_then(|c| c.as_str());
                        return match content {
                            Some(text) => Ok(text.to_string()),
                            None => Err(OracleError::Malformed {
                                reason: "missing choices[0].message.content".to_string(),
                                raw: json.to_string(),
                            }),
                        };
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(OracleError::Transient(format!(
                            "API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(OracleError::Malformed {
                        reason: format!("API error {}", status),
                        raw: body_text,
                    });
                }
                Err(e) => {
                    last_err = Some(OracleError::Transient(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| OracleError::Transient("oracle call failed after retries".into())))
    }
}

#[async_trait]
impl Oracle for OpenRouterOracle {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn select_match(
        &self,
        product_name: &str,
        candidates: &[CanonicalFood],
    ) -> Result<Selection, OracleError> {
        let listing: Vec<String> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}: {}", i, c.description))
            .collect();

        let user_msg = serde_json::json!({
            "product_name": product_name,
            "candidates": listing,
        })
        .to_string();

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SELECT_PROMPT},
                {"role": "user", "content": user_msg},
            ],
            "temperature": 0,
            "max_tokens": 512,
        });

        let raw = self.chat(body).await?;
        parse_selection(&raw, candidates.len())
    }

    async fn transcribe_receipt(
        &self,
        image: &[u8],
        mime: &str,
    ) -> Result<Vec<ReceiptLine>, OracleError> {
        let b64 = base64::engine::general_purpose::STANDARD.encode(image);
        let data_url = format!("data:{};base64,{}", mime, b64);

        let body = serde_json::json!({
            "model": self.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": TRANSCRIBE_PROMPT},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            }],
            "temperature": 0,
            "max_tokens": 4000,
        });

        let raw = self.chat(body).await?;
        parse_receipt_lines(&raw)
    }
}

// ============ Defensive response parsing ============

/// Strip accidental markdown code fences around a model response.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (possibly "```json") and the closing fence
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a disambiguation response into a [`Selection`].
///
/// Anything that does not resolve to a valid candidate index or an explicit
/// "none" becomes a non-match or a `Malformed` error — never a panic.
pub fn parse_selection(raw: &str, n_candidates: usize) -> Result<Selection, OracleError> {
    let cleaned = strip_fences(raw);

    static OBJ_RE: OnceLock<Regex> = OnceLock::new();
    let obj_re = OBJ_RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap());
    let json_text = obj_re
        .find(cleaned)
        .map(|m| m.as_str())
        .unwrap_or(cleaned);

    let value: serde_json::Value =
        serde_json::from_str(json_text).map_err(|e| OracleError::Malformed {
            reason: format!("not valid JSON: {}", e),
            raw: raw.to_string(),
        })?;

    let rationale = value
        .get("reason")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string());

    match value.get("action").and_then(|a| a.as_str()) {
        Some("none") => Ok(Selection::NoMatch { rationale }),
        Some("match") => {
            let index = value.get("index").and_then(|i| i.as_u64());
            match index {
                Some(i) if (i as usize) < n_candidates => Ok(Selection::Pick {
                    index: i as usize,
                    grams: parse_grams_field(value.get("grams")),
                    rationale,
                }),
                // An index outside the shortlist is a non-match, not a crash
                _ => Ok(Selection::NoMatch {
                    rationale: Some(format!(
                        "oracle returned invalid index {:?} for {} candidates",
                        index, n_candidates
                    )),
                }),
            }
        }
        _ => Err(OracleError::Malformed {
            reason: "missing or unknown action field".to_string(),
            raw: raw.to_string(),
        }),
    }
}

/// Grams may come back as a number, a numeric string, or null.
fn parse_grams_field(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64().filter(|g| *g > 0.0),
        serde_json::Value::String(s) => {
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            digits.parse::<f64>().ok().filter(|g| *g > 0.0)
        }
        _ => None,
    }
}

/// Parse a receipt transcription response into line items.
pub fn parse_receipt_lines(raw: &str) -> Result<Vec<ReceiptLine>, OracleError> {
    let cleaned = strip_fences(raw);

    static ARR_RE: OnceLock<Regex> = OnceLock::new();
    let arr_re = ARR_RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").unwrap());
    let json_text = arr_re
        .find(cleaned)
        .map(|m| m.as_str())
        .unwrap_or(cleaned);

    let value: serde_json::Value =
        serde_json::from_str(json_text).map_err(|e| OracleError::Malformed {
            reason: format!("not valid JSON: {}", e),
            raw: raw.to_string(),
        })?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        let Some(name) = item.get("product_name").and_then(|n| n.as_str()) else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let price = match item.get("price") {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
            _ => None,
        };
        let barcode = item
            .get("barcode")
            .and_then(|b| b.as_str())
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());

        lines.push(ReceiptLine {
            product_name: name.to_string(),
            price,
            barcode,
        });
    }

    Ok(lines)
}
