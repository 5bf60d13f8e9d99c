//! Candidate retrieval: lexical shortlists over the reference store.
//!
//! Product strings are short, abbreviated, and brand-prefixed; a lexical
//! BM25 ranking narrows tens of thousands of reference entries down to a
//! handful of candidates before the expensive oracle is consulted. The
//! index is read-only after construction and retrieval is deterministic:
//! scores descend and ties break on `food_id` ascending.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::models::CanonicalFood;
use crate::reference::ReferenceStore;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

/// A ranked candidate: reference index into the store plus its score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub food_id: String,
    pub score: f64,
}

pub struct Retriever {
    /// Token → (doc index, term frequency) postings.
    postings: HashMap<String, Vec<(usize, u32)>>,
    doc_lens: Vec<u32>,
    food_ids: Vec<String>,
    avg_len: f64,
}

impl Retriever {
    pub fn build(store: &ReferenceStore) -> Self {
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut doc_lens = Vec::with_capacity(store.len());
        let mut food_ids = Vec::with_capacity(store.len());

        for (doc, food) in store.foods().iter().enumerate() {
            let tokens = tokenize(&food.description);
            doc_lens.push(tokens.len() as u32);
            food_ids.push(food.food_id.clone());

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (token, count) in tf {
                postings.entry(token).or_default().push((doc, count));
            }
        }

        let total: u64 = doc_lens.iter().map(|&l| u64::from(l)).sum();
        let avg_len = if doc_lens.is_empty() {
            0.0
        } else {
            total as f64 / doc_lens.len() as f64
        };

        Self {
            postings,
            doc_lens,
            food_ids,
            avg_len,
        }
    }

    /// Return up to `k` candidates for a product name, best first.
    ///
    /// Returns an empty list (never an error) when no query token overlaps
    /// any reference description — the resolver treats that as "no match"
    /// without consulting the oracle.
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<Candidate> {
        let tokens = tokenize(&normalize_query(query));
        if tokens.is_empty() || self.doc_lens.is_empty() {
            return Vec::new();
        }

        let n_docs = self.doc_lens.len() as f64;
        let mut scores: HashMap<usize, f64> = HashMap::new();

        for token in &tokens {
            let Some(posting) = self.postings.get(token) else {
                continue;
            };
            let df = posting.len() as f64;
            // BM25 idf, floored at a small positive value so very common
            // tokens still contribute a consistent ordering
            let idf = ((n_docs - df + 0.5) / (df + 0.5) + 1.0).ln();

            for &(doc, tf) in posting {
                let tf = f64::from(tf);
                let len_norm =
                    1.0 - BM25_B + BM25_B * f64::from(self.doc_lens[doc]) / self.avg_len;
                let term = idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * len_norm);
                *scores.entry(doc).or_insert(0.0) += term;
            }
        }

        let mut ranked: Vec<Candidate> = scores
            .into_iter()
            .map(|(doc, score)| Candidate {
                food_id: self.food_ids[doc].clone(),
                score,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.food_id.cmp(&b.food_id))
        });
        ranked.truncate(k);
        ranked
    }

    /// Materialize candidates into reference entries, in ranked order.
    pub fn lookup<'a>(
        &self,
        store: &'a ReferenceStore,
        candidates: &[Candidate],
    ) -> Vec<&'a CanonicalFood> {
        candidates
            .iter()
            .filter_map(|c| store.get(&c.food_id))
            .collect()
    }
}

/// Strip embedded weight tokens ("400G", "1.5L", "250GR") and bare digits
/// before tokenizing, so quantities never influence lexical ranking.
pub fn normalize_query(name: &str) -> String {
    static WEIGHT_RE: OnceLock<Regex> = OnceLock::new();
    static DIGIT_RE: OnceLock<Regex> = OnceLock::new();

    let weight =
        WEIGHT_RE.get_or_init(|| Regex::new(r"\b\d[\d,\.]*\s*(?i:KG|GR|G|L|CL|ML)\b").unwrap());
    let digits = DIGIT_RE.get_or_init(|| Regex::new(r"\b\d+\b").unwrap());

    let cleaned = weight.replace_all(name, " ");
    let cleaned = digits.replace_all(&cleaned, " ");
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
