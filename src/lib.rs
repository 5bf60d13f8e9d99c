//! # BasketLens
//!
//! A local-first pipeline that turns grocery receipts into yearly
//! nutrition reports.
//!
//! BasketLens ingests shopping trips (ticket CSVs or receipt photos),
//! resolves each free-text product name to a canonical food database entry
//! using BM25 retrieval plus an LLM oracle, estimates purchased mass, and
//! aggregates per-trip nutrients into yearly summaries against adult daily
//! reference values. Everything lives in one SQLite file; oracle answers
//! are cached write-once so reruns cost nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Adapters   │──▶│  Resolution  │──▶│  SQLite   │
//! │ CSV / OCR   │   │ BM25+Oracle  │   │ + cache   │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │
//!                                           ▼
//!                                     ┌──────────┐
//!                                     │  Report   │
//!                                     │ CSV files │
//!                                     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! blens init                    # create database
//! blens ingest tickets          # ingest ticket CSVs
//! blens ingest ocr              # transcribe receipt photos
//! blens resolve                 # match product names to foods
//! blens report                  # write the nutrition report
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`reference`] | Food and DRV reference store |
//! | [`retriever`] | BM25 candidate retrieval |
//! | [`oracle`] | LLM oracle abstraction |
//! | [`resolver`] | Cached name resolution |
//! | [`quantity`] | Purchased-mass estimation |
//! | [`ingest`] | Ticket CSV adapter |
//! | [`ocr`] | Receipt image adapter |
//! | [`trips`] | Per-trip aggregation |
//! | [`yearly`] | Yearly DRV summaries |
//! | [`report`] | CSV report output |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod enrich;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod oracle;
pub mod progress;
pub mod quantity;
pub mod reference;
pub mod report;
pub mod resolver;
pub mod retriever;
pub mod stats;
pub mod trips;
pub mod yearly;
