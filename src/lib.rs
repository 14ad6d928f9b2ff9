//! Cross-Market Mispricing Detector & Trader
//!
//! Detects logical pricing inconsistencies across related binary
//! prediction-market contracts and executes coordinated multi-leg trades
//! when constraints are violated. The pipeline: market ingestion feeds a
//! versioned cache; a typed relationship catalog (SUBSET, THRESHOLD,
//! PARTITION, IMPLICATION) joins live prices in the violation detector;
//! scored opportunities pass the risk governor's admission ladder and run
//! through the multi-leg execution engine; confirmed fills reconcile back
//! into the position ledger.

pub mod alerts;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod detector;
pub mod exchange;
pub mod execution;
pub mod fees;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod pnl;
pub mod retry;
pub mod risk;
pub mod store;
pub mod types;
