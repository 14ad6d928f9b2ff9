//! Canonical in-memory view of live market state.
//!
//! The cache is the single owner of Market records. One ingestion worker
//! writes snapshots; every other component reads through immutable
//! copy-on-read views. Snapshots are append-at-monotonic-timestamp: an older
//! snapshot never overwrites a newer record.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::types::{Market, Quote};

/// Cache lookup failures. No retries here; callers decide.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("unknown ticker: {0}")]
    UnknownTicker(String),
    /// The market exists but is not open; its quotes are stale and must not
    /// feed detection.
    #[error("market {0} is not open")]
    StaleMarket(String),
}

/// Outcome of applying one ingestion snapshot.
#[derive(Debug, Default, Clone)]
pub struct SnapshotStats {
    pub applied: usize,
    /// Records skipped because the cache already held a newer update.
    pub skipped_stale: usize,
    /// Tickers rejected for impossible state (malformed quotes, negative
    /// depth). A non-empty list is a fatal signal for the caller.
    pub anomalies: Vec<String>,
}

struct CacheInner {
    markets: FxHashMap<String, Arc<Market>>,
    version: u64,
}

/// Versioned market table. Writers bump the version; readers copy under a
/// single read guard, which yields one coherent tick per view.
pub struct MarketCache {
    inner: RwLock<CacheInner>,
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                markets: FxHashMap::default(),
                version: 0,
            }),
        }
    }

    /// Apply a full or delta snapshot. Records older than what the cache
    /// holds are dropped; malformed records are reported, never stored.
    pub fn apply_snapshot(&self, markets: Vec<Market>) -> SnapshotStats {
        let mut stats = SnapshotStats::default();
        let mut inner = self.inner.write().expect("cache lock poisoned");

        for market in markets {
            if !market.quote.is_well_formed() || market.yes_depth < 0 || market.no_depth < 0 {
                stats.anomalies.push(market.ticker.clone());
                continue;
            }
            match inner.markets.get(&market.ticker) {
                Some(existing) if existing.updated_at > market.updated_at => {
                    stats.skipped_stale += 1;
                }
                _ => {
                    inner.markets.insert(market.ticker.clone(), Arc::new(market));
                    stats.applied += 1;
                }
            }
        }

        if stats.applied > 0 {
            inner.version += 1;
        }
        stats
    }

    /// Point lookup. Errors when the ticker is unknown or the market is not
    /// open (stale quotes).
    pub fn get(&self, ticker: &str) -> Result<Arc<Market>, CacheError> {
        let inner = self.inner.read().expect("cache lock poisoned");
        let market = inner
            .markets
            .get(ticker)
            .ok_or_else(|| CacheError::UnknownTicker(ticker.to_string()))?;
        if !market.status.is_open() {
            return Err(CacheError::StaleMarket(ticker.to_string()));
        }
        Ok(Arc::clone(market))
    }

    /// Lookup without the open-status check. Used for fingerprint sweeps and
    /// lifecycle decisions, which must see closed markets too.
    pub fn peek(&self, ticker: &str) -> Option<Arc<Market>> {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.markets.get(ticker).map(Arc::clone)
    }

    /// All open markets grouped under an event.
    pub fn markets_for_event(&self, event_ticker: &str) -> Vec<Arc<Market>> {
        let inner = self.inner.read().expect("cache lock poisoned");
        let mut out: Vec<Arc<Market>> = inner
            .markets
            .values()
            .filter(|m| m.event_ticker == event_ticker && m.status.is_open())
            .map(Arc::clone)
            .collect();
        out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        out
    }

    /// Every open market, sorted by ticker. Discovery batching input.
    pub fn open_markets(&self) -> Vec<Arc<Market>> {
        let inner = self.inner.read().expect("cache lock poisoned");
        let mut out: Vec<Arc<Market>> = inner
            .markets
            .values()
            .filter(|m| m.status.is_open())
            .map(Arc::clone)
            .collect();
        out.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        out
    }

    /// Consistent snapshot of quotes for the given tickers.
    ///
    /// All entries are copied under one read guard: no market in the set can
    /// change between the first and last read. Errors if any ticker is
    /// unknown or not open.
    pub fn price_view(&self, tickers: &[&str]) -> Result<PriceView, CacheError> {
        let inner = self.inner.read().expect("cache lock poisoned");
        let mut entries = FxHashMap::default();
        for &ticker in tickers {
            let market = inner
                .markets
                .get(ticker)
                .ok_or_else(|| CacheError::UnknownTicker(ticker.to_string()))?;
            if !market.status.is_open() {
                return Err(CacheError::StaleMarket(ticker.to_string()));
            }
            entries.insert(
                ticker.to_string(),
                PriceEntry {
                    quote: market.quote,
                    yes_depth: market.yes_depth,
                    no_depth: market.no_depth,
                },
            );
        }
        Ok(PriceView {
            version: inner.version,
            taken_at: Utc::now(),
            entries,
        })
    }

    pub fn version(&self) -> u64 {
        self.inner.read().expect("cache lock poisoned").version
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One coherent tick of quotes for a ticker set.
#[derive(Debug, Clone)]
pub struct PriceView {
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    entries: FxHashMap<String, PriceEntry>,
}

/// Quote plus observed depth for one ticker inside a view.
#[derive(Debug, Clone, Copy)]
pub struct PriceEntry {
    pub quote: Quote,
    pub yes_depth: i64,
    pub no_depth: i64,
}

impl PriceView {
    pub fn entry(&self, ticker: &str) -> Option<&PriceEntry> {
        self.entries.get(ticker)
    }

    pub fn quote(&self, ticker: &str) -> Option<Quote> {
        self.entries.get(ticker).map(|e| e.quote)
    }
}
