//! Relationship catalog: typed price constraints over sets of markets.
//!
//! The catalog is the single owner of Relationship records. It enforces
//! structural well-formedness and settlement-rules fingerprint matching; it
//! never interprets constraint semantics itself (that is the detector's
//! job) and never judges whether a relationship is true (that is the
//! discovery source's job).

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::cache::MarketCache;
use crate::types::{RelationshipCandidate, RelationshipKind, Revalidation};

/// Stable hash of a market's settlement-rules text. A changed fingerprint
/// means the market's meaning may have changed under the relationship.
pub fn rules_fingerprint(rules: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rules.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("malformed relationship: {0}")]
    Malformed(String),
    #[error("duplicate relationship for canonical key {0}")]
    DuplicateForSameTickers(String),
    #[error("market {0} not present in cache")]
    MissingMarket(String),
    #[error("unknown relationship id {0}")]
    Unknown(Uuid),
}

/// A stored, fingerprinted constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub kind: RelationshipKind,
    /// Curator's certainty in [0, 1].
    pub confidence: f64,
    /// Opaque rationale from the discovery source.
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    /// Settlement-rules fingerprint per involved ticker, captured at
    /// creation time.
    pub fingerprints: BTreeMap<String, String>,
    /// Terminal once set; an invalidated relationship is never re-activated.
    pub invalidated_reason: Option<String>,
}

impl Relationship {
    pub fn is_invalidated(&self) -> bool {
        self.invalidated_reason.is_some()
    }
}

/// Outcome of an upsert: stored fresh, or refreshed an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Uuid),
    Refreshed(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Refreshed(id) => *id,
        }
    }
}

/// Owner and lifecycle manager for relationships.
pub struct RelationshipCatalog {
    confidence_floor: f64,
    revalidate_after: Duration,
    relationships: FxHashMap<Uuid, Relationship>,
    by_key: FxHashMap<String, Uuid>,
}

impl RelationshipCatalog {
    pub fn new(confidence_floor: f64, revalidate_after: Duration) -> Self {
        Self {
            confidence_floor,
            revalidate_after,
            relationships: FxHashMap::default(),
            by_key: FxHashMap::default(),
        }
    }

    /// Canonical dedupe key: tag plus sorted tickers. Two SUBSETs over the
    /// same pair collapse to one entry regardless of discovery order.
    fn canonical_key(kind: &RelationshipKind) -> String {
        let mut tickers: Vec<&str> = kind.tickers();
        tickers.sort_unstable();
        format!("{}:{}", kind.tag(), tickers.join("|"))
    }

    fn validate_structure(kind: &RelationshipKind) -> Result<(), CatalogError> {
        let tickers = kind.tickers();
        if tickers.len() < 2 {
            return Err(CatalogError::Malformed(format!(
                "{} needs at least 2 tickers, got {}",
                kind.tag(),
                tickers.len()
            )));
        }
        let mut seen: Vec<&str> = tickers.clone();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            return Err(CatalogError::Malformed(format!(
                "{} references a ticker twice",
                kind.tag()
            )));
        }
        if let RelationshipKind::Implication { conditional_prob, .. } = kind {
            if !(0.0..=1.0).contains(conditional_prob) {
                return Err(CatalogError::Malformed(format!(
                    "conditional probability {} outside [0, 1]",
                    conditional_prob
                )));
            }
        }
        Ok(())
    }

    /// Validate and store a candidate, fingerprinting the current settlement
    /// rules of every involved market.
    ///
    /// A candidate matching an existing live entry refreshes its confidence
    /// and validation timestamp instead of duplicating it. A candidate
    /// matching an invalidated entry is rejected; invalidation is terminal.
    pub fn upsert(
        &mut self,
        candidate: RelationshipCandidate,
        cache: &MarketCache,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, CatalogError> {
        Self::validate_structure(&candidate.kind)?;
        if !(0.0..=1.0).contains(&candidate.confidence) {
            return Err(CatalogError::Malformed(format!(
                "confidence {} outside [0, 1]",
                candidate.confidence
            )));
        }

        let key = Self::canonical_key(&candidate.kind);
        if let Some(&existing_id) = self.by_key.get(&key) {
            let existing = self
                .relationships
                .get_mut(&existing_id)
                .expect("by_key points at a stored relationship");
            if existing.is_invalidated() {
                return Err(CatalogError::DuplicateForSameTickers(key));
            }
            existing.confidence = candidate.confidence;
            existing.last_validated_at = now;
            return Ok(UpsertOutcome::Refreshed(existing_id));
        }

        let mut fingerprints = BTreeMap::new();
        for ticker in candidate.kind.tickers() {
            let market = cache
                .peek(ticker)
                .ok_or_else(|| CatalogError::MissingMarket(ticker.to_string()))?;
            fingerprints.insert(ticker.to_string(), rules_fingerprint(&market.rules));
        }

        let id = Uuid::new_v4();
        let relationship = Relationship {
            id,
            kind: candidate.kind,
            confidence: candidate.confidence,
            reasoning: candidate.reasoning,
            created_at: now,
            last_validated_at: now,
            fingerprints,
            invalidated_reason: None,
        };
        info!(
            event = "relationship_stored",
            id = %id,
            kind = relationship.kind.tag(),
            confidence = relationship.confidence,
            "Relationship stored"
        );
        self.relationships.insert(id, relationship);
        self.by_key.insert(key, id);
        Ok(UpsertOutcome::Created(id))
    }

    /// Relationships eligible for detection: live, confident enough, every
    /// involved market present and open with a matching rules fingerprint.
    ///
    /// Returned sorted by id so downstream scan output is deterministic.
    pub fn active(&self, cache: &MarketCache) -> Vec<Relationship> {
        let mut out: Vec<Relationship> = self
            .relationships
            .values()
            .filter(|rel| !rel.is_invalidated() && rel.confidence >= self.confidence_floor)
            .filter(|rel| {
                rel.kind.tickers().iter().all(|ticker| {
                    cache.peek(ticker).is_some_and(|m| {
                        m.status.is_open()
                            && rel
                                .fingerprints
                                .get(*ticker)
                                .is_some_and(|fp| *fp == rules_fingerprint(&m.rules))
                    })
                })
            })
            .cloned()
            .collect();
        out.sort_by_key(|rel| rel.id);
        out
    }

    /// Mark a relationship terminally invalid. Idempotent on the reason
    /// already set.
    pub fn invalidate(&mut self, id: Uuid, reason: &str) -> Result<(), CatalogError> {
        let rel = self
            .relationships
            .get_mut(&id)
            .ok_or(CatalogError::Unknown(id))?;
        if rel.invalidated_reason.is_none() {
            info!(event = "relationship_invalidated", id = %id, reason, "Relationship invalidated");
            rel.invalidated_reason = Some(reason.to_string());
        }
        Ok(())
    }

    /// Hard-invalidate every live relationship whose markets have closed or
    /// whose settlement rules changed since fingerprinting. Run once per
    /// ingestion cycle, before any revalidation call goes out.
    pub fn sweep(&mut self, cache: &MarketCache) -> Vec<(Uuid, String)> {
        let mut invalidated = Vec::new();
        for rel in self.relationships.values_mut() {
            if rel.is_invalidated() {
                continue;
            }
            let mut reason: Option<String> = None;
            for ticker in rel.kind.tickers() {
                match cache.peek(ticker) {
                    None => {
                        reason = Some(format!("market {} no longer listed", ticker));
                        break;
                    }
                    Some(m) if !m.status.is_open() => {
                        reason = Some(format!("market {} closed", ticker));
                        break;
                    }
                    Some(m) => {
                        let current = rules_fingerprint(&m.rules);
                        if rel.fingerprints.get(ticker).is_some_and(|fp| *fp != current) {
                            reason = Some(format!("settlement rules changed for {}", ticker));
                            break;
                        }
                    }
                }
            }
            if let Some(reason) = reason {
                info!(event = "relationship_invalidated", id = %rel.id, reason = %reason, "Relationship invalidated");
                rel.invalidated_reason = Some(reason.clone());
                invalidated.push((rel.id, reason));
            }
        }
        invalidated
    }

    /// Live relationships whose last validation is older than the configured
    /// interval, oldest first.
    pub fn stale_for_revalidation(&self, now: DateTime<Utc>) -> Vec<Relationship> {
        let mut out: Vec<Relationship> = self
            .relationships
            .values()
            .filter(|rel| !rel.is_invalidated() && now - rel.last_validated_at >= self.revalidate_after)
            .cloned()
            .collect();
        out.sort_by_key(|rel| rel.last_validated_at);
        out
    }

    /// Apply an external validator's verdict. A failed revalidation or a
    /// confidence drop below the floor terminates the relationship.
    pub fn apply_revalidation(
        &mut self,
        id: Uuid,
        verdict: Revalidation,
        now: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        if !verdict.still_valid {
            return self.invalidate(id, "revalidation failed");
        }
        if verdict.confidence < self.confidence_floor {
            return self.invalidate(id, "confidence below floor");
        }
        let rel = self
            .relationships
            .get_mut(&id)
            .ok_or(CatalogError::Unknown(id))?;
        rel.confidence = verdict.confidence;
        rel.last_validated_at = now;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<&Relationship> {
        self.relationships.get(&id)
    }

    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }
}
