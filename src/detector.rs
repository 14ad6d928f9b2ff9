//! Constraint violation detection.
//!
//! Each scan joins the active relationship set with an atomic price view and
//! turns live crossings into scored, time-bounded opportunities. All math is
//! integer cents; an opportunity is emitted only when the gross edge clears
//! the fee safety gate at the sized contract count.
//!
//! Given identical price views and catalog contents, `scan` is
//! deterministic in both its output set and its ordering.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{MarketCache, PriceEntry, PriceView};
use crate::catalog::Relationship;
use crate::config::Config;
use crate::fees::{passes_fee_gate, FeeModel};
use crate::risk::Sizer;
use crate::types::{
    Action, Cents, Leg, Opportunity, OpportunityState, RelationshipKind, Side, Signal,
    SETTLEMENT_CENTS,
};

/// Violation scanner over the relationship catalog.
pub struct Detector {
    min_edge_cents: Cents,
    min_score_threshold: f64,
    fee_safety_multiplier: f64,
    implication_kappa_floor: f64,
    implication_soft_threshold_cents: Cents,
    opportunity_ttl: Duration,
    fee_model: FeeModel,
}

impl Detector {
    pub fn new(cfg: &Config, fee_model: FeeModel) -> Self {
        Self {
            min_edge_cents: cfg.min_edge_cents,
            min_score_threshold: cfg.min_score_threshold,
            fee_safety_multiplier: cfg.fee_safety_multiplier,
            implication_kappa_floor: cfg.implication_kappa_floor,
            implication_soft_threshold_cents: cfg.implication_soft_threshold_cents,
            opportunity_ttl: Duration::seconds(cfg.opportunity_ttl_seconds as i64),
            fee_model,
        }
    }

    /// Scan the given relationships against one coherent price view each.
    ///
    /// Relationships whose tickers cannot produce a view (closed or vanished
    /// mid-cycle) are skipped silently; the catalog sweep owns their
    /// lifecycle.
    pub fn scan(
        &self,
        relationships: &[Relationship],
        cache: &MarketCache,
        sizer: &Sizer,
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();

        for rel in relationships {
            let tickers = rel.kind.tickers();
            let view = match cache.price_view(&tickers) {
                Ok(view) => view,
                Err(err) => {
                    debug!(relationship = %rel.id, %err, "skipping relationship without a clean view");
                    continue;
                }
            };

            match &rel.kind {
                RelationshipKind::Subset { subset, superset } => {
                    opportunities.extend(self.check_subset(rel, subset, superset, &view, sizer, now));
                }
                RelationshipKind::Threshold { tickers_ascending } => {
                    opportunities.extend(self.check_threshold(rel, tickers_ascending, &view, sizer, now));
                }
                RelationshipKind::Partition { tickers } => {
                    opportunities.extend(self.check_partition(rel, tickers, &view, sizer, now));
                }
                RelationshipKind::Implication {
                    if_ticker,
                    then_ticker,
                    conditional_prob,
                } => {
                    opportunities.extend(self.check_implication(
                        rel,
                        if_ticker,
                        then_ticker,
                        *conditional_prob,
                        &view,
                        sizer,
                        now,
                    ));
                }
            }
        }

        opportunities.sort_by(|a, b| {
            (a.relationship_id, a.signal, &a.legs[0].ticker)
                .cmp(&(b.relationship_id, b.signal, &b.legs[0].ticker))
        });

        for opp in &opportunities {
            info!(
                event = "opportunity_detected",
                id = %opp.id,
                relationship = %opp.relationship_id,
                signal = %opp.signal,
                raw_edge_cents = opp.raw_edge,
                net_magnitude_cents = opp.net_magnitude,
                score = opp.score,
                contracts = opp.desired_count(),
                "Opportunity detected"
            );
        }
        opportunities
    }

    /// SUBSET: P(subset) <= P(superset). A crossing of the subset's ask over
    /// the superset's bid is sold on the subset and bought on the superset.
    fn check_subset(
        &self,
        rel: &Relationship,
        subset: &str,
        superset: &str,
        view: &PriceView,
        sizer: &Sizer,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let sub = view.entry(subset)?;
        let sup = view.entry(superset)?;

        let edge = sub.quote.yes_ask - sup.quote.yes_bid;
        if edge <= self.min_edge_cents {
            return None;
        }

        let legs = order_two_legs(
            buy_leg(superset, sup, sup.quote.yes_bid),
            sell_leg(subset, sub, sub.quote.yes_ask),
        );
        self.finish(rel, Signal::BuySupersetSellSubset, legs, edge, false, sizer, now)
    }

    /// THRESHOLD: over ascending strikes, P must descend. Each adjacent
    /// inversion is an independent two-leg opportunity; the governor
    /// deduplicates overlap at admission.
    fn check_threshold(
        &self,
        rel: &Relationship,
        tickers_ascending: &[String],
        view: &PriceView,
        sizer: &Sizer,
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        let mut out = Vec::new();
        for pair in tickers_ascending.windows(2) {
            let (lower_t, higher_t) = (&pair[0], &pair[1]);
            let (Some(lower), Some(higher)) = (view.entry(lower_t), view.entry(higher_t)) else {
                continue;
            };

            let edge = higher.quote.yes_ask - lower.quote.yes_bid;
            if edge <= self.min_edge_cents {
                continue;
            }

            let legs = order_two_legs(
                buy_leg(lower_t, lower, lower.quote.yes_bid),
                sell_leg(higher_t, higher, higher.quote.yes_ask),
            );
            out.extend(self.finish(rel, Signal::BuyLowerSellHigher, legs, edge, false, sizer, now));
        }
        out
    }

    /// PARTITION: YES prices must sum to 100. An underpriced set is bought
    /// whole, an overpriced set is sold whole. `min_edge_cents` plays the
    /// epsilon role.
    fn check_partition(
        &self,
        rel: &Relationship,
        tickers: &[String],
        view: &PriceView,
        sizer: &Sizer,
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        let entries: Vec<(&String, &PriceEntry)> = tickers
            .iter()
            .filter_map(|t| view.entry(t).map(|e| (t, e)))
            .collect();
        if entries.len() < tickers.len() {
            return Vec::new();
        }

        let sum_ask: Cents = entries.iter().map(|(_, e)| e.quote.yes_ask).sum();
        let sum_bid: Cents = entries.iter().map(|(_, e)| e.quote.yes_bid).sum();
        let mut out = Vec::new();

        let buy_edge = SETTLEMENT_CENTS - sum_ask;
        if buy_edge > self.min_edge_cents {
            let legs: Vec<Leg> = entries
                .iter()
                .map(|(t, e)| buy_leg(t, e, e.quote.yes_ask))
                .collect();
            out.extend(self.finish(rel, Signal::BuyAllPartition, legs, buy_edge, false, sizer, now));
        }

        let sell_edge = sum_bid - SETTLEMENT_CENTS;
        if sell_edge > self.min_edge_cents {
            let legs: Vec<Leg> = entries
                .iter()
                .map(|(t, e)| sell_leg(t, e, e.quote.yes_bid))
                .collect();
            out.extend(self.finish(rel, Signal::SellAllPartition, legs, sell_edge, false, sizer, now));
        }
        out
    }

    /// IMPLICATION: soft constraint, evaluated only at high conditional
    /// probability, with a wider mispricing threshold than the hard
    /// variants. Emitted opportunities are tagged probabilistic.
    #[allow(clippy::too_many_arguments)]
    fn check_implication(
        &self,
        rel: &Relationship,
        if_ticker: &str,
        then_ticker: &str,
        conditional_prob: f64,
        view: &PriceView,
        sizer: &Sizer,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        if conditional_prob < self.implication_kappa_floor {
            return None;
        }
        let if_entry = view.entry(if_ticker)?;
        let then_entry = view.entry(then_ticker)?;

        let edge = if_entry.quote.yes_bid - then_entry.quote.yes_ask;
        if edge <= self.implication_soft_threshold_cents {
            return None;
        }

        let legs = order_two_legs(
            buy_leg(then_ticker, then_entry, then_entry.quote.yes_ask),
            sell_leg(if_ticker, if_entry, if_entry.quote.yes_bid),
        );
        self.finish(rel, Signal::BuyThenSellIf, legs, edge, true, sizer, now)
    }

    /// Size, fee-gate, score, and stamp a candidate into an Opportunity.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        rel: &Relationship,
        signal: Signal,
        mut legs: Vec<Leg>,
        edge: Cents,
        probabilistic: bool,
        sizer: &Sizer,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let count = sizer.size(&legs);
        if count < 1 {
            return None;
        }

        let fee_total = self.fee_model.estimate_total(&legs, count);
        if !passes_fee_gate(edge, count, fee_total, self.fee_safety_multiplier) {
            return None;
        }

        let fee_per_contract = self.fee_model.estimate_per_contract(&legs, count);
        let net_magnitude = edge - fee_per_contract;
        if net_magnitude <= 0 {
            return None;
        }

        for leg in &mut legs {
            leg.desired_count = count;
        }
        let min_depth = legs.iter().map(|l| l.observed_depth).min().unwrap_or(0);
        let liquidity_factor = (min_depth as f64 / count as f64).clamp(0.0, 1.0);
        let score = net_magnitude as f64 * rel.confidence * liquidity_factor;
        if score < self.min_score_threshold {
            return None;
        }

        Some(Opportunity {
            id: Uuid::new_v4(),
            relationship_id: rel.id,
            signal,
            legs,
            raw_edge: edge,
            fee_estimate: fee_per_contract,
            net_magnitude,
            confidence: rel.confidence,
            liquidity_factor,
            score,
            probabilistic,
            state: OpportunityState::Detected,
            detected_at: now,
            expires_at: now + self.opportunity_ttl,
        })
    }
}

fn buy_leg(ticker: &str, entry: &PriceEntry, limit_price: Cents) -> Leg {
    Leg {
        ticker: ticker.to_string(),
        side: Side::Yes,
        action: Action::Buy,
        limit_price,
        desired_count: 0,
        observed_depth: entry.yes_depth,
    }
}

fn sell_leg(ticker: &str, entry: &PriceEntry, limit_price: Cents) -> Leg {
    Leg {
        ticker: ticker.to_string(),
        side: Side::Yes,
        action: Action::Sell,
        limit_price,
        desired_count: 0,
        observed_depth: entry.yes_depth,
    }
}

/// Two-leg sequencing: the less-liquid leg (lower observed depth) fills
/// first. Ties keep the buy leg first.
fn order_two_legs(a: Leg, b: Leg) -> Vec<Leg> {
    if b.observed_depth < a.observed_depth {
        vec![b, a]
    } else {
        vec![a, b]
    }
}
