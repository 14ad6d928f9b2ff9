//! Core data model shared across the detection and execution pipeline.
//!
//! All monetary values are integer cents (i64). Binary contract prices live
//! in [0, 100]; a YES contract pays 100 cents on resolution true.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer cents. The codebase does no floating-point money math.
pub type Cents = i64;

/// Contract payout on resolution, in cents.
pub const SETTLEMENT_CENTS: Cents = 100;

// =============================================================================
// MARKETS
// =============================================================================

/// Top-of-book quote for a binary market, in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub yes_bid: Cents,
    pub yes_ask: Cents,
    pub no_bid: Cents,
    pub no_ask: Cents,
}

impl Quote {
    /// Check price-band and bid/ask ordering invariants.
    pub fn is_well_formed(&self) -> bool {
        let in_band = |p: Cents| (0..=SETTLEMENT_CENTS).contains(&p);
        in_band(self.yes_bid)
            && in_band(self.yes_ask)
            && in_band(self.no_bid)
            && in_band(self.no_ask)
            && self.yes_bid <= self.yes_ask
            && self.no_bid <= self.no_ask
    }

    /// YES mid price, used for marking open positions.
    pub fn yes_mid(&self) -> Cents {
        (self.yes_bid + self.yes_ask) / 2
    }
}

/// Market lifecycle status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Settled,
}

impl MarketStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, MarketStatus::Open)
    }
}

/// A single binary market keyed by ticker.
///
/// Quotes on a non-open market are stale and must not feed detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub ticker: String,
    pub event_ticker: String,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    pub status: MarketStatus,
    pub quote: Quote,
    /// Visible size at top-of-book, YES side, in contracts.
    pub yes_depth: i64,
    /// Visible size at top-of-book, NO side, in contracts.
    pub no_depth: i64,
    /// Settlement rules text. Opaque to the core; hashed for change detection.
    pub rules: String,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    /// Depth observable for a leg on the given contract side.
    pub fn depth_for(&self, side: Side) -> i64 {
        match side {
            Side::Yes => self.yes_depth,
            Side::No => self.no_depth,
        }
    }
}

/// Exchange-provided grouping of related market tickers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_ticker: String,
    pub title: String,
    pub market_tickers: Vec<String>,
}

// =============================================================================
// RELATIONSHIPS
// =============================================================================

/// Typed price constraint over a set of tickers.
///
/// A closed tagged set: the detector branches on the tag. New kinds are added
/// by extending the enum and its detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    /// YES(subset) implies YES(superset): P(subset) <= P(superset).
    Subset {
        #[serde(alias = "subset_ticker")]
        subset: String,
        #[serde(alias = "superset_ticker")]
        superset: String,
    },
    /// Ascending strikes on one underlying: P(t1) >= P(t2) >= ... >= P(tn).
    Threshold { tickers_ascending: Vec<String> },
    /// Mutually exclusive, exhaustive outcomes: sum of P(ti) = 1.
    Partition { tickers: Vec<String> },
    /// Soft constraint: P(if) <= P(then) when the conditional probability
    /// approaches 1.
    Implication {
        if_ticker: String,
        then_ticker: String,
        #[serde(alias = "estimated_conditional_prob")]
        conditional_prob: f64,
    },
}

impl RelationshipKind {
    /// All tickers the constraint spans, in declaration order.
    pub fn tickers(&self) -> Vec<&str> {
        match self {
            RelationshipKind::Subset { subset, superset } => {
                vec![subset.as_str(), superset.as_str()]
            }
            RelationshipKind::Threshold { tickers_ascending } => {
                tickers_ascending.iter().map(String::as_str).collect()
            }
            RelationshipKind::Partition { tickers } => {
                tickers.iter().map(String::as_str).collect()
            }
            RelationshipKind::Implication {
                if_ticker,
                then_ticker,
                ..
            } => vec![if_ticker.as_str(), then_ticker.as_str()],
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            RelationshipKind::Subset { .. } => "SUBSET",
            RelationshipKind::Threshold { .. } => "THRESHOLD",
            RelationshipKind::Partition { .. } => "PARTITION",
            RelationshipKind::Implication { .. } => "IMPLICATION",
        }
    }
}

/// A relationship candidate as returned by the discovery source, before the
/// catalog validates and stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    #[serde(flatten)]
    pub kind: RelationshipKind,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Result of re-validating a stored relationship against current markets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Revalidation {
    pub still_valid: bool,
    pub confidence: f64,
}

// =============================================================================
// OPPORTUNITIES
// =============================================================================

/// YES/NO side of a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "yes"),
            Side::No => write!(f, "no"),
        }
    }
}

/// Order action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "buy"),
            Action::Sell => write!(f, "sell"),
        }
    }
}

/// Trade signal implied by a detected violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    BuySupersetSellSubset,
    BuyLowerSellHigher,
    BuyAllPartition,
    SellAllPartition,
    BuyThenSellIf,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Signal::BuySupersetSellSubset => "BUY_SUPERSET_SELL_SUBSET",
            Signal::BuyLowerSellHigher => "BUY_LOWER_SELL_HIGHER",
            Signal::BuyAllPartition => "BUY_ALL_PARTITION",
            Signal::SellAllPartition => "SELL_ALL_PARTITION",
            Signal::BuyThenSellIf => "BUY_THEN_SELL_IF",
        };
        write!(f, "{}", s)
    }
}

/// One leg of a multi-leg order sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    /// Resting limit price in cents.
    pub limit_price: Cents,
    /// Contracts to trade on this leg.
    pub desired_count: i64,
    /// Top-of-book depth observed at detection time.
    pub observed_depth: i64,
}

impl Leg {
    /// Signed YES-equivalent position delta per contract: buy YES and sell
    /// NO are +1, sell YES and buy NO are -1.
    pub fn position_delta_sign(&self) -> i64 {
        match (self.side, self.action) {
            (Side::Yes, Action::Buy) | (Side::No, Action::Sell) => 1,
            (Side::Yes, Action::Sell) | (Side::No, Action::Buy) => -1,
        }
    }

    /// Worst-case loss per contract if only this leg fills and settles
    /// against us: a buy can go to zero, a sell can settle at 100.
    pub fn worst_case_loss_per_contract(&self) -> Cents {
        match self.action {
            Action::Buy => self.limit_price,
            Action::Sell => SETTLEMENT_CENTS - self.limit_price,
        }
    }
}

/// Opportunity lifecycle. Transitions are irreversible.
///
/// ```text
/// DETECTED --admit--> VALIDATED --execute--> EXECUTING --+--> FILLED
///    |                    |                              +--> PARTIAL
///    +--expire-> EXPIRED  +--reject-> REJECTED           +--> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityState {
    Detected,
    Validated,
    Executing,
    Filled,
    Partial,
    Failed,
    Rejected,
    Expired,
}

impl OpportunityState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpportunityState::Filled
                | OpportunityState::Partial
                | OpportunityState::Failed
                | OpportunityState::Rejected
                | OpportunityState::Expired
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(&self, next: OpportunityState) -> bool {
        use OpportunityState::*;
        matches!(
            (self, next),
            (Detected, Validated)
                | (Detected, Expired)
                | (Detected, Rejected)
                | (Validated, Executing)
                | (Validated, Rejected)
                | (Validated, Expired)
                | (Executing, Filled)
                | (Executing, Partial)
                | (Executing, Failed)
        )
    }
}

impl std::fmt::Display for OpportunityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpportunityState::Detected => "DETECTED",
            OpportunityState::Validated => "VALIDATED",
            OpportunityState::Executing => "EXECUTING",
            OpportunityState::Filled => "FILLED",
            OpportunityState::Partial => "PARTIAL",
            OpportunityState::Failed => "FAILED",
            OpportunityState::Rejected => "REJECTED",
            OpportunityState::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// A detected constraint violation, priced and ready for admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub relationship_id: Uuid,
    pub signal: Signal,
    /// Ordered legs; two-leg variants put the less-liquid leg first.
    pub legs: Vec<Leg>,
    /// Gross mispricing per contract, in cents.
    pub raw_edge: Cents,
    /// Estimated fees per contract across all legs, in cents (rounded up).
    pub fee_estimate: Cents,
    /// raw_edge - fee_estimate, per contract.
    pub net_magnitude: Cents,
    /// Catalog confidence of the underlying relationship.
    pub confidence: f64,
    /// min(depth over legs) / desired_count, clamped to [0, 1].
    pub liquidity_factor: f64,
    /// net_magnitude * confidence * liquidity_factor.
    pub score: f64,
    /// Tagged true for soft (IMPLICATION) constraints; the governor may
    /// block these by policy.
    pub probabilistic: bool,
    pub state: OpportunityState,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Shallowest observed depth across legs.
    pub fn min_leg_depth(&self) -> i64 {
        self.legs
            .iter()
            .map(|l| l.observed_depth)
            .min()
            .unwrap_or(0)
    }

    /// Contracts per leg (uniform across legs by construction).
    pub fn desired_count(&self) -> i64 {
        self.legs.first().map(|l| l.desired_count).unwrap_or(0)
    }

    /// Apply a state transition, enforcing the lifecycle graph.
    pub fn transition(&mut self, next: OpportunityState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Resize every leg to the admitted contract count.
    pub fn resize(&mut self, count: i64) {
        for leg in &mut self.legs {
            leg.desired_count = count;
        }
    }
}

/// Attempted transition not present in the lifecycle graph.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("illegal opportunity transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: OpportunityState,
    pub to: OpportunityState,
}

// =============================================================================
// FILLS
// =============================================================================

/// A confirmed (or dry-run synthetic) fill reported by the execution engine.
///
/// The position ledger is updated only from these events, never from intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub opportunity_id: Uuid,
    pub ticker: String,
    pub order_id: String,
    pub side: Side,
    pub action: Action,
    /// Contracts filled.
    pub count: i64,
    /// Average fill price per contract, in cents.
    pub price: Cents,
    /// Total fee paid for this fill, in cents.
    pub fee: Cents,
    /// True when produced by dry-run synthetic execution.
    pub synthetic: bool,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn leg(ticker: &str, action: Action, price: Cents, depth: i64) -> Leg {
        Leg {
            ticker: ticker.to_string(),
            side: Side::Yes,
            action,
            limit_price: price,
            desired_count: 10,
            observed_depth: depth,
        }
    }

    fn opportunity() -> Opportunity {
        let detected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Opportunity {
            id: Uuid::new_v4(),
            relationship_id: Uuid::new_v4(),
            signal: Signal::BuySupersetSellSubset,
            legs: vec![leg("A", Action::Buy, 50, 15), leg("B", Action::Sell, 60, 20)],
            raw_edge: 10,
            fee_estimate: 2,
            net_magnitude: 8,
            confidence: 0.95,
            liquidity_factor: 1.0,
            score: 7.6,
            probabilistic: false,
            state: OpportunityState::Detected,
            detected_at: detected,
            expires_at: detected + chrono::Duration::seconds(15),
        }
    }

    #[test]
    fn quote_well_formed() {
        let q = Quote {
            yes_bid: 48,
            yes_ask: 52,
            no_bid: 48,
            no_ask: 52,
        };
        assert!(q.is_well_formed());
        assert_eq!(q.yes_mid(), 50);

        let crossed = Quote {
            yes_bid: 55,
            yes_ask: 52,
            no_bid: 48,
            no_ask: 52,
        };
        assert!(!crossed.is_well_formed());

        let out_of_band = Quote {
            yes_bid: 0,
            yes_ask: 101,
            no_bid: 0,
            no_ask: 1,
        };
        assert!(!out_of_band.is_well_formed());
    }

    #[test]
    fn lifecycle_accepts_legal_path() {
        let mut opp = opportunity();
        opp.transition(OpportunityState::Validated).unwrap();
        opp.transition(OpportunityState::Executing).unwrap();
        opp.transition(OpportunityState::Filled).unwrap();
        assert!(opp.state.is_terminal());
    }

    #[test]
    fn lifecycle_rejects_skips_and_reversals() {
        let mut opp = opportunity();
        assert!(opp.transition(OpportunityState::Executing).is_err());
        opp.transition(OpportunityState::Validated).unwrap();
        assert!(opp.transition(OpportunityState::Detected).is_err());
        opp.transition(OpportunityState::Rejected).unwrap();
        // Terminal states accept nothing further.
        assert!(opp.transition(OpportunityState::Executing).is_err());
        assert!(opp.transition(OpportunityState::Filled).is_err());
    }

    #[test]
    fn leg_worst_case_loss() {
        assert_eq!(leg("A", Action::Buy, 52, 10).worst_case_loss_per_contract(), 52);
        assert_eq!(leg("A", Action::Sell, 60, 10).worst_case_loss_per_contract(), 40);
    }

    #[test]
    fn leg_position_delta_sign() {
        let mut l = leg("A", Action::Buy, 50, 10);
        assert_eq!(l.position_delta_sign(), 1);
        l.action = Action::Sell;
        assert_eq!(l.position_delta_sign(), -1);
        l.side = Side::No;
        assert_eq!(l.position_delta_sign(), 1);
        l.action = Action::Buy;
        assert_eq!(l.position_delta_sign(), -1);
    }

    #[test]
    fn relationship_kind_tickers() {
        let kind = RelationshipKind::Threshold {
            tickers_ascending: vec!["T3".into(), "T4".into(), "T5".into()],
        };
        assert_eq!(kind.tickers(), vec!["T3", "T4", "T5"]);
        assert_eq!(kind.tag(), "THRESHOLD");
    }

    #[test]
    fn candidate_json_round_trip() {
        let json = r#"{
            "type": "SUBSET",
            "subset": "MAR_CUT",
            "superset": "JUN_CUT",
            "confidence": 0.95,
            "reasoning": "a March cut implies a cut by June"
        }"#;
        let cand: RelationshipCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(
            cand.kind,
            RelationshipKind::Subset {
                subset: "MAR_CUT".into(),
                superset: "JUN_CUT".into(),
            }
        );
        assert!((cand.confidence - 0.95).abs() < f64::EPSILON);
    }
}
