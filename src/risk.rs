//! Risk governor: global trading invariants and position sizing.
//!
//! Every execution passes through `admit`, which runs the check ladder in a
//! fixed order and sizes the trade with integer-only math. The governor owns
//! the position ledger; it is updated only by confirmed fill events, and a
//! daily-loss breach atomically engages the kill switch.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::pnl::{LedgerSummary, Position, PositionLedger};
use crate::types::{Cents, FillEvent, Leg, Opportunity, OpportunityState, Signal};

/// Admission rejection reasons. Rejected opportunities are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("KILL_SWITCH")]
    KillSwitch,
    #[error("DAILY_LOSS_CAP")]
    DailyLossCap,
    #[error("POSITION_CAP")]
    PositionCap,
    /// Another open opportunity already trades this ticker; overlapping
    /// emissions (adjacent THRESHOLD pairs) collapse to the first admitted.
    #[error("OVERLAP:{0}")]
    Overlap(String),
    #[error("PER_MARKET_CAP:{0}")]
    PerMarketCap(String),
    #[error("POLICY_BLOCK")]
    PolicyBlock,
    #[error("FEE_GATE")]
    FeeGate,
    #[error("TOO_SMALL")]
    TooSmall,
    #[error("EXPIRED")]
    Expired,
    #[error("ILLEGAL_STATE")]
    IllegalState,
}

/// Read-only sizing oracle handed to the detector for emission sizing.
#[derive(Debug, Clone, Copy)]
pub struct Sizer {
    pub balance_cents: Cents,
    pub max_risk_per_trade_pct: f64,
    pub max_contracts_per_trade: i64,
}

impl Sizer {
    /// desired_count = min(floor(pct * balance / worst_loss_per_contract),
    /// min leg depth, per-trade hard cap), floored at zero.
    pub fn size(&self, legs: &[Leg]) -> i64 {
        let worst_loss = legs
            .iter()
            .map(Leg::worst_case_loss_per_contract)
            .max()
            .unwrap_or(0)
            .max(1);
        let risk_budget = (self.balance_cents as f64 * self.max_risk_per_trade_pct) as Cents;
        let risk_based = risk_budget / worst_loss;
        let min_depth = legs.iter().map(|l| l.observed_depth).min().unwrap_or(0);
        risk_based.min(min_depth).min(self.max_contracts_per_trade).max(0)
    }
}

/// Operational flatten directive produced by `force_flat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenRequest {
    pub ticker: String,
    /// Signed YES-equivalent contracts currently held.
    pub net_contracts: i64,
}

/// Point-in-time governor state for logging and alerts.
#[derive(Debug, Clone, Copy)]
pub struct GovernorSummary {
    pub balance_cents: Cents,
    pub daily_pnl_cents: Cents,
    pub open_opportunities: usize,
    pub kill_switch: bool,
    pub ledger: LedgerSummary,
}

struct GovState {
    balance_cents: Cents,
    day: NaiveDate,
    daily_realized_cents: Cents,
    ledger: PositionLedger,
    /// Dry-run fills land here; the real ledger stays untouched.
    shadow: PositionLedger,
    open_opportunities: FxHashSet<Uuid>,
    /// Legs of open opportunities, for overlap dedupe and release.
    open_legs: FxHashMap<Uuid, Vec<String>>,
    engaged_tickers: FxHashSet<String>,
}

impl GovState {
    /// Daily realized (net of fees) plus current unrealized.
    fn daily_pnl_cents(&self) -> Cents {
        self.daily_realized_cents + self.ledger.summary().unrealized_cents
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != today {
            self.day = today;
            self.daily_realized_cents = 0;
        }
    }
}

/// Gatekeeper for all executions; owner of positions and the kill switch.
pub struct RiskGovernor {
    cfg: Config,
    kill_tx: watch::Sender<bool>,
    inner: Mutex<GovState>,
}

impl RiskGovernor {
    /// Build the governor and the kill-switch subscription side. Workers
    /// watch the receiver and stop at the next suspension point when it
    /// flips true.
    pub fn new(cfg: Config, now: DateTime<Utc>) -> (Self, watch::Receiver<bool>) {
        let (kill_tx, kill_rx) = watch::channel(cfg.kill_switch);
        let governor = Self {
            cfg,
            kill_tx,
            inner: Mutex::new(GovState {
                balance_cents: 0,
                day: now.date_naive(),
                daily_realized_cents: 0,
                ledger: PositionLedger::new(),
                shadow: PositionLedger::new(),
                open_opportunities: FxHashSet::default(),
                open_legs: FxHashMap::default(),
                engaged_tickers: FxHashSet::default(),
            }),
        };
        (governor, kill_rx)
    }

    pub fn kill_switch_engaged(&self) -> bool {
        *self.kill_tx.borrow()
    }

    /// Engage the global halt: admissions stop and workers cancel in-flight
    /// work at their next suspension point.
    pub fn engage_kill_switch(&self, reason: &str) {
        if !*self.kill_tx.borrow() {
            warn!(event = "kill_switch_engaged", reason, "KILL SWITCH engaged");
            let _ = self.kill_tx.send(true);
        }
    }

    pub fn disengage_kill_switch(&self) {
        if *self.kill_tx.borrow() {
            info!(event = "kill_switch_disengaged", "Kill switch disengaged");
            let _ = self.kill_tx.send(false);
        }
    }

    /// Refresh available balance from the exchange.
    pub fn set_balance(&self, balance_cents: Cents) {
        self.inner.lock().expect("governor lock").balance_cents = balance_cents;
    }

    /// Sizing oracle snapshot for the detector.
    pub fn sizer(&self) -> Sizer {
        let state = self.inner.lock().expect("governor lock");
        Sizer {
            balance_cents: state.balance_cents,
            max_risk_per_trade_pct: self.cfg.max_risk_per_trade_pct,
            max_contracts_per_trade: self.cfg.max_contracts_per_trade,
        }
    }

    /// Run the admission ladder. On success the opportunity is resized to
    /// the admitted count and transitioned DETECTED -> VALIDATED; the caller
    /// owns it through its terminal state and must call `release` there.
    pub fn admit(&self, opp: &mut Opportunity, now: DateTime<Utc>) -> Result<i64, RejectReason> {
        let mut state = self.inner.lock().expect("governor lock");
        state.roll_day(now);

        if opp.state != OpportunityState::Detected {
            return Err(RejectReason::IllegalState);
        }
        if opp.is_expired(now) {
            return Err(RejectReason::Expired);
        }
        if *self.kill_tx.borrow() {
            return Err(RejectReason::KillSwitch);
        }
        if state.daily_pnl_cents() <= -self.cfg.max_daily_loss_cents {
            return Err(RejectReason::DailyLossCap);
        }
        if state.open_opportunities.len() >= self.cfg.max_open_positions {
            return Err(RejectReason::PositionCap);
        }
        for leg in &opp.legs {
            if state.engaged_tickers.contains(&leg.ticker) {
                return Err(RejectReason::Overlap(leg.ticker.clone()));
            }
        }

        let count = Sizer {
            balance_cents: state.balance_cents,
            max_risk_per_trade_pct: self.cfg.max_risk_per_trade_pct,
            max_contracts_per_trade: self.cfg.max_contracts_per_trade,
        }
        .size(&opp.legs);

        for leg in &opp.legs {
            let delta = leg.position_delta_sign() * count;
            let projected = state.ledger.net_contracts(&leg.ticker) + delta;
            if projected.abs() > self.cfg.max_contracts_per_market {
                return Err(RejectReason::PerMarketCap(leg.ticker.clone()));
            }
        }

        if opp.probabilistic && self.cfg.require_human_for_implication {
            return Err(RejectReason::PolicyBlock);
        }
        if opp.net_magnitude as f64 <= self.cfg.fee_safety_multiplier * opp.fee_estimate as f64 {
            return Err(RejectReason::FeeGate);
        }
        if count < 1 {
            return Err(RejectReason::TooSmall);
        }

        opp.resize(count);
        opp.transition(OpportunityState::Validated)
            .map_err(|_| RejectReason::IllegalState)?;
        state.open_opportunities.insert(opp.id);
        let tickers: Vec<String> = opp.legs.iter().map(|l| l.ticker.clone()).collect();
        for ticker in &tickers {
            state.engaged_tickers.insert(ticker.clone());
        }
        state.open_legs.insert(opp.id, tickers);
        Ok(count)
    }

    /// Reduced-check admission for hedge/unwind tasks: directional unwinds
    /// are always allowed unless the kill switch is set.
    pub fn admit_unwind(&self) -> Result<(), RejectReason> {
        if *self.kill_tx.borrow() {
            return Err(RejectReason::KillSwitch);
        }
        Ok(())
    }

    /// Drop an opportunity from the open set once it reaches a terminal
    /// state.
    pub fn release(&self, opportunity_id: Uuid) {
        let mut state = self.inner.lock().expect("governor lock");
        state.open_opportunities.remove(&opportunity_id);
        if let Some(tickers) = state.open_legs.remove(&opportunity_id) {
            for ticker in tickers {
                state.engaged_tickers.remove(&ticker);
            }
        }
    }

    /// Reconcile one confirmed fill. Synthetic fills go to the shadow
    /// ledger; real fills update positions and daily P&L and may trip the
    /// daily-loss circuit, which engages the kill switch atomically.
    pub fn on_fill(&self, fill: &FillEvent) {
        let breach = {
            let mut state = self.inner.lock().expect("governor lock");
            state.roll_day(fill.ts);
            if fill.synthetic {
                state.shadow.apply_fill(fill);
                return;
            }
            let realized = state.ledger.apply_fill(fill);
            state.daily_realized_cents += realized - fill.fee;
            info!(
                event = "fill_reconciled",
                ticker = %fill.ticker,
                order_id = %fill.order_id,
                count = fill.count,
                price_cents = fill.price,
                fee_cents = fill.fee,
                realized_cents = realized,
                daily_pnl_cents = state.daily_pnl_cents(),
                "Fill reconciled"
            );
            state.daily_pnl_cents() <= -self.cfg.max_daily_loss_cents
        };
        if breach {
            self.engage_kill_switch("daily loss cap breached");
        }
    }

    /// Update the mark for a ticker and re-check the daily-loss circuit.
    pub fn mark(&self, ticker: &str, yes_mid_cents: Cents) {
        let breach = {
            let mut state = self.inner.lock().expect("governor lock");
            state.ledger.mark(ticker, yes_mid_cents);
            state.daily_pnl_cents() <= -self.cfg.max_daily_loss_cents
        };
        if breach {
            self.engage_kill_switch("daily loss cap breached on mark");
        }
    }

    // ── Operational surface ──────────────────────────────────────────────

    pub fn list_open_opportunities(&self) -> Vec<Uuid> {
        let state = self.inner.lock().expect("governor lock");
        let mut ids: Vec<Uuid> = state.open_opportunities.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn list_positions(&self) -> Vec<(String, Position)> {
        self.inner.lock().expect("governor lock").ledger.open_positions()
    }

    /// Directive to flatten one ticker's exposure. Returns None when flat.
    pub fn force_flat(&self, ticker: &str) -> Option<FlattenRequest> {
        let state = self.inner.lock().expect("governor lock");
        let net = state.ledger.net_contracts(ticker);
        (net != 0).then(|| FlattenRequest {
            ticker: ticker.to_string(),
            net_contracts: net,
        })
    }

    pub fn summary(&self) -> GovernorSummary {
        let state = self.inner.lock().expect("governor lock");
        GovernorSummary {
            balance_cents: state.balance_cents,
            daily_pnl_cents: state.daily_pnl_cents(),
            open_opportunities: state.open_opportunities.len(),
            kill_switch: *self.kill_tx.borrow(),
            ledger: state.ledger.summary(),
        }
    }

    /// What dry-run execution would have produced.
    pub fn shadow_summary(&self) -> LedgerSummary {
        self.inner.lock().expect("governor lock").shadow.summary()
    }

    /// True while IMPLICATION signals require an operator. Exposed for the
    /// execution path's logging.
    pub fn blocks_signal(&self, signal: Signal) -> bool {
        signal == Signal::BuyThenSellIf && self.cfg.require_human_for_implication
    }
}
