//! Multi-leg order execution engine.
//!
//! Turns admitted opportunities into ordered order sequences. Two-leg
//! signals run sequentially, least-liquid leg first, with the second leg
//! priced one cent more aggressive. PARTITION signals submit every leg in
//! parallel under a shared deadline and unwind to the largest common fill.
//! A partial fill that leaves directional exposure is handed to the hedge
//! task: one aggressive re-fill, then a bounded flatten.
//!
//! Every order carries an exchange-side expiration (deadline plus skew) and
//! is also cancelled locally at deadline in case the exchange misses its
//! own expiry. Orders that refuse cancellation are tracked as orphans and
//! surfaced; the engine continues.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertSink;
use crate::config::Config;
use crate::exchange::{ExchangeApi, OrderAck, OrderRequest, OrderState};
use crate::fees::FeeModel;
use crate::metrics::Metrics;
use crate::risk::RiskGovernor;
use crate::store::{Journal, JournalEvent};
use crate::types::{Action, Cents, FillEvent, Leg, Opportunity, OpportunityState, Signal};

/// Terminal execution problems attached to the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// The exchange refused an order (bad limit, insufficient funds).
    ExchangeRejected(String),
    /// No fill by the leg deadline.
    Timeout,
    /// An order could not be cancelled and is tracked for reconciliation.
    OrphanOrder(String),
    /// Directional exposure is held after a partial fill.
    PartialFillHeld,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub opportunity_id: Uuid,
    pub final_state: OpportunityState,
    /// Contracts matched across all legs.
    pub matched_count: i64,
    pub error: Option<ExecErrorKind>,
}

/// Engine-facing slice of the configuration.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub order_deadline: Duration,
    pub expiration_skew: Duration,
    pub poll_interval: Duration,
    pub hedge_widen_cents: Cents,
    pub max_unwind_loss_cents: Cents,
    pub dry_run: bool,
}

impl ExecConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            order_deadline: Duration::from_secs(cfg.order_deadline_seconds),
            expiration_skew: Duration::from_secs(cfg.order_expiration_skew_seconds),
            poll_interval: Duration::from_millis(cfg.order_poll_interval_ms),
            hedge_widen_cents: cfg.hedge_widen_cents,
            max_unwind_loss_cents: cfg.max_unwind_loss_cents,
            dry_run: cfg.dry_run,
        }
    }
}

/// Price adjustment toward fill: buyers raise, sellers lower. Clamped to
/// the valid [1, 99] limit band.
fn more_aggressive(action: Action, price: Cents, widen: Cents) -> Cents {
    match action {
        Action::Buy => (price + widen).min(99),
        Action::Sell => (price - widen).max(1),
    }
}

fn opposite(action: Action) -> Action {
    match action {
        Action::Buy => Action::Sell,
        Action::Sell => Action::Buy,
    }
}

/// Idempotency key for order submission. Retries of the same submission
/// MUST reuse the key; the exchange deduplicates on it.
fn idempotency_key(opportunity_id: Uuid, leg_index: usize, attempt: u32) -> String {
    format!("{opportunity_id}:{leg_index}:{attempt}")
}

struct WaitOutcome {
    filled: i64,
    avg_price: Option<Cents>,
    fees: Cents,
    state: OrderState,
    /// Kill switch observed while waiting.
    killed: bool,
}

/// The execution engine. Owns admitted opportunities through their terminal
/// state.
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeApi>,
    governor: Arc<RiskGovernor>,
    journal: Arc<Journal>,
    alerts: Arc<AlertSink>,
    fills_tx: mpsc::Sender<FillEvent>,
    kill_rx: watch::Receiver<bool>,
    fee_model: FeeModel,
    cfg: ExecConfig,
    orphans: Mutex<Vec<String>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        governor: Arc<RiskGovernor>,
        journal: Arc<Journal>,
        alerts: Arc<AlertSink>,
        fills_tx: mpsc::Sender<FillEvent>,
        kill_rx: watch::Receiver<bool>,
        fee_model: FeeModel,
        cfg: ExecConfig,
    ) -> Self {
        Self {
            exchange,
            governor,
            journal,
            alerts,
            fills_tx,
            kill_rx,
            fee_model,
            cfg,
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.cfg.dry_run
    }

    /// Orders the engine failed to cancel, pending reconciliation against
    /// the next position fetch.
    pub fn orphan_orders(&self) -> Vec<String> {
        self.orphans.lock().expect("orphan lock").clone()
    }

    /// Execute an admitted (VALIDATED) opportunity through to a terminal
    /// state.
    pub async fn execute(&self, opp: &mut Opportunity) -> ExecutionReport {
        if opp.transition(OpportunityState::Executing).is_err() {
            return ExecutionReport {
                opportunity_id: opp.id,
                final_state: opp.state,
                matched_count: 0,
                error: Some(ExecErrorKind::ExchangeRejected(
                    "opportunity not in VALIDATED state".into(),
                )),
            };
        }
        self.journal
            .transition(opp.id, OpportunityState::Validated, OpportunityState::Executing, None);

        if self.cfg.dry_run {
            return self.execute_synthetic(opp).await;
        }

        match opp.signal {
            Signal::BuyAllPartition | Signal::SellAllPartition => self.execute_partition(opp).await,
            _ => self.execute_two_leg(opp).await,
        }
    }

    /// Dry-run execution: synthetic fills at limit price on every leg. Same
    /// admission and sizing path as production, only the exchange call is
    /// short-circuited.
    async fn execute_synthetic(&self, opp: &mut Opportunity) -> ExecutionReport {
        let count = opp.desired_count();
        for (leg_index, leg) in opp.legs.clone().into_iter().enumerate() {
            let fee = self.fee_model.leg_fee_total(leg.limit_price, count);
            self.emit_fill(
                opp.id,
                &leg,
                count,
                leg.limit_price,
                fee,
                &format!("DRY-{}", idempotency_key(opp.id, leg_index, 0)),
                true,
            )
            .await;
        }
        self.finish(opp, OpportunityState::Filled, count, None)
    }

    // ── Two-leg strategy (SUBSET / THRESHOLD / IMPLICATION) ──────────────

    async fn execute_two_leg(&self, opp: &mut Opportunity) -> ExecutionReport {
        if *self.kill_rx.borrow() {
            // Killed between admission and the first order: nothing is out,
            // nothing is held.
            return self.finish(opp, OpportunityState::Failed, 0, None);
        }
        let count = opp.desired_count();
        let leg1 = opp.legs[0].clone();
        let leg2 = opp.legs[1].clone();

        // Leg 1 at its detected limit.
        let order1 = match self.place_leg(opp.id, 0, &leg1, count, 0, leg1.limit_price).await {
            Ok(ack) => ack,
            Err(e) => {
                return self.finish(
                    opp,
                    OpportunityState::Failed,
                    0,
                    Some(ExecErrorKind::ExchangeRejected(e)),
                )
            }
        };
        let w1 = match self.wait_for_fill(&order1.order_id, count).await {
            Ok(w) => w,
            Err(e) => {
                self.cancel_quietly(&order1.order_id).await;
                return self.finish(
                    opp,
                    OpportunityState::Failed,
                    0,
                    Some(ExecErrorKind::ExchangeRejected(e)),
                );
            }
        };

        if w1.filled == 0 {
            // Zero fill at deadline: cancel and walk away.
            if w1.state == OrderState::Resting {
                self.cancel_quietly(&order1.order_id).await;
            }
            return self.finish(opp, OpportunityState::Failed, 0, Some(ExecErrorKind::Timeout));
        }
        if w1.filled < count && w1.state == OrderState::Resting {
            // Partial at deadline: cancel the residual, proceed with what we
            // have.
            self.cancel_quietly(&order1.order_id).await;
        }
        self.emit_fill(
            opp.id,
            &leg1,
            w1.filled,
            w1.avg_price.unwrap_or(leg1.limit_price),
            w1.fees,
            &order1.order_id,
            false,
        )
        .await;

        if w1.killed || *self.kill_rx.borrow() {
            // Kill switch mid-execution: leg 2 is never submitted; the leg 1
            // fill is held and surfaced.
            warn!(
                event = "kill_mid_execution",
                opportunity = %opp.id,
                held_contracts = w1.filled,
                ticker = %leg1.ticker,
                "Kill switch engaged mid-execution, holding leg 1 fill"
            );
            self.alerts
                .error(
                    "kill switch mid-execution",
                    &format!("holding {} contracts of {}", w1.filled, leg1.ticker),
                )
                .await;
            return self.finish(
                opp,
                OpportunityState::Partial,
                0,
                Some(ExecErrorKind::PartialFillHeld),
            );
        }

        // Leg 2 for the matched quantity, one cent more aggressive.
        let leg2_price = more_aggressive(leg2.action, leg2.limit_price, 1);
        let order2 = match self.place_leg(opp.id, 1, &leg2, w1.filled, 0, leg2_price).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(opportunity = %opp.id, %e, "leg 2 placement failed, hedging leg 1 exposure");
                self.hedge_task(opp, &leg2, 1, &leg1, 0, w1.filled).await;
                return self.finish(
                    opp,
                    OpportunityState::Partial,
                    0,
                    Some(ExecErrorKind::PartialFillHeld),
                );
            }
        };
        let w2 = match self.wait_for_fill(&order2.order_id, w1.filled).await {
            Ok(w) => w,
            Err(e) => {
                self.cancel_quietly(&order2.order_id).await;
                error!(opportunity = %opp.id, %e, "leg 2 status lost, hedging leg 1 exposure");
                self.hedge_task(opp, &leg2, 1, &leg1, 0, w1.filled).await;
                return self.finish(
                    opp,
                    OpportunityState::Partial,
                    0,
                    Some(ExecErrorKind::PartialFillHeld),
                );
            }
        };

        if w2.filled > 0 {
            self.emit_fill(
                opp.id,
                &leg2,
                w2.filled,
                w2.avg_price.unwrap_or(leg2_price),
                w2.fees,
                &order2.order_id,
                false,
            )
            .await;
        }

        if w2.filled >= w1.filled {
            // Both legs balanced. Anything short of the desired size is a
            // successful partial, not a full fill.
            let state = if w1.filled == count {
                OpportunityState::Filled
            } else {
                OpportunityState::Partial
            };
            return self.finish(opp, state, w1.filled, None);
        }

        // Leg 2 short: cancel the residual and hand the exposure to the
        // hedge task.
        if w2.state == OrderState::Resting {
            self.cancel_quietly(&order2.order_id).await;
        }
        let exposed = w1.filled - w2.filled;
        self.alerts
            .error(
                "partial fill",
                &format!(
                    "opportunity {} leg 2 filled {}/{} ({} exposed)",
                    opp.id, w2.filled, w1.filled, exposed
                ),
            )
            .await;
        self.hedge_task(opp, &leg2, 1, &leg1, 0, exposed).await;
        self.finish(
            opp,
            OpportunityState::Partial,
            w2.filled,
            Some(ExecErrorKind::PartialFillHeld),
        )
    }

    // ── N-leg strategy (PARTITION) ───────────────────────────────────────

    async fn execute_partition(&self, opp: &mut Opportunity) -> ExecutionReport {
        if *self.kill_rx.borrow() {
            return self.finish(opp, OpportunityState::Failed, 0, None);
        }
        let count = opp.desired_count();
        let legs = opp.legs.clone();

        // Submit every leg; on any placement failure cancel what went out.
        let mut orders: Vec<OrderAck> = Vec::with_capacity(legs.len());
        for (leg_index, leg) in legs.iter().enumerate() {
            match self.place_leg(opp.id, leg_index, leg, count, 0, leg.limit_price).await {
                Ok(ack) => orders.push(ack),
                Err(e) => {
                    for placed in &orders {
                        self.cancel_quietly(&placed.order_id).await;
                    }
                    return self.finish(
                        opp,
                        OpportunityState::Failed,
                        0,
                        Some(ExecErrorKind::ExchangeRejected(e)),
                    );
                }
            }
        }

        // Shared deadline across all legs.
        let waits = join_all(
            orders
                .iter()
                .map(|ack| self.wait_for_fill(&ack.order_id, count)),
        )
        .await;

        let mut fills = vec![0i64; legs.len()];
        for (i, wait) in waits.into_iter().enumerate() {
            match wait {
                Ok(w) => {
                    if w.state == OrderState::Resting && w.filled < count {
                        self.cancel_quietly(&orders[i].order_id).await;
                    }
                    if w.filled > 0 {
                        self.emit_fill(
                            opp.id,
                            &legs[i],
                            w.filled,
                            w.avg_price.unwrap_or(legs[i].limit_price),
                            w.fees,
                            &orders[i].order_id,
                            false,
                        )
                        .await;
                    }
                    fills[i] = w.filled;
                }
                Err(e) => {
                    warn!(opportunity = %opp.id, leg = i, %e, "partition leg status lost");
                    self.cancel_quietly(&orders[i].order_id).await;
                }
            }
        }

        let matched = fills.iter().copied().min().unwrap_or(0);
        if matched == count {
            return self.finish(opp, OpportunityState::Filled, count, None);
        }

        // Unwind excess legs down to the largest common fill.
        let mut unwound_any = false;
        for (i, leg) in legs.iter().enumerate() {
            let excess = fills[i] - matched;
            if excess > 0 {
                self.flatten(opp.id, leg, i, excess).await;
                unwound_any = true;
            }
        }

        if fills.iter().all(|&f| f == 0) {
            return self.finish(opp, OpportunityState::Failed, 0, Some(ExecErrorKind::Timeout));
        }
        if unwound_any {
            self.alerts
                .error(
                    "partition partial",
                    &format!("opportunity {} matched {}/{} per leg", opp.id, matched, count),
                )
                .await;
        }
        self.finish(
            opp,
            OpportunityState::Partial,
            matched,
            Some(ExecErrorKind::PartialFillHeld),
        )
    }

    // ── Hedge / unwind ───────────────────────────────────────────────────

    /// Handle directional exposure from a partial fill: one aggressive
    /// re-fill of the missing leg, then a bounded flatten of the filled
    /// leg's excess. Goes through the governor with reduced checks; the
    /// kill switch still halts it, in which case the exposure is held and
    /// surfaced.
    async fn hedge_task(
        &self,
        opp: &Opportunity,
        missing: &Leg,
        missing_index: usize,
        filled: &Leg,
        filled_index: usize,
        qty: i64,
    ) {
        if qty <= 0 {
            return;
        }
        if self.governor.admit_unwind().is_err() {
            self.alerts
                .error(
                    "exposure held",
                    &format!(
                        "kill switch set; holding {} contracts of {}",
                        qty, filled.ticker
                    ),
                )
                .await;
            return;
        }

        // (a) One aggressive re-fill of the missing leg.
        let refill_price = more_aggressive(missing.action, missing.limit_price, self.cfg.hedge_widen_cents);
        let mut remaining = qty;
        if let Ok(ack) = self
            .place_leg(opp.id, missing_index, missing, qty, 1, refill_price)
            .await
        {
            match self.wait_for_fill(&ack.order_id, qty).await {
                Ok(w) => {
                    if w.filled > 0 {
                        self.emit_fill(
                            opp.id,
                            missing,
                            w.filled,
                            w.avg_price.unwrap_or(refill_price),
                            w.fees,
                            &ack.order_id,
                            false,
                        )
                        .await;
                    }
                    if w.state == OrderState::Resting && w.filled < qty {
                        self.cancel_quietly(&ack.order_id).await;
                    }
                    remaining = qty - w.filled;
                }
                Err(_) => {
                    self.cancel_quietly(&ack.order_id).await;
                }
            }
        }
        if remaining <= 0 {
            info!(event = "hedge_refill_complete", opportunity = %opp.id, "hedge re-fill completed");
            return;
        }

        // (b) Flatten the filled leg's uncovered remainder.
        self.flatten(opp.id, filled, filled_index, remaining).await;
    }

    /// Close `qty` contracts of a filled leg with a reverse order priced no
    /// worse than the configured per-contract unwind loss. Realized loss
    /// flows through fill reconciliation into the daily cap.
    async fn flatten(&self, opportunity_id: Uuid, leg: &Leg, leg_index: usize, qty: i64) {
        let action = opposite(leg.action);
        let price = more_aggressive(action, leg.limit_price, self.cfg.max_unwind_loss_cents);
        let flatten_leg = Leg {
            action,
            limit_price: price,
            ..leg.clone()
        };
        let ack = match self
            .place_leg(opportunity_id, leg_index, &flatten_leg, qty, 2, price)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.alerts
                    .error("unwind failed", &format!("{}: {}", leg.ticker, e))
                    .await;
                return;
            }
        };
        match self.wait_for_fill(&ack.order_id, qty).await {
            Ok(w) => {
                if w.filled > 0 {
                    self.emit_fill(
                        opportunity_id,
                        &flatten_leg,
                        w.filled,
                        w.avg_price.unwrap_or(price),
                        w.fees,
                        &ack.order_id,
                        false,
                    )
                    .await;
                }
                if w.filled < qty {
                    if w.state == OrderState::Resting {
                        self.cancel_quietly(&ack.order_id).await;
                    }
                    self.alerts
                        .error(
                            "unwind incomplete",
                            &format!("{} contracts of {} remain exposed", qty - w.filled, leg.ticker),
                        )
                        .await;
                }
            }
            Err(e) => {
                self.cancel_quietly(&ack.order_id).await;
                self.alerts
                    .error("unwind failed", &format!("{}: {}", leg.ticker, e))
                    .await;
            }
        }
    }

    // ── Order plumbing ───────────────────────────────────────────────────

    async fn place_leg(
        &self,
        opportunity_id: Uuid,
        leg_index: usize,
        leg: &Leg,
        count: i64,
        attempt: u32,
        price: Cents,
    ) -> Result<OrderAck, String> {
        let client_order_id = idempotency_key(opportunity_id, leg_index, attempt);
        let deadline = self.cfg.order_deadline + self.cfg.expiration_skew;
        let request = OrderRequest {
            ticker: leg.ticker.clone(),
            action: leg.action,
            side: leg.side,
            count,
            limit_price_cents: price,
            expiration_ts: (Utc::now() + chrono::Duration::from_std(deadline).expect("deadline"))
                .timestamp(),
            client_order_id: client_order_id.clone(),
        };
        self.journal.append(&JournalEvent::OrderSubmitted {
            opportunity_id,
            leg_index,
            attempt,
            ticker: leg.ticker.clone(),
            action: leg.action,
            side: leg.side,
            count,
            limit_price_cents: price,
            client_order_id,
            ts: Utc::now(),
        });
        self.exchange
            .place_order(&request)
            .await
            .map_err(|e| e.to_string())
    }

    /// Poll an order until full fill, terminal state, deadline, or kill
    /// switch. The deadline is local; the exchange-side expiration acts as
    /// the backstop.
    async fn wait_for_fill(&self, order_id: &str, count: i64) -> Result<WaitOutcome, String> {
        let deadline = Instant::now() + self.cfg.order_deadline;
        loop {
            let status = self
                .exchange
                .get_order(order_id)
                .await
                .map_err(|e| e.to_string())?;
            let outcome = WaitOutcome {
                filled: status.filled_count,
                avg_price: status.avg_fill_price_cents,
                fees: status.fees_paid_cents,
                state: status.state,
                killed: *self.kill_rx.borrow(),
            };
            if status.state != OrderState::Resting || status.filled_count >= count {
                return Ok(outcome);
            }
            if outcome.killed || Instant::now() >= deadline {
                return Ok(outcome);
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    /// Cancel, tracking orders the exchange refuses to release as orphans.
    async fn cancel_quietly(&self, order_id: &str) {
        match self.exchange.cancel_order(order_id).await {
            Ok(()) => {
                self.journal.append(&JournalEvent::OrderCancelled {
                    order_id: order_id.to_string(),
                    ts: Utc::now(),
                });
            }
            Err(e) => {
                warn!(order_id, %e, "cancel failed, tracking orphan order");
                self.orphans
                    .lock()
                    .expect("orphan lock")
                    .push(order_id.to_string());
                self.alerts
                    .error("orphan order", &format!("{order_id}: {e}"))
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_fill(
        &self,
        opportunity_id: Uuid,
        leg: &Leg,
        count: i64,
        price: Cents,
        fee: Cents,
        order_id: &str,
        synthetic: bool,
    ) {
        let fill = FillEvent {
            opportunity_id,
            ticker: leg.ticker.clone(),
            order_id: order_id.to_string(),
            side: leg.side,
            action: leg.action,
            count,
            price,
            fee,
            synthetic,
            ts: Utc::now(),
        };
        self.journal.append(&JournalEvent::Fill(fill.clone()));
        if self.fills_tx.send(fill).await.is_err() {
            error!("fill channel closed, reconciliation worker gone");
        }
    }

    fn finish(
        &self,
        opp: &mut Opportunity,
        state: OpportunityState,
        matched: i64,
        error: Option<ExecErrorKind>,
    ) -> ExecutionReport {
        let reason = error.as_ref().map(|e| format!("{e:?}"));
        if opp.transition(state).is_ok() {
            self.journal
                .transition(opp.id, OpportunityState::Executing, state, reason);
        }
        info!(
            event = "execution_finished",
            opportunity = %opp.id,
            state = %opp.state,
            matched,
            "Execution finished"
        );
        ExecutionReport {
            opportunity_id: opp.id,
            final_state: opp.state,
            matched_count: matched,
            error,
        }
    }
}

// =============================================================================
// WORKER POOL
// =============================================================================

/// Drain the opportunity queue with a small pool of workers. Each worker
/// admits through the governor, executes, and releases; rejected and
/// expired opportunities are journaled and dropped.
pub async fn run_execution_workers(
    engine: Arc<ExecutionEngine>,
    governor: Arc<RiskGovernor>,
    journal: Arc<Journal>,
    alerts: Arc<AlertSink>,
    metrics: Arc<Metrics>,
    rx: mpsc::Receiver<Opportunity>,
    workers: usize,
) {
    info!("execution workers started (pool={}, dry_run={})", workers, engine.dry_run());
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let handles: Vec<_> = (0..workers.max(1))
        .map(|worker_id| {
            let engine = engine.clone();
            let governor = governor.clone();
            let journal = journal.clone();
            let alerts = alerts.clone();
            let metrics = metrics.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(mut opp) = next else { break };
                    process_opportunity(
                        &engine, &governor, &journal, &alerts, &metrics, &mut opp, worker_id,
                    )
                    .await;
                }
            })
        })
        .collect();
    join_all(handles).await;
    info!("execution workers stopped");
}

async fn process_opportunity(
    engine: &ExecutionEngine,
    governor: &RiskGovernor,
    journal: &Journal,
    alerts: &AlertSink,
    metrics: &Metrics,
    opp: &mut Opportunity,
    worker_id: usize,
) {
    use crate::risk::RejectReason;

    match governor.admit(opp, Utc::now()) {
        Ok(count) => {
            metrics.opportunities_admitted.inc();
            journal.transition(
                opp.id,
                OpportunityState::Detected,
                OpportunityState::Validated,
                None,
            );
            info!(
                event = "opportunity_admitted",
                worker = worker_id,
                opportunity = %opp.id,
                signal = %opp.signal,
                contracts = count,
                "Opportunity admitted"
            );
            let report = engine.execute(opp).await;
            governor.release(opp.id);
            match report.final_state {
                OpportunityState::Filled => metrics.executions_filled.inc(),
                OpportunityState::Partial => metrics.executions_partial.inc(),
                _ => metrics.executions_failed.inc(),
            }
            alerts
                .execution_finished(opp, report.matched_count, engine.dry_run())
                .await;
        }
        Err(RejectReason::Expired) => {
            metrics.opportunities_expired.inc();
            let _ = opp.transition(OpportunityState::Expired);
            journal.transition(
                opp.id,
                OpportunityState::Detected,
                OpportunityState::Expired,
                Some("EXPIRED".into()),
            );
        }
        Err(reason) => {
            metrics.opportunities_rejected.inc();
            info!(
                event = "opportunity_rejected",
                worker = worker_id,
                opportunity = %opp.id,
                reason = %reason,
                "Opportunity rejected"
            );
            let _ = opp.transition(OpportunityState::Rejected);
            journal.transition(
                opp.id,
                OpportunityState::Detected,
                OpportunityState::Rejected,
                Some(reason.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggression_moves_toward_fill_and_clamps() {
        assert_eq!(more_aggressive(Action::Buy, 50, 1), 51);
        assert_eq!(more_aggressive(Action::Sell, 50, 1), 49);
        assert_eq!(more_aggressive(Action::Buy, 99, 2), 99);
        assert_eq!(more_aggressive(Action::Sell, 2, 5), 1);
    }

    #[test]
    fn idempotency_key_is_stable_per_attempt() {
        let id = Uuid::from_u128(7);
        assert_eq!(idempotency_key(id, 0, 0), format!("{id}:0:0"));
        assert_eq!(idempotency_key(id, 1, 2), format!("{id}:1:2"));
        // Same inputs always produce the same key.
        assert_eq!(idempotency_key(id, 1, 2), idempotency_key(id, 1, 2));
    }

    #[test]
    fn exec_config_derives_from_options() {
        let mut cfg = Config::default();
        cfg.order_deadline_seconds = 30;
        cfg.order_expiration_skew_seconds = 5;
        cfg.hedge_widen_cents = 3;
        let exec = ExecConfig::from_config(&cfg);
        assert_eq!(exec.order_deadline, Duration::from_secs(30));
        assert_eq!(exec.expiration_skew, Duration::from_secs(5));
        assert_eq!(exec.hedge_widen_cents, 3);
        assert!(exec.dry_run);
    }

    #[test]
    fn opposite_flips_action() {
        assert_eq!(opposite(Action::Buy), Action::Sell);
        assert_eq!(opposite(Action::Sell), Action::Buy);
    }
}
