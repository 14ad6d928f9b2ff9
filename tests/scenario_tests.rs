//! End-to-end pipeline scenarios against a mock exchange.
//!
//! Each test drives the real detection, admission, execution, and
//! reconciliation code; only the exchange behind the `ExchangeApi` trait is
//! simulated.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use cross_market_arbitrage::alerts::AlertSink;
use cross_market_arbitrage::cache::MarketCache;
use cross_market_arbitrage::catalog::RelationshipCatalog;
use cross_market_arbitrage::config::Config;
use cross_market_arbitrage::detector::Detector;
use cross_market_arbitrage::exchange::{
    ExchangeApi, ExchangeError, ExchangePosition, MarketsPage, OrderAck, OrderRequest, OrderState,
    OrderStatusView, OrderbookTop,
};
use cross_market_arbitrage::execution::{ExecConfig, ExecutionEngine};
use cross_market_arbitrage::fees::FeeModel;
use cross_market_arbitrage::risk::{RejectReason, RiskGovernor};
use cross_market_arbitrage::store::Journal;
use cross_market_arbitrage::types::{
    Action, Cents, Event, FillEvent, Market, MarketStatus, Opportunity, OpportunityState, Quote,
    RelationshipCandidate, RelationshipKind, Signal,
};

// =============================================================================
// MOCK EXCHANGE
// =============================================================================

#[derive(Debug, Clone)]
struct MockOrder {
    request: OrderRequest,
    filled: i64,
    state: OrderState,
}

#[derive(Default)]
struct MockState {
    orders: HashMap<String, MockOrder>,
    by_client_id: HashMap<String, String>,
    /// Planned fill counts per ticker, consumed per order placed. Orders
    /// without a plan fill completely.
    fill_plan: HashMap<String, VecDeque<i64>>,
    placed: Vec<OrderRequest>,
    next_id: u64,
}

/// In-memory exchange: orders fill instantly according to the per-ticker
/// fill plan.
struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    fn plan_fills(&self, ticker: &str, fills: &[i64]) {
        self.state
            .lock()
            .unwrap()
            .fill_plan
            .entry(ticker.to_string())
            .or_default()
            .extend(fills.iter().copied());
    }

    fn placed_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().placed.clone()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn list_open_markets(&self, _cursor: Option<String>) -> Result<MarketsPage, ExchangeError> {
        Ok(MarketsPage {
            markets: Vec::new(),
            next_cursor: None,
        })
    }

    async fn get_orderbook(&self, _ticker: &str) -> Result<OrderbookTop, ExchangeError> {
        Err(ExchangeError::Unavailable("no orderbook in mock".into()))
    }

    async fn list_events(&self) -> Result<Vec<Event>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_event(&self, event_ticker: &str) -> Result<Event, ExchangeError> {
        Err(ExchangeError::Rejected(format!("unknown event {event_ticker}")))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        // Idempotency: a resubmitted client_order_id returns the original
        // order instead of creating a second one.
        if let Some(order_id) = state.by_client_id.get(&request.client_order_id) {
            return Ok(OrderAck {
                order_id: order_id.clone(),
            });
        }
        state.next_id += 1;
        let order_id = format!("mock-{}", state.next_id);
        let planned = state
            .fill_plan
            .get_mut(&request.ticker)
            .and_then(VecDeque::pop_front)
            .unwrap_or(request.count);
        let filled = planned.min(request.count);
        let order = MockOrder {
            request: request.clone(),
            filled,
            state: if filled == request.count {
                OrderState::Filled
            } else {
                OrderState::Resting
            },
        };
        state.placed.push(request.clone());
        state.orders.insert(order_id.clone(), order);
        state
            .by_client_id
            .insert(request.client_order_id.clone(), order_id.clone());
        Ok(OrderAck { order_id })
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatusView, ExchangeError> {
        let state = self.state.lock().unwrap();
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::Rejected(format!("unknown order {order_id}")))?;
        Ok(OrderStatusView {
            state: order.state,
            filled_count: order.filled,
            avg_fill_price_cents: (order.filled > 0).then_some(order.request.limit_price_cents),
            fees_paid_cents: 0,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(order_id) {
            if order.state == OrderState::Resting {
                order.state = OrderState::Canceled;
            }
        }
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn get_balance(&self) -> Result<Cents, ExchangeError> {
        Ok(1_000_000)
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

fn market(ticker: &str, yes_bid: Cents, yes_ask: Cents, depth: i64) -> Market {
    Market {
        ticker: ticker.to_string(),
        event_ticker: "EV".to_string(),
        title: ticker.to_string(),
        subtitle: None,
        status: MarketStatus::Open,
        quote: Quote {
            yes_bid,
            yes_ask,
            no_bid: 100 - yes_ask,
            no_ask: 100 - yes_bid,
        },
        yes_depth: depth,
        no_depth: depth,
        rules: format!("rules {ticker}"),
        close_time: None,
        updated_at: Utc::now(),
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.dry_run = false;
    cfg.max_contracts_per_trade = 10;
    cfg.fee_safety_multiplier = 2.0;
    cfg
}

fn fast_exec_config(dry_run: bool) -> ExecConfig {
    ExecConfig {
        order_deadline: Duration::from_millis(100),
        expiration_skew: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        hedge_widen_cents: 2,
        max_unwind_loss_cents: 5,
        dry_run,
    }
}

struct Harness {
    exchange: Arc<MockExchange>,
    governor: Arc<RiskGovernor>,
    engine: ExecutionEngine,
    fills_rx: mpsc::Receiver<FillEvent>,
}

fn harness(cfg: Config, dry_run: bool) -> Harness {
    let exchange = MockExchange::new();
    let (governor, kill_rx) = RiskGovernor::new(cfg, Utc::now());
    let governor = Arc::new(governor);
    governor.set_balance(1_000_000);
    let (fills_tx, fills_rx) = mpsc::channel(1_024);
    let engine = ExecutionEngine::new(
        exchange.clone(),
        governor.clone(),
        Arc::new(Journal::disabled()),
        Arc::new(AlertSink::disabled()),
        fills_tx,
        kill_rx,
        FeeModel::Flat { cents_per_contract: 1 },
        fast_exec_config(dry_run),
    );
    Harness {
        exchange,
        governor,
        engine,
        fills_rx,
    }
}

/// Drain emitted fills into the governor, as the reconciliation worker
/// would.
fn reconcile(harness: &mut Harness) -> Vec<FillEvent> {
    let mut fills = Vec::new();
    while let Ok(fill) = harness.fills_rx.try_recv() {
        harness.governor.on_fill(&fill);
        fills.push(fill);
    }
    fills
}

fn detect_subset(cache: &MarketCache, governor: &RiskGovernor, cfg: &Config) -> Opportunity {
    let mut catalog = RelationshipCatalog::new(cfg.confidence_floor, chrono::Duration::hours(24));
    catalog
        .upsert(
            RelationshipCandidate {
                kind: RelationshipKind::Subset {
                    subset: "MAR_CUT".into(),
                    superset: "JUN_CUT".into(),
                },
                confidence: 0.95,
                reasoning: "a March cut implies a June cut".into(),
            },
            cache,
            Utc::now(),
        )
        .unwrap();
    let detector = Detector::new(cfg, FeeModel::Flat { cents_per_contract: 1 });
    let active = catalog.active(cache);
    let sizer = governor.sizer();
    let mut opportunities = detector.scan(&active, cache, &sizer, Utc::now());
    assert_eq!(opportunities.len(), 1);
    opportunities.remove(0)
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// SUBSET violation, full cycle: detect, admit, execute, reconcile.
#[tokio::test]
async fn subset_violation_fills_both_legs() {
    let cfg = test_config();
    let mut h = harness(cfg.clone(), false);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);

    let mut opp = detect_subset(&cache, &h.governor, &cfg);
    assert_eq!(opp.signal, Signal::BuySupersetSellSubset);
    assert_eq!(opp.raw_edge, 10);
    assert_eq!(opp.legs[0].ticker, "JUN_CUT");

    let count = h.governor.admit(&mut opp, Utc::now()).unwrap();
    assert_eq!(count, 10);

    let report = h.engine.execute(&mut opp).await;
    assert_eq!(report.final_state, OpportunityState::Filled);
    assert_eq!(report.matched_count, 10);

    let fills = reconcile(&mut h);
    assert_eq!(fills.len(), 2);

    // Position ledger equals the signed sum of confirmed fills.
    let positions = h.governor.list_positions();
    assert_eq!(positions.len(), 2);
    let jun = positions.iter().find(|(t, _)| t == "JUN_CUT").unwrap();
    let mar = positions.iter().find(|(t, _)| t == "MAR_CUT").unwrap();
    assert_eq!(jun.1.net_contracts, 10);
    assert_eq!(jun.1.avg_entry_cents, 50);
    assert_eq!(mar.1.net_contracts, -10);
    // The sell leg went out one cent more aggressive and filled there.
    assert_eq!(mar.1.avg_entry_cents, 59);

    // Legs went out least-liquid-first with the detected limits; leg 2 one
    // cent more aggressive.
    let placed = h.exchange.placed_orders();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[0].ticker, "JUN_CUT");
    assert_eq!(placed[0].limit_price_cents, 50);
    assert_eq!(placed[1].ticker, "MAR_CUT");
    assert_eq!(placed[1].limit_price_cents, 59); // sell lowered by 1c
}

/// Scenario: leg 1 fills 6/10 at deadline. Leg 2 goes out for exactly 6 and
/// the trade ends as a balanced partial.
#[tokio::test]
async fn partial_leg1_carries_matched_count_to_leg2() {
    let cfg = test_config();
    let mut h = harness(cfg.clone(), false);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);
    let mut opp = detect_subset(&cache, &h.governor, &cfg);
    h.governor.admit(&mut opp, Utc::now()).unwrap();

    h.exchange.plan_fills("JUN_CUT", &[6]);

    let report = h.engine.execute(&mut opp).await;
    assert_eq!(report.final_state, OpportunityState::Partial);
    assert_eq!(report.matched_count, 6);
    assert!(report.error.is_none());

    let placed = h.exchange.placed_orders();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[1].count, 6); // no over-leg

    let fills = reconcile(&mut h);
    assert_eq!(fills.iter().map(|f| f.count).sum::<i64>(), 12);
    // Balanced: +6 and -6.
    assert_eq!(h.governor.list_positions().len(), 2);
    let net: i64 = h
        .governor
        .list_positions()
        .iter()
        .map(|(_, p)| p.net_contracts)
        .sum();
    assert_eq!(net, 0);
}

/// Scenario: leg 2 never fills. The hedge task tries one aggressive
/// re-fill, then flattens the 6 exposed leg-1 contracts.
#[tokio::test]
async fn zero_fill_leg2_triggers_hedge_flatten() {
    let cfg = test_config();
    let mut h = harness(cfg.clone(), false);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);
    let mut opp = detect_subset(&cache, &h.governor, &cfg);
    h.governor.admit(&mut opp, Utc::now()).unwrap();

    // Leg 1 (JUN_CUT buy) fills 6; MAR_CUT refuses to fill twice (leg 2 and
    // the hedge re-fill), then the flatten sell on JUN_CUT fills.
    h.exchange.plan_fills("JUN_CUT", &[6]);
    h.exchange.plan_fills("MAR_CUT", &[0, 0]);

    let report = h.engine.execute(&mut opp).await;
    assert_eq!(report.final_state, OpportunityState::Partial);

    let placed = h.exchange.placed_orders();
    // leg1, leg2, hedge re-fill, flatten.
    assert_eq!(placed.len(), 4);
    let refill = &placed[2];
    assert_eq!(refill.ticker, "MAR_CUT");
    assert_eq!(refill.count, 6);
    // Sell leg widened down by hedge_widen_cents from its detected limit.
    assert_eq!(refill.limit_price_cents, 58);
    let flatten = &placed[3];
    assert_eq!(flatten.ticker, "JUN_CUT");
    assert_eq!(flatten.action, Action::Sell);
    assert_eq!(flatten.count, 6);

    let _ = reconcile(&mut h);
    // Exposure closed: the bought 6 were flattened.
    assert_eq!(h.governor.force_flat("JUN_CUT"), None);
}

/// Boundary case: kill switch flips after admission. Leg 2 is never
/// submitted; the leg 1 fill is held.
#[tokio::test]
async fn kill_switch_mid_execution_holds_leg1() {
    let cfg = test_config();
    let mut h = harness(cfg.clone(), false);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);
    let mut opp = detect_subset(&cache, &h.governor, &cfg);
    h.governor.admit(&mut opp, Utc::now()).unwrap();

    // Leg 1 rests with a partial fill, so the engine is mid-wait when the
    // kill switch flips.
    h.exchange.plan_fills("JUN_CUT", &[6]);
    let governor = h.governor.clone();
    let killer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        governor.engage_kill_switch("operator");
    });

    let report = h.engine.execute(&mut opp).await;
    killer.await.unwrap();
    assert_eq!(report.final_state, OpportunityState::Partial);

    let placed = h.exchange.placed_orders();
    assert_eq!(placed.len(), 1, "leg 2 must not be submitted");
    assert_eq!(placed[0].ticker, "JUN_CUT");

    let fills = reconcile(&mut h);
    assert_eq!(fills.len(), 1);
    assert_eq!(h.governor.force_flat("JUN_CUT").unwrap().net_contracts, 6);
}

/// PARTITION with unequal fills unwinds every leg down to the largest
/// common fill.
#[tokio::test]
async fn partition_unwinds_to_largest_common_fill() {
    let mut cfg = test_config();
    cfg.min_score_threshold = 0.01;
    cfg.fee_safety_multiplier = 0.5;
    let mut h = harness(cfg.clone(), false);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("G1", 18, 20, 20),
        market("G2", 23, 25, 20),
        market("G3", 23, 25, 20),
        market("G4", 20, 22, 20),
    ]);
    let mut catalog = RelationshipCatalog::new(cfg.confidence_floor, chrono::Duration::hours(24));
    catalog
        .upsert(
            RelationshipCandidate {
                kind: RelationshipKind::Partition {
                    tickers: vec!["G1".into(), "G2".into(), "G3".into(), "G4".into()],
                },
                confidence: 0.9,
                reasoning: String::new(),
            },
            &cache,
            Utc::now(),
        )
        .unwrap();
    let detector = Detector::new(&cfg, FeeModel::Flat { cents_per_contract: 1 });
    let active = catalog.active(&cache);
    let sizer = h.governor.sizer();
    let mut opps = detector.scan(&active, &cache, &sizer, Utc::now());
    assert_eq!(opps.len(), 1);
    let mut opp = opps.remove(0);
    assert_eq!(opp.signal, Signal::BuyAllPartition);

    let count = h.governor.admit(&mut opp, Utc::now()).unwrap();
    assert_eq!(count, 10);

    // G3 only fills 6 of 10.
    h.exchange.plan_fills("G3", &[6]);

    let report = h.engine.execute(&mut opp).await;
    assert_eq!(report.final_state, OpportunityState::Partial);
    assert_eq!(report.matched_count, 6);

    let placed = h.exchange.placed_orders();
    // 4 entry legs + 3 unwinds of the 4-contract excess.
    assert_eq!(placed.len(), 7);
    let unwinds: Vec<_> = placed[4..].iter().collect();
    assert!(unwinds.iter().all(|o| o.action == Action::Sell && o.count == 4));

    let _ = reconcile(&mut h);
    // Every leg nets to the common fill.
    for (_, position) in h.governor.list_positions() {
        assert_eq!(position.net_contracts, 6);
    }
}

/// Settlement-rules change invalidates the relationship the same cycle; no
/// emission even though prices still violate.
#[tokio::test]
async fn rules_change_silences_detection() {
    let cfg = test_config();
    let (governor, _kill_rx) = RiskGovernor::new(cfg.clone(), Utc::now());
    governor.set_balance(1_000_000);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);
    let mut catalog = RelationshipCatalog::new(cfg.confidence_floor, chrono::Duration::hours(24));
    catalog
        .upsert(
            RelationshipCandidate {
                kind: RelationshipKind::Subset {
                    subset: "MAR_CUT".into(),
                    superset: "JUN_CUT".into(),
                },
                confidence: 0.95,
                reasoning: String::new(),
            },
            &cache,
            Utc::now(),
        )
        .unwrap();
    let detector = Detector::new(&cfg, FeeModel::Flat { cents_per_contract: 1 });
    assert_eq!(
        detector
            .scan(&catalog.active(&cache), &cache, &governor.sizer(), Utc::now())
            .len(),
        1
    );

    // JUN_CUT's settlement rules change on the next ingestion.
    let mut changed = market("JUN_CUT", 50, 52, 15);
    changed.rules = "amended settlement criteria".into();
    changed.updated_at = Utc::now() + chrono::Duration::seconds(1);
    cache.apply_snapshot(vec![changed]);
    let swept = catalog.sweep(&cache);
    assert_eq!(swept.len(), 1);

    assert!(detector
        .scan(&catalog.active(&cache), &cache, &governor.sizer(), Utc::now())
        .is_empty());
}

/// Dry run: same admission and sizing, synthetic fills at limit price, real
/// ledger untouched.
#[tokio::test]
async fn dry_run_fills_only_the_shadow_ledger() {
    let mut cfg = test_config();
    cfg.dry_run = true;
    let mut h = harness(cfg.clone(), true);

    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);
    let mut opp = detect_subset(&cache, &h.governor, &cfg);
    h.governor.admit(&mut opp, Utc::now()).unwrap();

    let report = h.engine.execute(&mut opp).await;
    assert_eq!(report.final_state, OpportunityState::Filled);

    // No exchange orders, no real positions.
    assert!(h.exchange.placed_orders().is_empty());
    let fills = reconcile(&mut h);
    assert_eq!(fills.len(), 2);
    assert!(fills.iter().all(|f| f.synthetic));
    assert!(h.governor.list_positions().is_empty());

    let shadow = h.governor.shadow_summary();
    assert_eq!(shadow.open_positions, 2);
}

/// Resubmitting an order with the same idempotency key never produces two
/// exchange orders.
#[tokio::test]
async fn idempotent_resubmission_dedupes() {
    let exchange = MockExchange::new();
    let request = OrderRequest {
        ticker: "A".into(),
        action: Action::Buy,
        side: cross_market_arbitrage::types::Side::Yes,
        count: 5,
        limit_price_cents: 50,
        expiration_ts: Utc::now().timestamp() + 30,
        client_order_id: format!("{}:0:0", Uuid::new_v4()),
    };
    let first = exchange.place_order(&request).await.unwrap();
    let second = exchange.place_order(&request).await.unwrap();
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(exchange.placed_orders().len(), 1);
}

/// Admission dedup across the pipeline: an opportunity that was already
/// admitted cannot be admitted again.
#[tokio::test]
async fn double_admission_is_an_illegal_state() {
    let cfg = test_config();
    let h = harness(cfg.clone(), false);
    let cache = MarketCache::new();
    cache.apply_snapshot(vec![
        market("MAR_CUT", 58, 60, 20),
        market("JUN_CUT", 50, 52, 15),
    ]);
    let mut opp = detect_subset(&cache, &h.governor, &cfg);
    h.governor.admit(&mut opp, Utc::now()).unwrap();
    assert_eq!(
        h.governor.admit(&mut opp, Utc::now()),
        Err(RejectReason::IllegalState)
    );
}
