//! Orchestrator for the cross-market mispricing trader.
//!
//! Worker topology: one ingestion worker producing market snapshots, one
//! scan worker running the detector each tick, a bounded opportunity queue
//! feeding a small execution pool, and one reconciliation worker consuming
//! fill events. All shared state sits behind single-writer boundaries;
//! cross-worker reads go through immutable snapshots.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, info_span, warn};

use cross_market_arbitrage::alerts::AlertSink;
use cross_market_arbitrage::cache::MarketCache;
use cross_market_arbitrage::catalog::RelationshipCatalog;
use cross_market_arbitrage::config::Config;
use cross_market_arbitrage::detector::Detector;
use cross_market_arbitrage::exchange::{
    fetch_all_open_markets, ExchangeApi, KalshiAuth, KalshiClient,
};
use cross_market_arbitrage::execution::{run_execution_workers, ExecConfig, ExecutionEngine};
use cross_market_arbitrage::fees::FeeModel;
use cross_market_arbitrage::llm::{batch_by_event, AnthropicClient, RelationshipSource};
use cross_market_arbitrage::logging;
use cross_market_arbitrage::metrics::Metrics;
use cross_market_arbitrage::risk::RiskGovernor;
use cross_market_arbitrage::store::{Journal, JournalEvent};
use cross_market_arbitrage::types::{FillEvent, Opportunity};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init_logging();
    let run_id = logging::run_id();
    let cfg = Config::from_env();

    let root_span = info_span!(
        "mispricing_bot",
        run_id = %run_id,
        dry_run = cfg.dry_run,
        max_daily_loss_cents = cfg.max_daily_loss_cents,
    );
    let _enter = root_span.enter();

    info!("Cross-Market Mispricing Detector & Trader");
    if cfg.dry_run {
        info!("   Mode: DRY RUN (set DRY_RUN=0 to trade)");
    } else {
        warn!("   Mode: LIVE EXECUTION");
    }

    // Collaborators.
    let auth = KalshiAuth::from_env().context("Kalshi credentials")?;
    let base_url = std::env::var("KALSHI_BASE_URL").ok();
    let exchange: Arc<dyn ExchangeApi> = Arc::new(KalshiClient::new(auth, base_url));

    let llm: Option<Arc<dyn RelationshipSource>> =
        AnthropicClient::from_env(Duration::from_secs(cfg.llm_timeout_seconds))
            .map(|c| Arc::new(c) as Arc<dyn RelationshipSource>);
    if llm.is_none() {
        warn!("ANTHROPIC_API_KEY not set; relationship discovery disabled");
    }

    let alerts = Arc::new(AlertSink::from_env());
    let journal_dir = std::env::var("JOURNAL_DIR").unwrap_or_else(|_| "./data".to_string());
    let journal = Arc::new(Journal::open(&journal_dir).context("open journal")?);
    let metrics = Metrics::new();

    // Owned state.
    let cache = Arc::new(MarketCache::new());
    let catalog = Arc::new(Mutex::new(RelationshipCatalog::new(
        cfg.confidence_floor,
        chrono::Duration::hours(cfg.relationship_rescan_hours as i64),
    )));
    let (governor, kill_rx) = RiskGovernor::new(cfg.clone(), Utc::now());
    let governor = Arc::new(governor);
    let fee_model = FeeModel::Taker;
    let detector = Arc::new(Detector::new(&cfg, fee_model));

    // Channels: bounded opportunity queue, fill event stream.
    let (opp_tx, opp_rx) = mpsc::channel::<Opportunity>(cfg.opportunity_queue_capacity);
    let (fills_tx, fills_rx) = mpsc::channel::<FillEvent>(1_024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Arc::new(ExecutionEngine::new(
        exchange.clone(),
        governor.clone(),
        journal.clone(),
        alerts.clone(),
        fills_tx.clone(),
        kill_rx.clone(),
        fee_model,
        ExecConfig::from_config(&cfg),
    ));

    // Initial balance sync before anything trades.
    match exchange.get_balance().await {
        Ok(balance) => {
            governor.set_balance(balance);
            info!("balance synced: {}c", balance);
        }
        Err(e) => warn!("initial balance sync failed: {}", e),
    }

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(ingestion_loop(
        exchange.clone(),
        cache.clone(),
        catalog.clone(),
        governor.clone(),
        metrics.clone(),
        alerts.clone(),
        cfg.clone(),
        shutdown_rx.clone(),
    )));

    if let Some(llm) = llm {
        tasks.push(tokio::spawn(discovery_loop(
            llm,
            cache.clone(),
            catalog.clone(),
            metrics.clone(),
            cfg.clone(),
            shutdown_rx.clone(),
        )));
    }

    tasks.push(tokio::spawn(scan_loop(
        detector,
        cache.clone(),
        catalog.clone(),
        governor.clone(),
        metrics.clone(),
        alerts.clone(),
        opp_tx,
        cfg.clone(),
        kill_rx.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(run_execution_workers(
        engine.clone(),
        governor.clone(),
        journal.clone(),
        alerts.clone(),
        metrics.clone(),
        opp_rx,
        cfg.execution_workers,
    )));

    tasks.push(tokio::spawn(reconciliation_loop(
        fills_rx,
        governor.clone(),
        metrics.clone(),
    )));

    tasks.push(tokio::spawn(kill_switch_watcher(
        kill_rx,
        journal.clone(),
        alerts.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    )));

    tasks.push(tokio::spawn(heartbeat_loop(
        governor.clone(),
        metrics.clone(),
        alerts.clone(),
        shutdown_rx,
    )));

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    // Release the engine's fill sender so the reconciliation worker drains
    // and exits once the execution workers are done.
    drop(fills_tx);
    drop(engine);

    for task in tasks {
        let _ = task.await;
    }
    info!("goodbye");
    Ok(())
}

/// Sleep that wakes early on shutdown. Returns false when shutting down.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}

/// Full market ingestion on the full-scan cadence: snapshot the cache,
/// sweep fingerprints, refresh balance, and mark open positions.
#[allow(clippy::too_many_arguments)]
async fn ingestion_loop(
    exchange: Arc<dyn ExchangeApi>,
    cache: Arc<MarketCache>,
    catalog: Arc<Mutex<RelationshipCatalog>>,
    governor: Arc<RiskGovernor>,
    metrics: Arc<Metrics>,
    alerts: Arc<AlertSink>,
    cfg: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(cfg.full_scan_interval_seconds);
    loop {
        match fetch_all_open_markets(exchange.as_ref()).await {
            Ok(markets) => {
                let stats = cache.apply_snapshot(markets);
                metrics.ingest_runs.inc();
                metrics.markets_cached.set(cache.len() as i64);
                info!(
                    event = "ingest_complete",
                    applied = stats.applied,
                    skipped_stale = stats.skipped_stale,
                    "Ingestion complete"
                );

                if !stats.anomalies.is_empty() {
                    // Impossible market state is fatal for trading.
                    error!(anomalies = ?stats.anomalies, "impossible market state in snapshot");
                    governor.engage_kill_switch("impossible market state in snapshot");
                    alerts
                        .error("invariant violation", &format!("{:?}", stats.anomalies))
                        .await;
                }

                let swept = catalog.lock().expect("catalog lock").sweep(&cache);
                if !swept.is_empty() {
                    metrics.relationships_invalidated.add(swept.len() as u64);
                }

                match exchange.get_balance().await {
                    Ok(balance) => governor.set_balance(balance),
                    Err(e) => {
                        metrics.exchange_errors.inc();
                        warn!("balance refresh failed: {}", e);
                    }
                }

                for (ticker, _) in governor.list_positions() {
                    if let Ok(market) = cache.get(&ticker) {
                        governor.mark(&ticker, market.quote.yes_mid());
                    }
                }
            }
            Err(e) => {
                metrics.exchange_errors.inc();
                warn!("ingestion cycle failed, skipping: {}", e);
            }
        }
        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
}

/// Relationship discovery and revalidation on the rescan cadence.
async fn discovery_loop(
    llm: Arc<dyn RelationshipSource>,
    cache: Arc<MarketCache>,
    catalog: Arc<Mutex<RelationshipCatalog>>,
    metrics: Arc<Metrics>,
    cfg: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(cfg.relationship_rescan_hours.max(1) * 3_600);
    // Give the first ingestion a head start.
    if !sleep_or_shutdown(Duration::from_secs(cfg.full_scan_interval_seconds + 5), &mut shutdown).await
    {
        return;
    }
    loop {
        let batches = batch_by_event(&cache.open_markets());
        info!("discovery pass over {} event batches", batches.len());
        for batch in batches {
            match llm.discover(&batch).await {
                Ok(candidates) => {
                    let now = Utc::now();
                    let mut catalog = catalog.lock().expect("catalog lock");
                    for candidate in candidates {
                        if let Err(e) = catalog.upsert(candidate, &cache, now) {
                            tracing::debug!("candidate dropped: {}", e);
                        }
                    }
                }
                Err(e) => {
                    metrics.llm_errors.inc();
                    warn!("discovery batch failed: {}", e);
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
        metrics.discovery_runs.inc();

        // Revalidate anything past the interval.
        let stale = catalog
            .lock()
            .expect("catalog lock")
            .stale_for_revalidation(Utc::now());
        for rel in stale {
            let markets: Vec<_> = rel
                .kind
                .tickers()
                .iter()
                .filter_map(|t| cache.peek(t))
                .collect();
            match llm.revalidate(&rel, &markets).await {
                Ok(verdict) => {
                    let _ = catalog
                        .lock()
                        .expect("catalog lock")
                        .apply_revalidation(rel.id, verdict, Utc::now());
                }
                Err(e) => {
                    metrics.llm_errors.inc();
                    warn!("revalidation of {} failed: {}", rel.id, e);
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }

        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
}

/// Detection scan on the recheck cadence, feeding the bounded queue.
#[allow(clippy::too_many_arguments)]
async fn scan_loop(
    detector: Arc<Detector>,
    cache: Arc<MarketCache>,
    catalog: Arc<Mutex<RelationshipCatalog>>,
    governor: Arc<RiskGovernor>,
    metrics: Arc<Metrics>,
    alerts: Arc<AlertSink>,
    opp_tx: mpsc::Sender<Opportunity>,
    cfg: Config,
    kill_rx: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(cfg.opportunity_recheck_seconds);
    loop {
        if *kill_rx.borrow() {
            // Kill switch stops detector emission entirely.
            if !sleep_or_shutdown(interval, &mut shutdown).await {
                break;
            }
            continue;
        }

        let active = catalog.lock().expect("catalog lock").active(&cache);
        metrics.relationships_active.set(active.len() as i64);
        let sizer = governor.sizer();
        let opportunities = detector.scan(&active, &cache, &sizer, Utc::now());
        metrics.scans_completed.inc();

        for opp in opportunities {
            metrics.opportunities_detected.inc();
            alerts.opportunity_detected(&opp).await;
            match opp_tx.try_send(opp) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(opp)) => {
                    warn!(opportunity = %opp.id, "opportunity queue full, dropping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }

        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
}

/// Single consumer applying fills in arrival order: per-ticker fill
/// ordering follows submission order without any global lock.
async fn reconciliation_loop(
    mut fills_rx: mpsc::Receiver<FillEvent>,
    governor: Arc<RiskGovernor>,
    metrics: Arc<Metrics>,
) {
    while let Some(fill) = fills_rx.recv().await {
        governor.on_fill(&fill);
        metrics.fills_applied.inc();
    }
    info!("reconciliation worker stopped");
}

/// Journal and alert on kill-switch flips.
async fn kill_switch_watcher(
    mut kill_rx: watch::Receiver<bool>,
    journal: Arc<Journal>,
    alerts: Arc<AlertSink>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = kill_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let engaged = *kill_rx.borrow();
                if engaged {
                    metrics.kill_switch_trips.inc();
                }
                journal.append(&JournalEvent::KillSwitch {
                    engaged,
                    reason: "governor".to_string(),
                    ts: Utc::now(),
                });
                alerts.kill_switch(engaged, "see logs for trigger").await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Periodic metrics snapshot plus a daily portfolio summary.
async fn heartbeat_loop(
    governor: Arc<RiskGovernor>,
    metrics: Arc<Metrics>,
    alerts: Arc<AlertSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_summary_day = Utc::now().date_naive();
    loop {
        if !sleep_or_shutdown(Duration::from_secs(60), &mut shutdown).await {
            break;
        }
        metrics.log_snapshot();
        let summary = governor.summary();
        info!(
            event = "portfolio_heartbeat",
            balance_cents = summary.balance_cents,
            daily_pnl_cents = summary.daily_pnl_cents,
            open_opportunities = summary.open_opportunities,
            kill_switch = summary.kill_switch,
            "Portfolio"
        );

        let today = Utc::now().date_naive();
        if today != last_summary_day {
            last_summary_day = today;
            alerts
                .daily_summary(
                    &summary,
                    metrics.opportunities_detected.get(),
                    metrics.executions_filled.get(),
                )
                .await;
        }
    }
}
