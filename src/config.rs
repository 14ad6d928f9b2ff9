//! System configuration.
//!
//! A flat options record loaded from environment variables. Every recognized
//! option has a conservative default; malformed values warn and fall back
//! rather than abort.

use tracing::warn;

use crate::types::Cents;

/// Recognized runtime options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Synthetic execution: admission and sizing run identically, fills are
    /// simulated at limit price and recorded on the shadow ledger.
    pub dry_run: bool,
    /// Fraction of balance put at risk per opportunity (e.g. 0.02 = 2%).
    pub max_risk_per_trade_pct: f64,
    /// Trading halts when daily realized + unrealized P&L breaches this.
    pub max_daily_loss_cents: Cents,
    /// Admission cap on concurrently open opportunities.
    pub max_open_positions: usize,
    /// Hard cap on contracts per opportunity.
    pub max_contracts_per_trade: i64,
    /// Net absolute position cap per ticker.
    pub max_contracts_per_market: i64,
    /// Detector floor: opportunities scoring below are discarded.
    pub min_score_threshold: f64,
    /// Net edge must exceed this multiple of estimated fees.
    pub fee_safety_multiplier: f64,
    /// Minimum raw edge in cents before a violation is considered at all.
    /// Doubles as the PARTITION epsilon.
    pub min_edge_cents: Cents,
    /// Opportunity freshness window.
    pub opportunity_ttl_seconds: u64,
    /// Full market ingestion cadence.
    pub full_scan_interval_seconds: u64,
    /// Detection scan cadence.
    pub opportunity_recheck_seconds: u64,
    /// Relationship revalidation cadence.
    pub relationship_rescan_hours: u64,
    /// Per-leg fill deadline.
    pub order_deadline_seconds: u64,
    /// Exchange-side expiration is the local deadline plus this skew.
    pub order_expiration_skew_seconds: u64,
    /// Fill-status poll interval while an order rests.
    pub order_poll_interval_ms: u64,
    /// Price widening applied by the hedge task's aggressive re-fill.
    pub hedge_widen_cents: Cents,
    /// Accepted per-contract loss bound when flattening excess legs.
    pub max_unwind_loss_cents: Cents,
    /// IMPLICATION constraints below this conditional probability are not
    /// evaluated.
    pub implication_kappa_floor: f64,
    /// Minimum mispricing for soft IMPLICATION constraints.
    pub implication_soft_threshold_cents: Cents,
    /// Reject IMPLICATION opportunities at admission unless cleared by a
    /// human operator.
    pub require_human_for_implication: bool,
    /// Global halt. Engaged state at startup.
    pub kill_switch: bool,
    /// Catalog confidence floor for active relationships.
    pub confidence_floor: f64,
    /// Bounded opportunity queue capacity between detector and executors.
    pub opportunity_queue_capacity: usize,
    /// Execution worker pool size.
    pub execution_workers: usize,
    /// Deadline for LLM discovery/revalidation calls.
    pub llm_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: true,
            max_risk_per_trade_pct: 0.02,
            max_daily_loss_cents: 5_000,
            max_open_positions: 10,
            max_contracts_per_trade: 50,
            max_contracts_per_market: 200,
            min_score_threshold: 0.05,
            fee_safety_multiplier: 2.0,
            min_edge_cents: 2,
            opportunity_ttl_seconds: 15,
            full_scan_interval_seconds: 60,
            opportunity_recheck_seconds: 15,
            relationship_rescan_hours: 24,
            order_deadline_seconds: 30,
            order_expiration_skew_seconds: 5,
            order_poll_interval_ms: 500,
            hedge_widen_cents: 2,
            max_unwind_loss_cents: 500,
            implication_kappa_floor: 0.9,
            implication_soft_threshold_cents: 8,
            require_human_for_implication: true,
            kill_switch: false,
            confidence_floor: 0.5,
            opportunity_queue_capacity: 100,
            execution_workers: 4,
            llm_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dry_run: env_bool("DRY_RUN", d.dry_run),
            max_risk_per_trade_pct: env_parse("MAX_RISK_PER_TRADE_PCT", d.max_risk_per_trade_pct)
                .clamp(0.0, 1.0),
            max_daily_loss_cents: env_parse("MAX_DAILY_LOSS_CENTS", d.max_daily_loss_cents),
            max_open_positions: env_parse("MAX_OPEN_POSITIONS", d.max_open_positions),
            max_contracts_per_trade: env_parse(
                "MAX_CONTRACTS_PER_TRADE",
                d.max_contracts_per_trade,
            ),
            max_contracts_per_market: env_parse(
                "MAX_CONTRACTS_PER_MARKET",
                d.max_contracts_per_market,
            ),
            min_score_threshold: env_parse("MIN_SCORE_THRESHOLD", d.min_score_threshold),
            fee_safety_multiplier: env_parse("FEE_SAFETY_MULTIPLIER", d.fee_safety_multiplier),
            min_edge_cents: env_parse("MIN_EDGE_CENTS", d.min_edge_cents),
            opportunity_ttl_seconds: env_parse(
                "OPPORTUNITY_TTL_SECONDS",
                d.opportunity_ttl_seconds,
            ),
            full_scan_interval_seconds: env_parse(
                "FULL_SCAN_INTERVAL_SECONDS",
                d.full_scan_interval_seconds,
            ),
            opportunity_recheck_seconds: env_parse(
                "OPPORTUNITY_RECHECK_SECONDS",
                d.opportunity_recheck_seconds,
            ),
            relationship_rescan_hours: env_parse(
                "RELATIONSHIP_RESCAN_HOURS",
                d.relationship_rescan_hours,
            ),
            order_deadline_seconds: env_parse("ORDER_DEADLINE_SECONDS", d.order_deadline_seconds),
            order_expiration_skew_seconds: env_parse(
                "ORDER_EXPIRATION_SKEW_SECONDS",
                d.order_expiration_skew_seconds,
            ),
            order_poll_interval_ms: env_parse("ORDER_POLL_INTERVAL_MS", d.order_poll_interval_ms),
            hedge_widen_cents: env_parse("HEDGE_WIDEN_CENTS", d.hedge_widen_cents),
            max_unwind_loss_cents: env_parse("MAX_UNWIND_LOSS_CENTS", d.max_unwind_loss_cents),
            implication_kappa_floor: env_parse(
                "IMPLICATION_KAPPA_FLOOR",
                d.implication_kappa_floor,
            )
            .clamp(0.0, 1.0),
            implication_soft_threshold_cents: env_parse(
                "IMPLICATION_SOFT_THRESHOLD_CENTS",
                d.implication_soft_threshold_cents,
            ),
            require_human_for_implication: env_bool(
                "REQUIRE_HUMAN_FOR_IMPLICATION",
                d.require_human_for_implication,
            ),
            kill_switch: env_bool("KILL_SWITCH", d.kill_switch),
            confidence_floor: env_parse("CONFIDENCE_FLOOR", d.confidence_floor).clamp(0.0, 1.0),
            opportunity_queue_capacity: env_parse(
                "OPPORTUNITY_QUEUE_CAPACITY",
                d.opportunity_queue_capacity,
            ),
            execution_workers: env_parse("EXECUTION_WORKERS", d.execution_workers).max(1),
            llm_timeout_seconds: env_parse("LLM_TIMEOUT_SECONDS", d.llm_timeout_seconds),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Failed to parse {}='{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim(), "1" | "true" | "TRUE" | "True"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let cfg = Config::default();
        assert!(cfg.dry_run);
        assert!(!cfg.kill_switch);
        assert!(cfg.require_human_for_implication);
        assert_eq!(cfg.opportunity_ttl_seconds, 15);
        assert_eq!(cfg.order_deadline_seconds, 30);
        assert_eq!(cfg.execution_workers, 4);
        assert_eq!(cfg.opportunity_queue_capacity, 100);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("CMA_TEST_OPT", "not-a-number");
        assert_eq!(env_parse::<i64>("CMA_TEST_OPT", 7), 7);
        std::env::set_var("CMA_TEST_OPT", "42");
        assert_eq!(env_parse::<i64>("CMA_TEST_OPT", 7), 42);
        std::env::remove_var("CMA_TEST_OPT");
    }

    #[test]
    fn env_bool_accepts_common_truthy_forms() {
        std::env::set_var("CMA_TEST_FLAG", "true");
        assert!(env_bool("CMA_TEST_FLAG", false));
        std::env::set_var("CMA_TEST_FLAG", "0");
        assert!(!env_bool("CMA_TEST_FLAG", true));
        std::env::remove_var("CMA_TEST_FLAG");
        assert!(env_bool("CMA_TEST_FLAG", true));
    }
}
