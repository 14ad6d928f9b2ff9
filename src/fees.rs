//! Exchange fee estimation in integer cents.
//!
//! Kalshi fee schedule:
//!   Taker: ceil(7 * C * p * (100 - p) / 10000) cents
//!   Maker: ceil(7 * C * p * (100 - p) / 40000) cents
//!
//! Where C = contracts and p = price in cents [1..99]. Totals are computed
//! first and rounded up once, avoiding per-contract rounding drift.

use serde::{Deserialize, Serialize};

use crate::types::{Cents, Leg};

/// Total taker fee in cents for `contracts` at `price_cents`.
pub fn taker_fee_total_cents(price_cents: Cents, contracts: i64) -> Cents {
    fee_total(price_cents, contracts, 10_000)
}

/// Total maker fee in cents for `contracts` at `price_cents`.
pub fn maker_fee_total_cents(price_cents: Cents, contracts: i64) -> Cents {
    fee_total(price_cents, contracts, 40_000)
}

fn fee_total(price_cents: Cents, contracts: i64, divisor: i64) -> Cents {
    if contracts <= 0 || !(1..=99).contains(&price_cents) {
        return 0;
    }
    let raw = 7 * contracts * price_cents * (100 - price_cents);
    (raw + divisor - 1) / divisor
}

/// Fee model used by the detector and the execution engine.
///
/// A closed set: production uses the Kalshi schedule, tests substitute a
/// flat per-leg rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeModel {
    /// Kalshi schedule, crossing the book.
    Taker,
    /// Kalshi schedule, resting orders.
    Maker,
    /// Fixed cents per contract per leg.
    Flat { cents_per_contract: Cents },
}

impl FeeModel {
    /// Total fee in cents for one leg.
    pub fn leg_fee_total(&self, price_cents: Cents, contracts: i64) -> Cents {
        match self {
            FeeModel::Taker => taker_fee_total_cents(price_cents, contracts),
            FeeModel::Maker => maker_fee_total_cents(price_cents, contracts),
            FeeModel::Flat { cents_per_contract } => {
                if contracts <= 0 {
                    0
                } else {
                    cents_per_contract * contracts
                }
            }
        }
    }

    /// Total fee in cents across all legs at their limit prices.
    pub fn estimate_total(&self, legs: &[Leg], contracts: i64) -> Cents {
        legs.iter()
            .map(|l| self.leg_fee_total(l.limit_price, contracts))
            .sum()
    }

    /// Per-contract fee estimate across all legs, rounded up.
    pub fn estimate_per_contract(&self, legs: &[Leg], contracts: i64) -> Cents {
        if contracts <= 0 {
            return 0;
        }
        let total = self.estimate_total(legs, contracts);
        (total + contracts - 1) / contracts
    }
}

/// Emission gate: gross edge net of fees must clear the configured safety
/// multiple of fees.
///
/// `edge_cents * contracts - fee_total >= multiplier * fee_total`
pub fn passes_fee_gate(
    edge_cents: Cents,
    contracts: i64,
    fee_total_cents: Cents,
    safety_multiplier: f64,
) -> bool {
    if contracts <= 0 {
        return false;
    }
    let net = (edge_cents * contracts - fee_total_cents) as f64;
    net >= safety_multiplier * fee_total_cents as f64
}
