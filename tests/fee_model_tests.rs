//! Fee schedule validation across the full price band.
//!
//! The integer ceil formula must match a straightforward floating-point
//! rendering of the published schedule at every price point, and the fee
//! gate must behave consistently with it.

use cross_market_arbitrage::fees::{
    maker_fee_total_cents, passes_fee_gate, taker_fee_total_cents, FeeModel,
};
use cross_market_arbitrage::types::{Action, Cents, Leg, Side};

fn reference_taker_fee(price_cents: Cents, contracts: i64) -> Cents {
    // ceil(7 * C * P * (1 - P)) cents, with binary-float noise rounded off
    // before the ceil so exact multiples stay exact.
    let p = price_cents as f64 / 100.0;
    let raw = 7.0 * contracts as f64 * p * (1.0 - p);
    ((raw * 1e8).round() / 1e8).ceil() as Cents
}

#[test]
fn taker_formula_matches_reference_for_every_price() {
    let mut mismatches = Vec::new();
    for price in 1..=99i64 {
        for contracts in [1i64, 5, 10, 100] {
            let integer = taker_fee_total_cents(price, contracts);
            let reference = reference_taker_fee(price, contracts);
            if integer != reference {
                mismatches.push((price, contracts, integer, reference));
            }
        }
    }
    assert!(
        mismatches.is_empty(),
        "fee formula mismatches: {:?}",
        &mismatches[..mismatches.len().min(5)]
    );
}

#[test]
fn fees_peak_at_even_odds() {
    let at_50 = taker_fee_total_cents(50, 100);
    for price in 1..=99 {
        assert!(taker_fee_total_cents(price, 100) <= at_50);
    }
    // Symmetric around 50.
    for price in 1..=49 {
        assert_eq!(
            taker_fee_total_cents(price, 100),
            taker_fee_total_cents(100 - price, 100)
        );
    }
}

#[test]
fn maker_is_a_quarter_of_taker_modulo_rounding() {
    for price in 1..=99 {
        let taker = taker_fee_total_cents(price, 1000);
        let maker = maker_fee_total_cents(price, 1000);
        // ceil(x/4) is within one cent of taker/4.
        assert!(maker * 4 >= taker);
        assert!(maker * 4 - taker < 4);
    }
}

#[test]
fn gate_and_model_agree_on_a_marginal_trade() {
    let legs = vec![
        Leg {
            ticker: "A".into(),
            side: Side::Yes,
            action: Action::Buy,
            limit_price: 50,
            desired_count: 10,
            observed_depth: 50,
        },
        Leg {
            ticker: "B".into(),
            side: Side::Yes,
            action: Action::Sell,
            limit_price: 50,
            desired_count: 10,
            observed_depth: 50,
        },
    ];
    let model = FeeModel::Taker;
    let total = model.estimate_total(&legs, 10);
    assert_eq!(total, 36); // 18 per leg at 50c x 10

    // Edge of 11c/contract: 110 - 36 = 74 >= 2 * 36.
    assert!(passes_fee_gate(11, 10, total, 2.0));
    // Edge of 10c/contract: 100 - 36 = 64 < 72.
    assert!(!passes_fee_gate(10, 10, total, 2.0));
}
