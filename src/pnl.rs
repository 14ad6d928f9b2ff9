//! Position and P&L ledger in integer cents.
//!
//! Positions are tracked per ticker on a YES-equivalent axis: buying YES or
//! selling NO is +1 contract, selling YES or buying NO is -1. A NO fill at
//! price p is booked at the equivalent YES price 100 - p. Weighted-average
//! cost basis; realized P&L recognised when a fill reduces or crosses the
//! position.
//!
//! The ledger is updated only from confirmed fill events, never from intent.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Cents, FillEvent, Side, SETTLEMENT_CENTS};

/// One ticker's position state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    /// Signed YES-equivalent contracts. Positive = long YES.
    pub net_contracts: i64,
    /// Weighted-average entry price per contract, in cents.
    pub avg_entry_cents: Cents,
    /// Cumulative realized P&L in cents (fees excluded).
    pub realized_cents: Cents,
    /// Cumulative fees paid in cents.
    pub fees_cents: Cents,
    /// Last YES mid used for unrealized P&L.
    pub last_mark_cents: Option<Cents>,
}

impl Position {
    /// Apply a signed fill. Returns the realized P&L delta in cents.
    fn apply(&mut self, delta: i64, price: Cents, fee: Cents) -> Cents {
        self.fees_cents += fee;
        if delta == 0 {
            return 0;
        }

        let same_direction = self.net_contracts == 0 || self.net_contracts.signum() == delta.signum();
        if same_direction {
            // Extending: re-weight the average entry.
            let old_abs = self.net_contracts.abs();
            let add_abs = delta.abs();
            let total = old_abs + add_abs;
            self.avg_entry_cents =
                (old_abs * self.avg_entry_cents + add_abs * price) / total;
            self.net_contracts += delta;
            return 0;
        }

        // Reducing, possibly crossing through zero.
        let close_abs = self.net_contracts.abs().min(delta.abs());
        let realized = if self.net_contracts > 0 {
            (price - self.avg_entry_cents) * close_abs
        } else {
            (self.avg_entry_cents - price) * close_abs
        };
        self.realized_cents += realized;
        self.net_contracts += delta;

        if self.net_contracts == 0 {
            self.avg_entry_cents = 0;
        } else if self.net_contracts.signum() == delta.signum() {
            // Crossed zero: the remainder opened at the fill price.
            self.avg_entry_cents = price;
        }
        realized
    }

    /// Unrealized P&L at the last mark, zero when unmarked or flat.
    pub fn unrealized_cents(&self) -> Cents {
        match self.last_mark_cents {
            Some(mark) if self.net_contracts > 0 => {
                (mark - self.avg_entry_cents) * self.net_contracts
            }
            Some(mark) if self.net_contracts < 0 => {
                (self.avg_entry_cents - mark) * self.net_contracts.abs()
            }
            _ => 0,
        }
    }
}

/// Aggregate ledger snapshot for logging and the daily-loss circuit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerSummary {
    pub open_positions: usize,
    pub realized_cents: Cents,
    pub unrealized_cents: Cents,
    pub fees_cents: Cents,
}

impl LedgerSummary {
    /// Realized plus unrealized, net of fees.
    pub fn total_pnl_cents(&self) -> Cents {
        self.realized_cents + self.unrealized_cents - self.fees_cents
    }
}

/// Per-ticker position book.
#[derive(Debug, Default)]
pub struct PositionLedger {
    positions: FxHashMap<String, Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book a confirmed fill. Returns the realized P&L delta in cents.
    pub fn apply_fill(&mut self, fill: &FillEvent) -> Cents {
        let sign = match (fill.side, fill.action) {
            (Side::Yes, crate::types::Action::Buy) | (Side::No, crate::types::Action::Sell) => 1,
            (Side::Yes, crate::types::Action::Sell) | (Side::No, crate::types::Action::Buy) => -1,
        };
        let yes_price = match fill.side {
            Side::Yes => fill.price,
            Side::No => SETTLEMENT_CENTS - fill.price,
        };
        let position = self.positions.entry(fill.ticker.clone()).or_default();
        position.apply(sign * fill.count, yes_price, fill.fee)
    }

    /// Update the mark for unrealized P&L on one ticker.
    pub fn mark(&mut self, ticker: &str, yes_mid_cents: Cents) {
        if let Some(position) = self.positions.get_mut(ticker) {
            position.last_mark_cents = Some(yes_mid_cents);
        }
    }

    pub fn net_contracts(&self, ticker: &str) -> i64 {
        self.positions.get(ticker).map_or(0, |p| p.net_contracts)
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(ticker)
    }

    /// Non-flat positions, sorted by ticker.
    pub fn open_positions(&self) -> Vec<(String, Position)> {
        let mut out: Vec<(String, Position)> = self
            .positions
            .iter()
            .filter(|(_, p)| p.net_contracts != 0)
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for position in self.positions.values() {
            if position.net_contracts != 0 {
                summary.open_positions += 1;
            }
            summary.realized_cents += position.realized_cents;
            summary.unrealized_cents += position.unrealized_cents();
            summary.fees_cents += position.fees_cents;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;
    use chrono::Utc;
    use uuid::Uuid;

    fn fill(ticker: &str, side: Side, action: Action, count: i64, price: Cents, fee: Cents) -> FillEvent {
        FillEvent {
            opportunity_id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            order_id: "ord".to_string(),
            side,
            action,
            count,
            price,
            fee,
            synthetic: false,
            ts: Utc::now(),
        }
    }

    #[test]
    fn net_position_equals_signed_sum_of_fills() {
        let mut ledger = PositionLedger::new();
        ledger.apply_fill(&fill("A", Side::Yes, Action::Buy, 10, 50, 2));
        ledger.apply_fill(&fill("A", Side::Yes, Action::Sell, 4, 55, 1));
        ledger.apply_fill(&fill("A", Side::No, Action::Buy, 3, 45, 1));
        assert_eq!(ledger.net_contracts("A"), 10 - 4 - 3);
    }

    #[test]
    fn round_trip_realizes_spread() {
        let mut ledger = PositionLedger::new();
        ledger.apply_fill(&fill("A", Side::Yes, Action::Buy, 10, 40, 3));
        let realized = ledger.apply_fill(&fill("A", Side::Yes, Action::Sell, 10, 60, 3));
        assert_eq!(realized, (60 - 40) * 10);

        let summary = ledger.summary();
        assert_eq!(summary.realized_cents, 200);
        assert_eq!(summary.fees_cents, 6);
        assert_eq!(summary.open_positions, 0);
        assert_eq!(summary.total_pnl_cents(), 194);
    }

    #[test]
    fn no_fill_books_as_short_yes_at_complement_price() {
        let mut ledger = PositionLedger::new();
        // Buying NO at 45c is short YES at 55c.
        ledger.apply_fill(&fill("A", Side::No, Action::Buy, 10, 45, 0));
        assert_eq!(ledger.net_contracts("A"), -10);
        assert_eq!(ledger.position("A").unwrap().avg_entry_cents, 55);

        // YES falls to 30: short from 55 is up 25/contract.
        ledger.mark("A", 30);
        assert_eq!(ledger.position("A").unwrap().unrealized_cents(), 250);
    }

    #[test]
    fn extending_reweights_average_entry() {
        let mut ledger = PositionLedger::new();
        ledger.apply_fill(&fill("A", Side::Yes, Action::Buy, 10, 40, 0));
        ledger.apply_fill(&fill("A", Side::Yes, Action::Buy, 10, 60, 0));
        assert_eq!(ledger.position("A").unwrap().avg_entry_cents, 50);
        assert_eq!(ledger.net_contracts("A"), 20);
    }

    #[test]
    fn crossing_zero_reopens_at_fill_price() {
        let mut ledger = PositionLedger::new();
        ledger.apply_fill(&fill("A", Side::Yes, Action::Buy, 5, 40, 0));
        let realized = ledger.apply_fill(&fill("A", Side::Yes, Action::Sell, 8, 50, 0));
        // 5 closed at +10 each; 3 remain short from 50.
        assert_eq!(realized, 50);
        assert_eq!(ledger.net_contracts("A"), -3);
        assert_eq!(ledger.position("A").unwrap().avg_entry_cents, 50);
    }

    #[test]
    fn unrealized_tracks_last_mark() {
        let mut ledger = PositionLedger::new();
        ledger.apply_fill(&fill("A", Side::Yes, Action::Buy, 10, 50, 0));
        assert_eq!(ledger.summary().unrealized_cents, 0);
        ledger.mark("A", 56);
        assert_eq!(ledger.summary().unrealized_cents, 60);
        ledger.mark("A", 44);
        assert_eq!(ledger.summary().unrealized_cents, -60);
    }
}
