// Depth Aggregator - Ranked, depth-limited view of the order book
// Pure function of book state: top-N per side, window cumulative totals, spread

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;

use crate::layer2::orderbook::OrderBookState;

/// Displayed levels per side when nothing else is configured
pub const DEFAULT_DISPLAY_DEPTH: usize = 15;

/// One ranked price level
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthRow {
    pub price: Decimal,
    pub quantity: Decimal,
    /// Sum of quantities from the best price down to this row, within the window
    pub total: Decimal,
}

impl DepthRow {
    /// Fraction of the side's window total reached at this row, for bar widths
    pub fn depth_ratio(&self, max_total: Decimal) -> Decimal {
        if max_total.is_zero() {
            Decimal::ZERO
        } else {
            self.total / max_total
        }
    }
}

impl fmt::Display for DepthRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {} (total {})", self.price, self.quantity, self.total)
    }
}

/// Presentation-ready view of the book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthView {
    /// Descending by price
    pub bids: Vec<DepthRow>,
    /// Ascending by price
    pub asks: Vec<DepthRow>,
    /// Best ask minus best bid to 2dp, "0.00" when a side is empty
    pub spread: String,
    /// Largest window total per side; 1 when the side is empty
    pub max_bid_total: Decimal,
    pub max_ask_total: Decimal,
    pub last_update_id: u64,
}

impl Default for DepthView {
    fn default() -> Self {
        aggregate(&OrderBookState::default(), DEFAULT_DISPLAY_DEPTH)
    }
}

impl DepthView {
    pub fn best_bid(&self) -> Option<&DepthRow> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthRow> {
        self.asks.first()
    }

    pub fn bid_ratios(&self) -> Vec<Decimal> {
        self.bids.iter().map(|r| r.depth_ratio(self.max_bid_total)).collect()
    }

    pub fn ask_ratios(&self) -> Vec<Decimal> {
        self.asks.iter().map(|r| r.depth_ratio(self.max_ask_total)).collect()
    }
}

impl fmt::Display for DepthView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let price = |row: Option<&DepthRow>| row.map_or_else(|| "-".to_string(), |r| r.price.to_string());
        write!(
            f,
            "DepthView(bid={}, ask={}, spread={}, rows={}/{})",
            price(self.best_bid()),
            price(self.best_ask()),
            self.spread,
            self.bids.len(),
            self.asks.len()
        )
    }
}

/// Build the ranked view from raw book state
pub fn aggregate(state: &OrderBookState, depth: usize) -> DepthView {
    let bids = cumulative(state.bids.iter().rev().take(depth));
    let asks = cumulative(state.asks.iter().take(depth));

    let spread = match (bids.first(), asks.first()) {
        (Some(bid), Some(ask)) => format_spread(ask.price - bid.price),
        _ => format_spread(Decimal::ZERO),
    };

    let max_bid_total = bids.last().map_or(Decimal::ONE, |r| r.total);
    let max_ask_total = asks.last().map_or(Decimal::ONE, |r| r.total);

    DepthView {
        bids,
        asks,
        spread,
        max_bid_total,
        max_ask_total,
        last_update_id: state.last_update_id,
    }
}

// Totals saturate at Decimal::MAX
fn cumulative<'a>(levels: impl Iterator<Item = (&'a Decimal, &'a Decimal)>) -> Vec<DepthRow> {
    let mut running = Decimal::ZERO;
    levels
        .map(|(price, quantity)| {
            running = running.saturating_add(*quantity);
            DepthRow {
                price: *price,
                quantity: *quantity,
                total: running,
            }
        })
        .collect()
}

fn format_spread(spread: Decimal) -> String {
    let rounded = spread.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.2}", rounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> OrderBookState {
        OrderBookState {
            bids: bids.iter().copied().collect(),
            asks: asks.iter().copied().collect(),
            last_update_id: 7,
        }
    }

    #[test]
    fn test_ranking_and_truncation() {
        let bids: Vec<_> = (1..=20).map(|p| (Decimal::from(p), Decimal::ONE)).collect();
        let asks: Vec<_> = (21..=40).map(|p| (Decimal::from(p), Decimal::ONE)).collect();
        let view = aggregate(&book(&bids, &asks), 15);

        assert_eq!(view.bids.len(), 15);
        assert_eq!(view.asks.len(), 15);
        assert!(view.bids.windows(2).all(|w| w[0].price > w[1].price));
        assert!(view.asks.windows(2).all(|w| w[0].price < w[1].price));
        assert_eq!(view.bids[0].price, dec!(20));
        assert_eq!(view.asks[0].price, dec!(21));
        assert_eq!(view.last_update_id, 7);
    }

    #[test]
    fn test_cumulative_totals_within_window() {
        let bids: Vec<_> = (1..=20).map(|p| (Decimal::from(p), Decimal::from(p))).collect();
        let view = aggregate(&book(&bids, &[]), 3);

        let totals: Vec<_> = view.bids.iter().map(|r| r.total).collect();
        assert_eq!(totals, vec![dec!(20), dec!(39), dec!(57)]);
        assert_eq!(view.max_bid_total, dec!(57));
        assert_eq!(view.max_ask_total, Decimal::ONE);
    }

    #[test]
    fn test_spread() {
        let view = aggregate(&book(&[(dec!(100.004), dec!(1))], &[(dec!(101.5), dec!(1))]), 15);
        assert_eq!(view.spread, "1.50");

        let view = aggregate(&book(&[(dec!(100), dec!(1))], &[(dec!(100.005), dec!(1))]), 15);
        assert_eq!(view.spread, "0.01");

        assert_eq!(aggregate(&book(&[(dec!(100), dec!(1))], &[]), 15).spread, "0.00");
        assert_eq!(aggregate(&book(&[], &[(dec!(1), dec!(1))]), 15).spread, "0.00");
        assert_eq!(DepthView::default().spread, "0.00");
    }

    #[test]
    fn test_depth_ratio() {
        let view = aggregate(&book(&[(dec!(10), dec!(1)), (dec!(9), dec!(3))], &[]), 15);
        assert_eq!(view.bid_ratios(), vec![dec!(0.25), dec!(1)]);
        assert!(view.ask_ratios().is_empty());
    }

    #[test]
    fn test_totals_saturate_on_extreme_quantities() {
        let view = aggregate(
            &book(&[(dec!(100), Decimal::MAX), (dec!(99), Decimal::MAX)], &[(dec!(101), Decimal::MAX)]),
            15,
        );

        assert_eq!(view.bids.len(), 2);
        assert_eq!(view.bids[0].total, Decimal::MAX);
        assert_eq!(view.bids[1].total, Decimal::MAX);
        assert_eq!(view.max_bid_total, Decimal::MAX);
        assert_eq!(view.bid_ratios(), vec![Decimal::ONE, Decimal::ONE]);
        assert_eq!(view.spread, "1.00");
    }
}
