// Order Book Store
// Snapshot replace + incremental diff merge over exact decimal price levels

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::core::types::{DepthSnapshot, PriceLevel};

/// One side of the book: price -> resting quantity. Zero is never stored.
pub type BookSide = BTreeMap<Decimal, Decimal>;

/// Plain book data handed to the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookState {
    pub bids: BookSide,
    pub asks: BookSide,
    pub last_update_id: u64,
}

impl OrderBookState {
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl fmt::Display for OrderBookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_best = |best: Option<(Decimal, Decimal)>| match best {
            Some((p, q)) => format!("{}@{}", q, p),
            None => "-".to_string(),
        };
        write!(
            f,
            "OrderBookState(update_id={}, bid={}, ask={}, levels={}/{})",
            self.last_update_id,
            fmt_best(self.best_bid()),
            fmt_best(self.best_ask()),
            self.bids.len(),
            self.asks.len()
        )
    }
}

/// Result of merging one diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOutcome {
    /// Levels inserted or overwritten
    pub upserted: usize,
    /// Levels removed by a zero quantity
    pub removed: usize,
    /// Zero-quantity updates for prices that were not present
    pub absent_removals: usize,
    /// Pairs rejected as malformed
    pub rejected: usize,
}

impl DiffOutcome {
    pub fn changed(&self) -> bool {
        self.upserted + self.removed > 0
    }
}

/// Order book summary
#[derive(Debug, Clone)]
pub struct OrderBookSummary {
    pub symbol: String,
    pub is_initialized: bool,
    pub snapshot_count: u64,
    pub diff_count: u64,
    pub last_update_id: u64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
}

impl fmt::Display for OrderBookSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBook({} update_id={} bids={} asks={} snapshots={} diffs={})",
            self.symbol, self.last_update_id, self.bid_levels, self.ask_levels, self.snapshot_count, self.diff_count
        )
    }
}

/// Local order book for a single symbol
pub struct OrderBook {
    pub symbol: String,
    state: OrderBookState,
    is_initialized: bool,
    snapshot_count: u64,
    diff_count: u64,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        debug!(symbol = symbol, "OrderBook created");
        Self {
            symbol: symbol.to_uppercase(),
            state: OrderBookState::default(),
            is_initialized: false,
            snapshot_count: 0,
            diff_count: 0,
        }
    }

    /// Replace the whole book with a snapshot. Malformed snapshot levels are skipped.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) {
        let mut rejected = 0;
        let mut bids = BookSide::new();
        let mut asks = BookSide::new();

        for (levels, side) in [(&snapshot.bids, &mut bids), (&snapshot.asks, &mut asks)] {
            for level in levels {
                if level.validate().is_err() {
                    rejected += 1;
                    continue;
                }
                if !level.is_removal() {
                    side.insert(level.price, level.quantity);
                }
            }
        }

        self.state = OrderBookState {
            bids,
            asks,
            last_update_id: snapshot.last_update_id,
        };
        self.is_initialized = true;
        self.snapshot_count += 1;

        if rejected > 0 {
            warn!(rejected = rejected, "Snapshot levels rejected");
        }
        info!(
            symbol = %self.symbol,
            last_update_id = snapshot.last_update_id,
            bid_levels = self.state.bids.len(),
            ask_levels = self.state.asks.len(),
            "Order book replaced from snapshot"
        );
    }

    /// Merge one diff. Each pair is handled on its own: a zero quantity removes
    /// the level, anything else inserts or overwrites, malformed pairs are skipped.
    pub fn apply_diff(&mut self, bids: &[PriceLevel], asks: &[PriceLevel], final_update_id: u64) -> DiffOutcome {
        let mut outcome = DiffOutcome::default();

        merge_side(&mut self.state.bids, bids, "bid", &mut outcome);
        merge_side(&mut self.state.asks, asks, "ask", &mut outcome);

        self.state.last_update_id = final_update_id;
        self.diff_count += 1;

        debug!(
            final_update_id = final_update_id,
            upserted = outcome.upserted,
            removed = outcome.removed,
            rejected = outcome.rejected,
            "Diff applied"
        );

        outcome
    }

    pub fn state(&self) -> &OrderBookState {
        &self.state
    }

    pub fn last_update_id(&self) -> u64 {
        self.state.last_update_id
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn summary(&self) -> OrderBookSummary {
        OrderBookSummary {
            symbol: self.symbol.clone(),
            is_initialized: self.is_initialized,
            snapshot_count: self.snapshot_count,
            diff_count: self.diff_count,
            last_update_id: self.state.last_update_id,
            bid_levels: self.state.bids.len(),
            ask_levels: self.state.asks.len(),
            best_bid: self.state.best_bid().map(|(p, _)| p),
            best_ask: self.state.best_ask().map(|(p, _)| p),
        }
    }
}

fn merge_side(side: &mut BookSide, updates: &[PriceLevel], label: &'static str, outcome: &mut DiffOutcome) {
    for level in updates {
        if let Err(e) = level.validate() {
            warn!(side = label, error = %e, "Rejected diff level");
            outcome.rejected += 1;
            continue;
        }

        if level.is_removal() {
            if side.remove(&level.price).is_some() {
                outcome.removed += 1;
            } else {
                outcome.absent_removals += 1;
            }
        } else {
            side.insert(level.price, level.quantity);
            outcome.upserted += 1;
        }
    }
}
