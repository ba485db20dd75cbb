// Trade Log
// Bounded newest-first trade history

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use crate::core::types::Trade;

/// A trade plus its arrival sequence. `(trade.id, seq)` is unique even when
/// the feed redelivers an id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedTrade {
    pub seq: u64,
    pub trade: Trade,
}

impl LoggedTrade {
    pub fn key(&self) -> (&str, u64) {
        (self.trade.id.as_str(), self.seq)
    }
}

impl fmt::Display for LoggedTrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.seq, self.trade)
    }
}

pub struct TradeLog {
    entries: VecDeque<LoggedTrade>,
    capacity: usize,
    next_seq: u64,
}

impl TradeLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    /// Prepend a trade, evicting the oldest once full. Returns the assigned sequence.
    pub fn append(&mut self, trade: Trade) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(LoggedTrade { seq, trade });
        seq
    }

    /// Newest first
    pub fn iter(&self) -> impl Iterator<Item = &LoggedTrade> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&LoggedTrade> {
        self.entries.front()
    }

    pub fn to_vec(&self) -> Vec<LoggedTrade> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Trades ever appended, including evicted ones
    pub fn total_appended(&self) -> u64 {
        self.next_seq
    }
}
