// Data Synchronizer
// Buffer-then-reconcile: diffs are held until a snapshot arrives, then
// replayed in sequence order with continuity checks. A gap forces a re-snapshot.

use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

use crate::layer2::parser::ParsedDepthUpdate;

/// Stream synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    /// Collecting diffs while the first snapshot is fetched
    Buffering,
    /// Collecting diffs while a gap-triggered snapshot is fetched
    Resyncing,
    Synchronized,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What the caller should do with a live diff
#[derive(Debug, Clone, PartialEq)]
pub enum DiffDecision {
    /// Contiguous with the book: apply it
    Apply(ParsedDepthUpdate),
    /// Held until the next snapshot
    Buffered,
    /// Already covered by the book
    Stale,
    /// Sequence broke; the diff was kept in the buffer and a new snapshot is needed
    Gap { expected_after: u64, first_update_id: Option<u64> },
    /// No depth stream is active
    Ignored,
}

/// Outcome of replaying the buffer on top of a snapshot
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Diffs to apply to the book, in order
    pub updates: Vec<ParsedDepthUpdate>,
    /// Buffered diffs already covered by the snapshot
    pub discarded: u64,
    /// The buffer did not connect to the snapshot; another fetch is needed
    pub gap: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SynchronizerStats {
    pub total_messages: u64,
    pub messages_applied: u64,
    pub messages_buffered: u64,
    pub stale_dropped: u64,
    pub overflow_dropped: u64,
    pub gap_count: u64,
    pub snapshots_reconciled: u64,
}

impl fmt::Display for SynchronizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SynchronizerStats(total={}, applied={}, buffered={}, stale={}, overflow={}, gaps={})",
            self.total_messages,
            self.messages_applied,
            self.messages_buffered,
            self.stale_dropped,
            self.overflow_dropped,
            self.gap_count
        )
    }
}

/// Orders depth diffs against the snapshot version
pub struct DataSynchronizer {
    pub symbol: String,
    state: SyncState,
    buffer: VecDeque<ParsedDepthUpdate>,
    buffer_capacity: usize,
    /// Version of the last snapshot or diff applied to the book
    last_update_id: Option<u64>,
    /// No diff has been applied since the last snapshot
    awaiting_bridge: bool,
    stats: SynchronizerStats,
}

impl DataSynchronizer {
    pub fn new(symbol: &str, buffer_capacity: usize) -> Self {
        debug!(symbol = symbol, buffer_capacity = buffer_capacity, "DataSynchronizer created");
        Self {
            symbol: symbol.to_uppercase(),
            state: SyncState::NotStarted,
            buffer: VecDeque::new(),
            buffer_capacity: buffer_capacity.max(1),
            last_update_id: None,
            awaiting_bridge: true,
            stats: SynchronizerStats::default(),
        }
    }

    /// Depth stream opened: start collecting diffs for the coming snapshot
    pub fn begin_buffering(&mut self) {
        self.buffer.clear();
        self.last_update_id = None;
        self.state = SyncState::Buffering;
        info!(symbol = %self.symbol, "Buffering depth diffs until snapshot arrives");
    }

    /// Depth stream closed: whatever is buffered can no longer be reconciled
    pub fn stop(&mut self) {
        if !self.buffer.is_empty() {
            debug!(discarded = self.buffer.len(), "Discarding buffered diffs");
        }
        self.buffer.clear();
        self.state = SyncState::NotStarted;
    }

    /// Route one live diff
    pub fn on_diff(&mut self, update: ParsedDepthUpdate) -> DiffDecision {
        self.stats.total_messages += 1;

        match self.state {
            SyncState::NotStarted => DiffDecision::Ignored,
            SyncState::Buffering | SyncState::Resyncing => {
                self.push_buffered(update);
                DiffDecision::Buffered
            }
            SyncState::Synchronized => {
                let last = self.last_update_id.unwrap_or(0);

                if update.final_update_id <= last {
                    self.stats.stale_dropped += 1;
                    debug!(final_update_id = update.final_update_id, last = last, "Stale diff dropped");
                    return DiffDecision::Stale;
                }

                let connects = if self.awaiting_bridge {
                    bridges(&update, last)
                } else {
                    is_contiguous(&update, last)
                };

                if connects {
                    self.awaiting_bridge = false;
                    self.last_update_id = Some(update.final_update_id);
                    self.stats.messages_applied += 1;
                    return DiffDecision::Apply(update);
                }

                self.stats.gap_count += 1;
                warn!(
                    symbol = %self.symbol,
                    expected_after = last,
                    first_update_id = ?update.first_update_id,
                    prev_final_update_id = ?update.prev_final_update_id,
                    final_update_id = update.final_update_id,
                    "Depth sequence gap, re-synchronizing"
                );
                let first_update_id = update.first_update_id;
                self.state = SyncState::Resyncing;
                self.buffer.clear();
                self.push_buffered(update);

                DiffDecision::Gap {
                    expected_after: last,
                    first_update_id,
                }
            }
        }
    }

    /// Snapshot arrived: replay the buffer on top of `snapshot_last_id`
    pub fn on_snapshot(&mut self, snapshot_last_id: u64) -> Reconciliation {
        let mut result = Reconciliation::default();
        let mut pending: Vec<ParsedDepthUpdate> = self.buffer.drain(..).collect();
        pending.sort_by_key(|u| u.sequence_key());

        let mut last = snapshot_last_id;
        let mut remaining = pending.into_iter();

        for update in remaining.by_ref() {
            if update.final_update_id <= last {
                result.discarded += 1;
                continue;
            }

            // The first survivor must bridge the snapshot; pu never matches a REST version
            let connects = if result.updates.is_empty() {
                bridges(&update, last)
            } else {
                is_contiguous(&update, last)
            };

            if !connects {
                warn!(
                    snapshot_last_id = snapshot_last_id,
                    expected_after = last,
                    first_update_id = ?update.first_update_id,
                    "Buffered diffs do not connect to snapshot"
                );
                self.buffer.push_back(update);
                result.gap = true;
                break;
            }

            last = update.final_update_id;
            result.updates.push(update);
        }

        self.buffer.extend(remaining);
        self.last_update_id = Some(last);
        self.awaiting_bridge = result.updates.is_empty();
        self.stats.stale_dropped += result.discarded;
        self.stats.messages_applied += result.updates.len() as u64;
        self.stats.snapshots_reconciled += 1;

        if result.gap {
            self.stats.gap_count += 1;
            self.state = SyncState::Resyncing;
        } else {
            self.state = SyncState::Synchronized;
            info!(
                symbol = %self.symbol,
                snapshot_last_id = snapshot_last_id,
                replayed = result.updates.len(),
                discarded = result.discarded,
                last_update_id = last,
                "Depth stream synchronized"
            );
        }

        result
    }

    fn push_buffered(&mut self, update: ParsedDepthUpdate) {
        if self.buffer.len() >= self.buffer_capacity {
            self.buffer.pop_front();
            self.stats.overflow_dropped += 1;
            warn!(capacity = self.buffer_capacity, "Diff buffer full, dropped oldest");
        }
        self.buffer.push_back(update);
        self.stats.messages_buffered += 1;
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == SyncState::Synchronized
    }

    pub fn is_buffering(&self) -> bool {
        matches!(self.state, SyncState::Buffering | SyncState::Resyncing)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.last_update_id
    }

    pub fn stats(&self) -> &SynchronizerStats {
        &self.stats
    }
}

/// Can `update` be the first diff applied on top of snapshot version `last`?
fn bridges(update: &ParsedDepthUpdate, last: u64) -> bool {
    update.first_update_id.map_or(true, |first| first <= last + 1)
}

/// Does `update` continue directly from version `last`?
fn is_contiguous(update: &ParsedDepthUpdate, last: u64) -> bool {
    if let Some(prev) = update.prev_final_update_id {
        return prev == last;
    }
    match update.first_update_id {
        Some(first) => first <= last + 1,
        None => update.final_update_id > last,
    }
}
