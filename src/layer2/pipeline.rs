// Market Engine Pipeline
// Stream -> Parser -> Synchronizer -> OrderBook / TradeLog -> DepthView
//
// MarketEngine is a synchronous reducer: every input is an EngineEvent and
// every side effect comes back as an EngineCommand. FeedRuntime owns the
// tokio side (stream tasks, snapshot fetches, the reconnect timer) and
// publishes an EngineView through a watch channel.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::{ConfigError, FeedConfig};
use crate::core::types::{ConnectionStatus, DepthSnapshot, StreamKind};
use crate::layer1::rest_client::{BinanceRestClient, RestClientError, RestClientStats};
use crate::layer1::websocket::{FeedConnector, FeedEvent, FeedMessage, StreamHandle, StreamStats};
use crate::layer2::orderbook::{OrderBook, OrderBookState};
use crate::layer2::parser::ParsedDepthUpdate;
use crate::layer2::supervisor::{ReconnectSupervisor, SupervisorAction};
use crate::layer2::synchronizer::{DataSynchronizer, DiffDecision};
use crate::layer2::trade_log::{LoggedTrade, TradeLog};
use crate::layer3::depth_aggregator::{aggregate, DepthView};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("REST client error: {0}")]
    Rest(#[from] RestClientError),
}

// ============================================================================
// Events and Commands
// ============================================================================

/// Everything the engine reacts to
#[derive(Debug)]
pub enum EngineEvent {
    Feed(FeedMessage),
    SnapshotFetched {
        generation: u64,
        result: Result<DepthSnapshot, RestClientError>,
    },
    ReconnectDue,
    Shutdown,
}

/// Side effects requested by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    OpenStream { kind: StreamKind, generation: u64 },
    CloseStream { kind: StreamKind },
    /// Fetch a snapshot on behalf of depth connection `generation`
    FetchSnapshot { generation: u64 },
    /// Same as FetchSnapshot, after `delay`
    RetrySnapshot { generation: u64, delay: Duration },
    ScheduleReconnect { delay: Duration },
    CancelReconnect,
}

impl From<SupervisorAction> for EngineCommand {
    fn from(action: SupervisorAction) -> Self {
        match action {
            SupervisorAction::OpenStream { kind, generation } => EngineCommand::OpenStream { kind, generation },
            SupervisorAction::CloseStream { kind } => EngineCommand::CloseStream { kind },
            SupervisorAction::ScheduleReconnect { delay } => EngineCommand::ScheduleReconnect { delay },
            SupervisorAction::CancelReconnect => EngineCommand::CancelReconnect,
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// State exposed to the presentation layer
#[derive(Debug, Clone, Serialize)]
pub struct EngineView {
    pub symbol: String,
    /// Newest first
    pub trades: Vec<LoggedTrade>,
    pub order_book: OrderBookState,
    pub depth: DepthView,
    pub connected: bool,
    pub status: ConnectionStatus,
    pub synchronized: bool,
    pub updated_at_ms: i64,
}

impl EngineView {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            trades: Vec::new(),
            order_book: OrderBookState::default(),
            depth: DepthView::default(),
            connected: false,
            status: ConnectionStatus::Disconnected,
            synchronized: false,
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl fmt::Display for EngineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineView({} status={} synced={} update_id={} trades={} {})",
            self.symbol,
            self.status,
            self.synchronized,
            self.order_book.last_update_id,
            self.trades.len(),
            self.depth
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub trades_received: u64,
    pub diffs_applied: u64,
    pub diffs_stale: u64,
    pub diffs_ignored: u64,
    pub gaps_detected: u64,
    pub snapshots_requested: u64,
    pub snapshot_retries: u64,
    pub snapshots_applied: u64,
    pub snapshot_failures: u64,
    pub snapshots_discarded: u64,
    pub rejected_levels: u64,
    pub reconnect_attempts: u32,
    pub stream_errors: u64,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineStats(trades={}, diffs={}, stale={}, gaps={}, snapshots={}/{}, retries={}, failures={}, rejected={}, reconnects={})",
            self.trades_received,
            self.diffs_applied,
            self.diffs_stale,
            self.gaps_detected,
            self.snapshots_applied,
            self.snapshots_requested,
            self.snapshot_retries,
            self.snapshot_failures,
            self.rejected_levels,
            self.reconnect_attempts
        )
    }
}

// ============================================================================
// Market Engine
// ============================================================================

pub struct MarketEngine {
    pub symbol: String,
    display_depth: usize,
    snapshot_retry_delay: Duration,
    book: OrderBook,
    sync: DataSynchronizer,
    trades: TradeLog,
    supervisor: ReconnectSupervisor,
    /// Depth generation of the snapshot fetch in flight, if any
    pending_snapshot: Option<u64>,
    dirty: bool,
    stats: EngineStats,
}

impl MarketEngine {
    pub fn new(config: &FeedConfig) -> Self {
        let symbol = config.rest_symbol();
        info!(symbol = %symbol, "Creating market engine");

        Self {
            book: OrderBook::new(&symbol),
            sync: DataSynchronizer::new(&symbol, config.sync_buffer_capacity),
            trades: TradeLog::new(config.trade_log_capacity),
            supervisor: ReconnectSupervisor::new(config.reconnect_delay(), config.max_reconnect_attempts),
            display_depth: config.display_depth,
            snapshot_retry_delay: config.snapshot_retry_delay(),
            pending_snapshot: None,
            dirty: true,
            stats: EngineStats::default(),
            symbol,
        }
    }

    /// Open both streams
    pub fn start(&mut self) -> Vec<EngineCommand> {
        self.dirty = true;
        self.supervisor.start().into_iter().map(EngineCommand::from).collect()
    }

    pub fn handle(&mut self, event: EngineEvent) -> Vec<EngineCommand> {
        match event {
            EngineEvent::Feed(message) => self.on_feed(message),
            EngineEvent::SnapshotFetched { generation, result } => self.on_snapshot(generation, result),
            EngineEvent::ReconnectDue => self.on_reconnect_due(),
            EngineEvent::Shutdown => self.on_shutdown(),
        }
    }

    fn on_feed(&mut self, message: FeedMessage) -> Vec<EngineCommand> {
        let FeedMessage { kind, generation, event } = message;

        match event {
            FeedEvent::StreamOpened(_) => {
                if !self.supervisor.on_opened(kind, generation) {
                    debug!(stream = %kind, generation = generation, "Open from superseded connection ignored");
                    return Vec::new();
                }
                self.dirty = true;

                if kind == StreamKind::Depth {
                    self.sync.begin_buffering();
                    return self.request_snapshot(generation);
                }
                Vec::new()
            }
            FeedEvent::StreamClosed { code, reason, .. } => {
                let current = self.supervisor.is_current(kind, generation) && self.supervisor.stream(kind).is_live();
                let actions = self.supervisor.on_closed(kind, generation);

                if current {
                    info!(stream = %kind, code = ?code, reason = %reason, "Stream went down");
                    self.dirty = true;
                    if kind == StreamKind::Depth {
                        self.stop_depth();
                    }
                }
                self.stats.reconnect_attempts = self.supervisor.attempts();
                actions.into_iter().map(EngineCommand::from).collect()
            }
            FeedEvent::StreamError { message, .. } => {
                self.supervisor.on_error(kind, generation);
                self.stats.stream_errors = self.supervisor.stream_errors();
                debug!(stream = %kind, error = %message, "Stream error reported");
                Vec::new()
            }
            FeedEvent::Trade(trade) => {
                if !self.accepts_data(kind, generation) {
                    return Vec::new();
                }
                self.stats.trades_received += 1;
                self.trades.append(trade);
                self.dirty = true;
                Vec::new()
            }
            FeedEvent::DepthDiff(update) => {
                if !self.accepts_data(kind, generation) {
                    self.stats.diffs_ignored += 1;
                    return Vec::new();
                }
                self.on_depth_diff(generation, update)
            }
        }
    }

    fn accepts_data(&self, kind: StreamKind, generation: u64) -> bool {
        self.supervisor.is_current(kind, generation) && self.supervisor.stream(kind).is_open()
    }

    fn on_depth_diff(&mut self, generation: u64, update: ParsedDepthUpdate) -> Vec<EngineCommand> {
        self.stats.rejected_levels += update.rejected_levels as u64;

        match self.sync.on_diff(update) {
            DiffDecision::Apply(update) => {
                self.apply_diff(&update);
                Vec::new()
            }
            DiffDecision::Buffered => Vec::new(),
            DiffDecision::Stale => {
                self.stats.diffs_stale += 1;
                Vec::new()
            }
            DiffDecision::Gap { .. } => {
                self.stats.gaps_detected += 1;
                self.dirty = true;
                self.request_snapshot(generation)
            }
            DiffDecision::Ignored => {
                self.stats.diffs_ignored += 1;
                Vec::new()
            }
        }
    }

    fn apply_diff(&mut self, update: &ParsedDepthUpdate) {
        let outcome = self.book.apply_diff(&update.bids, &update.asks, update.final_update_id);
        self.stats.diffs_applied += 1;
        self.stats.rejected_levels += outcome.rejected as u64;
        self.dirty = true;
    }

    fn request_snapshot(&mut self, generation: u64) -> Vec<EngineCommand> {
        if self.pending_snapshot == Some(generation) {
            return Vec::new();
        }
        self.pending_snapshot = Some(generation);
        self.stats.snapshots_requested += 1;
        vec![EngineCommand::FetchSnapshot { generation }]
    }

    /// Snapshot lagged the buffered diffs; ask again after a pause
    fn retry_snapshot(&mut self, generation: u64) -> Vec<EngineCommand> {
        self.pending_snapshot = Some(generation);
        self.stats.snapshots_requested += 1;
        self.stats.snapshot_retries += 1;
        debug!(generation = generation, delay = ?self.snapshot_retry_delay, "Scheduling snapshot retry");
        vec![EngineCommand::RetrySnapshot {
            generation,
            delay: self.snapshot_retry_delay,
        }]
    }

    fn on_snapshot(&mut self, generation: u64, result: Result<DepthSnapshot, RestClientError>) -> Vec<EngineCommand> {
        if !self.supervisor.is_active()
            || self.pending_snapshot != Some(generation)
            || !self.supervisor.is_current(StreamKind::Depth, generation)
        {
            self.stats.snapshots_discarded += 1;
            debug!(generation = generation, "Snapshot for superseded connection discarded");
            return Vec::new();
        }
        self.pending_snapshot = None;

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Prior book stays; no retry until the depth stream reopens
                self.stats.snapshot_failures += 1;
                warn!(error = %e, "Snapshot fetch failed, keeping previous book");
                return Vec::new();
            }
        };

        self.book.apply_snapshot(&snapshot);
        self.stats.snapshots_applied += 1;
        self.dirty = true;

        let reconciliation = self.sync.on_snapshot(snapshot.last_update_id);
        self.stats.diffs_stale += reconciliation.discarded;
        for update in &reconciliation.updates {
            self.apply_diff(update);
        }

        if reconciliation.gap {
            self.stats.gaps_detected += 1;
            return self.retry_snapshot(generation);
        }
        Vec::new()
    }

    fn on_reconnect_due(&mut self) -> Vec<EngineCommand> {
        let actions = self.supervisor.on_reconnect_due();
        if !actions.is_empty() {
            self.stop_depth();
            self.dirty = true;
        }
        self.stats.reconnect_attempts = self.supervisor.attempts();
        actions.into_iter().map(EngineCommand::from).collect()
    }

    fn on_shutdown(&mut self) -> Vec<EngineCommand> {
        let actions = self.supervisor.shutdown();
        self.stop_depth();
        self.dirty = true;
        actions.into_iter().map(EngineCommand::from).collect()
    }

    fn stop_depth(&mut self) {
        self.sync.stop();
        self.pending_snapshot = None;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn view(&self) -> EngineView {
        let order_book = self.book.state().clone();
        EngineView {
            symbol: self.symbol.clone(),
            trades: self.trades.to_vec(),
            depth: aggregate(&order_book, self.display_depth),
            order_book,
            connected: self.supervisor.is_connected(),
            status: self.supervisor.status(),
            synchronized: self.sync.is_synchronized(),
            updated_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// True once per batch of state changes
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn is_active(&self) -> bool {
        self.supervisor.is_active()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync.is_synchronized()
    }

    pub fn generation(&self, kind: StreamKind) -> u64 {
        self.supervisor.stream(kind).generation()
    }

    pub fn book(&self) -> &OrderBookState {
        self.book.state()
    }

    pub fn trades(&self) -> &TradeLog {
        &self.trades
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Engine counters plus transport counters
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub engine: EngineStats,
    pub trade_stream: StreamStats,
    pub depth_stream: StreamStats,
    pub rest: RestClientStats,
}

impl FeedStats {
    pub fn malformed_messages(&self) -> u64 {
        self.trade_stream.malformed + self.depth_stream.malformed
    }
}

impl fmt::Display for FeedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} malformed={} trade={} depth={} {}",
            self.engine,
            self.malformed_messages(),
            self.trade_stream,
            self.depth_stream,
            self.rest
        )
    }
}

/// Drives a MarketEngine with real streams, fetches and timers
pub struct FeedRuntime {
    config: FeedConfig,
    engine: MarketEngine,
    connector: FeedConnector,
    rest: BinanceRestClient,
    feed_rx: mpsc::UnboundedReceiver<FeedMessage>,
    internal_tx: mpsc::UnboundedSender<EngineEvent>,
    internal_rx: mpsc::UnboundedReceiver<EngineEvent>,
    streams: HashMap<StreamKind, StreamHandle>,
    reconnect_timer: Option<JoinHandle<()>>,
    view_tx: watch::Sender<EngineView>,
    stats: Arc<RwLock<FeedStats>>,
}

/// Caller-side handle: read views and stats, stop the runtime
pub struct FeedHandle {
    view_rx: watch::Receiver<EngineView>,
    stats: Arc<RwLock<FeedStats>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FeedRuntime {
    /// Validate config, build the runtime and spawn it on the current tokio runtime
    pub fn spawn(config: FeedConfig) -> Result<FeedHandle, EngineError> {
        config.validate()?;
        let rest = BinanceRestClient::from_config(&config)?;

        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let engine = MarketEngine::new(&config);
        let (view_tx, view_rx) = watch::channel(engine.view());
        let stats = Arc::new(RwLock::new(FeedStats::default()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let runtime = FeedRuntime {
            connector: FeedConnector::new(&config, feed_tx),
            config,
            engine,
            rest,
            feed_rx,
            internal_tx,
            internal_rx,
            streams: HashMap::new(),
            reconnect_timer: None,
            view_tx,
            stats: stats.clone(),
        };

        let task = tokio::spawn(runtime.run(shutdown_rx));

        Ok(FeedHandle {
            view_rx,
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        info!(symbol = %self.engine.symbol, "Feed runtime started");
        let commands = self.engine.start();
        self.execute(commands);
        self.publish();

        loop {
            tokio::select! {
                biased;

                // Fires on an explicit shutdown and when the handle is dropped
                _ = &mut shutdown_rx => {
                    let commands = self.engine.handle(EngineEvent::Shutdown);
                    self.execute(commands);
                    self.publish();
                    break;
                }

                Some(event) = self.internal_rx.recv() => {
                    let commands = self.engine.handle(event);
                    self.execute(commands);
                }

                Some(message) = self.feed_rx.recv() => {
                    let commands = self.engine.handle(EngineEvent::Feed(message));
                    self.execute(commands);
                }
            }

            self.publish();
        }

        for (_, handle) in self.streams.drain() {
            let kind = handle.kind;
            if tokio::time::timeout(Duration::from_secs(5), handle.join()).await.is_err() {
                warn!(stream = %kind, "Stream task did not finish after close");
            }
        }
        info!(stats = %self.stats.read(), "Feed runtime stopped");
    }

    fn execute(&mut self, commands: Vec<EngineCommand>) {
        for command in commands {
            debug!(command = ?command, "Executing engine command");
            match command {
                EngineCommand::OpenStream { kind, generation } => {
                    if let Some(mut previous) = self.streams.remove(&kind) {
                        previous.close();
                    }
                    let handle = self.connector.open(kind, generation);
                    self.streams.insert(kind, handle);
                }
                EngineCommand::CloseStream { kind } => {
                    if let Some(mut handle) = self.streams.remove(&kind) {
                        handle.close();
                        // Closing streams finish on their own; shutdown keeps them to join
                        if self.engine.is_active() {
                            continue;
                        }
                        self.streams.insert(kind, handle);
                    }
                }
                EngineCommand::FetchSnapshot { generation } => self.spawn_fetch(generation, Duration::ZERO),
                EngineCommand::RetrySnapshot { generation, delay } => self.spawn_fetch(generation, delay),
                EngineCommand::ScheduleReconnect { delay } => {
                    self.cancel_timer();
                    let tx = self.internal_tx.clone();
                    self.reconnect_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(EngineEvent::ReconnectDue);
                    }));
                }
                EngineCommand::CancelReconnect => self.cancel_timer(),
            }
        }
    }

    fn spawn_fetch(&self, generation: u64, delay: Duration) {
        let rest = self.rest.clone();
        let tx = self.internal_tx.clone();
        let symbol = self.config.rest_symbol();
        let limit = self.config.snapshot_limit;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = rest.get_depth_snapshot(&symbol, limit).await;
            let _ = tx.send(EngineEvent::SnapshotFetched { generation, result });
        });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn publish(&mut self) {
        {
            let mut stats = self.stats.write();
            stats.engine = self.engine.stats().clone();
            stats.trade_stream = self.connector.stats(StreamKind::Trade);
            stats.depth_stream = self.connector.stats(StreamKind::Depth);
            stats.rest = self.rest.get_stats();
        }

        if self.engine.take_dirty() {
            self.view_tx.send_replace(self.engine.view());
        }
    }
}

impl FeedHandle {
    /// Receiver that wakes on every published view
    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.view_rx.clone()
    }

    pub fn view(&self) -> EngineView {
        self.view_rx.borrow().clone()
    }

    pub fn stats(&self) -> FeedStats {
        self.stats.read().clone()
    }

    /// Stop the runtime: cancel the reconnect timer, close both streams and
    /// wait for the loop to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
