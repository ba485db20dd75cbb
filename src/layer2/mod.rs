// Layer 2 - Data Processing & Synchronization
// Parses stream payloads, keeps the book in sequence and drives reconnects

pub mod orderbook;
pub mod parser;
pub mod synchronizer;
pub mod trade_log;
pub mod supervisor;
pub mod pipeline;

// Re-export commonly used items
pub use orderbook::{BookSide, DiffOutcome, OrderBook, OrderBookState, OrderBookSummary};
pub use parser::{parse_depth_snapshot, MessageParser, ParseError, ParsedDepthUpdate, ParsedMessage, ParserStats};
pub use synchronizer::{DataSynchronizer, DiffDecision, Reconciliation, SyncState, SynchronizerStats};
pub use trade_log::{LoggedTrade, TradeLog};
pub use supervisor::{connected, ReconnectSupervisor, StreamLifecycle, StreamPhase, SupervisorAction};
pub use pipeline::{
    EngineCommand, EngineError, EngineEvent, EngineStats, EngineView, FeedHandle, FeedRuntime, FeedStats,
    MarketEngine,
};
