// End-to-End Flow Tests for the order book stream
//
// These tests exercise the full engine without network connections:
//   raw JSON → Parser → MarketEngine (Synchronizer → OrderBook / TradeLog) → EngineView
//
// Run with: cargo test --test e2e_flow_test

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use orderbook_stream::core::{ConnectionStatus, FeedConfig, StreamKind};
use orderbook_stream::layer1::{FeedEvent, FeedMessage, RestClientError};
use orderbook_stream::layer2::{
    parse_depth_snapshot, EngineCommand, EngineEvent, MarketEngine, MessageParser, ParsedMessage,
};

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    engine: MarketEngine,
    parser: MessageParser,
    trade_gen: u64,
    depth_gen: u64,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(FeedConfig::default())
    }

    fn with_config(config: FeedConfig) -> Self {
        let parser = MessageParser::new(&config.symbol);
        Self {
            engine: MarketEngine::new(&config),
            parser,
            trade_gen: 0,
            depth_gen: 0,
        }
    }

    /// Start the engine and apply the open commands it returns
    fn start(&mut self) -> Vec<EngineCommand> {
        let commands = self.engine.start();
        self.track(&commands);
        commands
    }

    fn track(&mut self, commands: &[EngineCommand]) {
        for command in commands {
            if let EngineCommand::OpenStream { kind, generation } = command {
                match kind {
                    StreamKind::Trade => self.trade_gen = *generation,
                    StreamKind::Depth => self.depth_gen = *generation,
                }
            }
        }
    }

    fn generation(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Trade => self.trade_gen,
            StreamKind::Depth => self.depth_gen,
        }
    }

    fn send(&mut self, kind: StreamKind, event: FeedEvent) -> Vec<EngineCommand> {
        let generation = self.generation(kind);
        let commands = self.engine.handle(EngineEvent::Feed(FeedMessage { kind, generation, event }));
        self.track(&commands);
        commands
    }

    fn open(&mut self, kind: StreamKind) -> Vec<EngineCommand> {
        self.send(kind, FeedEvent::StreamOpened(kind))
    }

    fn close(&mut self, kind: StreamKind) -> Vec<EngineCommand> {
        self.send(
            kind,
            FeedEvent::StreamClosed {
                kind,
                code: Some(1006),
                reason: "abnormal closure".to_string(),
            },
        )
    }

    /// Feed one raw stream payload through the parser
    fn raw(&mut self, kind: StreamKind, payload: &str) -> Vec<EngineCommand> {
        match self.parser.parse(payload) {
            Ok(ParsedMessage::Trade(trade)) => self.send(kind, FeedEvent::Trade(trade)),
            Ok(ParsedMessage::DepthUpdate(update)) => self.send(kind, FeedEvent::DepthDiff(update)),
            Ok(other) => panic!("unexpected payload in test: {:?}", other),
            Err(_) => Vec::new(),
        }
    }

    fn snapshot(&mut self, body: serde_json::Value) -> Vec<EngineCommand> {
        let snapshot = parse_depth_snapshot(&body).expect("valid snapshot body");
        let generation = self.depth_gen;
        self.engine.handle(EngineEvent::SnapshotFetched {
            generation,
            result: Ok(snapshot),
        })
    }

    fn reconnect(&mut self) -> Vec<EngineCommand> {
        let commands = self.engine.handle(EngineEvent::ReconnectDue);
        self.track(&commands);
        commands
    }

    /// Started, both streams open, seeded with the reference snapshot
    fn synchronized() -> Self {
        let mut h = Self::new();
        h.start();
        h.open(StreamKind::Trade);
        h.open(StreamKind::Depth);
        h.snapshot(json!({"lastUpdateId": 10, "bids": [["100", "2"]], "asks": [["101", "3"]]}));
        h
    }
}

fn depth_json(first: Option<u64>, last: u64, bids: serde_json::Value, asks: serde_json::Value) -> String {
    let mut body = json!({"e": "depthUpdate", "E": 1_700_000_000_000u64, "s": "BTCUSDT", "u": last, "b": bids, "a": asks});
    if let Some(first) = first {
        body["U"] = json!(first);
    }
    body.to_string()
}

fn trade_json(id: u64, price: &str) -> String {
    json!({"e": "aggTrade", "E": 1, "s": "BTCUSDT", "a": id, "p": price, "q": "0.5", "T": 1_700_000_000_000u64 + id, "m": id % 2 == 0})
        .to_string()
}

// ============================================================================
// Order book
// ============================================================================

#[test]
fn test_snapshot_then_zero_quantity_diff_removes_bid() {
    let mut h = Harness::synchronized();
    h.raw(StreamKind::Depth, r#"{"e":"depthUpdate","b":[["100","0"]],"a":[],"u":11}"#);

    let view = h.engine.view();
    assert!(view.order_book.bids.is_empty());
    assert_eq!(view.order_book.asks.get(&dec!(101)), Some(&dec!(3)));
    assert_eq!(view.order_book.last_update_id, 11);
    assert!(view.synchronized);
}

#[test]
fn test_negative_quantity_rejected_for_that_pair_only() {
    let mut h = Harness::synchronized();
    h.raw(
        StreamKind::Depth,
        &depth_json(Some(11), 12, json!([["100", "-1"], ["99", "4"]]), json!([["101", "5"]])),
    );

    let book = h.engine.view().order_book;
    assert_eq!(book.bids.get(&dec!(100)), Some(&dec!(2)));
    assert_eq!(book.bids.get(&dec!(99)), Some(&dec!(4)));
    assert_eq!(book.asks.get(&dec!(101)), Some(&dec!(5)));
    assert_eq!(book.last_update_id, 12);
    assert_eq!(h.engine.stats().rejected_levels, 1);
}

#[test]
fn test_snapshot_replaces_previous_levels() {
    let mut h = Harness::synchronized();
    h.raw(StreamKind::Depth, &depth_json(Some(11), 11, json!([["98", "1"]]), json!([])));

    // A gap forces a fresh snapshot, which must wipe everything above
    let commands = h.raw(StreamKind::Depth, &depth_json(Some(40), 42, json!([]), json!([])));
    assert_eq!(commands, vec![EngineCommand::FetchSnapshot { generation: h.depth_gen }]);

    h.snapshot(json!({"lastUpdateId": 41, "bids": [["50", "1"]], "asks": [["60", "1"]]}));

    let book = h.engine.view().order_book;
    assert_eq!(book.bids.keys().copied().collect::<Vec<_>>(), vec![dec!(50)]);
    assert_eq!(book.asks.keys().copied().collect::<Vec<_>>(), vec![dec!(60)]);
    // The held diff (U=40, u=42) bridges snapshot 41
    assert_eq!(book.last_update_id, 42);
}

// ============================================================================
// Synchronization
// ============================================================================

#[test]
fn test_diffs_before_snapshot_are_buffered_and_reconciled() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    let commands = h.open(StreamKind::Depth);
    assert_eq!(commands, vec![EngineCommand::FetchSnapshot { generation: 1 }]);

    // Out of order, and partly older than the snapshot
    h.raw(StreamKind::Depth, &depth_json(Some(14), 15, json!([["97", "1"]]), json!([])));
    h.raw(StreamKind::Depth, &depth_json(Some(5), 9, json!([["90", "9"]]), json!([])));
    h.raw(StreamKind::Depth, &depth_json(Some(10), 13, json!([["100", "0"]]), json!([])));

    let view = h.engine.view();
    assert!(!view.synchronized);
    assert!(view.order_book.is_empty());

    h.snapshot(json!({"lastUpdateId": 11, "bids": [["100", "2"]], "asks": [["101", "3"]]}));

    let view = h.engine.view();
    assert!(view.synchronized);
    assert_eq!(view.order_book.last_update_id, 15);
    assert_eq!(view.order_book.bids.keys().copied().collect::<Vec<_>>(), vec![dec!(97)]);
    assert_eq!(h.engine.stats().diffs_applied, 2);
    assert_eq!(h.engine.stats().diffs_stale, 1);
}

#[test]
fn test_stale_live_diff_dropped() {
    let mut h = Harness::synchronized();
    h.raw(StreamKind::Depth, &depth_json(Some(3), 10, json!([["100", "0"]]), json!([])));

    assert_eq!(h.engine.view().order_book.bids.len(), 1);
    assert_eq!(h.engine.stats().diffs_stale, 1);
}

#[test]
fn test_gap_requests_snapshot_and_keeps_stale_book() {
    let mut h = Harness::synchronized();
    let commands = h.raw(StreamKind::Depth, &depth_json(Some(20), 25, json!([["100", "0"]]), json!([])));

    assert_eq!(commands, vec![EngineCommand::FetchSnapshot { generation: h.depth_gen }]);
    let view = h.engine.view();
    assert!(!view.synchronized);
    assert_eq!(view.order_book.bids.len(), 1);
    assert_eq!(h.engine.stats().gaps_detected, 1);

    // Further diffs while resyncing do not trigger more fetches
    assert!(h
        .raw(StreamKind::Depth, &depth_json(Some(26), 27, json!([]), json!([])))
        .is_empty());
}

#[test]
fn test_snapshot_failure_leaves_book_untouched() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    h.open(StreamKind::Depth);

    let commands = h.engine.handle(EngineEvent::SnapshotFetched {
        generation: h.depth_gen,
        result: Err(RestClientError::Api {
            status: 429,
            code: -1003,
            message: "Too many requests".to_string(),
        }),
    });

    assert!(commands.is_empty());
    assert!(h.engine.view().order_book.is_empty());
    assert!(!h.engine.is_synchronized());
    assert_eq!(h.engine.stats().snapshot_failures, 1);
}

// ============================================================================
// Depth view
// ============================================================================

#[test]
fn test_view_truncates_and_ranks() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    h.open(StreamKind::Depth);

    let bids: Vec<_> = (1..=20).map(|p| json!([p.to_string(), "1"])).collect();
    let asks: Vec<_> = (21..=40).map(|p| json!([p.to_string(), "2"])).collect();
    h.snapshot(json!({"lastUpdateId": 1, "bids": bids, "asks": asks}));

    let depth = h.engine.view().depth;
    assert_eq!(depth.bids.len(), 15);
    assert_eq!(depth.asks.len(), 15);
    assert_eq!(depth.bids[0].price, dec!(20));
    assert_eq!(depth.bids[14].price, dec!(6));
    assert_eq!(depth.asks[0].price, dec!(21));
    assert!(depth.bids.windows(2).all(|w| w[0].price > w[1].price));
    assert!(depth.asks.windows(2).all(|w| w[0].price < w[1].price));
    assert_eq!(depth.bids[14].total, dec!(15));
    assert_eq!(depth.asks[14].total, dec!(30));
    assert_eq!(depth.spread, "1.00");
}

#[test]
fn test_view_survives_maximum_quantities() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    h.open(StreamKind::Depth);

    let max = Decimal::MAX.to_string();
    h.snapshot(json!({"lastUpdateId": 5, "bids": [["100", max], ["99", max]], "asks": [["101", "1"]]}));

    let depth = h.engine.view().depth;
    assert_eq!(depth.bids.len(), 2);
    assert_eq!(depth.bids[1].total, Decimal::MAX);
    assert_eq!(depth.max_bid_total, Decimal::MAX);
    assert_eq!(depth.spread, "1.00");
}

#[test]
fn test_spread_zero_when_side_empty() {
    let mut h = Harness::synchronized();
    h.raw(StreamKind::Depth, &depth_json(Some(11), 11, json!([]), json!([["101", "0"]])));

    let depth = h.engine.view().depth;
    assert!(depth.asks.is_empty());
    assert_eq!(depth.spread, "0.00");
    assert_eq!(depth.max_ask_total, Decimal::ONE);
}

// ============================================================================
// Trades
// ============================================================================

#[test]
fn test_trade_log_caps_at_fifty() {
    let mut h = Harness::synchronized();
    for id in 0..51 {
        h.raw(StreamKind::Trade, &trade_json(id, "100.25"));
    }

    let view = h.engine.view();
    assert_eq!(view.trades.len(), 50);
    assert_eq!(view.trades[0].trade.id, "50");
    assert!(view.trades.iter().all(|t| t.trade.id != "0"));
    assert_eq!(h.engine.stats().trades_received, 51);
}

#[test]
fn test_duplicate_trade_ids_are_kept() {
    let mut h = Harness::synchronized();
    h.raw(StreamKind::Trade, &trade_json(9, "1"));
    h.raw(StreamKind::Trade, &trade_json(9, "1"));

    let trades = h.engine.view().trades;
    assert_eq!(trades.len(), 2);
    assert_ne!(trades[0].key(), trades[1].key());
}

#[test]
fn test_malformed_trade_is_dropped() {
    let mut h = Harness::synchronized();
    h.raw(StreamKind::Trade, r#"{"e":"aggTrade","a":1,"p":"abc","q":"1","T":1,"m":true}"#);
    h.raw(StreamKind::Trade, "garbage");

    assert!(h.engine.view().trades.is_empty());
    assert_eq!(h.parser.stats.parse_errors, 2);
}

// ============================================================================
// Connectivity
// ============================================================================

#[test]
fn test_connected_requires_both_streams() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    assert!(!h.engine.view().connected);

    h.open(StreamKind::Depth);
    assert!(h.engine.view().connected);
    assert_eq!(h.engine.view().status, ConnectionStatus::Connected);

    h.close(StreamKind::Depth);
    let view = h.engine.view();
    assert!(!view.connected);
    assert_eq!(view.status, ConnectionStatus::Reconnecting);
}

#[test]
fn test_reconnect_gives_up_after_five_attempts() {
    let mut h = Harness::with_config(FeedConfig {
        reconnect_delay_seconds: 5,
        max_reconnect_attempts: 5,
        ..FeedConfig::default()
    });
    h.start();

    for attempt in 1..=5u32 {
        let scheduled = h.close(StreamKind::Trade);
        assert_eq!(scheduled, vec![EngineCommand::ScheduleReconnect { delay: Duration::from_secs(5) }]);

        let commands = h.reconnect();
        assert!(commands.contains(&EngineCommand::OpenStream {
            kind: StreamKind::Trade,
            generation: attempt as u64 + 1
        }));
        assert_eq!(h.engine.stats().reconnect_attempts, attempt);
    }

    assert!(h.close(StreamKind::Trade).is_empty());
    let view = h.engine.view();
    assert!(!view.connected);
    assert_eq!(view.status, ConnectionStatus::GivenUp);
    assert!(h.reconnect().is_empty());
}

#[test]
fn test_reconnect_resynchronizes_depth() {
    let mut h = Harness::synchronized();
    h.close(StreamKind::Depth);
    h.reconnect();
    h.open(StreamKind::Trade);
    let commands = h.open(StreamKind::Depth);
    assert_eq!(commands, vec![EngineCommand::FetchSnapshot { generation: 2 }]);

    // Old book stays visible until the new snapshot lands
    assert_eq!(h.engine.view().order_book.last_update_id, 10);

    h.snapshot(json!({"lastUpdateId": 500, "bids": [["200", "1"]], "asks": []}));
    let view = h.engine.view();
    assert!(view.connected);
    assert!(view.synchronized);
    assert_eq!(view.order_book.last_update_id, 500);
}

#[test]
fn test_events_from_old_connection_ignored_after_reconnect() {
    let mut h = Harness::synchronized();
    h.close(StreamKind::Trade);
    h.reconnect();

    // Late message from depth generation 1, which the reconnect closed
    let stale = h.parser.parse(&depth_json(Some(11), 11, json!([["100", "0"]]), json!([]))).unwrap();
    let ParsedMessage::DepthUpdate(update) = stale else {
        panic!("expected depth update");
    };
    h.engine.handle(EngineEvent::Feed(FeedMessage {
        kind: StreamKind::Depth,
        generation: 1,
        event: FeedEvent::DepthDiff(update),
    }));

    assert_eq!(h.engine.view().order_book.bids.len(), 1);
    assert_eq!(h.engine.stats().diffs_ignored, 1);
}

#[test]
fn test_snapshot_for_previous_depth_connection_discarded() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    assert_eq!(h.open(StreamKind::Depth), vec![EngineCommand::FetchSnapshot { generation: 1 }]);

    // Depth drops before its snapshot lands and comes back as generation 2
    h.close(StreamKind::Depth);
    h.reconnect();
    h.open(StreamKind::Trade);
    assert_eq!(h.open(StreamKind::Depth), vec![EngineCommand::FetchSnapshot { generation: 2 }]);

    let late = parse_depth_snapshot(&json!({"lastUpdateId": 10, "bids": [["100", "2"]], "asks": [["101", "3"]]}))
        .unwrap();
    let commands = h.engine.handle(EngineEvent::SnapshotFetched {
        generation: 1,
        result: Ok(late),
    });

    assert!(commands.is_empty());
    let view = h.engine.view();
    assert!(view.order_book.is_empty());
    assert!(!view.synchronized);
    assert_eq!(h.engine.stats().snapshots_discarded, 1);
    assert_eq!(h.engine.stats().snapshots_applied, 0);

    // The current connection's snapshot still applies
    h.snapshot(json!({"lastUpdateId": 20, "bids": [["200", "1"]], "asks": [["201", "1"]]}));
    let view = h.engine.view();
    assert!(view.synchronized);
    assert_eq!(view.order_book.last_update_id, 20);
    assert_eq!(h.engine.stats().snapshots_discarded, 1);
}

#[test]
fn test_shutdown_ignores_late_snapshot() {
    let mut h = Harness::new();
    h.start();
    h.open(StreamKind::Trade);
    h.open(StreamKind::Depth);

    let commands = h.engine.handle(EngineEvent::Shutdown);
    assert!(commands.contains(&EngineCommand::CloseStream { kind: StreamKind::Depth }));

    h.snapshot(json!({"lastUpdateId": 10, "bids": [["100", "2"]], "asks": []}));
    let view = h.engine.view();
    assert!(view.order_book.is_empty());
    assert_eq!(view.status, ConnectionStatus::Stopped);
    assert!(!view.connected);
}
