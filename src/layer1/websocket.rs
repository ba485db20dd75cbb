// Feed Connector - one WebSocket task per stream
// Parses frames into typed feed events; malformed payloads never end a stream

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::core::config::FeedConfig;
use crate::core::types::{StreamKind, Trade};
use crate::layer2::parser::{MessageParser, ParsedDepthUpdate, ParsedMessage};

// ============================================================================
// Events
// ============================================================================

/// Typed output of a stream
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Trade(Trade),
    DepthDiff(ParsedDepthUpdate),
    StreamOpened(StreamKind),
    StreamClosed {
        kind: StreamKind,
        code: Option<u16>,
        reason: String,
    },
    StreamError {
        kind: StreamKind,
        message: String,
    },
}

impl fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedEvent::Trade(trade) => write!(f, "{}", trade),
            FeedEvent::DepthDiff(update) => write!(f, "DepthDiff(u={})", update.final_update_id),
            FeedEvent::StreamOpened(kind) => write!(f, "StreamOpened({})", kind),
            FeedEvent::StreamClosed { kind, code, reason } => {
                write!(f, "StreamClosed({}, code={:?}, reason={})", kind, code, reason)
            }
            FeedEvent::StreamError { kind, message } => write!(f, "StreamError({}, {})", kind, message),
        }
    }
}

/// A feed event tagged with the connection that produced it
#[derive(Debug, Clone)]
pub struct FeedMessage {
    pub kind: StreamKind,
    pub generation: u64,
    pub event: FeedEvent,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub connects: u64,
    pub messages: u64,
    pub events_emitted: u64,
    pub malformed: u64,
    pub control_frames: u64,
    pub errors: u64,
    pub pings_sent: u64,
}

impl fmt::Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamStats(connects={}, messages={}, malformed={}, errors={})",
            self.connects, self.messages, self.malformed, self.errors
        )
    }
}

pub type SharedStreamStats = Arc<RwLock<StreamStats>>;

// ============================================================================
// Stream handle
// ============================================================================

/// Running stream task. Closing or dropping the handle sends a close frame.
pub struct StreamHandle {
    pub kind: StreamKind,
    pub generation: u64,
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            debug!(stream = %self.kind, generation = self.generation, "Closing stream");
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to finish after `close`
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens trade and depth streams for one symbol
pub struct FeedConnector {
    symbol: String,
    config: FeedConfig,
    events_tx: mpsc::UnboundedSender<FeedMessage>,
    trade_stats: SharedStreamStats,
    depth_stats: SharedStreamStats,
}

impl FeedConnector {
    pub fn new(config: &FeedConfig, events_tx: mpsc::UnboundedSender<FeedMessage>) -> Self {
        Self {
            symbol: config.rest_symbol(),
            config: config.clone(),
            events_tx,
            trade_stats: Arc::new(RwLock::new(StreamStats::default())),
            depth_stats: Arc::new(RwLock::new(StreamStats::default())),
        }
    }

    pub fn stream_url(&self, kind: StreamKind) -> String {
        self.config.stream_url(kind.stream_suffix())
    }

    /// Spawn the task for one connection of `kind`
    pub fn open(&self, kind: StreamKind, generation: u64) -> StreamHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let ctx = StreamContext {
            kind,
            generation,
            url: self.stream_url(kind),
            symbol: self.symbol.clone(),
            ping_interval: Duration::from_secs(self.config.ws_ping_interval_secs.max(1)),
            events_tx: self.events_tx.clone(),
            stats: self.stats_handle(kind),
        };

        info!(stream = %kind, generation = generation, url = %ctx.url, "Opening stream");
        let task = tokio::spawn(run_stream(ctx, close_rx));

        StreamHandle {
            kind,
            generation,
            close_tx: Some(close_tx),
            task,
        }
    }

    fn stats_handle(&self, kind: StreamKind) -> SharedStreamStats {
        match kind {
            StreamKind::Trade => self.trade_stats.clone(),
            StreamKind::Depth => self.depth_stats.clone(),
        }
    }

    pub fn stats(&self, kind: StreamKind) -> StreamStats {
        self.stats_handle(kind).read().clone()
    }
}

struct StreamContext {
    kind: StreamKind,
    generation: u64,
    url: String,
    symbol: String,
    ping_interval: Duration,
    events_tx: mpsc::UnboundedSender<FeedMessage>,
    stats: SharedStreamStats,
}

impl StreamContext {
    /// Returns false once the receiving side is gone
    fn emit(&self, event: FeedEvent) -> bool {
        self.stats.write().events_emitted += 1;
        self.events_tx
            .send(FeedMessage {
                kind: self.kind,
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    fn emit_failure(&self, message: String) {
        self.stats.write().errors += 1;
        self.emit(FeedEvent::StreamError {
            kind: self.kind,
            message: message.clone(),
        });
        self.emit(FeedEvent::StreamClosed {
            kind: self.kind,
            code: None,
            reason: message,
        });
    }

    /// Parse one text frame; anything unusable is logged and dropped
    fn handle_text(&self, parser: &mut MessageParser, text: &str) -> bool {
        self.stats.write().messages += 1;

        match parser.parse(text) {
            Ok(ParsedMessage::Trade(trade)) => self.emit(FeedEvent::Trade(trade)),
            Ok(ParsedMessage::DepthUpdate(update)) => self.emit(FeedEvent::DepthDiff(update)),
            Ok(ParsedMessage::Control) => {
                self.stats.write().control_frames += 1;
                true
            }
            Ok(ParsedMessage::DepthSnapshot(_)) => {
                self.stats.write().malformed += 1;
                warn!(stream = %self.kind, "Unexpected snapshot payload on stream, dropped");
                true
            }
            Err(e) => {
                self.stats.write().malformed += 1;
                warn!(stream = %self.kind, error = %e, "Malformed message dropped");
                true
            }
        }
    }
}

/// One connection, from connect to close
async fn run_stream(ctx: StreamContext, mut close_rx: oneshot::Receiver<()>) {
    debug!(url = %ctx.url, "Connecting to WebSocket");

    let connected = tokio::select! {
        result = connect_async(ctx.url.as_str()) => result,
        _ = &mut close_rx => {
            ctx.emit(FeedEvent::StreamClosed {
                kind: ctx.kind,
                code: None,
                reason: "closed before connect".to_string(),
            });
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!(stream = %ctx.kind, error = %e, "WebSocket connect failed");
            ctx.emit_failure(e.to_string());
            return;
        }
    };

    ctx.stats.write().connects += 1;
    info!(stream = %ctx.kind, generation = ctx.generation, "WebSocket connected");
    if !ctx.emit(FeedEvent::StreamOpened(ctx.kind)) {
        return;
    }

    let (mut write, mut read) = ws_stream.split();
    let mut parser = MessageParser::new(&ctx.symbol);
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ctx.ping_interval, ctx.ping_interval);

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                let _ = write.send(Message::Close(None)).await;
                info!(stream = %ctx.kind, generation = ctx.generation, "Stream closed by client");
                ctx.emit(FeedEvent::StreamClosed {
                    kind: ctx.kind,
                    code: Some(1000),
                    reason: "closed by client".to_string(),
                });
                break;
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    warn!(stream = %ctx.kind, error = %e, "Ping failed");
                    ctx.emit_failure(e.to_string());
                    break;
                }
                ctx.stats.write().pings_sent += 1;
            }

            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if !ctx.handle_text(&mut parser, &text) {
                            debug!(stream = %ctx.kind, "Event receiver gone, stopping stream");
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        ctx.stats.write().malformed += 1;
                        warn!(stream = %ctx.kind, bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        info!(stream = %ctx.kind, code = ?code, reason = %reason, "WebSocket closed by server");
                        ctx.emit(FeedEvent::StreamClosed { kind: ctx.kind, code, reason });
                        break;
                    }
                    Some(Err(e)) => {
                        error!(stream = %ctx.kind, error = %e, "WebSocket error");
                        ctx.emit_failure(e.to_string());
                        break;
                    }
                    None => {
                        info!(stream = %ctx.kind, "WebSocket stream ended");
                        ctx.emit(FeedEvent::StreamClosed {
                            kind: ctx.kind,
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }

    let stats = ctx.stats.read().clone();
    debug!(stream = %ctx.kind, generation = ctx.generation, stats = %stats, "Stream task finished");
}
