// Message Parser
// Binance spot aggTrade / trade / depthUpdate payloads and REST depth snapshots

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{DepthSnapshot, LevelError, PriceLevel, Trade};

// ============================================================================
// Parsed Message Types
// ============================================================================

/// Parsed depth update (order book diff)
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ParsedDepthUpdate {
    pub event_time: Option<u64>,
    /// `U`; absent on some feeds, which disables the start-version check
    pub first_update_id: Option<u64>,
    /// `u`
    pub final_update_id: u64,
    /// `pu`; only futures-style feeds send it
    pub prev_final_update_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Pairs dropped while parsing because they were malformed
    pub rejected_levels: usize,
}

impl ParsedDepthUpdate {
    pub fn new(first_update_id: Option<u64>, final_update_id: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            event_time: None,
            first_update_id,
            final_update_id,
            prev_final_update_id: None,
            bids,
            asks,
            rejected_levels: 0,
        }
    }

    /// Sort key used when replaying buffered diffs
    pub fn sequence_key(&self) -> (u64, u64) {
        (self.first_update_id.unwrap_or(self.final_update_id), self.final_update_id)
    }
}

/// All message shapes the feed can deliver
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Trade(Trade),
    DepthUpdate(ParsedDepthUpdate),
    DepthSnapshot(DepthSnapshot),
    /// Subscription acks and other frames that carry no market data
    Control,
}

/// Parser error type
#[derive(Debug)]
pub enum ParseError {
    InvalidJson(String),
    UnknownEventType(String),
    ValidationFailed(String),
    InvalidField(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidJson(e) => write!(f, "Invalid JSON: {}", e),
            ParseError::UnknownEventType(e) => write!(f, "Unknown event type: {}", e),
            ParseError::ValidationFailed(e) => write!(f, "Validation failed: {}", e),
            ParseError::InvalidField(e) => write!(f, "Invalid field: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<LevelError> for ParseError {
    fn from(e: LevelError) -> Self {
        ParseError::InvalidField(e.to_string())
    }
}

// ============================================================================
// Serde Structures (Raw Binance JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "a", default)]
    agg_trade_id: Option<u64>,
    #[serde(rename = "t", default)]
    trade_id: Option<u64>,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    timestamp: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E", default)]
    event_time: Option<u64>,
    #[serde(rename = "U", default)]
    first_update_id: Option<u64>,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "pu", default)]
    prev_final_update_id: Option<u64>,
    #[serde(rename = "b", default)]
    bids: Vec<Value>,
    #[serde(rename = "a", default)]
    asks: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    #[serde(default)]
    bids: Vec<Value>,
    #[serde(default)]
    asks: Vec<Value>,
}

// ============================================================================
// Level helpers
// ============================================================================

fn field_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse one `[price, quantity]` JSON pair
fn level_from_value(value: &Value) -> Result<PriceLevel, ParseError> {
    let pair = value
        .as_array()
        .filter(|items| items.len() >= 2)
        .ok_or_else(|| ParseError::InvalidField(format!("level is not a [price, qty] pair: {}", value)))?;

    let price = field_as_string(&pair[0])
        .ok_or_else(|| ParseError::InvalidField(format!("price is not a string: {}", pair[0])))?;
    let quantity = field_as_string(&pair[1])
        .ok_or_else(|| ParseError::InvalidField(format!("quantity is not a string: {}", pair[1])))?;

    Ok(PriceLevel::parse(&price, &quantity)?)
}

/// Parse a side, dropping malformed pairs individually. Returns (levels, rejected).
fn parse_side(raw: &[Value], side: &'static str) -> (Vec<PriceLevel>, usize) {
    let mut levels = Vec::with_capacity(raw.len());
    let mut rejected = 0;

    for value in raw {
        match level_from_value(value) {
            Ok(level) => levels.push(level),
            Err(e) => {
                rejected += 1;
                warn!(side = side, error = %e, "Rejected malformed price level");
            }
        }
    }

    (levels, rejected)
}

/// Parse a REST depth snapshot body
pub fn parse_depth_snapshot(value: &Value) -> Result<DepthSnapshot, ParseError> {
    let raw: RawDepthSnapshot = serde_json::from_value(value.clone())
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let (bids, rejected_bids) = parse_side(&raw.bids, "bid");
    let (asks, rejected_asks) = parse_side(&raw.asks, "ask");
    if rejected_bids + rejected_asks > 0 {
        warn!(rejected = rejected_bids + rejected_asks, "Snapshot contained malformed levels");
    }

    Ok(DepthSnapshot::new(raw.last_update_id, bids, asks))
}

// ============================================================================
// Parser
// ============================================================================

/// Parser statistics
#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub validation_failures: u64,
    pub trade_count: u64,
    pub depth_count: u64,
    pub snapshot_count: u64,
    pub control_count: u64,
    pub rejected_levels: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Stateful message parser: symbol validation and stats
pub struct MessageParser {
    pub symbol: String,
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            stats: ParserStats::default(),
        }
    }

    /// Parse any feed message (auto-detects type). Errors are counted.
    pub fn parse(&mut self, raw_json: &str) -> Result<ParsedMessage, ParseError> {
        let result = self.parse_inner(raw_json);
        match &result {
            Ok(ParsedMessage::Control) => self.stats.control_count += 1,
            Ok(_) => self.stats.messages_parsed += 1,
            Err(ParseError::ValidationFailed(_)) => {
                self.stats.validation_failures += 1;
                self.stats.parse_errors += 1;
            }
            Err(_) => self.stats.parse_errors += 1,
        }
        result
    }

    fn parse_inner(&mut self, raw_json: &str) -> Result<ParsedMessage, ParseError> {
        let value: Value = serde_json::from_str(raw_json)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        // Unwrap combined stream format: {"stream": "...", "data": {...}}
        let data = match value.get("data") {
            Some(inner) if value.get("stream").is_some() => inner,
            _ => &value,
        };

        if !data.is_object() {
            return Err(ParseError::InvalidJson("payload is not an object".into()));
        }

        // Subscription ack: {"result": null, "id": 1}
        if data.get("id").is_some() && data.get("e").is_none() && data.get("lastUpdateId").is_none() {
            debug!(payload = %data, "Control frame");
            return Ok(ParsedMessage::Control);
        }

        // Depth snapshot has no "e" field
        if data.get("lastUpdateId").is_some() && data.get("e").is_none() {
            let snapshot = parse_depth_snapshot(data)?;
            self.stats.snapshot_count += 1;
            return Ok(ParsedMessage::DepthSnapshot(snapshot));
        }

        let event_type = data
            .get("e")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::InvalidJson("Missing event type 'e'".into()))?;

        if let Some(sym) = data.get("s").and_then(|v| v.as_str()) {
            if sym.to_uppercase() != self.symbol {
                return Err(ParseError::ValidationFailed(format!(
                    "Symbol mismatch: expected {}, got {}",
                    self.symbol, sym
                )));
            }
        }

        match event_type {
            "aggTrade" | "trade" => self.parse_trade(data),
            "depthUpdate" => self.parse_depth_update(data),
            other => Err(ParseError::UnknownEventType(other.to_string())),
        }
    }

    pub fn parse_trade(&mut self, data: &Value) -> Result<ParsedMessage, ParseError> {
        let raw: RawTrade = serde_json::from_value(data.clone())
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        let id = raw
            .agg_trade_id
            .or(raw.trade_id)
            .ok_or_else(|| ParseError::InvalidField("trade carries no id".into()))?;
        let level = PriceLevel::parse(&raw.price, &raw.quantity)?;

        self.stats.trade_count += 1;

        Ok(ParsedMessage::Trade(Trade {
            id: id.to_string(),
            price: level.price,
            quantity: level.quantity,
            time: raw.timestamp,
            is_buyer_maker: raw.is_buyer_maker,
        }))
    }

    pub fn parse_depth_update(&mut self, data: &Value) -> Result<ParsedMessage, ParseError> {
        let raw: RawDepthUpdate = serde_json::from_value(data.clone())
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        if let Some(first) = raw.first_update_id {
            if first > raw.final_update_id {
                return Err(ParseError::ValidationFailed(format!(
                    "first update id {} exceeds final update id {}",
                    first, raw.final_update_id
                )));
            }
        }

        let (bids, rejected_bids) = parse_side(&raw.bids, "bid");
        let (asks, rejected_asks) = parse_side(&raw.asks, "ask");
        let rejected_levels = rejected_bids + rejected_asks;

        self.stats.depth_count += 1;
        self.stats.rejected_levels += rejected_levels as u64;

        Ok(ParsedMessage::DepthUpdate(ParsedDepthUpdate {
            event_time: raw.event_time,
            first_update_id: raw.first_update_id,
            final_update_id: raw.final_update_id,
            prev_final_update_id: raw.prev_final_update_id,
            bids,
            asks,
            rejected_levels,
        }))
    }
}
