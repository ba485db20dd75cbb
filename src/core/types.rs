// Core Type Definitions for the order book stream
// Prices and quantities are exact decimals, never floats

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Enums
// ============================================================================

/// The two independent feed streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Trade,
    Depth,
}

impl StreamKind {
    /// Binance stream suffix for this kind
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            StreamKind::Trade => "aggTrade",
            StreamKind::Depth => "depth",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Trade => write!(f, "trade"),
            StreamKind::Depth => write!(f, "depth"),
        }
    }
}

/// Overall feed connectivity as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    GivenUp,
    Stopped,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// ============================================================================
// PriceLevel
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum LevelError {
    #[error("invalid {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("negative quantity {0} at price {1}")]
    NegativeQuantity(Decimal, Decimal),
    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),
}

/// A `[price, quantity]` pair. A zero quantity means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Parse a wire `[price, quantity]` string pair, validating both fields
    pub fn parse(price: &str, quantity: &str) -> Result<Self, LevelError> {
        let price = parse_decimal(price, "price")?;
        let quantity = parse_decimal(quantity, "quantity")?;
        let level = Self { price, quantity };
        level.validate()?;
        Ok(level)
    }

    pub fn validate(&self) -> Result<(), LevelError> {
        if self.price <= Decimal::ZERO {
            return Err(LevelError::NonPositivePrice(self.price));
        }
        if self.quantity.is_sign_negative() && !self.quantity.is_zero() {
            return Err(LevelError::NegativeQuantity(self.quantity, self.price));
        }
        Ok(())
    }

    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

impl fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.price, self.quantity)
    }
}

fn parse_decimal(value: &str, field: &'static str) -> Result<Decimal, LevelError> {
    Decimal::from_str(value.trim())
        .or_else(|_| Decimal::from_scientific(value.trim()))
        .map_err(|_| LevelError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

// ============================================================================
// Trade
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Feed-assigned id; not guaranteed unique under redelivery
    pub id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Trade time, epoch milliseconds
    pub time: i64,
    pub is_buyer_maker: bool,
}

impl Trade {
    /// Aggressor side: a resting buyer means the taker sold
    pub fn side(&self) -> OrderSide {
        if self.is_buyer_maker {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price.saturating_mul(self.quantity)
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade(id={}, price={}, qty={}, side={})",
            self.id, self.price, self.quantity, self.side()
        )
    }
}

// ============================================================================
// DepthSnapshot
// ============================================================================

/// Full point-in-time book used to bootstrap or re-synchronize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthSnapshot {
    pub fn new(last_update_id: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            last_update_id,
            bids,
            asks,
        }
    }
}

impl fmt::Display for DepthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepthSnapshot(update_id={}, bids={}, asks={})",
            self.last_update_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}
