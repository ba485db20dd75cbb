// REST Client for the Binance spot API
// One-shot depth snapshot fetch; failures are reported, never retried here

use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::config::FeedConfig;
use crate::core::types::DepthSnapshot;
use crate::layer2::parser::{parse_depth_snapshot, ParseError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status} (code {code}): {message}")]
    Api { status: u16, code: i64, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Snapshot parse error: {0}")]
    Parse(#[from] ParseError),
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
}

impl RestClientStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent > 0 {
            self.requests_succeeded as f64 / self.requests_sent as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, rate={:.2}%)",
            self.requests_sent,
            self.requests_succeeded,
            self.requests_failed,
            self.success_rate() * 100.0
        )
    }
}

// ============================================================================
// Binance REST Client
// ============================================================================

/// Public market-data REST client. Cheap to clone; clones share the
/// connection pool and stats.
#[derive(Clone)]
pub struct BinanceRestClient {
    base_url: String,
    client: Client,
    stats: Arc<Mutex<RestClientStats>>,
}

impl BinanceRestClient {
    pub fn new(base_url: &str, timeout_seconds: u64) -> Result<Self, RestClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            stats: Arc::new(Mutex::new(RestClientStats::default())),
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self, RestClientError> {
        Self::new(&config.rest_base_url, config.request_timeout_seconds)
    }

    /// GET a public endpoint and return its JSON body
    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, RestClientError> {
        let url = format!("{}{}", self.base_url, endpoint);
        self.stats.lock().requests_sent += 1;

        let result = self.send(&url, params).await;
        let mut stats = self.stats.lock();
        match &result {
            Ok(_) => stats.requests_succeeded += 1,
            Err(_) => stats.requests_failed += 1,
        }
        result
    }

    async fn send(&self, url: &str, params: &[(&str, String)]) -> Result<Value, RestClientError> {
        let response = self.client.get(url).query(params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            let data: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let code = data.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
            let message = data
                .get("msg")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or(body);
            warn!(url = url, status = status.as_u16(), code = code, message = %message, "Request rejected");
            return Err(RestClientError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    // ========================================================================
    // Market Data Endpoints
    // ========================================================================

    /// Fetch a bounded-depth order book snapshot
    pub async fn get_depth_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, RestClientError> {
        let symbol = symbol.trim().to_uppercase();
        let data = self
            .get("/api/v3/depth", &[("symbol", symbol.clone()), ("limit", limit.to_string())])
            .await?;

        let snapshot = parse_depth_snapshot(&data)?;
        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Depth snapshot fetched"
        );
        Ok(snapshot)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn get_stats(&self) -> RestClientStats {
        self.stats.lock().clone()
    }
}
