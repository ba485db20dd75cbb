// Configuration Management for the order book stream
// Defaults, JSON file overlay, then environment overlay

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Binance caps the REST depth endpoint at this many levels per side
pub const MAX_SNAPSHOT_LIMIT: u32 = 5000;

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub symbol: String,
    pub ws_base_url: String,
    pub rest_base_url: String,

    // Book and log sizing
    pub snapshot_limit: u32,
    pub display_depth: usize,
    pub trade_log_capacity: usize,

    // Connection settings
    pub reconnect_delay_seconds: u64,
    pub max_reconnect_attempts: u32,
    pub request_timeout_seconds: u64,
    pub ws_ping_interval_secs: u64,

    // Synchronizer settings
    pub sync_buffer_capacity: usize,
    /// Wait before re-fetching a snapshot the buffered diffs failed to connect to
    pub snapshot_retry_delay_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: "btcusdt".to_string(),
            ws_base_url: "wss://data-stream.binance.vision".to_string(),
            rest_base_url: "https://api.binance.com".to_string(),
            snapshot_limit: 100,
            display_depth: 15,
            trade_log_capacity: 50,
            reconnect_delay_seconds: 5,
            max_reconnect_attempts: 5,
            request_timeout_seconds: 10,
            ws_ping_interval_secs: 20,
            sync_buffer_capacity: 10_000,
            snapshot_retry_delay_ms: 1_000,
        }
    }
}

impl FeedConfig {
    /// Lower-case symbol as used in stream names
    pub fn stream_symbol(&self) -> String {
        self.symbol.trim().to_lowercase()
    }

    /// Upper-case symbol as used by the REST API
    pub fn rest_symbol(&self) -> String {
        self.symbol.trim().to_uppercase()
    }

    /// Raw stream URL for one `<symbol>@<suffix>` stream
    pub fn stream_url(&self, suffix: &str) -> String {
        format!(
            "{}/ws/{}@{}",
            self.ws_base_url.trim_end_matches('/'),
            self.stream_symbol(),
            suffix
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    pub fn snapshot_retry_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_retry_delay_ms)
    }

    /// Collect every problem with the config rather than stopping at the first
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.symbol.trim().is_empty() {
            errors.push("symbol must not be empty".to_string());
        }
        if self.snapshot_limit == 0 || self.snapshot_limit > MAX_SNAPSHOT_LIMIT {
            errors.push(format!("snapshot_limit must be between 1 and {}", MAX_SNAPSHOT_LIMIT));
        }
        if self.display_depth == 0 {
            errors.push("display_depth must be at least 1".to_string());
        }
        if self.trade_log_capacity == 0 {
            errors.push("trade_log_capacity must be at least 1".to_string());
        }
        if self.sync_buffer_capacity == 0 {
            errors.push("sync_buffer_capacity must be at least 1".to_string());
        }
        if !self.ws_base_url.starts_with("ws://") && !self.ws_base_url.starts_with("wss://") {
            errors.push(format!("ws_base_url must be a ws:// or wss:// URL, got '{}'", self.ws_base_url));
        }

        if errors.is_empty() {
            return Ok(());
        }

        for error in &errors {
            warn!(error = %error, "Config validation error");
        }
        Err(ConfigError::Validation(errors.join("; ")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub stats_interval_seconds: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
            stats_interval_seconds: 30,
        }
    }
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    feed: FeedConfig,
    monitoring: MonitoringConfig,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            feed: FeedConfig::default(),
            monitoring: MonitoringConfig::default(),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!(symbol = %manager.feed.symbol, "Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from a JSON file with "feed" and "monitoring" sections
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(feed_data) = config_data.get("feed") {
            self.feed = serde_json::from_value(feed_data.clone())?;
        }

        if let Some(monitoring_data) = config_data.get("monitoring") {
            self.monitoring = serde_json::from_value(monitoring_data.clone())?;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbol) = lookup("FEED_SYMBOL") {
            self.feed.symbol = symbol;
        }
        if let Some(url) = lookup("FEED_WS_BASE_URL") {
            self.feed.ws_base_url = url;
        }
        if let Some(url) = lookup("FEED_REST_BASE_URL") {
            self.feed.rest_base_url = url;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut config_map = HashMap::new();
        config_map.insert("feed", serde_json::to_value(&self.feed)?);
        config_map.insert("monitoring", serde_json::to_value(&self.monitoring)?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed.validate()?;
        info!("Configuration validated successfully");
        Ok(())
    }

    pub fn feed(&self) -> FeedConfig {
        self.feed.clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let feed = FeedConfig::default();
        assert_eq!(feed.symbol, "btcusdt");
        assert_eq!(feed.snapshot_limit, 100);
        assert_eq!(feed.display_depth, 15);
        assert_eq!(feed.trade_log_capacity, 50);
        assert_eq!(feed.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(feed.max_reconnect_attempts, 5);
        assert_eq!(feed.snapshot_retry_delay(), Duration::from_secs(1));
        assert!(feed.validate().is_ok());
    }

    #[test]
    fn test_stream_urls() {
        let feed = FeedConfig {
            symbol: "ETHUSDT".to_string(),
            ws_base_url: "wss://example.test/".to_string(),
            ..FeedConfig::default()
        };
        assert_eq!(feed.stream_url("depth"), "wss://example.test/ws/ethusdt@depth");
        assert_eq!(feed.rest_symbol(), "ETHUSDT");
    }

    #[test]
    fn test_validation_collects_errors() {
        let feed = FeedConfig {
            symbol: "  ".to_string(),
            display_depth: 0,
            snapshot_limit: 6000,
            ..FeedConfig::default()
        };
        match feed.validate() {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("symbol"));
                assert!(msg.contains("display_depth"));
                assert!(msg.contains("snapshot_limit"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_env_overlay() {
        let mut manager = ConfigManager::new(None).unwrap();
        manager.apply_env(|key| match key {
            "FEED_SYMBOL" => Some("solusdt".to_string()),
            "LOG_LEVEL" => Some("DEBUG".to_string()),
            _ => None,
        });
        assert_eq!(manager.feed().symbol, "solusdt");
        assert_eq!(manager.monitoring().log_level, "DEBUG");
    }

    #[test]
    fn test_file_round_trip_with_partial_sections() {
        let dir = std::env::temp_dir().join(format!("orderbook_stream_cfg_{}", std::process::id()));
        let path = dir.join("config.json");
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, r#"{"feed": {"symbol": "bnbusdt", "display_depth": 10}}"#).unwrap();

        let mut manager = ConfigManager::new(None).unwrap();
        manager.load_from_file(path.to_str().unwrap()).unwrap();
        let feed = manager.feed();
        assert_eq!(feed.symbol, "bnbusdt");
        assert_eq!(feed.display_depth, 10);
        // Missing fields fall back to defaults
        assert_eq!(feed.trade_log_capacity, 50);

        let saved = dir.join("saved").join("config.json");
        manager.save_to_file(saved.to_str().unwrap()).unwrap();
        let reloaded = ConfigManager::new(saved.to_str()).unwrap();
        assert_eq!(reloaded.feed().symbol, "bnbusdt");
        assert_eq!(reloaded.feed().display_depth, 10);
        assert_eq!(reloaded.monitoring().log_level, manager.monitoring().log_level);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let manager = ConfigManager::new(Some("/nonexistent/orderbook_stream.json"));
        assert!(manager.is_ok());
    }
}
