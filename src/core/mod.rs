// Core Module - Foundational types, config, logging

pub mod types;
pub mod config;
pub mod logger;

pub use types::*;
pub use config::{ConfigError, ConfigManager, FeedConfig, MonitoringConfig, MAX_SNAPSHOT_LIMIT};
pub use logger::setup_logging;
