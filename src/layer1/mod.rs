// Layer 1 - Data Connectors for the Binance spot market-data feed

pub mod websocket;
pub mod rest_client;

// Re-export commonly used items for convenience
pub use websocket::{FeedConnector, FeedEvent, FeedMessage, SharedStreamStats, StreamHandle, StreamStats};
pub use rest_client::{BinanceRestClient, RestClientError, RestClientStats};
