// Order book stream binary
// Loads config, starts logging, runs the feed until Ctrl-C

use std::time::Duration;
use tracing::{debug, error, info};

use orderbook_stream::core::{setup_logging, ConfigManager};
use orderbook_stream::layer2::FeedRuntime;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let manager = ConfigManager::new(config_path.as_deref())?;
    let monitoring = manager.monitoring();
    setup_logging(Some(&monitoring.log_level), monitoring.json_logs);

    if let Err(e) = manager.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let feed = manager.feed();
    info!(symbol = %feed.symbol, ws = %feed.ws_base_url, rest = %feed.rest_base_url, "Starting order book stream");

    let handle = FeedRuntime::spawn(feed)?;
    let mut views = handle.subscribe();
    let mut stats_interval = tokio::time::interval(Duration::from_secs(monitoring.stats_interval_seconds.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                debug!(
                    status = %view.status,
                    connected = view.connected,
                    synchronized = view.synchronized,
                    last_update_id = view.order_book.last_update_id,
                    spread = %view.depth.spread,
                    trades = view.trades.len(),
                    "View updated"
                );
            }
            _ = stats_interval.tick() => {
                info!(stats = %handle.stats(), "Feed stats");
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
