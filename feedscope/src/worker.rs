use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use common::FeedSource;

use crate::feed_store::FeedStore;

/// Counters of one worker cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub refreshed: usize,
    pub added: usize,
    pub failed: usize,
    pub new_items: usize,
}

/// Refresh every configured feed once, subscribing to the ones not yet
/// known. Feeds are handled one after another and a failing feed does not
/// stop the rest.
pub async fn run_cycle(store: &FeedStore, feed_source: &dyn FeedSource) -> CycleReport {
    let mut report = CycleReport::default();
    let configs = match feed_source.feed_configs().await {
        Ok(configs) => configs,
        Err(e) => {
            error!("worker: failed to load feed list: {:#}", e);
            return report;
        }
    };
    info!("worker: {} feeds configured", configs.len());

    for config in configs {
        match store.get_feed_from_url(&config.url).await {
            Some(feed) => match store.refresh_feed(&feed.id).await {
                Ok(items) => {
                    report.refreshed += 1;
                    report.new_items += items.len();
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("worker: refresh of {} failed: {}", config.url, e);
                }
            },
            None => match store.add_feed(&config.url).await {
                Ok(feed) => {
                    report.added += 1;
                    info!("worker: subscribed to '{}' ({})", feed.title, config.url);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("worker: could not add {}: {}", config.url, e);
                }
            },
        }
    }

    info!(
        refreshed = report.refreshed,
        added = report.added,
        failed = report.failed,
        new_items = report.new_items,
        "worker: cycle finished"
    );
    report
}

/// Run cycles every `interval` until `shutdown` is notified. The signal is
/// only observed between cycles, so a running cycle always completes.
pub async fn run_worker(
    store: Arc<FeedStore>,
    feed_source: Arc<dyn FeedSource>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    info!("worker: starting, interval {:?}", interval);
    loop {
        run_cycle(&store, feed_source.as_ref()).await;

        select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.notified() => {
                info!("worker: shutdown requested");
                break;
            }
        }
    }
}
