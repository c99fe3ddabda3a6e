use accnotify_core::store::MessageStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Unix-ms cutoff for messages older than `days`.
pub fn retention_cutoff(days: u32, now_ms: i64) -> i64 {
    now_ms - ChronoDuration::days(i64::from(days)).num_milliseconds()
}

pub async fn prune(store: &MessageStore, days: u32) -> anyhow::Result<u64> {
    let cutoff = retention_cutoff(days, Utc::now().timestamp_millis());
    let removed = store.delete_older_than(cutoff).await?;
    if removed > 0 {
        info!(removed, days, "pruned old messages");
    }
    Ok(removed)
}

pub fn spawn_retention_loop(
    store: MessageStore,
    days: u32,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(err) = prune(&store, days).await {
                warn!(error = %err, "message retention failed");
            }
        }
    })
}
