//! Event buffering and batched flushing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::schema::UsageConfig;
use crate::lifecycle::Shutdown;
use crate::store::{ConfigStore, UsageDelta};

/// One proxied request's worth of usage.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub user_id: String,
    pub origin: String,
    pub day_epoch_ms: i64,
    pub count: u64,
    pub bytes: u64,
}

/// Background consumer of usage events.
///
/// Flushes when the buffer reaches `max_batch_size` or when the flush
/// interval elapses, whichever comes first. On shutdown it drains the
/// channel and flushes everything before the task exits, so a redeploy
/// never drops usage silently.
pub struct UsageAggregator;

impl UsageAggregator {
    pub fn spawn(
        store: Arc<dyn ConfigStore>,
        config: UsageConfig,
        shutdown: &Shutdown,
    ) -> (mpsc::UnboundedSender<UsageEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stop = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut rx = rx;
            let mut buffer: Vec<UsageEvent> = Vec::new();
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.flush_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately

            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                buffer.push(event);
                                if buffer.len() >= config.max_batch_size {
                                    flush(&store, &mut buffer).await;
                                    ticker.reset();
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        flush(&store, &mut buffer).await;
                    }
                    _ = stop.recv() => break,
                }
            }

            // Drain whatever arrived before the channel closed or the
            // shutdown signal fired.
            while let Ok(event) = rx.try_recv() {
                buffer.push(event);
                if buffer.len() >= config.max_batch_size {
                    flush(&store, &mut buffer).await;
                }
            }
            flush(&store, &mut buffer).await;
            tracing::info!("usage aggregator drained");
        });

        (tx, handle)
    }
}

async fn flush(store: &Arc<dyn ConfigStore>, buffer: &mut Vec<UsageEvent>) {
    if buffer.is_empty() {
        return;
    }
    let events = buffer.len();
    let batch = merge(std::mem::take(buffer));

    match store.increment_usage(&batch).await {
        Ok(()) => {
            tracing::debug!(
                events,
                rows = batch.len(),
                "flushed aggregated usage batch"
            );
        }
        Err(err) => {
            // Metering must never affect proxied traffic; drop and log.
            tracing::error!(error = %err, events, "failed to flush usage batch");
        }
    }
}

/// Merge same-(user, origin, day) events by summing counts and bytes.
pub fn merge(events: Vec<UsageEvent>) -> Vec<UsageDelta> {
    let mut merged: HashMap<(String, String, i64), (u64, u64)> = HashMap::new();
    for event in events {
        let entry = merged
            .entry((event.user_id, event.origin, event.day_epoch_ms))
            .or_insert((0, 0));
        entry.0 += event.count;
        entry.1 += event.bytes;
    }
    merged
        .into_iter()
        .map(|((user_id, origin, day_epoch_ms), (req_count, bytes))| UsageDelta {
            user_id,
            origin,
            day_epoch_ms,
            req_count,
            bytes,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{today_epoch_ms, MemoryStore};

    fn event(user: &str, bytes: u64) -> UsageEvent {
        UsageEvent {
            user_id: user.into(),
            origin: "https://shop.example".into(),
            day_epoch_ms: today_epoch_ms(),
            count: 1,
            bytes,
        }
    }

    #[test]
    fn merge_sums_per_key() {
        let day = today_epoch_ms();
        let events = vec![event("u1", 10), event("u1", 20), event("u2", 5)];
        let mut batch = merge(events);
        batch.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].req_count, 2);
        assert_eq!(batch[0].bytes, 30);
        assert_eq!(batch[0].day_epoch_ms, day);
        assert_eq!(batch[1].req_count, 1);
    }

    #[tokio::test]
    async fn count_threshold_splits_into_two_batches() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = Shutdown::new();
        let config = UsageConfig {
            flush_interval_secs: 3600,
            max_batch_size: 300,
            cache_dedup: false,
            marker_ttl_secs: 60,
        };
        let (tx, handle) = UsageAggregator::spawn(store.clone(), config, &shutdown);

        for i in 0..350 {
            tx.send(event(&format!("user-{}", i % 7), 1)).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        // 300 events flush on the count threshold, the remaining 50 on
        // drain; every event is accounted for.
        assert_eq!(store.usage_batch_sizes(), vec![7, 7]);
        let day = today_epoch_ms();
        let total: u64 = (0..7)
            .map(|i| store.usage_for(&format!("user-{i}"), "https://shop.example", day).0)
            .sum();
        assert_eq!(total, 350);
    }

    #[tokio::test]
    async fn shutdown_signal_drains_pending_events() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = Shutdown::new();
        let config = UsageConfig {
            flush_interval_secs: 3600,
            max_batch_size: 300,
            cache_dedup: false,
            marker_ttl_secs: 60,
        };
        let (tx, handle) = UsageAggregator::spawn(store.clone(), config, &shutdown);

        for _ in 0..42 {
            tx.send(event("user-1", 2)).unwrap();
        }
        shutdown.trigger();
        handle.await.unwrap();

        let day = today_epoch_ms();
        let (req, bytes) = store.usage_for("user-1", "https://shop.example", day);
        assert_eq!(req, 42);
        assert_eq!(bytes, 84);
    }
}
