//! Request-path entry point for metering.
//!
//! Recording is fire-and-forget: an unbounded channel send plus, for
//! cache-enabled responses, one shared-store round trip. Failures are
//! logged and never surfaced to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::schema::UsageConfig;
use crate::store::{today_epoch_ms, SharedState};
use crate::usage::aggregator::UsageEvent;

/// Attribution stashed in the dedup marker so a later CDN-served hit can
/// still be traced to the tenant that populated the cache.
#[derive(Debug, Serialize, Deserialize)]
struct MarkerData {
    user_id: String,
    bytes: u64,
}

pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<UsageEvent>,
    shared: Arc<dyn SharedState>,
    config: UsageConfig,
}

impl UsageRecorder {
    pub fn new(
        tx: mpsc::UnboundedSender<UsageEvent>,
        shared: Arc<dyn SharedState>,
        config: UsageConfig,
    ) -> Self {
        Self { tx, shared, config }
    }

    /// Queue one request for the aggregator.
    pub fn record(&self, user_id: &str, origin: &str, bytes: u64) {
        let event = UsageEvent {
            user_id: user_id.to_string(),
            origin: origin.to_string(),
            day_epoch_ms: today_epoch_ms(),
            count: 1,
            bytes,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("usage channel closed, event dropped");
        }
    }

    /// Record a completed proxied response.
    ///
    /// When the response was served with public caching enabled, a marker
    /// keyed by (target url, origin) suppresses double counting: the edge
    /// cache will answer repeats of this request, and those repeats reach
    /// us only as preflights. The marker is refreshed on every origin hit
    /// so its attribution stays current.
    pub async fn record_response(
        &self,
        user_id: &str,
        origin: &str,
        target_url: &str,
        bytes: u64,
        cache_enabled: bool,
    ) {
        if !cache_enabled || !self.config.cache_dedup {
            self.record(user_id, origin, bytes);
            return;
        }

        let key = marker_key(target_url, origin);
        let already_counted = match self.shared.marker_get(&key).await {
            Ok(existing) => existing.is_some(),
            Err(err) => {
                tracing::error!(error = %err, "marker lookup failed");
                false
            }
        };

        let data = MarkerData {
            user_id: user_id.to_string(),
            bytes,
        };
        if let Ok(value) = serde_json::to_string(&data) {
            let ttl = Duration::from_secs(self.config.marker_ttl_secs);
            if let Err(err) = self.shared.marker_set(&key, &value, ttl).await {
                tracing::error!(error = %err, "marker write failed");
            }
        }

        if !already_counted {
            self.record(user_id, origin, bytes);
        }
    }

    /// Attribute a cache-hit preflight.
    ///
    /// A preflight for a cache-enabled request means the actual request is
    /// about to be (or was) answered by the edge cache without touching
    /// us. If a marker exists for this (target, origin), count one request
    /// with the marker's recorded size against the marker's user.
    pub async fn attribute_preflight(&self, target_url: &str, origin: &str) {
        if !self.config.cache_dedup {
            return;
        }

        let key = marker_key(target_url, origin);
        match self.shared.marker_get(&key).await {
            Ok(Some(value)) => match serde_json::from_str::<MarkerData>(&value) {
                Ok(data) => self.record(&data.user_id, origin, data.bytes),
                Err(err) => tracing::warn!(error = %err, "malformed dedup marker"),
            },
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "marker lookup failed"),
        }
    }
}

fn marker_key(target_url: &str, origin: &str) -> String {
    format!("metrics|{target_url}|{origin}")
}
