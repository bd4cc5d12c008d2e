//! Tenant cache invalidation listener.
//!
//! The dashboard publishes a JSON array of origin strings whenever an
//! application is created, edited, or deleted. Every proxy process evicts
//! those origins from its local cache; the cache TTL bounds staleness even
//! if a message is lost.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;
use crate::store::InvalidationBus;
use crate::tenant::TenantResolver;

pub fn spawn_invalidation_listener(
    bus: Arc<dyn InvalidationBus>,
    resolver: Arc<TenantResolver>,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    let mut messages = bus.subscribe();
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = messages.recv() => {
                    match message {
                        Ok(payload) => handle_message(&resolver, &payload).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            // Dropped messages only delay eviction until the
                            // cache TTL expires.
                            tracing::warn!(skipped, "invalidation listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = stop.recv() => break,
            }
        }
        tracing::debug!("invalidation listener stopped");
    })
}

async fn handle_message(resolver: &TenantResolver, payload: &str) {
    match serde_json::from_str::<Vec<String>>(payload) {
        Ok(origins) => {
            tracing::debug!(count = origins.len(), "evicting invalidated origins");
            for origin in &origins {
                resolver.invalidate(origin).await;
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "malformed invalidation message");
        }
    }
}
