//! In-memory collaborator implementations.
//!
//! Back the self-host binary and the test suite. Counters mirror the
//! semantics the deployed stores provide: atomic increments, fixed-window
//! counting past the limit, TTL'd markers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{
    ConfigStore, InvalidationBus, SecretRecord, SharedCount, SharedState, StoreError,
    Subscription, Tenant, UsageDelta, UsageTotals,
};

/// In-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    tenants: DashMap<String, Tenant>,
    secrets: DashMap<String, Vec<SecretRecord>>,
    subscriptions: DashMap<String, Subscription>,
    usage: DashMap<(String, String, i64), (u64, u64)>,
    tenant_queries: AtomicU64,
    secret_queries: AtomicU64,
    usage_batches: DashMap<u64, usize>,
    batch_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    pub fn insert_secret(&self, secret: SecretRecord) {
        self.secrets
            .entry(secret.application_id.clone())
            .or_default()
            .push(secret);
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.user_id.clone(), subscription);
    }

    /// Seed a usage row directly, for quota tests.
    pub fn seed_usage(&self, user_id: &str, origin: &str, day_epoch_ms: i64, req: u64, bytes: u64) {
        self.usage.insert(
            (user_id.to_string(), origin.to_string(), day_epoch_ms),
            (req, bytes),
        );
    }

    /// How many tenant lookups hit the store (cache-miss counter for tests).
    pub fn tenant_query_count(&self) -> u64 {
        self.tenant_queries.load(Ordering::Relaxed)
    }

    /// How many secret lookups hit the store.
    pub fn secret_query_count(&self) -> u64 {
        self.secret_queries.load(Ordering::Relaxed)
    }

    /// Sizes of the usage batches flushed so far, in flush order.
    pub fn usage_batch_sizes(&self) -> Vec<usize> {
        let mut entries: Vec<(u64, usize)> =
            self.usage_batches.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, n)| n).collect()
    }

    pub fn usage_for(&self, user_id: &str, origin: &str, day_epoch_ms: i64) -> (u64, u64) {
        self.usage
            .get(&(user_id.to_string(), origin.to_string(), day_epoch_ms))
            .map(|e| *e.value())
            .unwrap_or((0, 0))
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn tenant_by_origins(&self, origins: &[String]) -> Result<Option<Tenant>, StoreError> {
        self.tenant_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tenants
            .iter()
            .find(|t| origins.iter().any(|o| t.allowed_origins.contains(o)))
            .map(|t| t.value().clone()))
    }

    async fn secrets_for_application(
        &self,
        application_id: &str,
    ) -> Result<Vec<SecretRecord>, StoreError> {
        self.secret_queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .secrets
            .get(application_id)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn active_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .get(user_id)
            .filter(|s| s.active)
            .map(|s| s.value().clone()))
    }

    async fn increment_usage(&self, batch: &[UsageDelta]) -> Result<(), StoreError> {
        let seq = self.batch_seq.fetch_add(1, Ordering::Relaxed);
        self.usage_batches.insert(seq, batch.len());

        for delta in batch {
            let mut entry = self
                .usage
                .entry((
                    delta.user_id.clone(),
                    delta.origin.clone(),
                    delta.day_epoch_ms,
                ))
                .or_insert((0, 0));
            entry.0 += delta.req_count;
            entry.1 += delta.bytes;
        }
        Ok(())
    }

    async fn month_to_date_usage(&self, user_id: &str) -> Result<UsageTotals, StoreError> {
        let month_start = super::month_start_epoch_ms();
        let mut totals = UsageTotals::default();
        for entry in self.usage.iter() {
            let (uid, _, day) = entry.key();
            if uid == user_id && *day >= month_start {
                totals.req_count += entry.value().0;
                totals.bytes += entry.value().1;
            }
        }
        Ok(totals)
    }
}

struct CounterWindow {
    consumed: u32,
    reset_at: Instant,
}

struct Marker {
    value: String,
    expires_at: Instant,
}

/// In-memory shared counter and marker store.
#[derive(Default)]
pub struct MemorySharedState {
    counters: DashMap<(String, String), CounterWindow>,
    markers: DashMap<String, Marker>,
}

impl MemorySharedState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedState for MemorySharedState {
    async fn counter_consume(
        &self,
        bucket: &str,
        key: &str,
        points: u32,
        limit: u32,
        window: Duration,
    ) -> Result<SharedCount, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry((bucket.to_string(), key.to_string()))
            .or_insert_with(|| CounterWindow {
                consumed: 0,
                reset_at: now + window,
            });

        if now >= entry.reset_at {
            entry.consumed = 0;
            entry.reset_at = now + window;
        }
        entry.consumed += points;

        Ok(SharedCount {
            consumed: entry.consumed,
            ms_before_reset: entry.reset_at.saturating_duration_since(now).as_millis() as u64,
            exceeded: entry.consumed > limit,
        })
    }

    async fn marker_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        if let Some(marker) = self.markers.get(key) {
            if marker.expires_at > now {
                return Ok(Some(marker.value.clone()));
            }
        }
        self.markers.remove(key);
        Ok(None)
    }

    async fn marker_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.markers.insert(
            key.to_string(),
            Marker {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

/// In-memory invalidation channel.
pub struct MemoryBus {
    tx: broadcast::Sender<String>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus for MemoryBus {
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn publish(&self, payload: String) {
        let _ = self.tx.send(payload);
    }
}
