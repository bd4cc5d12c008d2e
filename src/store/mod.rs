//! External collaborator interfaces.
//!
//! The document store, the shared counter/marker store, and the
//! invalidation channel are external systems. The proxy consumes them
//! through these traits; `memory` provides the implementations used by
//! tests and self-host deployments.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::{MemoryBus, MemorySharedState, MemoryStore};

/// Failure talking to a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// A registered caller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub user_id: String,
    /// Origins allowed to call through this tenant. Unique across tenants,
    /// enforced by the administrative layer.
    pub allowed_origins: Vec<String>,
    /// Target patterns the tenant may fetch; `*` permits any target.
    pub target_domains: Vec<String>,
}

impl Tenant {
    /// Substring match against the full target URL, `*` matches anything.
    pub fn allows_target(&self, url: &str) -> bool {
        self.target_domains
            .iter()
            .any(|pattern| pattern == "*" || url.contains(pattern.as_str()))
    }
}

/// Tenant-scoped encrypted secret record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub application_id: String,
    pub name: String,
    /// Secret value, encrypted under the per-secret DEK.
    pub data: EncryptedBlob,
    /// The DEK, encrypted under the versioned KEK.
    pub dek: EncryptedBlob,
    pub kek_version: String,
}

/// AES-256-GCM ciphertext with its nonce and tag, each base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub iv: String,
    pub encrypted: String,
    pub tag: String,
}

/// Billing subscription state, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub product_id: String,
    pub active: bool,
}

/// Additive usage increment for one (user, origin, UTC day).
#[derive(Debug, Clone, PartialEq)]
pub struct UsageDelta {
    pub user_id: String,
    pub origin: String,
    /// UTC midnight of the day being counted, epoch milliseconds.
    pub day_epoch_ms: i64,
    pub req_count: u64,
    pub bytes: u64,
}

/// Month-to-date usage totals for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub req_count: u64,
    pub bytes: u64,
}

/// Outcome of consuming points against the shared counter.
#[derive(Debug, Clone, Copy)]
pub struct SharedCount {
    /// Points consumed in the current window, including this consumption.
    pub consumed: u32,
    /// Milliseconds until the window resets.
    pub ms_before_reset: u64,
    /// Whether the limit was exceeded by this consumption.
    pub exceeded: bool,
}

/// Document store read/write contract.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Find the tenant whose origin set contains any of the given origins.
    async fn tenant_by_origins(&self, origins: &[String]) -> Result<Option<Tenant>, StoreError>;

    /// All secrets belonging to an application.
    async fn secrets_for_application(
        &self,
        application_id: &str,
    ) -> Result<Vec<SecretRecord>, StoreError>;

    /// The active subscription for a user, if any.
    async fn active_subscription(&self, user_id: &str)
        -> Result<Option<Subscription>, StoreError>;

    /// Batched upsert-increment of daily usage rows. Increments are atomic
    /// at the store layer.
    async fn increment_usage(&self, batch: &[UsageDelta]) -> Result<(), StoreError>;

    /// Sum of usage rows for the current UTC month.
    async fn month_to_date_usage(&self, user_id: &str) -> Result<UsageTotals, StoreError>;
}

/// Shared counter and short-TTL marker store (one per deployment).
#[async_trait]
pub trait SharedState: Send + Sync {
    /// Consume `points` against a fixed-window counter. The counter keeps
    /// counting past the limit; `exceeded` reports whether it went over.
    async fn counter_consume(
        &self,
        bucket: &str,
        key: &str,
        points: u32,
        limit: u32,
        window: Duration,
    ) -> Result<SharedCount, StoreError>;

    async fn marker_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn marker_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
}

/// Publish/subscribe channel for tenant cache invalidation. Messages are
/// JSON arrays of origin strings.
pub trait InvalidationBus: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<String>;

    fn publish(&self, payload: String);
}

/// UTC midnight of the current day, epoch milliseconds.
pub fn today_epoch_ms() -> i64 {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default()
}

/// UTC midnight of the first day of the current month, epoch milliseconds.
pub fn month_start_epoch_ms() -> i64 {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default()
}
