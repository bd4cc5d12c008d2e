//! Free-tier monthly quota gate.
//!
//! Tenants without an active paid subscription are capped on cumulative
//! request count and bytes per UTC month. Month-to-date sums are cached
//! briefly so the gate does not cost a store round-trip per request.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::config::schema::FreeTierConfig;
use crate::error::ProxyError;
use crate::store::{ConfigStore, UsageTotals};

pub struct QuotaGate {
    store: Arc<dyn ConfigStore>,
    totals: Cache<String, UsageTotals>,
    limits: FreeTierConfig,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn ConfigStore>, limits: FreeTierConfig) -> Self {
        Self {
            store,
            totals: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
            limits,
        }
    }

    /// Reject when either monthly allowance is already spent.
    pub async fn check(&self, user_id: &str) -> Result<(), ProxyError> {
        let store = self.store.clone();
        let key = user_id.to_string();
        let totals = self
            .totals
            .try_get_with(key.clone(), async move {
                store.month_to_date_usage(&key).await
            })
            .await
            .map_err(|err| ProxyError::Unknown(format!("quota lookup failed: {err}")))?;

        if totals.req_count >= self.limits.req_count || totals.bytes >= self.limits.bytes {
            return Err(ProxyError::QuotaExceeded);
        }
        Ok(())
    }
}
