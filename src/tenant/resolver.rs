//! Origin-to-tenant resolution with local caching.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::ProxyError;
use crate::store::{ConfigStore, Tenant};

/// Resolves a caller origin to its tenant configuration. Lookups tolerate
/// an explicit `:443` on https origins: the store is queried with both
/// forms and both cache keys are populated.
pub struct TenantResolver {
    store: Arc<dyn ConfigStore>,
    cache: Cache<String, Arc<Tenant>>,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    /// Look up the tenant registered for `origin`. Misses are not
    /// negatively cached; an unregistered origin costs a store query.
    pub async fn resolve(&self, origin: &str) -> Result<Option<Arc<Tenant>>, ProxyError> {
        if let Some(tenant) = self.cache.get(origin).await {
            return Ok(Some(tenant));
        }

        let alternate = alternate_origin(origin);
        let mut query = vec![origin.to_string()];
        if let Some(ref alt) = alternate {
            query.push(alt.clone());
        }

        let Some(tenant) = self.store.tenant_by_origins(&query).await? else {
            return Ok(None);
        };
        let tenant = Arc::new(tenant);

        self.cache.insert(origin.to_string(), tenant.clone()).await;
        if let Some(alt) = alternate {
            self.cache.insert(alt, tenant.clone()).await;
        }
        Ok(Some(tenant))
    }

    /// Drop one origin (and its `:443` alternate) from the cache.
    pub async fn invalidate(&self, origin: &str) {
        self.cache.invalidate(origin).await;
        if let Some(alt) = alternate_origin(origin) {
            self.cache.invalidate(&alt).await;
        }
    }
}

/// `https://x:443` and `https://x` identify the same origin.
fn alternate_origin(origin: &str) -> Option<String> {
    if let Some(stripped) = origin.strip_suffix(":443") {
        Some(stripped.to_string())
    } else if origin.starts_with("https://") && !origin[8..].contains(':') {
        Some(format!("{origin}:443"))
    } else {
        None
    }
}
