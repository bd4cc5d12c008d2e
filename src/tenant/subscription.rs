//! Subscription lookup with caching.
//!
//! Billing state changes far less often than tenant config, so it gets a
//! longer TTL than the tenant cache.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::ProxyError;
use crate::store::{ConfigStore, Subscription};

pub struct SubscriptionService {
    store: Arc<dyn ConfigStore>,
    cache: Cache<String, Option<Arc<Subscription>>>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(5 * 60))
                .build(),
        }
    }

    /// The user's active subscription, if any. Absence is cached too: a
    /// free-tier user would otherwise query the store on every request.
    pub async fn active_for(&self, user_id: &str) -> Result<Option<Arc<Subscription>>, ProxyError> {
        let store = self.store.clone();
        let key = user_id.to_string();
        self.cache
            .try_get_with(key.clone(), async move {
                store
                    .active_subscription(&key)
                    .await
                    .map(|sub| sub.map(Arc::new))
            })
            .await
            .map_err(|err| ProxyError::Unknown(format!("subscription lookup failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn returns_active_subscription() {
        let store = Arc::new(MemoryStore::new());
        store.insert_subscription(Subscription {
            user_id: "user-1".into(),
            product_id: "growth".into(),
            active: true,
        });
        let service = SubscriptionService::new(store);

        let sub = service.active_for("user-1").await.unwrap().unwrap();
        assert_eq!(sub.product_id, "growth");
    }

    #[tokio::test]
    async fn inactive_subscription_is_none() {
        let store = Arc::new(MemoryStore::new());
        store.insert_subscription(Subscription {
            user_id: "user-1".into(),
            product_id: "growth".into(),
            active: false,
        });
        let service = SubscriptionService::new(store);
        assert!(service.active_for("user-1").await.unwrap().is_none());
    }
}
