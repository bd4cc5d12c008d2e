//! Startup wiring.
//!
//! Every cache, store handle, and background task hangs off an explicit
//! `AppContext`. Construction spawns the background tasks; `shutdown`
//! tears them down in order, draining buffered usage last.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::secrets::{KekSource, SecretVault};
use crate::security::{QuotaGate, RateLimiter};
use crate::store::{ConfigStore, InvalidationBus, SharedState};
use crate::tenant::{spawn_invalidation_listener, SubscriptionService, TenantResolver};
use crate::upstream::Dispatcher;
use crate::usage::{UsageAggregator, UsageRecorder};

use super::Shutdown;

/// Everything a request handler needs, built once at startup.
pub struct AppContext {
    pub config: ProxyConfig,
    pub resolver: Arc<TenantResolver>,
    pub subscriptions: SubscriptionService,
    pub vault: SecretVault,
    pub limiter: RateLimiter,
    pub quota: QuotaGate,
    pub usage: UsageRecorder,
    pub dispatcher: Dispatcher,
    pub shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    pub fn build(
        config: ProxyConfig,
        store: Arc<dyn ConfigStore>,
        shared: Arc<dyn SharedState>,
        bus: Arc<dyn InvalidationBus>,
        kek: Arc<dyn KekSource>,
    ) -> Arc<Self> {
        let shutdown = Shutdown::new();

        let resolver = Arc::new(TenantResolver::new(store.clone()));
        let listener = spawn_invalidation_listener(bus, resolver.clone(), &shutdown);

        let (usage_tx, aggregator) =
            UsageAggregator::spawn(store.clone(), config.usage.clone(), &shutdown);
        let usage = UsageRecorder::new(usage_tx, shared.clone(), config.usage.clone());

        Arc::new(Self {
            resolver,
            subscriptions: SubscriptionService::new(store.clone()),
            vault: SecretVault::new(store.clone(), kek),
            limiter: RateLimiter::new(shared),
            quota: QuotaGate::new(store, config.free_tier.clone()),
            usage,
            dispatcher: Dispatcher::new(&config.upstream, &config.security),
            shutdown,
            tasks: Mutex::new(vec![listener, aggregator]),
            config,
        })
    }

    /// Signal every background task and wait for them to finish. The
    /// usage aggregator drains its buffer before exiting, so this must
    /// run after the listener has stopped accepting requests.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "background task panicked during shutdown");
            }
        }
        tracing::info!("all background tasks stopped");
    }
}
