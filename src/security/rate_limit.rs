//! Hybrid local/shared rate limiting.
//!
//! Each proxy process keeps a fixed-window counter per key. Every
//! `SYNC_THRESHOLD`th local consumption also consumes that many points
//! against the shared deployment-wide counter; if the shared counter
//! reports exhaustion, the local window is overwritten with the shared
//! state and the request is rejected. Shared-store calls are thereby
//! bounded to 1-in-N while cross-process drift stays below N requests.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::store::{SharedCount, SharedState};

const SYNC_THRESHOLD: u32 = 10;
const WINDOW: Duration = Duration::from_secs(60);

/// Whether a key participates in cross-process reconciliation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitScope {
    /// Local counter only (IP-keyed and lowest-tier traffic).
    Local,
    /// Local counter reconciled against the shared counter.
    Shared,
}

/// Outcome of one consumption, also the source of the X-RateLimit headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub used: u32,
    /// Window reset time, epoch milliseconds.
    pub reset_at_ms: u64,
}

impl RateLimitDecision {
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("x-ratelimit-limit".into(), self.limit.to_string()),
            ("x-ratelimit-remaining".into(), self.remaining.to_string()),
            ("x-ratelimit-used".into(), self.used.to_string()),
            ("x-ratelimit-reset".into(), self.reset_at_ms.to_string()),
        ]
    }
}

/// Snapshot of one key's fixed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowState {
    pub consumed: u32,
    pub reset_at_ms: u64,
}

/// Fold the shared counter's view into the local window. The shared state
/// wins: it has seen consumption from every process.
pub fn reconcile(_local: WindowState, shared: SharedCount, now_ms: u64) -> WindowState {
    WindowState {
        consumed: shared.consumed,
        reset_at_ms: now_ms + shared.ms_before_reset,
    }
}

/// Hybrid rate limiter service, one per process.
pub struct RateLimiter {
    windows: DashMap<String, WindowState>,
    shared: Arc<dyn SharedState>,
}

impl RateLimiter {
    pub fn new(shared: Arc<dyn SharedState>) -> Self {
        Self {
            windows: DashMap::new(),
            shared,
        }
    }

    /// Consume one point for `key` under the given rpm tier.
    pub async fn consume(&self, key: &str, rpm: u32, scope: LimitScope) -> RateLimitDecision {
        let now_ms = epoch_ms();

        // The entry guard is dropped before any await point.
        let local = {
            let mut window = self.windows.entry(key.to_string()).or_insert(WindowState {
                consumed: 0,
                reset_at_ms: now_ms + WINDOW.as_millis() as u64,
            });
            if now_ms >= window.reset_at_ms {
                window.consumed = 0;
                window.reset_at_ms = now_ms + WINDOW.as_millis() as u64;
            }
            window.consumed += 1;
            *window
        };

        let mut state = local;

        if scope == LimitScope::Shared && local.consumed % SYNC_THRESHOLD == 0 {
            let bucket = format!("rpm{rpm}");
            match self
                .shared
                .counter_consume(&bucket, key, SYNC_THRESHOLD, rpm, WINDOW)
                .await
            {
                Ok(shared) => {
                    state = reconcile(local, shared, now_ms);
                    if let Some(mut window) = self.windows.get_mut(key) {
                        *window = state;
                    }
                }
                Err(err) => {
                    // Availability over strictness: fall back to the local
                    // decision when the shared store is unreachable.
                    tracing::error!(error = %err, key, "shared rate limit store unavailable");
                }
            }
        }

        decision_from(state, rpm)
    }
}

fn decision_from(state: WindowState, rpm: u32) -> RateLimitDecision {
    RateLimitDecision {
        allowed: state.consumed <= rpm,
        limit: rpm,
        remaining: rpm.saturating_sub(state.consumed),
        used: state.consumed,
        reset_at_ms: state.reset_at_ms,
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySharedState;

    fn limiter() -> (RateLimiter, Arc<MemorySharedState>) {
        let shared = Arc::new(MemorySharedState::new());
        (RateLimiter::new(shared.clone()), shared)
    }

    #[tokio::test]
    async fn local_window_rejects_past_limit() {
        let (limiter, _) = limiter();

        for i in 1..=5 {
            let decision = limiter.consume("ip:1.2.3.4", 5, LimitScope::Local).await;
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.used, i);
        }
        let decision = limiter.consume("ip:1.2.3.4", 5, LimitScope::Local).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn remaining_is_monotonically_non_increasing() {
        let (limiter, _) = limiter();
        let mut last = u32::MAX;
        for _ in 0..10 {
            let decision = limiter.consume("k", 8, LimitScope::Local).await;
            assert!(decision.remaining <= last);
            last = decision.remaining;
        }
    }

    #[tokio::test]
    async fn shared_exhaustion_propagates_across_processes() {
        let shared = Arc::new(MemorySharedState::new());
        let a = RateLimiter::new(shared.clone());
        let b = RateLimiter::new(shared.clone());

        // Process A burns through 20 local consumptions under a 20 rpm
        // tier, syncing 10 shared points at 10 and 20.
        for _ in 0..20 {
            a.consume("user-1", 20, LimitScope::Shared).await;
        }

        // Process B has an empty local window, but its first sync (at its
        // own 10th consumption) sees the shared counter at 30 and rejects.
        let mut rejected = false;
        for _ in 0..10 {
            let decision = b.consume("user-1", 20, LimitScope::Shared).await;
            rejected = !decision.allowed;
        }
        assert!(rejected, "shared state must override the local window");
    }

    #[tokio::test]
    async fn shared_sync_happens_once_per_threshold() {
        let (limiter, shared) = limiter();

        for _ in 0..9 {
            limiter.consume("user-2", 100, LimitScope::Shared).await;
        }
        // Nothing synced yet: the shared counter starts fresh for another
        // consumer, so a 10-point consume lands at exactly 10.
        let probe = shared
            .counter_consume("rpm100", "user-2", 10, 100, WINDOW)
            .await
            .unwrap();
        assert_eq!(probe.consumed, 10);
    }

    #[test]
    fn reconcile_adopts_shared_view() {
        let local = WindowState {
            consumed: 10,
            reset_at_ms: 1_000,
        };
        let shared = SharedCount {
            consumed: 160,
            ms_before_reset: 30_000,
            exceeded: true,
        };
        let merged = reconcile(local, shared, 5_000);
        assert_eq!(merged.consumed, 160);
        assert_eq!(merged.reset_at_ms, 35_000);
    }
}
