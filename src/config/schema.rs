//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.
//! KEK material is never part of the config file; it is read from the
//! environment by key version (see `secrets::KekSource`).

use serde::{Deserialize, Serialize};

/// Root configuration for the CORS proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Outbound fetch configuration.
    pub upstream: UpstreamConfig,

    /// Request/response limits and SSRF policy.
    pub security: SecurityConfig,

    /// Subscription plans mapping product ids to rpm tiers.
    pub plans: Vec<PlanConfig>,

    /// Free tier allowances.
    pub free_tier: FreeTierConfig,

    /// Caller origins treated as local/dev traffic.
    pub local_origins: LocalOriginConfig,

    /// Usage metering configuration.
    pub usage: UsageConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Homepage used for the bare-root redirect.
    pub homepage_url: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Outbound fetch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Absolute timeout for the whole upstream fetch in seconds.
    pub timeout_secs: u64,

    /// Maximum redirect hops to follow.
    pub max_redirects: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_redirects: 10,
        }
    }
}

/// Request/response limits and SSRF policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject requests whose Content-Length exceeds this (bytes).
    pub max_payload_bytes: u64,

    /// Hard server-side body cap (bytes).
    pub max_body_bytes: usize,

    /// Maximum buffered JSONP response size (bytes).
    pub max_jsonp_bytes: usize,

    /// Refuse to dial unspecified/loopback/link-local/private/reserved
    /// addresses. Disable only for self-host deployments that proxy to
    /// internal services.
    pub block_private_networks: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 5 * 1024 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
            max_jsonp_bytes: 3 * 1024 * 1024,
            block_private_networks: true,
        }
    }
}

/// A subscription plan and its requests-per-minute tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanConfig {
    /// Billing product id.
    pub id: String,

    /// Plan name for logging.
    pub name: String,

    /// Requests per minute granted by this plan.
    pub rpm: u32,
}

/// Free tier allowances, evaluated per UTC month.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FreeTierConfig {
    /// Monthly request allowance.
    pub req_count: u64,

    /// Monthly byte allowance.
    pub bytes: u64,

    /// Requests per minute for free tier traffic.
    pub rpm: u32,
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            req_count: 500,
            bytes: 50_000_000,
            rpm: 60,
        }
    }
}

/// Origins exempt from tenant resolution (dev traffic, first-party apps).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalOriginConfig {
    /// Exact additional origins treated as local (e.g. the dashboard).
    pub first_party: Vec<String>,

    /// Requests per minute for local traffic, keyed by caller IP.
    pub rpm: u32,
}

impl Default for LocalOriginConfig {
    fn default() -> Self {
        Self {
            first_party: Vec::new(),
            rpm: 60,
        }
    }
}

/// Usage metering configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Flush the event buffer after this many seconds.
    pub flush_interval_secs: u64,

    /// Flush the event buffer once it holds this many events.
    pub max_batch_size: usize,

    /// Enable the shared cache-hit dedup marker path.
    pub cache_dedup: bool,

    /// Marker TTL in seconds.
    pub marker_ttl_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            max_batch_size: 300,
            cache_dedup: true,
            marker_ttl_secs: 2 * 60 * 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            upstream: UpstreamConfig::default(),
            security: SecurityConfig::default(),
            plans: Vec::new(),
            free_tier: FreeTierConfig::default(),
            local_origins: LocalOriginConfig::default(),
            usage: UsageConfig::default(),
            observability: ObservabilityConfig::default(),
            homepage_url: "https://corsgate.dev".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Look up the rpm tier for a billing product id. Unknown products fall
    /// back to the lowest tier.
    pub fn rpm_for_product(&self, product_id: &str) -> u32 {
        self.plans
            .iter()
            .find(|p| p.id == product_id)
            .map(|p| p.rpm)
            .unwrap_or(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_product_falls_back_to_lowest_tier() {
        let mut config = ProxyConfig::default();
        config.plans = vec![
            PlanConfig {
                id: "growth".into(),
                name: "growth".into(),
                rpm: 150,
            },
            PlanConfig {
                id: "scale".into(),
                name: "scale".into(),
                rpm: 300,
            },
        ];

        assert_eq!(config.rpm_for_product("growth"), 150);
        assert_eq!(config.rpm_for_product("scale"), 300);
        assert_eq!(config.rpm_for_product("nope"), 60);
    }
}
