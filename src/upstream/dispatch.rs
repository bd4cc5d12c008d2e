//! Target fetch with per-hop address vetting.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use reqwest::redirect::Policy;
use tokio::time::Instant;
use url::Url;

use crate::config::schema::{SecurityConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::security::ssrf;

pub struct Dispatcher {
    timeout: Duration,
    max_redirects: u32,
    block_private: bool,
}

impl Dispatcher {
    pub fn new(upstream: &UpstreamConfig, security: &SecurityConfig) -> Self {
        Self {
            timeout: Duration::from_secs(upstream.timeout_secs),
            max_redirects: upstream.max_redirects,
            block_private: security.block_private_networks,
        }
    }

    /// Fetch `url`, following redirects manually so each hop is resolved
    /// and vetted before it is dialed. The timeout is a single deadline
    /// across all hops.
    pub async fn dispatch(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, ProxyError> {
        let deadline = Instant::now() + self.timeout;
        let mut method = method;
        let mut url = url;
        let mut body = body;

        for _hop in 0..=self.max_redirects {
            let (host, addrs) = self.resolve_and_check(&url).await?;

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ProxyError::UpstreamTimeout)?;

            // Pinning the vetted addresses onto the client closes the gap
            // between our lookup and the client's own resolution.
            let client = reqwest::Client::builder()
                .redirect(Policy::none())
                .resolve_to_addrs(&host, &addrs)
                .build()
                .map_err(|err| ProxyError::UpstreamFetch(err.to_string()))?;

            let mut request = client
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .timeout(remaining);
            if let Some(ref bytes) = body {
                request = request.body(bytes.clone());
            }

            let response = request.send().await.map_err(classify)?;

            let status = response.status();
            if !status.is_redirection() {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(axum::http::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };

            url = url
                .join(location)
                .map_err(|_| ProxyError::UpstreamFetch("invalid redirect location".into()))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ProxyError::UpstreamFetch(
                    "redirect to non-http scheme".into(),
                ));
            }
            if downgrade_to_get(status.as_u16(), &method) {
                method = Method::GET;
                body = None;
            }
        }

        Err(ProxyError::UpstreamFetch("too many redirects".into()))
    }

    /// Resolve the URL host and refuse non-routable destinations.
    pub async fn resolve_and_check(
        &self,
        url: &Url,
    ) -> Result<(String, Vec<SocketAddr>), ProxyError> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidTarget(url.to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|_| ProxyError::UpstreamNotFound)?
            .collect();
        if addrs.is_empty() {
            return Err(ProxyError::UpstreamNotFound);
        }

        if self.block_private {
            for addr in &addrs {
                if let Some(range) = ssrf::blocked_range(&addr.ip()) {
                    tracing::warn!(%host, ip = %addr.ip(), ?range, "refusing non-routable target");
                    return Err(ProxyError::BlockedTarget);
                }
            }
        }

        Ok((host, addrs))
    }
}

/// Whether a redirect status rewrites the method to GET, per the fetch
/// algorithm: 303 always, 301/302 only for POST.
fn downgrade_to_get(status: u16, method: &Method) -> bool {
    match status {
        303 => true,
        301 | 302 => *method == Method::POST,
        _ => false,
    }
}

pub(crate) fn classify(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout
    } else {
        ProxyError::UpstreamFetch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(block_private: bool) -> Dispatcher {
        Dispatcher::new(
            &UpstreamConfig::default(),
            &SecurityConfig {
                block_private_networks: block_private,
                ..SecurityConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn loopback_target_is_blocked() {
        let url = Url::parse("http://127.0.0.1:9/health").unwrap();
        let err = dispatcher(true).resolve_and_check(&url).await.unwrap_err();
        assert!(matches!(err, ProxyError::BlockedTarget));
    }

    #[tokio::test]
    async fn private_range_target_is_blocked() {
        let url = Url::parse("https://10.1.2.3/").unwrap();
        let err = dispatcher(true).resolve_and_check(&url).await.unwrap_err();
        assert!(matches!(err, ProxyError::BlockedTarget));
    }

    #[tokio::test]
    async fn blocking_can_be_disabled_for_self_host() {
        let url = Url::parse("http://127.0.0.1:9/health").unwrap();
        let (host, addrs) = dispatcher(false).resolve_and_check(&url).await.unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(addrs[0].port(), 9);
    }

    #[test]
    fn redirect_method_rules() {
        assert!(downgrade_to_get(303, &Method::GET));
        assert!(downgrade_to_get(303, &Method::PUT));
        assert!(downgrade_to_get(301, &Method::POST));
        assert!(!downgrade_to_get(301, &Method::PUT));
        assert!(!downgrade_to_get(307, &Method::POST));
        assert!(!downgrade_to_get(308, &Method::POST));
    }
}
