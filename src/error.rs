//! Request error taxonomy and HTTP mapping.
//!
//! Every stage of the pipeline short-circuits by returning a `ProxyError`;
//! the conversion to an HTTP response lives here so status codes and
//! client-facing bodies stay in one place. Store and metering failures are
//! logged where they happen and never reach the caller.

use axum::body::Body;
use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::security::rate_limit::RateLimitDecision;
use crate::store::StoreError;

pub const ROBOTS_HEADER: (&str, &str) = ("x-robots-tag", "noindex, nofollow");

const DOCS_API: &str = "https://corsgate.dev/docs/cors-proxy/api";
const DOCS_APPLICATION: &str = "https://corsgate.dev/docs/dashboard/application";
const DOCS_THROUGHPUT: &str = "https://corsgate.dev/docs/cors-proxy/throughput";
const DOCS_BILLING: &str = "https://app.corsgate.dev/billing";

/// Errors that terminate a proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing or invalid Origin header")]
    InvalidOrigin,

    #[error("missing or invalid Referer header on a JSONP request")]
    InvalidReferer,

    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("request payload too large")]
    PayloadTooLarge,

    #[error("response body too large for JSONP")]
    JsonpTooLarge,

    #[error("no application registered for this origin")]
    NoTenant,

    #[error("target domain not in the application allow-list")]
    TargetNotAllowed,

    #[error("free tier quota exceeded")]
    QuotaExceeded,

    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),

    #[error("target address is not routable from this proxy")]
    BlockedTarget,

    #[error("timeout fetching the target URL")]
    UpstreamTimeout,

    #[error("target URL not found")]
    UpstreamNotFound,

    #[error("unable to reach target URL: {0}")]
    UpstreamFetch(String),

    #[error("secret decryption failed: {0}")]
    Decryption(String),

    #[error("internal error: {0}")]
    Unknown(String),
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        ProxyError::Unknown(format!("store failure: {err}"))
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidOrigin
            | ProxyError::InvalidReferer
            | ProxyError::InvalidTarget(_)
            | ProxyError::BlockedTarget => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge | ProxyError::JsonpTooLarge => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ProxyError::NoTenant | ProxyError::TargetNotAllowed | ProxyError::QuotaExceeded => {
                StatusCode::FORBIDDEN
            }
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamNotFound => StatusCode::NOT_FOUND,
            ProxyError::UpstreamFetch(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Decryption(_) | ProxyError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing body. Opaque for server-side failures.
    fn body(&self) -> String {
        match self {
            ProxyError::InvalidOrigin => format!(
                "Corsgate: Origin header not found. Check the documentation for CORS proxy API usage. ({DOCS_API})"
            ),
            ProxyError::InvalidReferer => format!(
                "Corsgate: Referer header required for JSONP requests. Check the documentation for CORS proxy API usage. ({DOCS_API})"
            ),
            ProxyError::InvalidTarget(_) => format!(
                "Corsgate: Invalid URL provided. Check the documentation for CORS proxy API usage. ({DOCS_API})"
            ),
            ProxyError::PayloadTooLarge => format!(
                "Corsgate: Payload Too Large. Maximum allowed request size is 5MB. ({DOCS_API})"
            ),
            ProxyError::JsonpTooLarge => {
                "Corsgate: Response body too large for JSONP (max 3MB).".to_string()
            }
            ProxyError::NoTenant => format!(
                "Corsgate: No application found for this origin. Check the documentation for adding applications. ({DOCS_APPLICATION})"
            ),
            ProxyError::TargetNotAllowed => format!(
                "Corsgate: Target domain not allowed. Check the documentation for adding allowed domains. ({DOCS_APPLICATION})"
            ),
            ProxyError::QuotaExceeded => format!(
                "Corsgate: Free tier limits reached. Please upgrade to continue using the proxy. ({DOCS_BILLING})"
            ),
            ProxyError::RateLimited(_) => format!(
                "Corsgate: Too Many Requests. Check the documentation for throughput. ({DOCS_THROUGHPUT})"
            ),
            ProxyError::BlockedTarget => "Corsgate: Error.".to_string(),
            ProxyError::UpstreamTimeout => format!(
                "Corsgate: Timeout fetching the target URL. Check documentation for timeout limits. ({DOCS_API})"
            ),
            ProxyError::UpstreamNotFound => "Corsgate: Target URL not found.".to_string(),
            ProxyError::UpstreamFetch(_) => "Corsgate: Unable to reach target URL.".to_string(),
            ProxyError::Decryption(_) | ProxyError::Unknown(_) => {
                "Corsgate: Unknown error occurred.".to_string()
            }
        }
    }

    fn log(&self) {
        match self {
            ProxyError::UpstreamNotFound | ProxyError::UpstreamFetch(_) => {
                tracing::error!(error = %self, "upstream fetch failed");
            }
            ProxyError::Decryption(_) => {
                tracing::error!(error = %self, "secret decryption failed, refusing to forward");
            }
            ProxyError::Unknown(_) => {
                tracing::error!(error = %self, "unhandled proxy error");
            }
            _ => {
                tracing::debug!(error = %self, "request rejected");
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.status();
        let mut response = Response::builder()
            .status(status)
            .body(Body::from(self.body()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

        if status == StatusCode::BAD_REQUEST {
            let (name, value) = ROBOTS_HEADER;
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }

        if let ProxyError::RateLimited(decision) = &self {
            for (name, value) in decision.headers() {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<HeaderName>(),
                    HeaderValue::from_str(&value),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ProxyError::InvalidOrigin.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ProxyError::NoTenant.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(ProxyError::UpstreamNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::UpstreamFetch("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::Decryption("bad tag".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn server_errors_are_opaque() {
        let body = ProxyError::Decryption("aes tag mismatch".into()).body();
        assert!(!body.contains("aes"));
        assert!(body.contains("Unknown error"));
    }
}
