//! Target URL and caller identity extraction.

use std::sync::LazyLock;

use axum::http::{HeaderMap, Uri};
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

use crate::error::ProxyError;

static SCHEME_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://").unwrap_or_else(|_| unreachable!()));

static LOCAL_ORIGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^https?://(localhost|127\.0\.0\.1|192\.168\.\d{1,3}\.\d{1,3}|0\.0\.0\.0)(:\d+)?$",
    )
    .unwrap_or_else(|_| unreachable!())
});

/// The destination plus, for JSONP requests, the callback name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyTarget {
    pub url: Url,
    pub callback: Option<String>,
}

/// How the caller identified itself.
#[derive(Debug, Clone, PartialEq)]
pub enum CallerIdentity {
    /// Ordinary CORS request, identified by the Origin header.
    Cors { origin: String },
    /// Script-tag load; browsers send no Origin, so identity comes from
    /// the Referer origin.
    Jsonp { origin: String },
}

impl CallerIdentity {
    pub fn origin(&self) -> &str {
        match self {
            CallerIdentity::Cors { origin } | CallerIdentity::Jsonp { origin } => origin,
        }
    }
}

/// Extract the destination URL from the request line.
///
/// Precedence: the path itself (`/https://target/...`, with the request
/// query belonging to the target), then a `url` query parameter (where a
/// `callback` sibling marks JSONP), then the whole raw query string.
pub fn extract_target(uri: &Uri) -> Result<ProxyTarget, ProxyError> {
    let path = uri.path();
    let raw_query = uri.query();
    let mut callback = None;

    let input = if path != "/" {
        match raw_query {
            Some(query) => format!("{}?{}", &path[1..], query),
            None => path[1..].to_string(),
        }
    } else {
        let pairs: Vec<(String, String)> =
            url::form_urlencoded::parse(raw_query.unwrap_or_default().as_bytes())
                .into_owned()
                .collect();
        if let Some((_, value)) = pairs.iter().find(|(key, _)| key == "url") {
            callback = pairs
                .iter()
                .find(|(key, _)| key == "callback")
                .map(|(_, value)| value.clone());
            value.clone()
        } else {
            raw_query.unwrap_or_default().to_string()
        }
    };

    Ok(ProxyTarget {
        url: parse_target(&input)?,
        callback,
    })
}

/// Parse a destination string: percent-decoded, defaulted to https://,
/// restricted to http(s) toward a dotted hostname.
fn parse_target(input: &str) -> Result<Url, ProxyError> {
    if input.is_empty() {
        return Err(ProxyError::InvalidTarget(input.to_string()));
    }

    let decoded = percent_decode_str(input)
        .decode_utf8()
        .map_err(|_| ProxyError::InvalidTarget(input.to_string()))?;
    let with_scheme = if SCHEME_PREFIX.is_match(&decoded) {
        decoded.into_owned()
    } else {
        format!("https://{decoded}")
    };

    let url =
        Url::parse(&with_scheme).map_err(|_| ProxyError::InvalidTarget(input.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::InvalidTarget(input.to_string()));
    }
    let dotted_host = url.host_str().is_some_and(|host| host.contains('.'));
    if !dotted_host {
        return Err(ProxyError::InvalidTarget(input.to_string()));
    }
    Ok(url)
}

/// Derive the caller's identity.
///
/// A `callback` parameter combined with `Sec-Fetch-Dest: script` marks a
/// JSONP request, whose identity is the Referer's origin. Everything else
/// must send a parseable Origin header.
pub fn caller_identity(
    headers: &HeaderMap,
    target: &ProxyTarget,
) -> Result<CallerIdentity, ProxyError> {
    let script_dest = headers
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("script"));

    if target.callback.is_some() && script_dest {
        let referer = headers
            .get(axum::http::header::REFERER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ProxyError::InvalidReferer)?;
        let url = Url::parse(referer).map_err(|_| ProxyError::InvalidReferer)?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(ProxyError::InvalidReferer);
        }
        return Ok(CallerIdentity::Jsonp {
            origin: origin.ascii_serialization(),
        });
    }

    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::InvalidOrigin)?;
    Url::parse(origin).map_err(|_| ProxyError::InvalidOrigin)?;
    Ok(CallerIdentity::Cors {
        origin: origin.to_string(),
    })
}

/// Whether an origin is local/dev traffic or a first-party surface.
pub fn is_local_origin(origin: &str, first_party: &[String]) -> bool {
    LOCAL_ORIGIN.is_match(origin) || first_party.iter().any(|o| o == origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn target_in_path_keeps_its_query() {
        let target = extract_target(&uri("/https://api.example.com/data?x=1&y=2")).unwrap();
        assert_eq!(
            target.url.as_str(),
            "https://api.example.com/data?x=1&y=2"
        );
        assert!(target.callback.is_none());
    }

    #[test]
    fn url_parameter_with_callback_is_jsonp() {
        let target =
            extract_target(&uri("/?url=https%3A%2F%2Fapi.example.com%2Fd&callback=cb")).unwrap();
        assert_eq!(target.url.as_str(), "https://api.example.com/d");
        assert_eq!(target.callback.as_deref(), Some("cb"));
    }

    #[test]
    fn raw_query_string_is_the_target() {
        let target = extract_target(&uri("/?https://api.example.com/data")).unwrap();
        assert_eq!(target.url.as_str(), "https://api.example.com/data");
    }

    #[test]
    fn missing_scheme_defaults_to_https() {
        let target = extract_target(&uri("/api.example.com/data")).unwrap();
        assert_eq!(target.url.as_str(), "https://api.example.com/data");
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        assert!(matches!(
            extract_target(&uri("/ftp://api.example.com/data")),
            Err(ProxyError::InvalidTarget(_))
        ));
        assert!(matches!(
            extract_target(&uri("/file:///etc/passwd")),
            Err(ProxyError::InvalidTarget(_))
        ));
    }

    #[test]
    fn hostname_without_dot_is_rejected() {
        assert!(matches!(
            extract_target(&uri("/https://internal/secrets")),
            Err(ProxyError::InvalidTarget(_))
        ));
    }

    #[test]
    fn origin_header_identifies_cors_callers() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://shop.example"));
        let target = extract_target(&uri("/https://api.example.com/d")).unwrap();

        let identity = caller_identity(&headers, &target).unwrap();
        assert_eq!(identity.origin(), "https://shop.example");
    }

    #[test]
    fn missing_origin_is_rejected() {
        let target = extract_target(&uri("/https://api.example.com/d")).unwrap();
        assert!(matches!(
            caller_identity(&HeaderMap::new(), &target),
            Err(ProxyError::InvalidOrigin)
        ));
    }

    #[test]
    fn jsonp_identity_comes_from_the_referer() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-dest", HeaderValue::from_static("script"));
        headers.insert(
            "referer",
            HeaderValue::from_static("https://shop.example/page/one"),
        );
        let target =
            extract_target(&uri("/?url=https%3A%2F%2Fapi.example.com%2Fd&callback=cb")).unwrap();

        let identity = caller_identity(&headers, &target).unwrap();
        assert_eq!(
            identity,
            CallerIdentity::Jsonp {
                origin: "https://shop.example".into()
            }
        );
    }

    #[test]
    fn jsonp_without_referer_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-fetch-dest", HeaderValue::from_static("script"));
        let target =
            extract_target(&uri("/?url=https%3A%2F%2Fapi.example.com%2Fd&callback=cb")).unwrap();
        assert!(matches!(
            caller_identity(&headers, &target),
            Err(ProxyError::InvalidReferer)
        ));
    }

    #[test]
    fn callback_without_script_dest_is_plain_cors() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://shop.example"));
        let target =
            extract_target(&uri("/?url=https%3A%2F%2Fapi.example.com%2Fd&callback=cb")).unwrap();
        assert!(matches!(
            caller_identity(&headers, &target).unwrap(),
            CallerIdentity::Cors { .. }
        ));
    }

    #[test]
    fn local_origins_match_dev_hosts() {
        let first_party = vec!["https://app.corsgate.dev".to_string()];
        assert!(is_local_origin("http://localhost:3000", &first_party));
        assert!(is_local_origin("http://127.0.0.1", &first_party));
        assert!(is_local_origin("http://192.168.1.10:8080", &first_party));
        assert!(is_local_origin("https://app.corsgate.dev", &first_party));
        assert!(!is_local_origin("https://shop.example", &first_party));
        assert!(!is_local_origin("https://localhost.evil.example", &first_party));
    }
}
