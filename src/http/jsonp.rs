//! Script-envelope rendering for JSONP callers.
//!
//! A `<script>` tag cannot read response headers or non-200 statuses, so
//! the whole upstream response is serialized into one callback invocation:
//! `cb({"status":..,"headers":{..},"type":..,"body":..})`. The HTTP status
//! of the envelope itself is always 200 so the script executes.

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};

/// Classified body representation inside the envelope.
fn classify(body: &Bytes) -> (&'static str, Value) {
    if body.is_empty() {
        return ("empty", Value::String(String::new()));
    }
    match std::str::from_utf8(body) {
        Ok(text) => match serde_json::from_str::<Value>(text) {
            Ok(value) => ("json", value),
            Err(_) => ("text", Value::String(text.to_string())),
        },
        Err(_) => (
            "base64",
            Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
        ),
    }
}

pub fn render(callback: &str, status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    let (kind, value) = classify(&body);

    let mut header_map = serde_json::Map::new();
    for (name, header_value) in headers {
        if let Ok(text) = header_value.to_str() {
            header_map.insert(name.as_str().to_string(), Value::String(text.to_string()));
        }
    }

    let envelope = json!({
        "status": status.as_u16(),
        "headers": Value::Object(header_map),
        "type": kind,
        "body": value,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/javascript")
        .body(Body::from(format!("{callback}({envelope})")))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_bodies_are_embedded_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let response = render(
            "cb",
            StatusCode::OK,
            &headers,
            Bytes::from_static(b"{\"a\":1}"),
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/javascript"
        );
        let text = body_text(response).await;
        assert!(text.starts_with("cb({"));
        assert!(text.contains("\"type\":\"json\""));
        assert!(text.contains("\"body\":{\"a\":1}"));
        assert!(text.contains("\"status\":200"));
    }

    #[tokio::test]
    async fn non_json_text_is_a_string() {
        let response = render(
            "cb",
            StatusCode::NOT_FOUND,
            &HeaderMap::new(),
            Bytes::from_static(b"not found"),
        );
        let text = body_text(response).await;
        assert!(text.contains("\"type\":\"text\""));
        assert!(text.contains("\"body\":\"not found\""));
        assert!(text.contains("\"status\":404"));
    }

    #[tokio::test]
    async fn binary_bodies_are_base64_encoded() {
        let response = render(
            "cb",
            StatusCode::OK,
            &HeaderMap::new(),
            Bytes::from_static(&[0xff, 0xfe, 0x00, 0x01]),
        );
        let text = body_text(response).await;
        assert!(text.contains("\"type\":\"base64\""));
        assert!(text.contains("\"body\":\"//4AAQ==\""));
    }

    #[tokio::test]
    async fn empty_bodies_are_marked_empty() {
        let response = render("cb", StatusCode::NO_CONTENT, &HeaderMap::new(), Bytes::new());
        let text = body_text(response).await;
        assert!(text.contains("\"type\":\"empty\""));
    }
}
