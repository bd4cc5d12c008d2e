//! HTTP server setup.
//!
//! Two fixed routes (`/up` for load-balancer health checks, `/error` as a
//! sentinel target for refused fetches) and a catch-all proxy handler,
//! wrapped in a request body limit and request tracing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::error::ROBOTS_HEADER;
use crate::http::proxy;
use crate::lifecycle::AppContext;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let body_limit = ctx.config.security.max_body_bytes;
    Router::new()
        .route("/up", any(up))
        .route("/error", any(error_sentinel))
        .fallback(proxy::handle)
        .with_state(ctx)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
}

/// Serve until the shutdown signal fires, then stop accepting and drain
/// in-flight connections.
pub async fn serve(ctx: Arc<AppContext>, listener: TcpListener) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "proxy listening");

    let app = router(ctx.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let mut stop = ctx.shutdown.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await?;

    tracing::info!("proxy stopped accepting connections");
    Ok(())
}

async fn up() -> Response {
    branded(StatusCode::OK, "Corsgate: OK.")
}

/// Fixed 400 target. Refused upstream fetches are answered with this
/// body, indistinguishable from a direct visit.
async fn error_sentinel() -> Response {
    branded(StatusCode::BAD_REQUEST, "Corsgate: Error.")
}

fn branded(status: StatusCode, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let (name, value) = ROBOTS_HEADER;
    if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
        response.headers_mut().insert(name, value);
    }
    response
}
