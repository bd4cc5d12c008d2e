//! Shared utilities for integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use corsgate::config::ProxyConfig;
use corsgate::http;
use corsgate::lifecycle::AppContext;
use corsgate::secrets::StaticKekSource;
use corsgate::store::{MemoryBus, MemorySharedState, MemoryStore, Tenant};

/// Base config for tests: upstreams live on loopback, so the private
/// network guard is off.
#[allow(dead_code)]
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.security.block_private_networks = false;
    config
}

#[allow(dead_code)]
pub struct TestProxy {
    pub base: String,
    pub store: Arc<MemoryStore>,
    pub shared: Arc<MemorySharedState>,
    pub ctx: Arc<AppContext>,
}

/// Boot the proxy on an ephemeral port against in-memory collaborators.
#[allow(dead_code)]
pub async fn spawn_proxy(
    config: ProxyConfig,
    store: Arc<MemoryStore>,
    keks: HashMap<String, Vec<u8>>,
) -> TestProxy {
    let shared = Arc::new(MemorySharedState::new());
    let ctx = AppContext::build(
        config,
        store.clone(),
        shared.clone(),
        Arc::new(MemoryBus::new()),
        Arc::new(StaticKekSource(keks)),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(http::serve(ctx.clone(), listener));

    TestProxy {
        base: format!("http://{addr}"),
        store,
        shared,
        ctx,
    }
}

#[allow(dead_code)]
pub fn tenant(id: &str, user_id: &str, origin: &str, targets: &[&str]) -> Tenant {
    Tenant {
        id: id.to_string(),
        user_id: user_id.to_string(),
        allowed_origins: vec![origin.to_string()],
        target_domains: targets.iter().map(|s| s.to_string()).collect(),
    }
}

/// Start a mock upstream that answers every request with a fixed
/// response. Returns its base URL.
#[allow(dead_code)]
pub async fn start_upstream(
    status_line: &'static str,
    extra_headers: &'static [(&'static str, &'static str)],
    body: &'static str,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        read_request_head(&mut socket).await;
                        let mut response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                            status_line,
                            body.len()
                        );
                        for (name, value) in extra_headers {
                            response.push_str(&format!("{name}: {value}\r\n"));
                        }
                        response.push_str("\r\n");
                        response.push_str(body);
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    format!("http://{addr}")
}

/// Start a mock upstream that echoes the received request head back as
/// its plain-text body, for asserting what the proxy actually forwarded.
#[allow(dead_code)]
pub async fn start_echo_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let head = read_request_head(&mut socket).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            head.len(),
                            head
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    format!("http://{addr}")
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match socket.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf)
        .split("\r\n\r\n")
        .next()
        .unwrap_or_default()
        .to_string()
}
