//! End-to-end tests for standard HTTP forwarding
//!
//! Tests complete proxy functionality including:
//! - Host based integration selection and request rewriting
//! - Credential injection from a secret plugin
//! - Hop-by-hop header handling
//! - Upstream failure and timeout responses
//! - Inbound and outbound rate limiting

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use integration_proxy::secrets::BoxError;
use integration_proxy::{
    CredentialConfig, IntegrationConfig, Plugin, ProxyConfig, ProxyServer, SecretRegistry,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Secret backend returning `secret-<id>` and counting lookups
struct VaultStub {
    loads: AtomicUsize,
}

#[async_trait]
impl Plugin for VaultStub {
    fn prefix(&self) -> &str {
        "vault"
    }

    async fn load(&self, _cancel: &CancellationToken, id: &str) -> Result<String, BoxError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if id == "sealed" {
            return Err("vault is sealed".into());
        }
        Ok(format!("secret-{}", id))
    }
}

/// Report what the upstream received through response headers and body
async fn inspect_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let seen = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("x-seen-method", req.method().as_str())
        .header("x-seen-host", seen("host"))
        .header("x-seen-forwarded-host", seen("x-forwarded-host"))
        .header("x-seen-forwarded-for", seen("x-forwarded-for"))
        .header("x-seen-authorization", seen("authorization"))
        .header("x-seen-session-hint", seen("x-session-hint"))
        .header("x-seen-proxy-authorization", seen("proxy-authorization"))
        .header("x-seen-custom", seen("x-custom"))
        .body(Full::new(Bytes::from(req.uri().to_string())))
        .unwrap();

    Ok(response)
}

/// Create a mock upstream server for testing
async fn start_mock_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(inspect_handler))
                    .await;
            });
        }
    });

    addr
}

/// Upstream answering every request with `size` bytes, counting requests
async fn start_counting_upstream(size: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let service = service_fn(move |_req: Request<Incoming>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(vec![b'x'; size])))) }
            });
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

/// Upstream that accepts connections but never answers
async fn start_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

async fn start_proxy(
    integrations: Vec<IntegrationConfig>,
    secrets: Arc<SecretRegistry>,
) -> (SocketAddr, CancellationToken) {
    let mut config = ProxyConfig::default_for_testing();
    config.integrations = integrations;

    let server = ProxyServer::new(config, secrets).unwrap();
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    (addr, shutdown)
}

/// Send one request over a fresh client connection
async fn send(proxy: SocketAddr, request: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

fn get(host: &str, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("host", host)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn test_request_is_forwarded_to_destination() {
    let upstream = start_mock_upstream().await;
    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("github", format!("http://{}/api/v3", upstream), 100.0, 100_000.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/repos?page=2")
        .header("host", "GitHub:8080")
        .header("x-custom", "kept")
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    let (status, headers, body) = send(proxy, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"/api/v3/repos?page=2");
    assert_eq!(headers.get("x-seen-method").unwrap(), "POST");
    assert_eq!(headers.get("x-seen-host").unwrap(), upstream.to_string().as_str());
    assert_eq!(headers.get("x-seen-forwarded-host").unwrap(), "GitHub:8080");
    assert_eq!(headers.get("x-seen-forwarded-for").unwrap(), "127.0.0.1");
    assert_eq!(headers.get("x-seen-custom").unwrap(), "kept");
    assert_eq!(headers.get("x-seen-authorization").unwrap(), "-");

    shutdown.cancel();
}

#[tokio::test]
async fn test_credential_is_injected() {
    let upstream = start_mock_upstream().await;
    let plugin = Arc::new(VaultStub { loads: AtomicUsize::new(0) });
    let secrets = SecretRegistry::default();
    secrets.register(plugin.clone());

    let integration = IntegrationConfig::new("billing", format!("http://{}", upstream), 100.0, 100_000.0)
        .with_credential(
            CredentialConfig::new("authorization", vec!["vault:billing-a".to_string(), "vault:billing-b".to_string()])
                .with_format("Bearer {secret}"),
        );
    let (proxy, shutdown) = start_proxy(vec![integration], Arc::new(secrets)).await;

    for _ in 0..4 {
        let request = Request::builder()
            .uri("/invoices")
            .header("host", "billing")
            .header("authorization", "Bearer client-supplied")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, headers, _) = send(proxy, request).await;

        assert_eq!(status, StatusCode::OK);
        let seen = headers.get("x-seen-authorization").unwrap().to_str().unwrap();
        assert!(
            seen == "Bearer secret-billing-a" || seen == "Bearer secret-billing-b",
            "unexpected credential {}",
            seen
        );
    }

    // Cache TTL of zero keeps resolved secrets, so at most one load per reference
    assert!(plugin.loads.load(Ordering::SeqCst) <= 2);

    shutdown.cancel();
}

#[tokio::test]
async fn test_secret_failure_is_bad_gateway_without_upstream_contact() {
    let plugin = Arc::new(VaultStub { loads: AtomicUsize::new(0) });
    let secrets = SecretRegistry::default();
    secrets.register(plugin.clone());

    // No upstream listens here; a 502 must come from the secret failure
    let integration = IntegrationConfig::new("sealed", "http://127.0.0.1:1", 100.0, 100.0)
        .with_credential(CredentialConfig::new("x-api-key", vec!["vault:sealed".to_string()]));
    let (proxy, shutdown) = start_proxy(vec![integration], Arc::new(secrets)).await;

    let (status, _, body) = send(proxy, get("sealed", "/")).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(&body[..], b"Bad Gateway");
    assert_eq!(plugin.loads.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_stripped() {
    let upstream = start_mock_upstream().await;
    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("svc", format!("http://{}", upstream), 100.0, 100_000.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    let request = Request::builder()
        .uri("/")
        .header("host", "svc")
        .header("connection", "x-session-hint")
        .header("x-session-hint", "abc")
        .header("proxy-authorization", "Basic Zm9vOmJhcg==")
        .header("x-custom", "kept")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, _) = send(proxy, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-seen-session-hint").unwrap(), "-");
    assert_eq!(headers.get("x-seen-proxy-authorization").unwrap(), "-");
    assert_eq!(headers.get("x-seen-custom").unwrap(), "kept");

    shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_integration_is_bad_gateway() {
    let upstream = start_mock_upstream().await;
    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("known", format!("http://{}", upstream), 100.0, 100.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    let (status, _, body) = send(proxy, get("unknown", "/")).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(&body[..], b"Unknown integration");

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("dead", format!("http://{}", dead), 100.0, 100.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    let (status, _, _) = send(proxy, get("dead", "/")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    shutdown.cancel();
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let upstream = start_silent_upstream().await;
    let mut integration = IntegrationConfig::new("slow", format!("http://{}", upstream), 100.0, 100.0);
    integration.timeout = Duration::from_millis(200);

    let (proxy, shutdown) = start_proxy(vec![integration], Arc::new(SecretRegistry::default())).await;

    let started = Instant::now();
    let (status, _, _) = send(proxy, get("slow", "/")).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));

    shutdown.cancel();
}

#[tokio::test]
async fn test_inbound_rate_limit_delays_requests() {
    let upstream = start_mock_upstream().await;
    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("limited", format!("http://{}", upstream), 2.0, 100_000.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    let started = Instant::now();
    // Burst of two, then one more at two per second
    for _ in 0..3 {
        let (status, _, _) = send(proxy, get("limited", "/")).await;
        assert_eq!(status, StatusCode::OK);
    }

    assert!(
        started.elapsed() >= Duration::from_millis(400),
        "third request was not delayed: {:?}",
        started.elapsed()
    );

    shutdown.cancel();
}

#[tokio::test]
async fn test_removed_integration_is_no_longer_routed() {
    let upstream = start_mock_upstream().await;
    let mut config = ProxyConfig::default_for_testing();
    config.integrations = vec![IntegrationConfig::new("temp", format!("http://{}", upstream), 100.0, 100_000.0)];

    let server = ProxyServer::new(config, Arc::new(SecretRegistry::default())).unwrap();
    let integrations = Arc::clone(server.integrations());
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    let (status, _, _) = send(proxy, get("temp", "/")).await;
    assert_eq!(status, StatusCode::OK);

    integrations.remove_integration("temp").unwrap();

    let (status, _, _) = send(proxy, get("temp", "/")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    shutdown.cancel();
}

#[tokio::test]
async fn test_outbound_rate_limit_paces_response_bytes() {
    let (upstream, _) = start_counting_upstream(1500).await;
    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("download", format!("http://{}", upstream), 100.0, 1000.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    let started = Instant::now();
    for _ in 0..2 {
        let (status, _, body) = send(proxy, get("download", "/file")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len(), 1500);
    }

    // 3000 bytes at 1000 per second with a 1000 byte burst
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1400), "responses were not paced: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "responses took {:?}", elapsed);

    shutdown.cancel();
}

#[tokio::test]
async fn test_client_disconnect_during_admission_skips_upstream() {
    let (upstream, hits) = start_counting_upstream(2).await;
    let (proxy, shutdown) = start_proxy(
        vec![IntegrationConfig::new("slowlane", format!("http://{}", upstream), 0.5, 1000.0)],
        Arc::new(SecretRegistry::default()),
    )
    .await;

    // Spend the single token
    let (status, _, _) = send(proxy, get("slowlane", "/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The next request waits two seconds for a token; leave before then
    let mut conn = TcpStream::connect(proxy).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: slowlane\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(conn);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}
