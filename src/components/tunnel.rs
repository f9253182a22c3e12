//! WebSocket Tunnel Component
//!
//! Replays a client's upgrade request to the integration's destination and,
//! once the upstream answers `101 Switching Protocols`, detaches both
//! connections from HTTP and relays raw bytes between them. Each direction
//! admits every chunk it reads against that direction's limiter.

use crate::components::forwarder::{
    connect, empty, rewrite_request_target, upstream_address, Credential, ProxyBody, ThrottledBody,
};
use crate::components::rate_limit::RateLimiter;
use crate::components::registry::Integration;
use crate::error::ProxyError;
use crate::ConnectionSlot;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, CONNECTION, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of the read buffer used by each copy direction
pub const TUNNEL_BUFFER_SIZE: usize = 8192;

/// Whether the request asks to be upgraded to a WebSocket
///
/// Requires `Upgrade: websocket` (any case), an `upgrade` token in
/// `Connection` and a `Sec-WebSocket-Key` header.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.trim().eq_ignore_ascii_case("websocket"));

    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    upgrade && connection && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// Forward an upgrade request and set up the tunnel on success
///
/// A `101` from the upstream is relayed to the client unchanged (status,
/// reason and headers, including `Sec-WebSocket-Accept`) and the tunnel is
/// spawned to run once both sides have switched protocols. Any other
/// upstream response is relayed as-is and no tunnel is created.
pub async fn forward_upgrade(
    mut request: Request<Incoming>,
    integration: Arc<Integration>,
    credential: Option<Credential>,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<Response<ProxyBody>, ProxyError> {
    let client_upgrade = hyper::upgrade::on(&mut request);
    let slot = request.extensions_mut().remove::<ConnectionSlot>();

    let (parts, _body) = request.into_parts();
    let mut upstream_request = Request::from_parts(parts, Empty::<Bytes>::new());
    rewrite_request_target(&mut upstream_request, integration.destination(), peer_addr)?;
    if let Some((name, value)) = credential {
        upstream_request.headers_mut().insert(name, value);
    }

    let address = upstream_address(integration.destination());
    let limit = integration.timeout();

    let handshake = async {
        let stream = connect(&address).await?;
        let (mut sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::Upstream(format!("Handshake with {} failed: {}", address, e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Upstream upgrade connection closed with error");
            }
        });

        sender
            .send_request(upstream_request)
            .await
            .map_err(|e| ProxyError::Upstream(format!("Failed to send upgrade request to {}: {}", address, e)))
    };

    let mut response = tokio::select! {
        result = timeout(limit, handshake) => match result {
            Ok(response) => response?,
            Err(_) => return Err(ProxyError::upstream_timeout(&address, limit.as_millis() as u64)),
        },
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(
            event = "upgrade_rejected",
            integration = %integration.name(),
            status = response.status().as_u16(),
            "Upstream rejected WebSocket upgrade"
        );
        let (parts, body) = response.into_parts();
        let body = ThrottledBody::new(body, Arc::clone(&integration.out_limiter), cancel);
        return Ok(Response::from_parts(parts, body.boxed_unsync()));
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let tunnel = Tunnel::new(
        integration.name(),
        Arc::clone(&integration.in_limiter),
        Arc::clone(&integration.out_limiter),
    );

    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(integration = %tunnel.integration, error = %e, "Protocol switch failed");
                return;
            }
        };
        tunnel.run(TokioIo::new(client), TokioIo::new(upstream), cancel).await;
        drop(slot);
    });

    let (parts, _body) = response.into_parts();
    Ok(Response::from_parts(parts, empty()))
}

/// Which way bytes flow through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream, gated by the inbound limiter
    Inbound,
    /// Upstream to client, gated by the outbound limiter
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Duplex byte relay between two detached connections
#[derive(Debug)]
pub struct Tunnel {
    integration: String,
    in_limiter: Arc<RateLimiter>,
    out_limiter: Arc<RateLimiter>,
}

impl Tunnel {
    pub fn new<S: Into<String>>(
        integration: S,
        in_limiter: Arc<RateLimiter>,
        out_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            integration: integration.into(),
            in_limiter,
            out_limiter,
        }
    }

    /// Relay bytes until either direction ends, then close both sides
    pub async fn run<C, U>(self, client: C, upstream: U, cancel: CancellationToken)
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        info!(event = "tunnel_established", integration = %self.integration, "WebSocket tunnel established");

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let inbound = copy_admitted(&mut client_read, &mut upstream_write, &self.in_limiter, &cancel);
        let outbound = copy_admitted(&mut upstream_read, &mut client_write, &self.out_limiter, &cancel);

        let (direction, result) = tokio::select! {
            result = inbound => (Direction::Inbound, result),
            result = outbound => (Direction::Outbound, result),
        };

        // Closing both writers propagates the half-close to each peer
        let _ = client_write.shutdown().await;
        let _ = upstream_write.shutdown().await;

        match result {
            Ok(bytes) => info!(
                event = "tunnel_closed",
                integration = %self.integration,
                direction = direction.as_str(),
                bytes,
                "WebSocket tunnel closed"
            ),
            Err(e) => info!(
                event = "tunnel_closed",
                integration = %self.integration,
                direction = direction.as_str(),
                error = %e,
                error_category = e.category().as_str(),
                "WebSocket tunnel closed with error"
            ),
        }
    }
}

/// Copy `reader` to `writer`, admitting each chunk against `limiter`
/// before it is written. Returns the bytes copied once `reader` hits EOF.
async fn copy_admitted<R, W>(
    reader: &mut R,
    writer: &mut W,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        };
        if n == 0 {
            return Ok(total);
        }

        limiter.admit(n, cancel).await?;
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}
