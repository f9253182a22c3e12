//! HTTP Forwarder Component
//!
//! Forwards standard (non-upgrade) requests to an integration's destination
//! over a fresh HTTP/1.1 connection and streams the response back, counting
//! response bytes against the integration's outbound limiter.

use crate::components::rate_limit::RateLimiter;
use crate::components::registry::Integration;
use crate::error::ProxyError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::ready;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use pin_project::pin_project;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Response body type produced by the proxy
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// A credential header resolved for one upstream request
pub type Credential = (HeaderName, HeaderValue);

/// Forwarder for standard HTTP requests
///
/// Each request gets its own upstream connection; nothing is pooled.
#[derive(Debug, Default, Clone)]
pub struct HttpForwarder;

impl HttpForwarder {
    pub fn new() -> Self {
        Self
    }

    /// Forward `request` to the integration and return the upstream response
    ///
    /// The integration timeout bounds connecting and receiving the response
    /// head. The response body is streamed through [`ThrottledBody`].
    pub async fn forward_request(
        &self,
        mut request: Request<Incoming>,
        integration: &Integration,
        credential: Option<Credential>,
        peer_addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        strip_hop_by_hop_headers(request.headers_mut());
        rewrite_request_target(&mut request, integration.destination(), peer_addr)?;
        if let Some((name, value)) = credential {
            request.headers_mut().insert(name, value);
        }

        let address = upstream_address(integration.destination());
        let limit = integration.timeout();

        let exchange = async {
            let stream = connect(&address).await?;
            let (mut sender, conn) = http1::Builder::new()
                .preserve_header_case(true)
                .handshake(TokioIo::new(stream))
                .await
                .map_err(|e| ProxyError::Upstream(format!("Handshake with {} failed: {}", address, e)))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "Upstream connection closed with error");
                }
            });

            sender
                .send_request(request)
                .await
                .map_err(|e| ProxyError::Upstream(format!("Failed to send request to {}: {}", address, e)))
        };

        let response = tokio::select! {
            result = timeout(limit, exchange) => match result {
                Ok(response) => response?,
                Err(_) => return Err(ProxyError::upstream_timeout(&address, limit.as_millis() as u64)),
            },
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        };

        debug!(
            integration = %integration.name(),
            upstream = %address,
            status = response.status().as_u16(),
            "Received upstream response"
        );

        let (parts, body) = response.into_parts();
        let body = ThrottledBody::new(body, Arc::clone(&integration.out_limiter), cancel.clone());
        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }
}

/// Open a TCP connection to an upstream `host:port`
pub(crate) async fn connect(address: &str) -> Result<TcpStream, ProxyError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| ProxyError::Upstream(format!("Failed to connect to {}: {}", address, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// `host:port` of a destination, defaulting the port to 80
pub(crate) fn upstream_address(destination: &Uri) -> String {
    let host = destination.host().unwrap_or_default();
    let port = destination.port_u16().unwrap_or(80);
    format!("{}:{}", host, port)
}

/// Point `request` at `destination`
///
/// The request URI becomes origin-form with the destination's base path
/// prefixed, `Host` is set to the destination authority and the
/// `x-forwarded-*` headers record the original client and host.
pub(crate) fn rewrite_request_target<B>(
    request: &mut Request<B>,
    destination: &Uri,
    peer_addr: SocketAddr,
) -> Result<(), ProxyError> {
    let base = destination.path().trim_end_matches('/');
    let path = request.uri().path();
    let target = match request.uri().query() {
        Some(query) => format!("{}{}?{}", base, path, query),
        None => format!("{}{}", base, path),
    };
    let uri: Uri = target
        .parse()
        .map_err(|e| ProxyError::BadRequest(format!("Invalid upstream URI '{}': {}", target, e)))?;

    let authority = destination
        .authority()
        .ok_or_else(|| ProxyError::Config(format!("Destination '{}' has no authority", destination)))?;
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|e| ProxyError::Config(format!("Invalid destination authority: {}", e)))?;

    let original_host = request.headers().get(header::HOST).cloned();
    let headers = request.headers_mut();

    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, peer_addr.ip()),
        None => peer_addr.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
    if let Some(original_host) = original_host {
        if !headers.contains_key(&X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST.clone(), original_host);
        }
    }
    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));
    }
    headers.insert(header::HOST, host);

    *request.uri_mut() = uri;
    Ok(())
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub(crate) fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Convert a proxy error into the response sent to the client
pub fn error_to_http_response(error: &ProxyError) -> Response<ProxyBody> {
    let status = error.to_status_code();
    let message = match error {
        ProxyError::IntegrationNotFound { .. } => "Unknown integration",
        _ => status.canonical_reason().unwrap_or("Error"),
    };

    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(message.len()));
    response
}

/// Body holding a fixed chunk
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Response body that admits each data frame's length against a limiter
/// before yielding it
#[pin_project]
pub struct ThrottledBody<B = Incoming> {
    #[pin]
    inner: B,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    admission: Option<BoxFuture<'static, Result<(), ProxyError>>>,
    held: Option<Frame<Bytes>>,
}

impl<B> ThrottledBody<B> {
    pub fn new(inner: B, limiter: Arc<RateLimiter>, cancel: CancellationToken) -> Self {
        Self {
            inner,
            limiter,
            cancel,
            admission: None,
            held: None,
        }
    }
}

impl<B> Body for ThrottledBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<ProxyError>,
{
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        loop {
            if let Some(admission) = this.admission.as_mut() {
                let result = ready!(admission.as_mut().poll(cx));
                *this.admission = None;
                return match result {
                    Ok(()) => Poll::Ready(this.held.take().map(Ok)),
                    Err(e) => {
                        warn!(error = %e, "Response stream aborted while waiting for admission");
                        this.held.take();
                        Poll::Ready(Some(Err(e)))
                    }
                };
            }

            match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let len = frame.data_ref().map_or(0, |data| data.len());
                    if len == 0 {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                    let limiter = Arc::clone(this.limiter);
                    let cancel = this.cancel.clone();
                    *this.admission = Some(Box::pin(async move { limiter.admit(len, &cancel).await }));
                    *this.held = Some(frame);
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => return Poll::Ready(None),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.admission.is_none() && self.held.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
