//! Proxy Dispatcher Component
//!
//! The HTTP entry point. Selects the integration from the request's Host,
//! admits the request against the integration's inbound limiter and hands it
//! to the HTTP forwarder or the WebSocket tunnel.

use crate::components::forwarder::{error_to_http_response, Credential, HttpForwarder, ProxyBody};
use crate::components::registry::{Integration, IntegrationRegistry};
use crate::components::tunnel::{forward_upgrade, is_websocket_upgrade};
use crate::error::{ErrorCategory, ProxyError};
use crate::secrets::SecretRegistry;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routes inbound requests to registered integrations
#[derive(Debug)]
pub struct Dispatcher {
    integrations: Arc<IntegrationRegistry>,
    secrets: Arc<SecretRegistry>,
    forwarder: HttpForwarder,
}

impl Dispatcher {
    pub fn new(integrations: Arc<IntegrationRegistry>, secrets: Arc<SecretRegistry>) -> Self {
        Self {
            integrations,
            secrets,
            forwarder: HttpForwarder::new(),
        }
    }

    pub fn integrations(&self) -> &Arc<IntegrationRegistry> {
        &self.integrations
    }

    /// Handle one request, always producing a response for the client
    ///
    /// `cancel` fires when the connection is torn down by shutdown. A client
    /// disconnect drops this future, which abandons any pending admission
    /// before the upstream is contacted.
    pub async fn dispatch(
        &self,
        request: Request<Incoming>,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<ProxyBody> {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        debug!(
            event = "request_received",
            peer_addr = %peer_addr,
            method = %method,
            path = %path,
            user_agent = ?request.headers().get("user-agent"),
            "Processing request"
        );

        match self.route(request, peer_addr, &cancel).await {
            Ok((integration, response)) => {
                info!(
                    event = "request_completed",
                    peer_addr = %peer_addr,
                    integration = %integration,
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Request completed"
                );
                response
            }
            Err(e) => {
                let status = e.to_status_code().as_u16();
                let duration_ms = started.elapsed().as_millis() as u64;
                match e.category() {
                    ErrorCategory::Configuration => error!(
                        event = "request_failed",
                        peer_addr = %peer_addr,
                        method = %method,
                        path = %path,
                        status,
                        duration_ms,
                        error = %e,
                        error_category = e.category().as_str(),
                        "Request failed"
                    ),
                    ErrorCategory::Cancelled => debug!(
                        event = "request_cancelled",
                        peer_addr = %peer_addr,
                        path = %path,
                        error = %e,
                        "Request abandoned"
                    ),
                    _ => warn!(
                        event = "request_failed",
                        peer_addr = %peer_addr,
                        method = %method,
                        path = %path,
                        status,
                        duration_ms,
                        error = %e,
                        error_category = e.category().as_str(),
                        "Request failed"
                    ),
                }
                error_to_http_response(&e)
            }
        }
    }

    async fn route(
        &self,
        request: Request<Incoming>,
        peer_addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(String, Response<ProxyBody>), ProxyError> {
        let key = routing_key(&request)?;
        let integration = self
            .integrations
            .lookup(&key)
            .ok_or_else(|| ProxyError::integration_not_found(&key))?;

        integration.in_limiter.admit(1, cancel).await?;

        let credential = self.resolve_credential(&integration, cancel).await?;
        let name = integration.name().to_string();

        let response = if is_websocket_upgrade(request.headers()) {
            debug!(
                event = "upgrade_requested",
                peer_addr = %peer_addr,
                integration = %name,
                "Forwarding WebSocket upgrade"
            );
            forward_upgrade(request, Arc::clone(&integration), credential, peer_addr, cancel.clone()).await?
        } else {
            self.forwarder
                .forward_request(request, &integration, credential, peer_addr, cancel)
                .await?
        };

        Ok((name, response))
    }

    /// Resolve the integration's credential header, if it has one
    async fn resolve_credential(
        &self,
        integration: &Integration,
        cancel: &CancellationToken,
    ) -> Result<Option<Credential>, ProxyError> {
        let credential = match integration.credential() {
            Some(credential) => credential,
            None => return Ok(None),
        };

        let secret = self.secrets.load_random_secret(cancel, credential.secrets.as_slice()).await?;

        let name = HeaderName::from_bytes(credential.header.as_bytes())
            .map_err(|e| ProxyError::Config(format!("Invalid credential header '{}': {}", credential.header, e)))?;
        let mut value = HeaderValue::from_str(&credential.render(&secret)).map_err(|_| {
            ProxyError::Config(format!(
                "Secret for integration '{}' is not a valid header value",
                integration.name()
            ))
        })?;
        value.set_sensitive(true);

        Ok(Some((name, value)))
    }
}

/// Integration name addressed by a request: the Host header without its
/// port, lower-cased. Falls back to the host of an absolute-form URI.
pub fn routing_key<B>(request: &Request<B>) -> Result<String, ProxyError> {
    let host = match request.headers().get(HOST) {
        Some(value) => value
            .to_str()
            .map_err(|_| ProxyError::BadRequest("Host header is not valid text".to_string()))?,
        None => request
            .uri()
            .host()
            .ok_or_else(|| ProxyError::BadRequest("Request has no Host".to_string()))?,
    };

    let key = strip_port(host.trim());
    if key.is_empty() {
        return Err(ProxyError::BadRequest("Request has an empty Host".to_string()));
    }
    Ok(key.to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    // IPv6 literal: keep the brackets, drop anything after them
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
