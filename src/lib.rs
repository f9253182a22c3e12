//! Integration Proxy
//!
//! A reverse proxy for third-party integrations. Each integration is a named
//! upstream selected by the request's Host header, with its own inbound and
//! outbound token-bucket rate limits. Standard HTTP requests are forwarded
//! with optional credential injection from pluggable secret backends, and
//! WebSocket upgrades become rate-limited byte tunnels.

pub mod components;
pub mod config;
pub mod error;
pub mod secrets;

pub use components::{Dispatcher, Integration, IntegrationRegistry, RateLimiter};
pub use config::{CredentialConfig, IntegrationConfig, ProxyConfig};
pub use error::ProxyError;
pub use secrets::{EnvPlugin, Plugin, SecretRegistry};

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main proxy server struct
pub struct ProxyServer {
    config: ProxyConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    connection_count: Arc<AtomicUsize>,
}

impl ProxyServer {
    /// Create a proxy server and register the configured integrations
    ///
    /// Every credential reference is checked against `secrets` before any
    /// integration is registered. The registry's cache TTL is taken from the
    /// configuration.
    pub fn new(config: ProxyConfig, secrets: Arc<SecretRegistry>) -> Result<Self, ProxyError> {
        config.validate()?;
        config.validate_secrets(&secrets)?;
        secrets.set_cache_ttl(config.secrets.cache_ttl);

        let integrations = Arc::new(IntegrationRegistry::new());
        for integration in &config.integrations {
            if let Err(e) = integrations.add_integration(integration.clone()) {
                integrations.stop_all();
                return Err(e);
            }
        }

        info!(
            integrations = integrations.len(),
            secret_sources = ?secrets.prefixes(),
            "Proxy server components initialized"
        );

        Ok(ProxyServer {
            config,
            dispatcher: Arc::new(Dispatcher::new(integrations, secrets)),
            shutdown: CancellationToken::new(),
            connection_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn integrations(&self) -> &Arc<IntegrationRegistry> {
        self.dispatcher.integrations()
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Open client connections, counting upgraded connections until their
    /// tunnel closes
    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Shared handle to the open connection count, readable after `serve`
    /// has taken the server
    pub fn connection_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connection_count)
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    pub async fn start(self) -> Result<(), ProxyError> {
        let socket_addr = self.config.socket_addr()?;

        let listener = TcpListener::bind(socket_addr)
            .await
            .map_err(|e| ProxyError::Config(format!("Failed to bind to {}: {}", socket_addr, e)))?;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            shutdown.cancel();
        });

        self.serve(listener).await
    }

    /// Serve connections from `listener` until the shutdown token fires
    ///
    /// On shutdown, open connections and tunnels are cancelled and every
    /// integration is removed.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr()?;
        info!(
            event = "server_started",
            listen_addr = %local_addr,
            integrations = ?self.integrations().names(),
            "Integration proxy is ready and accepting connections"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let slot = ConnectionSlot::acquire(&self.connection_count, peer_addr);
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let cancel = self.shutdown.child_token();

                            tokio::spawn(Self::handle_connection(stream, peer_addr, dispatcher, cancel, slot));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    info!("Shutting down server");
                    break;
                }
            }
        }

        self.integrations().stop_all();
        info!("Server shutdown complete");
        Ok(())
    }

    /// Serve one client connection over HTTP/1.1, allowing upgrades
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
        slot: ConnectionSlot,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let request_cancel = cancel.clone();
        let service = service_fn(move |mut request: Request<Incoming>| {
            // An upgrade takes this clone into its tunnel task
            request.extensions_mut().insert(slot.clone());
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = request_cancel.clone();
            async move { Ok::<_, Infallible>(dispatcher.dispatch(request, peer_addr, cancel).await) }
        });

        // No Date header, so relayed 101 heads stay byte-for-byte the upstream's
        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .auto_date_header(false)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    if e.is_incomplete_message() || e.is_closed() {
                        debug!("Connection closed by client {}: {}", peer_addr, e);
                    } else {
                        warn!("Connection error from {}: {}", peer_addr, e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("Connection from {} interrupted by graceful shutdown", peer_addr);
                conn.as_mut().graceful_shutdown();
                if let Err(e) = conn.await {
                    debug!("Connection from {} ended during shutdown: {}", peer_addr, e);
                }
            }
        }
    }

    /// Wait for shutdown signals (SIGINT, SIGTERM)
    async fn wait_for_shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            },
            _ = terminate => {
                info!("Received terminate signal");
            },
        }
    }
}

/// One slot in the server's open connection count
///
/// The slot is released when the last clone is dropped. Upgraded
/// connections hand a clone to their tunnel task, so they stay counted
/// after hyper lets go of the connection.
#[derive(Clone)]
pub(crate) struct ConnectionSlot(Arc<SlotState>);

struct SlotState {
    peer_addr: SocketAddr,
    count: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(count: &Arc<AtomicUsize>, peer_addr: SocketAddr) -> Self {
        let current = count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Accepted connection from {} (total connections: {})", peer_addr, current);
        ConnectionSlot(Arc::new(SlotState {
            peer_addr,
            count: Arc::clone(count),
        }))
    }
}

impl Drop for SlotState {
    fn drop(&mut self) {
        let remaining = self.count.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!("Connection from {} closed (remaining connections: {})", self.peer_addr, remaining);
    }
}
