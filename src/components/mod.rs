//! Proxy components module
//!
//! Contains the main components of the proxy server:
//! - Rate limiter gating each traffic direction of an integration
//! - Integration registry owning integrations and their limiters
//! - Dispatcher selecting an integration per request
//! - Forwarder for standard HTTP requests
//! - Tunnel for WebSocket upgrades

pub mod dispatcher;
pub mod forwarder;
pub mod rate_limit;
pub mod registry;
pub mod tunnel;

pub use dispatcher::Dispatcher;
pub use forwarder::{HttpForwarder, ProxyBody};
pub use rate_limit::RateLimiter;
pub use registry::{Integration, IntegrationRegistry};
pub use tunnel::{is_websocket_upgrade, Tunnel};
