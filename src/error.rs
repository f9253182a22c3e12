//! Error handling module
//!
//! Defines the error types for the integration proxy with HTTP status code mapping

use crate::secrets::SecretError;
use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the proxy server
#[derive(Error, Debug)]
pub enum ProxyError {
    // Integration configuration errors
    #[error("Invalid integration configuration: {field}, reason: {reason}")]
    Validation { field: String, reason: String },

    #[error("Integration already registered: {name}")]
    DuplicateIntegration { name: String },

    #[error("Unknown integration: {name}")]
    IntegrationNotFound { name: String },

    // Upstream errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout: {address}, timeout: {timeout_ms}ms")]
    UpstreamTimeout { address: String, timeout_ms: u64 },

    // Rate limiting
    #[error("Operation cancelled while waiting for admission")]
    Cancelled,

    #[error("Rate limiter stopped")]
    LimiterStopped,

    // Secret resolution
    #[error(transparent)]
    Secret(#[from] SecretError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    // Network and protocol errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ProxyError {
    /// Convert ProxyError to the HTTP status code reported to the client
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,

            // Unknown integrations and upstream failures are gateway errors
            ProxyError::IntegrationNotFound { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Io(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            ProxyError::Secret(err) => match err {
                SecretError::Plugin { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },

            ProxyError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::LimiterStopped => StatusCode::SERVICE_UNAVAILABLE,

            ProxyError::Validation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::DuplicateIntegration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProxyError::Validation { .. }
            | ProxyError::DuplicateIntegration { .. }
            | ProxyError::Config(_)
            | ProxyError::Serialization(_) => ErrorCategory::Configuration,

            ProxyError::IntegrationNotFound { .. } => ErrorCategory::NotFound,

            ProxyError::Upstream(_)
            | ProxyError::UpstreamTimeout { .. }
            | ProxyError::Http(_)
            | ProxyError::Io(_) => ErrorCategory::Upstream,

            ProxyError::Cancelled | ProxyError::LimiterStopped => ErrorCategory::Cancelled,

            ProxyError::Secret(SecretError::Plugin { .. }) => ErrorCategory::Plugin,
            ProxyError::Secret(SecretError::UnknownSource { .. }) => ErrorCategory::NotFound,
            ProxyError::Secret(_) => ErrorCategory::Configuration,

            ProxyError::BadRequest(_) => ErrorCategory::Protocol,
        }
    }

    /// Create a validation error for an integration field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        ProxyError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an upstream timeout error
    pub fn upstream_timeout<S: Into<String>>(address: S, timeout_ms: u64) -> Self {
        ProxyError::UpstreamTimeout {
            address: address.into(),
            timeout_ms,
        }
    }

    /// Create an unknown integration error
    pub fn integration_not_found<S: Into<String>>(name: S) -> Self {
        ProxyError::IntegrationNotFound { name: name.into() }
    }
}

/// Error categories used as a structured logging field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    NotFound,
    Upstream,
    Plugin,
    Cancelled,
    Protocol,
}

impl ErrorCategory {
    /// Get string representation for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Upstream => "upstream",
            ErrorCategory::Plugin => "plugin",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Protocol => "protocol",
        }
    }
}
