//! Secret resolution
//!
//! Secrets are named by `prefix:identifier` references. The prefix selects a
//! [`Plugin`] registered with the [`SecretRegistry`], which resolves the
//! identifier to a value. Resolved values are cached, optionally with a TTL.

pub mod env;
pub mod reference;
pub mod registry;

pub use env::EnvPlugin;
pub use reference::SecretReference;
pub use registry::{Plugin, SecretRegistry};

use thiserror::Error;

/// Opaque error returned by secret backends
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while validating or resolving secret references
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("invalid secret reference: {reference}")]
    InvalidReference { reference: String },

    #[error("unknown secret source: {prefix}")]
    UnknownSource { prefix: String },

    #[error("no secrets provided")]
    NoSecretsProvided,

    /// Failure reported by the backend, displayed as-is
    #[error("{source}")]
    Plugin { source: BoxError },
}

impl SecretError {
    /// Wrap a backend failure
    pub fn plugin<E: Into<BoxError>>(source: E) -> Self {
        SecretError::Plugin {
            source: source.into(),
        }
    }
}
