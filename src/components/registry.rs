//! Integration Registry Component
//!
//! Stores the integrations the proxy routes to, keyed by name, and owns the
//! lifecycle of each integration's inbound and outbound rate limiters.

use crate::components::rate_limit::RateLimiter;
use crate::config::{CredentialConfig, IntegrationConfig};
use crate::error::ProxyError;
use hyper::Uri;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::info;

/// A registered upstream with its two directional limiters
#[derive(Debug)]
pub struct Integration {
    config: IntegrationConfig,
    destination: Uri,
    /// Gates client to upstream traffic
    pub in_limiter: Arc<RateLimiter>,
    /// Gates upstream to client traffic
    pub out_limiter: Arc<RateLimiter>,
}

impl Integration {
    fn from_config(config: IntegrationConfig) -> Result<Self, ProxyError> {
        let destination = config.validate()?;

        let in_limiter = match config.burst {
            Some(burst) => RateLimiter::with_burst(config.in_rate_limit, burst)?,
            None => RateLimiter::new(config.in_rate_limit)?,
        };
        let out_limiter = match config.burst {
            Some(burst) => RateLimiter::with_burst(config.out_rate_limit, burst)?,
            None => RateLimiter::new(config.out_rate_limit)?,
        };

        Ok(Self {
            config,
            destination,
            in_limiter: Arc::new(in_limiter),
            out_limiter: Arc::new(out_limiter),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Parsed destination base URL
    pub fn destination(&self) -> &Uri {
        &self.destination
    }

    pub fn credential(&self) -> Option<&CredentialConfig> {
        self.config.credential.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    fn stop(&self) {
        self.in_limiter.stop();
        self.out_limiter.stop();
    }
}

/// Name-keyed store of integrations
///
/// Lookups are exact and case-sensitive. Callers normalise routing keys
/// before calling [`IntegrationRegistry::lookup`].
#[derive(Debug, Default)]
pub struct IntegrationRegistry {
    integrations: RwLock<HashMap<String, Arc<Integration>>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config`, build its limiters and store the integration
    ///
    /// Nothing is stored if validation fails or the name is taken.
    pub fn add_integration(&self, config: IntegrationConfig) -> Result<Arc<Integration>, ProxyError> {
        if self.read().contains_key(&config.name) {
            return Err(ProxyError::DuplicateIntegration { name: config.name });
        }

        let integration = Arc::new(Integration::from_config(config)?);

        let mut integrations = self.write();
        // Re-check under the write lock; another caller may have won the race
        if integrations.contains_key(integration.name()) {
            integration.stop();
            return Err(ProxyError::DuplicateIntegration {
                name: integration.name().to_string(),
            });
        }
        integrations.insert(integration.name().to_string(), Arc::clone(&integration));
        drop(integrations);

        info!(
            event = "integration_registered",
            integration = %integration.name(),
            destination = %integration.destination(),
            in_rate_limit = integration.in_limiter.rate(),
            out_rate_limit = integration.out_limiter.rate(),
            "Integration registered"
        );

        Ok(integration)
    }

    /// Find an integration by exact name
    pub fn lookup(&self, name: &str) -> Option<Arc<Integration>> {
        self.read().get(name).cloned()
    }

    /// Stop both limiters of `name` and remove it
    ///
    /// Requests already holding the integration see their limiters fail with
    /// [`ProxyError::LimiterStopped`].
    pub fn remove_integration(&self, name: &str) -> Result<(), ProxyError> {
        let removed = self.write().remove(name);
        match removed {
            Some(integration) => {
                integration.stop();
                info!(event = "integration_removed", integration = %name, "Integration removed");
                Ok(())
            }
            None => Err(ProxyError::integration_not_found(name)),
        }
    }

    /// Remove every integration, stopping all limiters
    pub fn stop_all(&self) {
        let drained: Vec<Arc<Integration>> = self.write().drain().map(|(_, v)| v).collect();
        for integration in &drained {
            integration.stop();
        }
        if !drained.is_empty() {
            info!(event = "integrations_stopped", count = drained.len(), "All integrations stopped");
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Integration>>> {
        self.integrations.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Integration>>> {
        self.integrations.write().unwrap_or_else(PoisonError::into_inner)
    }
}
