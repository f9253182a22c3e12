//! Configuration module
//!
//! Handles loading and parsing of proxy configuration

use crate::error::ProxyError;
use crate::secrets::SecretRegistry;
use clap::Parser;
use hyper::header::HeaderName;
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder replaced by the resolved secret in a credential format
pub const SECRET_PLACEHOLDER: &str = "{secret}";

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listening address and port
    pub listen: ListenConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Secret resolution settings
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Integrations registered at startup
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
}

/// Listen configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Secret cache configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// How long resolved secrets stay cached; zero keeps them until cleared
    #[serde(default, with = "duration_serde")]
    pub cache_ttl: Duration,
}

/// One routable upstream integration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IntegrationConfig {
    /// Routing key, matched against the request's Host header
    pub name: String,
    /// Upstream base URL (`http://` or `ws://`)
    pub destination: String,
    /// Client to upstream admissions per second
    pub in_rate_limit: f64,
    /// Upstream to client admissions per second
    pub out_rate_limit: f64,
    /// Burst capacity for both directions; defaults to each direction's rate
    #[serde(default)]
    pub burst: Option<f64>,
    /// Bound on connecting to the upstream and receiving its response head
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Credential injected into upstream requests
    #[serde(default)]
    pub credential: Option<CredentialConfig>,
}

/// Credential header resolved from one of several equivalent secrets
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CredentialConfig {
    /// Header name, e.g. `authorization`
    pub header: String,
    /// Secret references; one is chosen at random per request
    pub secrets: Vec<String>,
    /// Header value template containing `{secret}`
    #[serde(default = "default_credential_format")]
    pub format: String,
}

impl IntegrationConfig {
    /// Create an integration without burst override or credential
    pub fn new<N: Into<String>, D: Into<String>>(
        name: N,
        destination: D,
        in_rate_limit: f64,
        out_rate_limit: f64,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            in_rate_limit,
            out_rate_limit,
            burst: None,
            timeout: default_timeout(),
            credential: None,
        }
    }

    /// Attach a credential header to the integration
    pub fn with_credential(mut self, credential: CredentialConfig) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Validate the integration and return its parsed destination
    pub fn validate(&self) -> Result<Uri, ProxyError> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::validation("name", "integration name cannot be empty"));
        }

        let destination = parse_destination(&self.destination)?;

        for (field, rate) in [
            ("in_rate_limit", self.in_rate_limit),
            ("out_rate_limit", self.out_rate_limit),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ProxyError::validation(
                    field,
                    format!("must be a positive number for '{}', got {}", self.name, rate),
                ));
            }
        }

        if let Some(burst) = self.burst {
            if !burst.is_finite() || burst < 1.0 {
                return Err(ProxyError::validation(
                    "burst",
                    format!("must be at least 1 for '{}', got {}", self.name, burst),
                ));
            }
        }

        if self.timeout.is_zero() {
            return Err(ProxyError::validation(
                "timeout",
                format!("must be greater than zero for '{}'", self.name),
            ));
        }

        if let Some(ref credential) = self.credential {
            credential.validate()?;
        }

        Ok(destination)
    }
}

impl CredentialConfig {
    pub fn new<H: Into<String>>(header: H, secrets: Vec<String>) -> Self {
        Self {
            header: header.into(),
            secrets,
            format: default_credential_format(),
        }
    }

    /// Use a value template such as `Bearer {secret}`
    pub fn with_format<F: Into<String>>(mut self, format: F) -> Self {
        self.format = format.into();
        self
    }

    /// Render the header value for a resolved secret
    pub fn render(&self, secret: &str) -> String {
        self.format.replace(SECRET_PLACEHOLDER, secret)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        HeaderName::from_bytes(self.header.as_bytes()).map_err(|e| {
            ProxyError::validation(
                "credential.header",
                format!("invalid header name '{}': {}", self.header, e),
            )
        })?;

        if self.secrets.is_empty() {
            return Err(ProxyError::validation(
                "credential.secrets",
                "at least one secret reference is required",
            ));
        }

        if !self.format.contains(SECRET_PLACEHOLDER) {
            return Err(ProxyError::validation(
                "credential.format",
                format!("'{}' does not contain {}", self.format, SECRET_PLACEHOLDER),
            ));
        }

        Ok(())
    }
}

/// Parse an integration destination into an absolute `http` URI
///
/// `ws://` destinations are accepted and treated as plain HTTP, since the
/// upgrade handshake is carried over HTTP/1.1 either way.
pub fn parse_destination(destination: &str) -> Result<Uri, ProxyError> {
    let uri: Uri = destination.parse().map_err(|e| {
        ProxyError::validation("destination", format!("'{}' is not a valid URL: {}", destination, e))
    })?;

    match uri.scheme_str() {
        Some("http") | Some("ws") => {}
        Some(other) => {
            return Err(ProxyError::validation(
                "destination",
                format!("unsupported scheme '{}' in '{}'", other, destination),
            ))
        }
        None => {
            return Err(ProxyError::validation(
                "destination",
                format!("'{}' must be an absolute URL", destination),
            ))
        }
    }

    match uri.host() {
        Some(host) if !host.is_empty() => Ok(uri),
        _ => Err(ProxyError::validation(
            "destination",
            format!("'{}' has no host", destination),
        )),
    }
}

// Default value functions
fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_credential_format() -> String {
    SECRET_PLACEHOLDER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "integration-proxy")]
#[command(about = "Reverse proxy for third-party integrations with rate limiting and WebSocket tunnelling")]
#[command(version)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "integration-proxy.yaml")]
    pub config: PathBuf,

    /// Override listen address
    #[arg(long)]
    pub listen_address: Option<String>,

    /// Override listen port
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Override log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the secret cache TTL in seconds (0 disables expiry)
    #[arg(long)]
    pub cache_ttl: Option<u64>,
}

// Durations are written as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl ProxyConfig {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: ProxyConfig = serde_yaml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from command-line arguments
    pub fn from_args(args: Args) -> Result<Self, ProxyError> {
        let mut config = Self::from_file(&args.config)?;

        if let Some(address) = args.listen_address {
            config.listen.address = address;
        }

        if let Some(port) = args.listen_port {
            config.listen.port = port;
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if let Some(cache_ttl) = args.cache_ttl {
            config.secrets.cache_ttl = Duration::from_secs(cache_ttl);
        }

        config.validate()?;

        Ok(config)
    }

    /// Create a configuration for testing with no integrations
    pub fn default_for_testing() -> Self {
        Self {
            listen: ListenConfig {
                address: "127.0.0.1".to_string(),
                port: 0,
            },
            logging: LoggingConfig::default(),
            secrets: SecretsConfig::default(),
            integrations: vec![],
        }
    }

    /// Get socket address for listening
    pub fn socket_addr(&self) -> Result<SocketAddr, ProxyError> {
        let addr = format!("{}:{}", self.listen.address, self.listen.port);
        addr.parse()
            .map_err(|e| ProxyError::Config(format!("Invalid address: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ProxyError> {
        self.socket_addr()?;
        self.validate_logging_config()?;
        self.validate_integrations()?;
        Ok(())
    }

    /// Check every credential reference against the registered secret plugins
    ///
    /// Runs before any integration is registered so malformed or unknown
    /// references fail at startup rather than on the first request.
    pub fn validate_secrets(&self, secrets: &SecretRegistry) -> Result<(), ProxyError> {
        for integration in &self.integrations {
            if let Some(ref credential) = integration.credential {
                for reference in &credential.secrets {
                    secrets.validate_secret(reference).map_err(|e| {
                        ProxyError::validation(
                            format!("integrations.{}.credential.secrets", integration.name),
                            e.to_string(),
                        )
                    })?;
                }
            }
        }
        Ok(())
    }

    fn validate_logging_config(&self) -> Result<(), ProxyError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ProxyError::Config(format!(
                "Invalid log level '{}'. Valid levels: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }

    fn validate_integrations(&self) -> Result<(), ProxyError> {
        let mut names = HashSet::new();
        for integration in &self.integrations {
            integration.validate()?;
            if !names.insert(integration.name.as_str()) {
                return Err(ProxyError::DuplicateIntegration {
                    name: integration.name.clone(),
                });
            }
        }
        Ok(())
    }
}
