//! Environment variable secret backend (`env:VAR_NAME`)

use super::registry::Plugin;
use super::BoxError;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
#[error("environment variable {name} is not set or is not valid unicode")]
pub struct MissingVariable {
    name: String,
}

/// Resolves identifiers as process environment variable names
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvPlugin;

#[async_trait]
impl Plugin for EnvPlugin {
    fn prefix(&self) -> &str {
        "env"
    }

    async fn load(&self, _cancel: &CancellationToken, id: &str) -> Result<String, BoxError> {
        std::env::var(id).map_err(|_| {
            Box::new(MissingVariable {
                name: id.to_string(),
            }) as BoxError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loads_variable_from_environment() {
        std::env::set_var("INTEGRATION_PROXY_ENV_PLUGIN_TEST", "s3cr3t");
        let value = EnvPlugin
            .load(&CancellationToken::new(), "INTEGRATION_PROXY_ENV_PLUGIN_TEST")
            .await
            .unwrap();
        assert_eq!(value, "s3cr3t");
    }

    #[tokio::test]
    async fn test_missing_variable_names_the_variable() {
        let err = EnvPlugin
            .load(&CancellationToken::new(), "INTEGRATION_PROXY_DEFINITELY_UNSET")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("INTEGRATION_PROXY_DEFINITELY_UNSET"));
    }
}
