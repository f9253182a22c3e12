use clap::Parser;
use integration_proxy::config::Args;
use integration_proxy::{EnvPlugin, ProxyConfig, ProxyServer, SecretRegistry};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command-line arguments first
    let args = Args::parse();

    // Load configuration from file and apply CLI overrides
    let config = match ProxyConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Use --help for usage information");
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging.level) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    display_startup_info(&config);

    // Secret backends shipped with the binary
    let secrets = Arc::new(SecretRegistry::new(config.secrets.cache_ttl));
    secrets.register(Arc::new(EnvPlugin));

    let server = match ProxyServer::new(config, secrets) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create proxy server: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.start().await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let mut filter_str = format!("integration_proxy={},hyper=warn,tokio=warn", level);

    // Allow environment override
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        filter_str = env_filter;
    }

    let filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| format!("Invalid log filter '{}': {}", filter_str, e))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    info!("Log filter: {}", filter_str);
    Ok(())
}

fn display_startup_info(config: &ProxyConfig) {
    info!("=== Integration Proxy Startup Information ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Listen Address: {}:{}", config.listen.address, config.listen.port);
    info!("Log Level: {}", config.logging.level);

    if config.secrets.cache_ttl.is_zero() {
        info!("Secret cache: entries never expire");
    } else {
        info!("Secret cache TTL: {}s", config.secrets.cache_ttl.as_secs());
    }

    if config.integrations.is_empty() {
        info!("No integrations configured - every request will be rejected");
    } else {
        info!("{} integration(s) configured:", config.integrations.len());
        for (i, integration) in config.integrations.iter().enumerate() {
            info!(
                "  {}. '{}' -> {} (in: {}/s, out: {}/s{})",
                i + 1,
                integration.name,
                integration.destination,
                integration.in_rate_limit,
                integration.out_rate_limit,
                if integration.credential.is_some() { ", credential" } else { "" }
            );
        }
    }

    info!("=== End Startup Information ===");
}
