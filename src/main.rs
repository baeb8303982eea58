//! Cloudflare ban synchronizer CLI.

use anyhow::Result;
use clap::Parser;
use cloudflare_ban_sync::config::AccountConfig;
use cloudflare_ban_sync::generate::discover_accounts;
use cloudflare_ban_sync::metrics::Metrics;
use cloudflare_ban_sync::{supervisor, CloudflareClient, Config, LapiStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cloudflare-ban-sync")]
#[command(about = "Synchronize CrowdSec ban decisions into Cloudflare IP lists and firewall rules")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cloudflare-ban-sync.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Comma-separated API tokens; write their accounts and zones to the
    /// config file and exit
    #[arg(short = 'g', long, value_delimiter = ',', value_name = "TOKENS")]
    generate_config: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if let Some(tokens) = &args.generate_config {
        return generate_config(&args.config, tokens).await;
    }

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let feed = LapiStream::new(
        &config.crowdsec_lapi_url,
        &config.crowdsec_lapi_key,
        Duration::from_secs(config.crowdsec_update_frequency_seconds),
        config.cloudflare.request_timeout(),
    )?;

    let metrics = Metrics::new()?;
    let cloudflare = &config.cloudflare;
    let make_api = |account: &AccountConfig| {
        CloudflareClient::new(&cloudflare.api_url, account, cloudflare.request_timeout())
            .map_err(anyhow::Error::from)
    };

    info!(
        accounts = cloudflare.accounts.len(),
        lapi_url = %config.crowdsec_lapi_url,
        "Starting ban synchronizer"
    );

    let result = tokio::select! {
        result = supervisor::run(&cloudflare.accounts, cloudflare.update_frequency(), make_api, feed, &metrics) => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping");
            Ok(())
        }
    };

    info!(api_calls = metrics.api_calls_total(), "Cloudflare API calls made");
    result
}

/// Write the accounts and zones visible to `tokens` into the config at
/// `path`, keeping its other settings when it already exists.
async fn generate_config(path: &Path, tokens: &[String]) -> Result<()> {
    let mut config = if path.exists() {
        Config::read(path)?
    } else {
        Config::skeleton()
    };

    let cloudflare = &config.cloudflare;
    let make_api = |token: &str| {
        CloudflareClient::for_token(&cloudflare.api_url, token, cloudflare.request_timeout())
            .map_err(anyhow::Error::from)
    };
    let accounts = discover_accounts(tokens, make_api).await?;
    let zones: usize = accounts.iter().map(|a| a.zones.len()).sum();
    config.cloudflare.accounts = accounts;

    std::fs::write(path, config.to_yaml()?)?;
    info!(
        config = %path.display(),
        accounts = config.cloudflare.accounts.len(),
        zones,
        "Configuration written"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
