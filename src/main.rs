//! nodeup - in-place node upgrade for Kubernetes clusters on Azure VMs.
//!
//! Replaces each master (one at a time) and each node of the selected
//! agent pools (a bounded number at a time) with a VM deployed from the
//! cluster's rendered ARM template at the target Kubernetes version.

mod config;
mod output;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::{debug, error, info};

use config::{Args, BUILD_DATE, COMMIT, Config, LogFormat, VERSION};
use nodeup::arm::{ArmClient, ArmRestClient, AzureCliTokenSource, StaticTokenSource, TokenSource};
use nodeup::build_orchestrator;
use output::print_topology;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(&args.log_level, args.log_format) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    debug!(
        "Starting nodeup v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Main application logic.
async fn run(config: &Config) -> Result<()> {
    let tokens: Arc<dyn TokenSource> = match &config.access_token {
        Some(token) => Arc::new(StaticTokenSource::new(token.as_str())),
        None => Arc::new(AzureCliTokenSource::new()),
    };
    let client: Arc<dyn ArmClient> = Arc::new(
        ArmRestClient::new(config.subscription_id.to_string(), tokens)
            .context("Failed to build ARM client")?,
    );

    let request = config.build_request();
    info!(
        cluster = %config.cluster.name,
        resource_group = %config.resource_group,
        target_version = request.target_version(),
        "Upgrading cluster"
    );

    let mut orchestrator = build_orchestrator(client, &request, &config.options).await?;
    let outcome = orchestrator.run(&request).await;

    if let Some(topology) = orchestrator.topology() {
        print_topology(topology, &config.resource_group);
    }

    let result = outcome?;
    println!();
    println!(
        "  {} Upgraded {} node(s) to {} in {}s",
        "✓".green(),
        result.upgraded_count(),
        request.target_version().bold(),
        result.duration().num_seconds()
    );
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    match format {
        LogFormat::Json => fmt().with_env_filter(filter).json().with_target(true).init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init(),
    }

    Ok(())
}
