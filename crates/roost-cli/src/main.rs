use anyhow::Result;
use clap::{Parser, Subcommand};
use roost_storage::{HttpClientConfig, HttpFetcher, InstanceRegistry};
use roost_sync::{PollDriver, WatchConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "roost")]
#[command(about = "Mirror feed monitor: polls mirror pools and notifies on new posts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single poll cycle and exit.
    Run,
    /// Poll continuously on the configured interval.
    Watch,
    /// Refresh the instance cache from the health-status API.
    RefreshInstances,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if config.targets.is_empty() {
                warn!("no targets configured; nothing to do");
                return Ok(());
            }
            let driver = PollDriver::new(config)?;
            let summary = driver.run_cycle().await?;
            info!(
                run_id = %summary.run_id,
                targets = summary.targets,
                notified = summary.notified,
                unchanged = summary.unchanged,
                misses = summary.misses,
                "cycle complete"
            );
        }
        Commands::Watch => {
            if config.targets.is_empty() {
                warn!("no targets configured; nothing to do");
                return Ok(());
            }
            let driver = PollDriver::new(config)?;
            driver.run_watch().await?;
        }
        Commands::RefreshInstances => {
            let fetcher = HttpFetcher::new(HttpClientConfig {
                user_agent: Some(config.user_agent.clone()),
                backoff: roost_storage::BackoffPolicy::transient(),
                ..Default::default()
            })?;
            let registry = InstanceRegistry::new(&config.instances_file);
            match registry.refresh(&fetcher, &config.health_api).await {
                Ok(count) => info!(hosts = count, "instance cache refreshed"),
                Err(err) => warn!(error = %err, "refresh failed; existing cache kept"),
            }
        }
    }

    Ok(())
}
