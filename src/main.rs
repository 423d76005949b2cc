use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostpool::{cli, config, Core};

#[derive(Parser)]
#[command(name = "hostpool")]
#[command(version, about = "Health-checked, DNS-driven HTTP client for one hostname", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (YAML); falls back to HOSTPOOL_* environment variables
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print pool health (OK, WARNING or ERROR) with per-endpoint detail
    Check,

    /// Print the addresses the hostname currently resolves to
    Resolve,

    /// GET a path through the pool
    Get {
        /// Path and query, e.g. /status?verbose=1
        path: String,

        /// Print status line and response headers
        #[arg(short, long)]
        include: bool,
    },

    /// Print the health report periodically until Ctrl-C
    Watch {
        /// Seconds between reports (defaults to the DNS refresh period)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        every: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Probe and refresh tasks run alongside the command
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

fn watch_interval(every: Option<u64>, refresh_period: Duration) -> Duration {
    every.map(Duration::from_secs).unwrap_or(refresh_period)
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let refresh_period = config.dns_refresh_period();

    let core = Core::new(config).await?;

    let result = match cli.command {
        Commands::Check => cli::cmd_check(&core).await,
        Commands::Resolve => cli::cmd_resolve(&core).await,
        Commands::Get { path, include } => cli::cmd_get(&core, &path, include).await,
        Commands::Watch { every } => {
            cli::cmd_watch(&core, watch_interval(every, refresh_period)).await
        }
    };

    core.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_rejects_zero_interval() {
        assert!(Cli::try_parse_from(["hostpool", "watch", "--every", "0"]).is_err());

        let cli = Cli::try_parse_from(["hostpool", "watch", "--every", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Watch { every: Some(5) }));
    }

    #[test]
    fn test_watch_defaults_to_refresh_period() {
        let refresh = Duration::from_secs(300);
        assert_eq!(watch_interval(None, refresh), refresh);
        assert_eq!(watch_interval(Some(7), refresh), Duration::from_secs(7));
    }
}
