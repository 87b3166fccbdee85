//! stratum-ingest - one polling cycle of the ingestion orchestrator
//!
//! Designed to run from cron; overlapping invocations skip via the lock
//! file configured in `paths.lock_file`.

use clap::Parser;
use stratum_common::logging::{init_logging, LogConfig, LogLevel};
use stratum_ingest::{Cli, Config, Orchestrator};
use tracing::error;

#[tokio::main]
async fn main() {
    // Pick up secrets from a local .env when present (dev setups)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_level(log_level)
        .with_file_prefix("stratum-ingest");
    if let Err(err) = init_logging(&log_config) {
        eprintln!("failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    let result = async {
        let config = Config::load(&cli.config)?;
        let orchestrator = Orchestrator::new(config)?;
        orchestrator.run_once(cli.list_only).await
    }
    .await;

    if let Err(err) = result {
        error!("Ingestion pass failed: {err:#}");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
