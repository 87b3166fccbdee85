//! stratum-publish - one-shot tarball ingestion
//!
//! Validates a local tarball against the target tree's layout rules and
//! publishes it transactionally. Exit codes distinguish validation failures
//! from precondition and transactional ones; see `stratum_common::error`.

use std::path::PathBuf;

use clap::Parser;
use stratum_common::logging::{init_logging, LogConfig, LogLevel};
use stratum_publish::cvmfs::CvmfsSettings;
use stratum_publish::executor::{ExecutorConfig, IngestExecutor};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stratum-publish")]
#[command(author, version, about = "Validate and publish one tarball into a target repository")]
struct Cli {
    /// Target repository (must be served by this host)
    repo: String,

    /// Path to the local tarball
    tarball: PathBuf,

    /// Target tree partitions tarballs by tenant project
    #[arg(long)]
    tenant: bool,

    /// Repository whose software ingests trigger module cache regeneration
    #[arg(long)]
    primary_repo: Option<String>,

    /// External script that rebuilds module caches
    #[arg(long)]
    module_cache_script: Option<PathBuf>,

    /// cvmfs_server command to invoke
    #[arg(long, default_value = "cvmfs_server")]
    cvmfs_command: String,

    /// Invoke cvmfs_server directly instead of through sudo
    #[arg(long)]
    no_sudo: bool,

    /// Mount point of the repositories
    #[arg(long, default_value = "/cvmfs")]
    repo_root: PathBuf,

    /// Timeout in seconds for each external command
    #[arg(long, default_value_t = stratum_publish::cvmfs::DEFAULT_COMMAND_TIMEOUT_SECS)]
    command_timeout_secs: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_level(log_level)
        .with_file_prefix("stratum-publish");
    if let Err(err) = init_logging(&log_config) {
        eprintln!("failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    let executor = IngestExecutor::new(ExecutorConfig {
        cvmfs: CvmfsSettings {
            command: cli.cvmfs_command,
            ingest_as_root: !cli.no_sudo,
            repo_root: cli.repo_root,
            command_timeout_secs: cli.command_timeout_secs,
        },
        tenant: cli.tenant,
        primary_repo: cli.primary_repo,
        module_cache_script: cli.module_cache_script,
    });

    match executor.ingest_tarball(&cli.repo, &cli.tarball).await {
        Ok(class) => {
            info!(
                repo = %cli.repo,
                tarball = %cli.tarball.display(),
                class = %class,
                "published"
            );
        }
        Err(err) => {
            error!(repo = %cli.repo, tarball = %cli.tarball.display(), "{err}");
            std::process::exit(err.exit_code());
        }
    }
}
