//! Stratum Ingest Library
//!
//! The automated ingestion orchestrator for a CernVM-FS style distribution
//! tree: discovers producer tarballs in staging buckets, books them through
//! the review ledger, and drives `stratum-publish`'s executor for the
//! approved ones.
//!
//! # Overview
//!
//! - [`config`]: the explicit configuration struct threaded everywhere
//! - [`storage`]: staging bucket listing and cached downloads
//! - [`github`]: review-host API client
//! - [`metadata`]: producer metadata documents
//! - [`ledger`]: the directory-per-state staging ledger
//! - [`notify`]: fire-and-forget success notifications
//! - [`orchestrator`]: one polling cycle over all of the above

pub mod config;
pub mod github;
pub mod ledger;
pub mod metadata;
pub mod notify;
pub mod orchestrator;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{Orchestrator, RunSummary};

use clap::Parser;
use std::path::PathBuf;

/// Automated tarball ingestion for the distribution tree
#[derive(Parser, Debug)]
#[command(name = "stratum-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "stratum-ingest.toml")]
    pub config: PathBuf,

    /// Only list discovered tarballs and their ledger states
    #[arg(short, long)]
    pub list_only: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Print CLI documentation as markdown and exit
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}
