//! Configuration for the ingestion orchestrator
//!
//! One explicit [`Config`] struct is loaded at startup (TOML file layered
//! with `STRATUM_*` environment overrides) and threaded through every
//! component; nothing reads process-global state after that. Secrets never
//! live in the file: AWS credentials come from the SDK's environment chain,
//! the review-host token from `STRATUM_GITHUB_TOKEN`/`GITHUB_TOKEN`, and the
//! notification webhook from `STRATUM_SLACK_WEBHOOK`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use stratum_publish::executor::ExecutorConfig;

/// Default extension of the metadata file accompanying each tarball.
pub const DEFAULT_METADATA_EXTENSION: &str = ".meta.txt";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aws: AwsConfig,

    /// Staging bucket name -> target repository name. Iterated in order;
    /// each repository is processed strictly sequentially.
    pub buckets: BTreeMap<String, String>,

    #[serde(default)]
    pub paths: PathsConfig,

    pub github: GithubConfig,

    #[serde(default)]
    pub slack: SlackConfig,

    /// Host-side ingestion settings, shared with `stratum-publish`.
    #[serde(default)]
    pub ingestion: ExecutorConfig,
}

/// Object storage endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Custom endpoint for S3-compatible backends (MinIO etc.)
    pub endpoint_url: Option<String>,
    pub region: String,
    /// S3-compatible services usually want path-style addressing
    pub path_style: bool,
    /// Static credentials; when absent the SDK's environment chain applies
    /// (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY).
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: "us-east-1".to_string(),
            path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Local paths used by one run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where tarballs and metadata files are downloaded to.
    pub download_dir: PathBuf,

    /// Extension of the metadata file accompanying each tarball.
    pub metadata_file_extension: String,

    /// Lock file guarding against overlapping runs.
    pub lock_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/var/spool/stratum/downloads"),
            metadata_file_extension: DEFAULT_METADATA_EXTENSION.to_string(),
            lock_file: PathBuf::from("/var/spool/stratum/stratum-ingest.lock"),
        }
    }
}

/// Review host settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    /// Staging repository holding the ledger state directories
    /// (e.g. "example/staging").
    pub staging_repo: String,

    /// Branch the ledger's state directories live on.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// API endpoint; override for GitHub Enterprise or tests.
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

/// Notification settings. The webhook itself comes from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Send a message for every successful ingestion.
    pub ingestion_notification: bool,
}

impl Config {
    /// Load configuration from a TOML file plus `STRATUM_*` environment
    /// overrides (e.g. `STRATUM_GITHUB__STAGING_REPO`).
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("STRATUM").separator("__"))
            .build()
            .with_context(|| format!("Unable to read configuration file {}", path.display()))?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.buckets.is_empty() {
            bail!("Configuration maps no staging buckets to target repositories");
        }
        if !self.github.staging_repo.contains('/') {
            bail!(
                "github.staging_repo must be an owner/name pair, got '{}'",
                self.github.staging_repo
            );
        }
        if self.paths.metadata_file_extension.is_empty() {
            bail!("paths.metadata_file_extension must not be empty");
        }
        Ok(())
    }

    /// Review-host token from the environment.
    pub fn github_token() -> Result<String> {
        std::env::var("STRATUM_GITHUB_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .context("Neither STRATUM_GITHUB_TOKEN nor GITHUB_TOKEN is set")
    }

    /// Notification webhook from the environment, if configured.
    pub fn slack_webhook() -> Option<String> {
        std::env::var("STRATUM_SLACK_WEBHOOK").ok()
    }
}
