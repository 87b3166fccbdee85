//! The ingestion orchestrator
//!
//! One [`Orchestrator::run_once`] call is one polling cycle, meant to be
//! fired by cron: discover tarball/metadata pairs in the staging buckets,
//! stage the new ones and propose them for review, ingest the approved ones,
//! and report outcomes (tracking issue per failure, optional notification
//! per success).
//!
//! Both staging and ingestion are gated by the current ledger state, so
//! running the cycle twice without external changes does nothing the second
//! time. Repositories are processed strictly sequentially (the command
//! interface supports one open transaction per repository), and the whole
//! pass is guarded by a lock file so an overlapping cron trigger skips.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use stratum_common::checksum;
use stratum_common::error::IngestError;
use stratum_publish::tarball::Tarball;
use stratum_publish::IngestExecutor;

use crate::config::Config;
use crate::github::GithubClient;
use crate::ledger::{ApprovalStatus, Ledger, LedgerState};
use crate::metadata::TarballMetadata;
use crate::notify::Notifier;
use crate::storage::{RemoteTarball, StagingBucket};

/// Outcome counters for one polling cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub discovered: usize,
    pub staged: usize,
    pub ingested: usize,
    pub failed: usize,
    pub rejected: usize,
    pub skipped: usize,
}

/// Whether to keep going with the remaining tarballs of a repository.
enum Flow {
    Continue,
    /// A failed abort left the repository in an unknown transaction state;
    /// stop automated ingestion against it until someone looks.
    HaltRepository,
}

/// Lock file guarding against overlapping runs. Removed on drop.
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock; `None` means another run holds it.
    fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to create lock file {}", path.display()))
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {err}", self.path.display());
        }
    }
}

/// Drives the whole pipeline for every configured bucket/repository pair.
pub struct Orchestrator {
    config: Config,
    github: GithubClient,
    executor: IngestExecutor,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        let github = GithubClient::new(config.github.api_url.clone(), &Config::github_token()?)?;
        let executor = IngestExecutor::new(config.ingestion.clone());
        let notifier = Notifier::new(
            Config::slack_webhook(),
            config.slack.ingestion_notification,
        );
        Ok(Self {
            config,
            github,
            executor,
            notifier,
        })
    }

    /// Run one polling cycle. With `list_only`, discovered pairs and their
    /// ledger states are logged and nothing is acted on.
    pub async fn run_once(&self, list_only: bool) -> Result<RunSummary> {
        let Some(_lock) = RunLock::acquire(&self.config.paths.lock_file)? else {
            warn!(
                "Another run holds {}; skipping this pass",
                self.config.paths.lock_file.display()
            );
            return Ok(RunSummary::default());
        };

        let span = info_span!("ingestion_pass", run_id = %Uuid::new_v4());
        async {
            let mut summary = RunSummary::default();
            for (bucket_name, repo) in &self.config.buckets {
                if let Err(err) = self
                    .process_bucket(bucket_name, repo, list_only, &mut summary)
                    .await
                {
                    // Storage or review host unreachable: nothing in the
                    // ledger moved, the next scheduled pass retries.
                    error!("Processing bucket {bucket_name} for {repo} failed: {err:#}");
                }
            }
            info!(
                discovered = summary.discovered,
                staged = summary.staged,
                ingested = summary.ingested,
                failed = summary.failed,
                rejected = summary.rejected,
                skipped = summary.skipped,
                "pass complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn process_bucket(
        &self,
        bucket_name: &str,
        repo: &str,
        list_only: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        info!("Processing bucket {bucket_name} for repository {repo}");
        let bucket = StagingBucket::new(&self.config.aws, bucket_name).await?;
        let ledger = Ledger::new(
            self.github.clone(),
            self.config.github.staging_repo.clone(),
            self.config.github.default_branch.clone(),
            self.config.paths.metadata_file_extension.clone(),
        );

        let tarballs = bucket
            .list_tarballs(&self.config.paths.metadata_file_extension)
            .await?;
        summary.discovered += tarballs.len();

        for remote in &tarballs {
            let state = ledger.find_state(&remote.key).await?;
            if list_only {
                let state = state.map_or("new", |s| s.dir_name());
                info!("[{bucket_name}] {} ({state})", remote.key);
                continue;
            }

            match self
                .process_tarball(&bucket, repo, &ledger, remote, state, summary)
                .await
            {
                Ok(Flow::Continue) => {}
                Ok(Flow::HaltRepository) => {
                    error!(
                        "Halting automated ingestion against {repo} until the open \
                         transaction is cleared manually"
                    );
                    break;
                }
                Err(err) => {
                    error!("Failed to process {}: {err:#}", remote.key);
                }
            }
        }
        Ok(())
    }

    async fn process_tarball(
        &self,
        bucket: &StagingBucket,
        repo: &str,
        ledger: &Ledger,
        remote: &RemoteTarball,
        state: Option<LedgerState>,
        summary: &mut RunSummary,
    ) -> Result<Flow> {
        match state {
            None => {
                self.handle_new(bucket, ledger, remote, summary).await?;
                Ok(Flow::Continue)
            }
            Some(LedgerState::Staged) => {
                self.handle_staged(bucket, ledger, remote, summary).await?;
                Ok(Flow::Continue)
            }
            Some(LedgerState::Approved) => {
                self.handle_approved(bucket, repo, ledger, remote, summary)
                    .await
            }
            Some(state) => {
                debug!("{} is {state}, nothing to do", remote.key);
                summary.skipped += 1;
                Ok(Flow::Continue)
            }
        }
    }

    /// A tarball never seen before: stage its metadata, then immediately
    /// drive the review request.
    async fn handle_new(
        &self,
        bucket: &StagingBucket,
        ledger: &Ledger,
        remote: &RemoteTarball,
        summary: &mut RunSummary,
    ) -> Result<()> {
        info!("Found new tarball {}", remote.key);
        let metadata_contents = self.fetch_metadata_contents(bucket, remote).await?;
        let metadata = match TarballMetadata::parse(&metadata_contents) {
            Ok(metadata) => metadata,
            Err(err) => {
                self.file_issue(
                    &format!("Cannot parse metadata of {}", remote.key),
                    &format!(
                        "The metadata file `{}` does not parse:\n```\n{err:#}\n```",
                        remote.metadata_key
                    ),
                )
                .await;
                return Ok(());
            }
        };

        if ledger.stage(&remote.key, &metadata_contents).await? {
            summary.staged += 1;
            self.update_producer_comment(&metadata, "staged for ingestion")
                .await;
        }
        self.handle_staged(bucket, ledger, remote, summary).await
    }

    /// A staged tarball: open the review request, or react to the review's
    /// decision.
    async fn handle_staged(
        &self,
        bucket: &StagingBucket,
        ledger: &Ledger,
        remote: &RemoteTarball,
        summary: &mut RunSummary,
    ) -> Result<()> {
        match ledger.approval_status(&remote.key).await? {
            ApprovalStatus::NeedsRequest => {
                let metadata_contents = self.fetch_metadata_contents(bucket, remote).await?;
                let overview = match self.contents_overview(bucket, remote).await {
                    Ok(overview) => overview,
                    Err(err) => {
                        warn!("Cannot build contents overview for {}: {err:#}", remote.key);
                        self.file_issue(
                            &format!("Failed to get contents of {}", remote.key),
                            &format!(
                                "Building the contents overview of `{}` failed:\n```\n{err:#}\n```",
                                remote.key
                            ),
                        )
                        .await;
                        return Ok(());
                    }
                };
                let body = render_pr_body(&overview, &metadata_contents);
                ledger.request_approval(&remote.key, &body).await?;
                if let Ok(metadata) = TarballMetadata::parse(&metadata_contents) {
                    self.update_producer_comment(&metadata, "awaiting review")
                        .await;
                }
            }
            ApprovalStatus::PendingReview { pr_url } => {
                info!("{} still under review in {pr_url}", remote.key);
                summary.skipped += 1;
            }
            ApprovalStatus::RejectedByReview => {
                info!("Review rejected {}", remote.key);
                ledger.mark_rejected(&remote.key).await?;
                summary.rejected += 1;
                if let Ok(metadata) = self.metadata_for(bucket, remote).await {
                    self.update_producer_comment(&metadata, "rejected by review")
                        .await;
                }
            }
            ApprovalStatus::Inconsistent { detail } => {
                warn!("{} is in an odd review state, skipping: {detail}", remote.key);
                summary.skipped += 1;
            }
        }
        Ok(())
    }

    /// An approved tarball: download, verify, ingest, and report.
    async fn handle_approved(
        &self,
        bucket: &StagingBucket,
        repo: &str,
        ledger: &Ledger,
        remote: &RemoteTarball,
        summary: &mut RunSummary,
    ) -> Result<Flow> {
        info!("{} is approved, ingesting into {repo}", remote.key);
        let metadata = self.metadata_for(bucket, remote).await?;

        let local_path = self.local_path(remote.file_name());
        bucket.download(&remote.key, &local_path).await?;

        if let Err(err) = checksum::verify_sha256(&local_path, &metadata.payload.sha256sum) {
            return self
                .report_failure(ledger, remote, &metadata, &err, summary)
                .await;
        }

        match self.executor.ingest_tarball(repo, &local_path).await {
            Ok(class) => {
                ledger.mark_ingested(&remote.key).await?;
                summary.ingested += 1;
                info!("{} ({class}) ingested into {repo}", remote.key);
                self.notifier.ingested(remote.file_name(), repo).await;
                self.update_producer_comment(&metadata, "ingested").await;
                Ok(Flow::Continue)
            }
            Err(err) => self.report_failure(ledger, remote, &metadata, &err, summary).await,
        }
    }

    async fn report_failure(
        &self,
        ledger: &Ledger,
        remote: &RemoteTarball,
        metadata: &TarballMetadata,
        err: &IngestError,
        summary: &mut RunSummary,
    ) -> Result<Flow> {
        error!("Ingestion of {} failed: {err}", remote.key);
        summary.failed += 1;
        ledger.mark_failed(&remote.key, &err.to_string()).await?;
        self.file_issue(
            &format!("Failed to ingest {}", remote.key),
            &render_issue_body(&remote.key, err),
        )
        .await;
        self.update_producer_comment(metadata, "ingestion failed").await;

        if err.is_fatal_for_repository() {
            Ok(Flow::HaltRepository)
        } else {
            Ok(Flow::Continue)
        }
    }

    /// File a tracking issue on the staging repository unless an open one
    /// with the same title already exists.
    async fn file_issue(&self, title: &str, body: &str) {
        let staging_repo = &self.config.github.staging_repo;
        let result: Result<()> = async {
            if self.github.open_issue_exists(staging_repo, title).await? {
                info!("An open issue titled '{title}' already exists, not filing another");
                return Ok(());
            }
            self.github.create_issue(staging_repo, title, body).await
        }
        .await;
        if let Err(err) = result {
            error!("Failed to file issue '{title}': {err:#}");
        }
    }

    /// Append a status row to the producer pull request's tracking comment.
    /// Strictly best-effort: failures are logged and never propagate.
    async fn update_producer_comment(&self, metadata: &TarballMetadata, status: &str) {
        let Some(link) = &metadata.link2pr else {
            return;
        };
        let result: Result<()> = async {
            let comments = self.github.issue_comments(&link.repo, link.pr).await?;
            let comment = match link.pr_comment_id {
                Some(id) => comments.into_iter().find(|c| c.id == id),
                None => comments
                    .into_iter()
                    .find(|c| c.body.contains(&metadata.payload.filename)),
            };
            let Some(comment) = comment else {
                debug!(
                    "No tracking comment for {} in {}#{}",
                    metadata.payload.filename, link.repo, link.pr
                );
                return Ok(());
            };
            let row = format!("|{}|{status}|", Utc::now().format("%b %d %X UTC %Y"));
            let body = format!("{}\n{row}", comment.body);
            self.github.update_comment(&link.repo, comment.id, &body).await
        }
        .await;
        if let Err(err) = result {
            warn!(
                "Failed to update producer comment in {}#{}: {err:#}",
                link.repo, link.pr
            );
        }
    }

    async fn fetch_metadata_contents(
        &self,
        bucket: &StagingBucket,
        remote: &RemoteTarball,
    ) -> Result<String> {
        let local = self.local_path(&format!(
            "{}{}",
            remote.file_name(),
            self.config.paths.metadata_file_extension
        ));
        bucket.download(&remote.metadata_key, &local).await?;
        std::fs::read_to_string(&local)
            .with_context(|| format!("Failed to read {}", local.display()))
    }

    async fn metadata_for(
        &self,
        bucket: &StagingBucket,
        remote: &RemoteTarball,
    ) -> Result<TarballMetadata> {
        let contents = self.fetch_metadata_contents(bucket, remote).await?;
        TarballMetadata::parse(&contents)
    }

    async fn contents_overview(
        &self,
        bucket: &StagingBucket,
        remote: &RemoteTarball,
    ) -> Result<String> {
        let local_path = self.local_path(remote.file_name());
        bucket.download(&remote.key, &local_path).await?;
        let tarball = Tarball::open(&local_path)?;
        Ok(tarball.contents_overview(&bucket.object_url(&remote.key))?)
    }

    fn local_path(&self, file_name: &str) -> PathBuf {
        self.config.paths.download_dir.join(file_name)
    }
}

/// Body of the review pull request: the producer metadata plus what the
/// tarball actually contains.
fn render_pr_body(overview: &str, metadata_contents: &str) -> String {
    format!(
        "A new tarball is ready for ingestion and needs your approval.\n\n\
         Merge this pull request to approve it, close the pull request to \
         reject it.\n\n\
         Metadata:\n```\n{metadata_contents}\n```\n\n{overview}"
    )
}

/// Body of the tracking issue for one failed ingestion attempt.
fn render_issue_body(tarball: &str, err: &IngestError) -> String {
    format!(
        "Ingestion of `{tarball}` failed.\n\n\
         Diagnostic:\n```\n{err}\n```\n\n\
         The tarball stays available in the staging bucket; a corrected \
         upload needs a new timestamp to be picked up as a fresh entry."
    )
}
