//! The staging ledger
//!
//! One metadata file per tarball lives in a directory named after its
//! lifecycle state, inside the staging repository:
//!
//! ```text
//! staged/    -> awaiting review
//! approved/  -> review merged, ready to ingest
//! rejected/  -> review closed without merging
//! ingested/  -> published into the target repository
//! failed/    -> ingestion attempted and failed
//! ```
//!
//! A transition is a file move (delete + create) committed through the
//! contents API, which makes every transition an auditable commit and
//! "has this tarball been handled" a file-existence probe. Transitions only
//! ever move forward; re-ingesting a corrected tarball takes a new upload
//! with a fresh timestamp.
//!
//! The `staged -> approved` edge is special: the move happens on a
//! per-tarball branch and a pull request carries it, so the merge (or close)
//! of that pull request is the human review decision.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::github::GithubClient;

/// Lifecycle states, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Staged,
    Approved,
    Rejected,
    Ingested,
    Failed,
}

impl LedgerState {
    pub const ALL: [LedgerState; 5] = [
        LedgerState::Staged,
        LedgerState::Approved,
        LedgerState::Rejected,
        LedgerState::Ingested,
        LedgerState::Failed,
    ];

    /// Name of the state's directory in the staging repository.
    pub fn dir_name(&self) -> &'static str {
        match self {
            LedgerState::Staged => "staged",
            LedgerState::Approved => "approved",
            LedgerState::Rejected => "rejected",
            LedgerState::Ingested => "ingested",
            LedgerState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Where a staged tarball stands in the review workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalStatus {
    /// No review request exists yet; one should be opened.
    NeedsRequest,
    /// The review pull request is open; nothing to do this pass.
    PendingReview { pr_url: String },
    /// The review pull request was closed without merging.
    RejectedByReview,
    /// Branch and pull request disagree with the ledger state; needs a
    /// human look, skip for now.
    Inconsistent { detail: String },
}

/// The ledger over one staging repository.
#[derive(Debug, Clone)]
pub struct Ledger {
    github: GithubClient,
    staging_repo: String,
    default_branch: String,
    metadata_extension: String,
}

impl Ledger {
    pub fn new(
        github: GithubClient,
        staging_repo: impl Into<String>,
        default_branch: impl Into<String>,
        metadata_extension: impl Into<String>,
    ) -> Self {
        Self {
            github,
            staging_repo: staging_repo.into(),
            default_branch: default_branch.into(),
            metadata_extension: metadata_extension.into(),
        }
    }

    pub fn staging_repo(&self) -> &str {
        &self.staging_repo
    }

    /// Ledger path of a tarball's metadata file in a given state.
    fn metadata_path(&self, state: LedgerState, object: &str) -> String {
        format!(
            "{}/{}{}",
            state.dir_name(),
            object,
            self.metadata_extension
        )
    }

    /// Branch carrying the approval request of one tarball.
    pub fn approval_branch(object: &str) -> String {
        let file_name = object.rsplit('/').next().unwrap_or(object);
        format!("{file_name}_approved")
    }

    /// Find which state a tarball is in, or `None` if it has never been
    /// staged.
    pub async fn find_state(&self, object: &str) -> Result<Option<LedgerState>> {
        for state in LedgerState::ALL {
            if self
                .github
                .file_exists(&self.staging_repo, &self.metadata_path(state, object))
                .await?
            {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Create a `staged` entry for a new tarball. Returns `false` without
    /// touching anything when the tarball is already ledgered in any state,
    /// so re-running discovery never duplicates entries.
    pub async fn stage(&self, object: &str, metadata_contents: &str) -> Result<bool> {
        if let Some(state) = self.find_state(object).await? {
            info!("{object} is already ledgered as {state}, not staging again");
            return Ok(false);
        }
        self.github
            .create_file(
                &self.staging_repo,
                &self.metadata_path(LedgerState::Staged, object),
                "new tarball",
                metadata_contents,
                Some(&self.default_branch),
            )
            .await
            .with_context(|| format!("Failed to stage {object}"))?;
        info!("{object} staged");
        Ok(true)
    }

    /// Inspect the review workflow of a `staged` tarball.
    ///
    /// A leftover branch without a pull request is deleted so the request
    /// can be remade from scratch.
    pub async fn approval_status(&self, object: &str) -> Result<ApprovalStatus> {
        let branch = Self::approval_branch(object);
        if !self
            .github
            .branch_exists(&self.staging_repo, &branch)
            .await?
        {
            return Ok(ApprovalStatus::NeedsRequest);
        }

        let pulls = self
            .github
            .pulls_for_head(&self.staging_repo, &branch)
            .await?;
        let Some(pr) = pulls.first() else {
            // Branch but no pull request: a previous run died between the
            // two steps. Remove the branch and start over.
            warn!("{object} has an approval branch but no pull request, removing the branch");
            self.github
                .delete_branch(&self.staging_repo, &branch)
                .await?;
            return Ok(ApprovalStatus::NeedsRequest);
        };

        if pr.is_open() {
            Ok(ApprovalStatus::PendingReview {
                pr_url: pr.html_url.clone(),
            })
        } else if !pr.is_merged() {
            Ok(ApprovalStatus::RejectedByReview)
        } else {
            // Merged, yet the metadata file is still under staged/ on the
            // default branch; do not guess.
            Ok(ApprovalStatus::Inconsistent {
                detail: format!(
                    "pull request #{} for branch {branch} is merged but {object} is still staged",
                    pr.number
                ),
            })
        }
    }

    /// Open the review pull request for a `staged` tarball: move its
    /// metadata file to `approved/` on a dedicated branch and request the
    /// merge. Returns the pull request URL.
    pub async fn request_approval(&self, object: &str, body: &str) -> Result<String> {
        let branch = Self::approval_branch(object);
        let base_sha = self
            .github
            .branch_sha(&self.staging_repo, &self.default_branch)
            .await?;
        self.github
            .create_branch(&self.staging_repo, &branch, &base_sha)
            .await
            .with_context(|| format!("Failed to create approval branch for {object}"))?;

        self.move_metadata(
            object,
            LedgerState::Staged,
            LedgerState::Approved,
            Some(&branch),
        )
        .await?;

        let file_name = object.rsplit('/').next().unwrap_or(object);
        let pr = self
            .github
            .create_pull(
                &self.staging_repo,
                &format!("Ingest {file_name}"),
                body,
                &branch,
                &self.default_branch,
            )
            .await
            .with_context(|| format!("Failed to open approval pull request for {object}"))?;
        info!("{object} proposed for ingestion in {}", pr.html_url);
        Ok(pr.html_url)
    }

    /// `staged -> rejected`, after the review pull request was closed
    /// without merging.
    pub async fn mark_rejected(&self, object: &str) -> Result<()> {
        self.move_metadata(object, LedgerState::Staged, LedgerState::Rejected, None)
            .await
    }

    /// `approved -> ingested`, after a successful ingestion.
    pub async fn mark_ingested(&self, object: &str) -> Result<()> {
        self.move_metadata(object, LedgerState::Approved, LedgerState::Ingested, None)
            .await
    }

    /// `approved -> failed`; the diagnostic ends up in the commit message
    /// and therefore in the audit history.
    pub async fn mark_failed(&self, object: &str, diagnostic: &str) -> Result<()> {
        let source = self.metadata_path(LedgerState::Approved, object);
        let target = self.metadata_path(LedgerState::Failed, object);
        let Some(file) = self.github.get_file(&self.staging_repo, &source).await? else {
            bail!("{object} is not in the approved state, refusing to mark it failed");
        };

        let mut reason = diagnostic.lines().next().unwrap_or("").to_string();
        if reason.len() > 200 {
            reason.truncate(200);
        }
        self.github
            .delete_file(
                &self.staging_repo,
                &source,
                "remove from approved",
                &file.sha,
                Some(&self.default_branch),
            )
            .await?;
        self.github
            .create_file(
                &self.staging_repo,
                &target,
                &format!("move to failed: {reason}"),
                &file.content,
                Some(&self.default_branch),
            )
            .await?;
        info!("{object} marked failed");
        Ok(())
    }

    /// Move a metadata file between state directories with two commits.
    ///
    /// The create runs after the delete, mirroring a `git mv`; if the
    /// process dies in between, the entry vanishes from the ledger and the
    /// next discovery pass re-stages the tarball.
    async fn move_metadata(
        &self,
        object: &str,
        from: LedgerState,
        to: LedgerState,
        branch: Option<&str>,
    ) -> Result<()> {
        let source = self.metadata_path(from, object);
        let target = self.metadata_path(to, object);
        let Some(file) = self.github.get_file(&self.staging_repo, &source).await? else {
            bail!("{object} is not in the {from} state, refusing to move it to {to}");
        };

        let branch = branch.or(Some(self.default_branch.as_str()));
        self.github
            .delete_file(
                &self.staging_repo,
                &source,
                &format!("remove from {from}"),
                &file.sha,
                branch,
            )
            .await?;
        self.github
            .create_file(
                &self.staging_repo,
                &target,
                &format!("move to {to}"),
                &file.content,
                branch,
            )
            .await?;
        info!("{object} moved from {from} to {to}");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OBJECT: &str = "eessi-2000.01-init-1700000000.tar.gz";

    fn ledger(server: &MockServer) -> Ledger {
        let github = GithubClient::new(server.uri(), "test-token").unwrap();
        Ledger::new(github, "example/staging", "main", ".meta.txt")
    }

    fn contents_response(sha: &str, content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "sha": sha,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64"
        }))
    }

    fn state_path(state: &str) -> String {
        format!("/repos/example/staging/contents/{state}/{OBJECT}.meta.txt")
    }

    #[tokio::test]
    async fn test_find_state_probes_state_directories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(state_path("staged")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(state_path("approved")))
            .respond_with(contents_response("abc", "{}"))
            .mount(&server)
            .await;

        let state = ledger(&server).find_state(OBJECT).await.unwrap();
        assert_eq!(state, Some(LedgerState::Approved));
    }

    #[tokio::test]
    async fn test_stage_creates_entry_when_unledgered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(state_path("staged")))
            .and(body_partial_json(json!({
                "message": "new tarball",
                "branch": "main"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        assert!(ledger(&server).stage(OBJECT, "{}").await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(state_path("staged")))
            .respond_with(contents_response("abc", "{}"))
            .mount(&server)
            .await;
        // no PUT mock mounted: any create attempt would fail the test
        assert!(!ledger(&server).stage(OBJECT, "{}").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_ingested_moves_approved_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(state_path("approved")))
            .respond_with(contents_response("abc", "{\"payload\": {}}"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(state_path("approved")))
            .and(body_partial_json(json!({
                "message": "remove from approved",
                "sha": "abc"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(state_path("ingested")))
            .and(body_partial_json(json!({"message": "move to ingested"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        ledger(&server).mark_ingested(OBJECT).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_ingested_refuses_entry_not_in_approved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = ledger(&server).mark_ingested(OBJECT).await.unwrap_err();
        assert!(err.to_string().contains("not in the approved state"));
    }

    #[tokio::test]
    async fn test_approval_status_without_branch_needs_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let status = ledger(&server).approval_status(OBJECT).await.unwrap();
        assert_eq!(status, ApprovalStatus::NeedsRequest);
    }

    #[tokio::test]
    async fn test_approval_status_removes_stale_branch() {
        let server = MockServer::start().await;
        let branch = format!("{OBJECT}_approved");
        Mock::given(method("GET"))
            .and(path(format!("/repos/example/staging/branches/{branch}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commit": {"sha": "abc"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/pulls"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!(
                "/repos/example/staging/git/refs/heads/{branch}"
            )))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let status = ledger(&server).approval_status(OBJECT).await.unwrap();
        assert_eq!(status, ApprovalStatus::NeedsRequest);
    }

    #[tokio::test]
    async fn test_approval_status_reports_closed_pr_as_rejected() {
        let server = MockServer::start().await;
        let branch = format!("{OBJECT}_approved");
        Mock::given(method("GET"))
            .and(path(format!("/repos/example/staging/branches/{branch}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commit": {"sha": "abc"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/pulls"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "number": 7,
                "state": "closed",
                "merged_at": null,
                "html_url": "https://github.example/pr/7",
                "head": {"ref": branch}
            }])))
            .mount(&server)
            .await;

        let status = ledger(&server).approval_status(OBJECT).await.unwrap();
        assert_eq!(status, ApprovalStatus::RejectedByReview);
    }

    #[tokio::test]
    async fn test_request_approval_moves_entry_on_branch_and_opens_pr() {
        let server = MockServer::start().await;
        let branch = format!("{OBJECT}_approved");
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/branches/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commit": {"sha": "base-sha"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/example/staging/git/refs"))
            .and(body_partial_json(json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": "base-sha"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(state_path("staged")))
            .respond_with(contents_response("abc", "{}"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(state_path("staged")))
            .and(body_partial_json(json!({"branch": branch})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(state_path("approved")))
            .and(body_partial_json(json!({"branch": branch})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/example/staging/pulls"))
            .and(body_partial_json(json!({
                "title": format!("Ingest {OBJECT}"),
                "head": branch,
                "base": "main"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "number": 12,
                "state": "open",
                "merged_at": null,
                "html_url": "https://github.example/pr/12",
                "head": {"ref": branch}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = ledger(&server)
            .request_approval(OBJECT, "overview body")
            .await
            .unwrap();
        assert_eq!(url, "https://github.example/pr/12");
    }
}
