//! HTTP client for the review-host API
//!
//! A thin typed wrapper over the REST endpoints the pipeline needs. Methods
//! take the repository as a parameter because the orchestrator talks to two:
//! the staging repository (ledger + review queue + tracking issues) and each
//! producer repository (status comments).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use super::types::*;

/// Default timeout for API requests in seconds. Can be overridden via the
/// STRATUM_API_TIMEOUT_SECS environment variable.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

/// Review-host API client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: Client,
    api_url: String,
}

impl GithubClient {
    /// Create a new client authenticating with `token`.
    pub fn new(api_url: impl Into<String>, token: &str) -> Result<Self> {
        let timeout_secs = std::env::var("STRATUM_API_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_API_TIMEOUT_SECS);

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("Invalid review-host token")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("stratum-ingest")
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("{what} failed with {status}: {body}");
    }

    // ========================================================================
    // Contents
    // ========================================================================

    /// Fetch a file, or `None` when the path does not exist.
    pub async fn get_file(&self, repo: &str, path: &str) -> Result<Option<RepoFile>> {
        let url = self.url(&format!("repos/{repo}/contents/{path}"));
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let contents: ContentsResponse = Self::check(response, "fetching file")
            .await?
            .json()
            .await?;

        let decoded = match (contents.content, contents.encoding.as_deref()) {
            (Some(content), Some("base64")) => {
                let raw: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .context("Review host returned undecodable file content")?;
                String::from_utf8(bytes).context("File content is not UTF-8")?
            }
            (Some(content), _) => content,
            (None, _) => String::new(),
        };

        Ok(Some(RepoFile {
            sha: contents.sha,
            content: decoded,
        }))
    }

    /// Whether a path exists on the default branch.
    pub async fn file_exists(&self, repo: &str, path: &str) -> Result<bool> {
        let url = self.url(&format!("repos/{repo}/contents/{path}"));
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response, "probing file").await?;
        Ok(true)
    }

    pub async fn create_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        content: &str,
        branch: Option<&str>,
    ) -> Result<()> {
        let url = self.url(&format!("repos/{repo}/contents/{path}"));
        debug!("PUT {url}");
        let request = CreateFileRequest {
            message,
            content: base64::engine::general_purpose::STANDARD.encode(content),
            branch,
        };
        let response = self.client.put(&url).json(&request).send().await?;
        Self::check(response, "creating file").await?;
        Ok(())
    }

    pub async fn delete_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        sha: &str,
        branch: Option<&str>,
    ) -> Result<()> {
        let url = self.url(&format!("repos/{repo}/contents/{path}"));
        debug!("DELETE {url}");
        let request = DeleteFileRequest {
            message,
            sha,
            branch,
        };
        let response = self.client.delete(&url).json(&request).send().await?;
        Self::check(response, "deleting file").await?;
        Ok(())
    }

    // ========================================================================
    // Branches
    // ========================================================================

    /// Head commit sha of a branch.
    pub async fn branch_sha(&self, repo: &str, branch: &str) -> Result<String> {
        let url = self.url(&format!("repos/{repo}/branches/{branch}"));
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        let branch: BranchResponse = Self::check(response, "fetching branch")
            .await?
            .json()
            .await?;
        Ok(branch.commit.sha)
    }

    pub async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        let url = self.url(&format!("repos/{repo}/branches/{branch}"));
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response, "probing branch").await?;
        Ok(true)
    }

    pub async fn create_branch(&self, repo: &str, branch: &str, from_sha: &str) -> Result<()> {
        let url = self.url(&format!("repos/{repo}/git/refs"));
        debug!("POST {url}");
        let request = CreateRefRequest {
            git_ref: format!("refs/heads/{branch}"),
            sha: from_sha,
        };
        let response = self.client.post(&url).json(&request).send().await?;
        Self::check(response, "creating branch").await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &str, branch: &str) -> Result<()> {
        let url = self.url(&format!("repos/{repo}/git/refs/heads/{branch}"));
        debug!("DELETE {url}");
        let response = self.client.delete(&url).send().await?;
        Self::check(response, "deleting branch").await?;
        Ok(())
    }

    // ========================================================================
    // Pull requests
    // ========================================================================

    /// All pull requests (any state) whose head is exactly `branch`.
    ///
    /// The API treats `head` as a filter hint and may return unrelated pull
    /// requests, so the head ref is double-checked here.
    pub async fn pulls_for_head(&self, repo: &str, branch: &str) -> Result<Vec<PullRequest>> {
        let owner = repo.split('/').next().unwrap_or_default();
        let url = self.url(&format!(
            "repos/{repo}/pulls?state=all&head={owner}:{branch}"
        ));
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        let pulls: Vec<PullRequest> = Self::check(response, "listing pull requests")
            .await?
            .json()
            .await?;
        Ok(pulls
            .into_iter()
            .filter(|pr| pr.head.branch == branch)
            .collect())
    }

    pub async fn create_pull(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<PullRequest> {
        let url = self.url(&format!("repos/{repo}/pulls"));
        debug!("POST {url}");
        let request = CreatePullRequest {
            title,
            body,
            head,
            base,
        };
        let response = self.client.post(&url).json(&request).send().await?;
        let pull: PullRequest = Self::check(response, "creating pull request")
            .await?
            .json()
            .await?;
        Ok(pull)
    }

    // ========================================================================
    // Issues
    // ========================================================================

    /// Whether an open issue with exactly this title exists.
    pub async fn open_issue_exists(&self, repo: &str, title: &str) -> Result<bool> {
        let mut page = 1u32;
        loop {
            let url = self.url(&format!(
                "repos/{repo}/issues?state=open&per_page=100&page={page}"
            ));
            debug!("GET {url}");
            let response = self.client.get(&url).send().await?;
            let issues: Vec<Issue> = Self::check(response, "listing issues")
                .await?
                .json()
                .await?;
            if issues.is_empty() {
                return Ok(false);
            }
            if issues.iter().any(|i| i.title == title) {
                return Ok(true);
            }
            page += 1;
        }
    }

    pub async fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<()> {
        let url = self.url(&format!("repos/{repo}/issues"));
        debug!("POST {url}");
        let request = CreateIssueRequest { title, body };
        let response = self.client.post(&url).json(&request).send().await?;
        Self::check(response, "creating issue").await?;
        Ok(())
    }

    // ========================================================================
    // Issue comments
    // ========================================================================

    pub async fn issue_comments(&self, repo: &str, issue: u64) -> Result<Vec<IssueComment>> {
        let url = self.url(&format!("repos/{repo}/issues/{issue}/comments?per_page=100"));
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        let comments: Vec<IssueComment> = Self::check(response, "listing comments")
            .await?
            .json()
            .await?;
        Ok(comments)
    }

    pub async fn update_comment(&self, repo: &str, comment_id: u64, body: &str) -> Result<()> {
        let url = self.url(&format!("repos/{repo}/issues/comments/{comment_id}"));
        debug!("PATCH {url}");
        let request = UpdateCommentRequest { body };
        let response = self.client.patch(&url).json(&request).send().await?;
        Self::check(response, "updating comment").await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> GithubClient {
        GithubClient::new(server.uri(), "test-token").unwrap()
    }

    #[tokio::test]
    async fn test_get_file_decodes_base64() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/contents/staged/a.tar.gz.meta.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sha": "abc123",
                "content": "aGVsbG8g\nd29ybGQ=\n",
                "encoding": "base64"
            })))
            .mount(&server)
            .await;

        let file = client(&server)
            .await
            .get_file("example/staging", "staged/a.tar.gz.meta.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.sha, "abc123");
        assert_eq!(file.content, "hello world");
    }

    #[tokio::test]
    async fn test_get_file_returns_none_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let file = client(&server)
            .await
            .get_file("example/staging", "staged/missing")
            .await
            .unwrap();
        assert!(file.is_none());
    }

    #[tokio::test]
    async fn test_create_file_sends_base64_content() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/repos/example/staging/contents/staged/a.meta.txt"))
            .and(body_partial_json(json!({
                "message": "new tarball",
                "content": base64::engine::general_purpose::STANDARD.encode("{}"),
                "branch": "a.tar.gz_approved"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .create_file(
                "example/staging",
                "staged/a.meta.txt",
                "new tarball",
                "{}",
                Some("a.tar.gz_approved"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pulls_for_head_filters_on_exact_branch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/pulls"))
            .and(query_param("state", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "number": 7,
                    "state": "closed",
                    "merged_at": "2026-01-01T00:00:00Z",
                    "html_url": "https://github.example/pr/7",
                    "head": {"ref": "a.tar.gz_approved"}
                },
                {
                    "number": 8,
                    "state": "open",
                    "merged_at": null,
                    "html_url": "https://github.example/pr/8",
                    "head": {"ref": "unrelated-branch"}
                }
            ])))
            .mount(&server)
            .await;

        let pulls = client(&server)
            .await
            .pulls_for_head("example/staging", "a.tar.gz_approved")
            .await
            .unwrap();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].number, 7);
        assert!(pulls[0].is_merged());
        assert!(!pulls[0].is_open());
    }

    #[tokio::test]
    async fn test_open_issue_exists_matches_exact_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/issues"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"number": 1, "title": "Failed to ingest a.tar.gz", "state": "open"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/example/staging/issues"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let c = client(&server).await;
        assert!(c
            .open_issue_exists("example/staging", "Failed to ingest a.tar.gz")
            .await
            .unwrap());
        assert!(!c
            .open_issue_exists("example/staging", "Failed to ingest b.tar.gz")
            .await
            .unwrap());
    }
}
