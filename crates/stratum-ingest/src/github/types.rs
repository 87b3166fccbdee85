//! Typed payloads for the review-host API

use serde::{Deserialize, Serialize};

/// A file fetched through the contents API, body already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub sha: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContentsResponse {
    pub sha: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateFileRequest<'a> {
    pub message: &'a str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteFileRequest<'a> {
    pub message: &'a str,
    pub sha: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BranchResponse {
    pub commit: CommitRef,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommitRef {
    pub sha: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: &'a str,
}

/// A pull request on the staging repository.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    /// "open" or "closed"
    pub state: String,
    pub merged_at: Option<String>,
    pub html_url: String,
    pub head: PullRequestHead,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    pub fn is_merged(&self) -> bool {
        self.merged_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub branch: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreatePullRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateIssueRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
}

/// A comment on an issue or pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub body: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct UpdateCommentRequest<'a> {
    pub body: &'a str,
}
