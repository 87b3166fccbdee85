//! Review host (GitHub) API access
//!
//! The staging repository doubles as the ledger substrate and the review
//! queue, so this client covers contents, branches, pull requests, issues,
//! and issue comments, nothing more.

pub mod client;
pub mod types;

pub use client::GithubClient;
pub use types::{IssueComment, PullRequest, RepoFile};
