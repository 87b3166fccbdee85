//! Producer metadata files
//!
//! Every tarball in the staging bucket is accompanied by a small JSON
//! document written by the producer's upload job. Its `payload` section is
//! what the orchestrator trusts for idempotency (sha256, size); `link2pr`
//! points back at the pull request in the producer repository that built the
//! tarball, so state changes can be reported there.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Metadata describing one uploaded tarball.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TarballMetadata {
    pub uploader: Uploader,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link2pr: Option<LinkToPr>,
}

/// Who uploaded the tarball.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Uploader {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// The payload the metadata belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    pub filename: String,
    pub sha256sum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Link back to the producer pull request that built the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkToPr {
    pub repo: String,
    #[serde(deserialize_with = "number_or_string")]
    pub pr: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_number_or_string"
    )]
    pub pr_comment_id: Option<u64>,
}

impl TarballMetadata {
    /// Parse a metadata document.
    pub fn parse(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse tarball metadata")
    }

    /// Load a metadata document from a local file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metadata file {}", path.display()))?;
        Self::parse(&contents)
    }
}

// Producer upload jobs serialize PR numbers inconsistently, sometimes as
// strings; accept both.
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn optional_number_or_string<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    number_or_string(deserializer).map(Some)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "uploader": {"username": "bot", "email": "bot@example.org"},
        "payload": {
            "filename": "eessi-2000.01-compat-linux-x86_64-123456.tar.gz",
            "size": 4194304,
            "sha256sum": "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            "url": "https://bucket.example.org/eessi-2000.01-compat-linux-x86_64-123456.tar.gz"
        },
        "link2pr": {"repo": "example/software-layer", "pr": "42"}
    }"#;

    #[test]
    fn test_parse_sample() {
        let metadata = TarballMetadata::parse(SAMPLE).unwrap();
        assert_eq!(metadata.uploader.username, "bot");
        assert_eq!(
            metadata.payload.filename,
            "eessi-2000.01-compat-linux-x86_64-123456.tar.gz"
        );
        assert_eq!(metadata.payload.size, Some(4194304));
        let link = metadata.link2pr.unwrap();
        assert_eq!(link.repo, "example/software-layer");
        assert_eq!(link.pr, 42);
        assert_eq!(link.pr_comment_id, None);
    }

    #[test]
    fn test_pr_number_accepted_as_number() {
        let metadata = TarballMetadata::parse(
            r#"{
                "uploader": {"username": "bot"},
                "payload": {"filename": "a.tar.gz", "sha256sum": "00"},
                "link2pr": {"repo": "example/software-layer", "pr": 7, "pr_comment_id": "99"}
            }"#,
        )
        .unwrap();
        let link = metadata.link2pr.unwrap();
        assert_eq!(link.pr, 7);
        assert_eq!(link.pr_comment_id, Some(99));
    }

    #[test]
    fn test_metadata_without_link2pr() {
        let metadata = TarballMetadata::parse(
            r#"{
                "uploader": {"username": "bot"},
                "payload": {"filename": "a.tar.gz", "sha256sum": "00"}
            }"#,
        )
        .unwrap();
        assert!(metadata.link2pr.is_none());
    }

    #[test]
    fn test_load_missing_file_names_the_path() {
        let err = TarballMetadata::load("/nonexistent/a.meta.txt").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/a.meta.txt"));
    }
}
