//! S3 staging bucket access
//!
//! Producers drop `<tarball>` + `<tarball>.meta.txt` pairs into one bucket
//! per target repository. Discovery lists the whole bucket (paginated) and
//! only surfaces tarballs whose metadata companion exists; lone tarballs are
//! uploads still in flight.
//!
//! Downloads keep an `.etag` sidecar next to the local file so an unchanged
//! object is not fetched twice across runs.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::config::AwsConfig;

/// Extensions a tarball object may carry.
const TARBALL_EXTENSIONS: [&str; 2] = [".tar.gz", ".tar.zst"];

/// One discovered tarball + metadata pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarball {
    /// Object key of the tarball itself.
    pub key: String,
    /// Object key of the metadata companion.
    pub metadata_key: String,
    pub size: Option<i64>,
}

impl RemoteTarball {
    /// Basename of the tarball, the ledger entry key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Client for one staging bucket.
#[derive(Debug, Clone)]
pub struct StagingBucket {
    client: Client,
    bucket: String,
    endpoint_url: Option<String>,
}

impl StagingBucket {
    pub async fn new(aws: &AwsConfig, bucket: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        debug!("Initializing S3 client for bucket {bucket}");

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(aws.region.clone()));
        if let Some(endpoint) = &aws.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&aws.access_key_id, &aws.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "stratum-config",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(aws.path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
            endpoint_url: aws.endpoint_url.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Public URL of an object, for humans reading review requests.
    pub fn object_url(&self, key: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        }
    }

    /// List every tarball in the bucket that has a metadata companion.
    pub async fn list_tarballs(&self, metadata_extension: &str) -> Result<Vec<RemoteTarball>> {
        let mut keys: Vec<(String, Option<i64>)> = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("Failed to list bucket {}", self.bucket))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push((key.to_string(), object.size()));
                }
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        let key_set: HashSet<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
        let tarballs: Vec<RemoteTarball> = keys
            .iter()
            .filter(|(key, _)| TARBALL_EXTENSIONS.iter().any(|ext| key.ends_with(ext)))
            .filter_map(|(key, size)| {
                let metadata_key = format!("{key}{metadata_extension}");
                if key_set.contains(metadata_key.as_str()) {
                    Some(RemoteTarball {
                        key: key.clone(),
                        metadata_key,
                        size: *size,
                    })
                } else {
                    debug!("Skipping {key}: no metadata companion yet");
                    None
                }
            })
            .collect();

        info!(
            bucket = %self.bucket,
            total_objects = keys.len(),
            tarballs = tarballs.len(),
            "listed staging bucket"
        );
        Ok(tarballs)
    }

    /// Download an object to a local path, skipping the transfer when the
    /// stored `.etag` sidecar still matches.
    pub async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let etag_path = dest.with_extension(
            dest.extension()
                .map(|e| format!("{}.etag", e.to_string_lossy()))
                .unwrap_or_else(|| "etag".to_string()),
        );

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to stat s3://{}/{key}", self.bucket))?;
        let remote_etag = head.e_tag().unwrap_or_default().to_string();

        if dest.is_file() && !remote_etag.is_empty() {
            if let Ok(cached) = std::fs::read_to_string(&etag_path) {
                if cached.trim() == remote_etag {
                    debug!("Download of {key} skipped, ETag unchanged");
                    return Ok(());
                }
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        info!("Downloading s3://{}/{key} to {}", self.bucket, dest.display());
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download s3://{}/{key}", self.bucket))?;

        let mut file = std::fs::File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .context("Failed while streaming object body")?
        {
            file.write_all(&chunk)?;
        }

        if !remote_etag.is_empty() {
            // Best-effort cache; a failed write only costs a re-download.
            if let Err(err) = std::fs::write(&etag_path, &remote_etag) {
                warn!("Failed to write ETag sidecar {}: {err}", etag_path.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_tarball_file_name() {
        let tarball = RemoteTarball {
            key: "2000.01/eessi-2000.01-init-1.tar.gz".to_string(),
            metadata_key: "2000.01/eessi-2000.01-init-1.tar.gz.meta.txt".to_string(),
            size: Some(1024),
        };
        assert_eq!(tarball.file_name(), "eessi-2000.01-init-1.tar.gz");
    }

    #[tokio::test]
    async fn test_object_url_with_custom_endpoint() {
        let aws = AwsConfig {
            endpoint_url: Some("https://minio.example.org/".to_string()),
            ..AwsConfig::default()
        };
        let bucket = StagingBucket::new(&aws, "staging-software").await.unwrap();
        assert_eq!(
            bucket.object_url("eessi-2000.01-init-1.tar.gz"),
            "https://minio.example.org/staging-software/eessi-2000.01-init-1.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_object_url_default_aws() {
        let aws = AwsConfig::default();
        let bucket = StagingBucket::new(&aws, "staging-software").await.unwrap();
        assert_eq!(
            bucket.object_url("a.tar.gz"),
            "https://staging-software.s3.amazonaws.com/a.tar.gz"
        );
    }
}
