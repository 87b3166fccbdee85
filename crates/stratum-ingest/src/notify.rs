//! Success notifications
//!
//! A fire-and-forget webhook message per successful ingestion. Delivery
//! failures are logged and swallowed: notifications are a courtesy, never
//! part of the ingestion outcome.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Notifier over an optional Slack-compatible webhook.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook: Option<String>,
    enabled: bool,
}

impl Notifier {
    pub fn new(webhook: Option<String>, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook,
            enabled,
        }
    }

    /// Disabled notifier, for tests and `--list-only` runs.
    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    /// Announce a successful ingestion. Never fails.
    pub async fn ingested(&self, tarball: &str, repo: &str) {
        self.send(&format!("Tarball `{tarball}` was ingested into `{repo}`."))
            .await;
    }

    async fn send(&self, text: &str) {
        if !self.enabled {
            return;
        }
        let Some(webhook) = &self.webhook else {
            warn!("Ingestion notifications enabled but no webhook configured");
            return;
        };

        let result = self
            .client
            .post(webhook)
            .json(&json!({ "text": text }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered");
            }
            Ok(response) => {
                warn!("Notification webhook returned {}", response.status());
            }
            Err(err) => {
                warn!("Notification webhook unreachable: {err}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_ingested_posts_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "text": "Tarball `a.tar.gz` was ingested into `software.example.org`."
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        Notifier::new(Some(server.uri()), true)
            .ingested("a.tar.gz", "software.example.org")
            .await;
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        // must not panic or error
        Notifier::new(Some(server.uri()), true)
            .ingested("a.tar.gz", "software.example.org")
            .await;
    }

    #[tokio::test]
    async fn test_disabled_notifier_sends_nothing() {
        let server = MockServer::start().await;
        // no mocks mounted: any request would fail the test on drop
        Notifier::new(Some(server.uri()), false)
            .ingested("a.tar.gz", "software.example.org")
            .await;
        Notifier::disabled()
            .ingested("a.tar.gz", "software.example.org")
            .await;
    }
}
