//! Best-effort push notifications via ntfy
//!
//! Delivery failures are logged and discarded; no caller treats a failed
//! notification as fatal. When the toggle is off, calls are skipped
//! without touching the network.

use crate::config::NtfyConfig;
use std::time::Duration;
use tracing::{error, info};

const NTFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes status messages to a configured ntfy topic
#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    config: NtfyConfig,
}

impl Notifier {
    pub fn new(config: NtfyConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(NTFY_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self { http, config }
    }

    /// Post a message with the default priority
    pub async fn post_default(&self, message: &str, title: &str, tags: &str) -> bool {
        self.post(message, title, tags, "default").await
    }

    /// Post a message to the configured topic
    ///
    /// Returns `true` if the notification was accepted. A `false` return
    /// covers the disabled toggle, missing configuration, and delivery
    /// failures alike; none of these propagate.
    pub async fn post(&self, message: &str, title: &str, tags: &str, priority: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let (Some(server_url), Some(topic)) = (&self.config.server_url, &self.config.topic)
        else {
            error!("NTFY_SERVER_URL or NTFY_TOPIC not set in environment");
            return false;
        };

        let url = topic_url(server_url, topic);
        let result = self
            .http
            .post(&url)
            .header("Title", title)
            .header("Tags", tags)
            .header("Priority", priority)
            .body(message.to_string())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(title, "Sent ntfy notification");
                true
            }
            Ok(response) => {
                error!(title, status = %response.status(), "Failed to send ntfy notification");
                false
            }
            Err(e) => {
                error!(title, error = %e, "Failed to send ntfy notification");
                false
            }
        }
    }
}

/// Join the server URL and topic, tolerating stray slashes in either
fn topic_url(server_url: &str, topic: &str) -> String {
    format!("{}/{}", server_url.trim_end_matches('/'), topic.trim_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_url_plain() {
        assert_eq!(
            topic_url("https://ntfy.example.com", "deploys"),
            "https://ntfy.example.com/deploys"
        );
    }

    #[test]
    fn test_topic_url_trims_slashes() {
        assert_eq!(
            topic_url("https://ntfy.example.com/", "/deploys/"),
            "https://ntfy.example.com/deploys"
        );
    }

    #[tokio::test]
    async fn test_disabled_notifier_skips_send() {
        // Unroutable server URL: a send attempt would error loudly, but the
        // disabled toggle must short-circuit before any request is built.
        let notifier = Notifier::new(NtfyConfig {
            enabled: false,
            server_url: Some("http://192.0.2.1:1".to_string()),
            topic: Some("deploys".to_string()),
        });

        assert!(!notifier.post("msg", "title", "tag", "default").await);
    }

    #[tokio::test]
    async fn test_missing_topic_fails_without_panic() {
        let notifier = Notifier::new(NtfyConfig {
            enabled: true,
            server_url: Some("http://192.0.2.1:1".to_string()),
            topic: None,
        });

        assert!(!notifier.post("msg", "title", "tag", "default").await);
    }
}
