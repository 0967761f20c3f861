//! Nginx Proxy Manager API client
//!
//! All authenticated interaction with NPM lives here: bearer token
//! acquisition with an expiry-aware cache, certificate id lookup, and
//! idempotent proxy host creation. Every terminal outcome optionally
//! fires an ntfy note; the return value alone carries correctness.

use crate::config::NpmConfig;
use crate::ntfy::Notifier;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

const NPM_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety margin before token expiry; a token within this window is
/// treated as stale so it cannot expire mid-request.
const TOKEN_EXPIRY_SKEW_SECS: i64 = 5;

/// Cached NPM bearer token with its absolute expiry
#[derive(Debug, Clone)]
struct AuthToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AuthToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - chrono::Duration::seconds(TOKEN_EXPIRY_SKEW_SECS)
    }
}

/// Outcome of a proxy host creation attempt that reached the desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// NPM created a new proxy host record
    Created,
    /// A proxy host for the domain already existed; nothing to do
    AlreadyExists,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires: String,
}

#[derive(Debug, Deserialize)]
struct Certificate {
    id: i64,
    #[serde(default)]
    domain_names: Vec<String>,
}

/// Authenticated NPM API client
///
/// Holds the process-wide token cache. The cache lock is held across a
/// refresh, so concurrent callers coalesce into one in-flight token
/// request.
pub struct NpmClient {
    http: reqwest::Client,
    config: NpmConfig,
    notifier: Notifier,
    token: Mutex<Option<AuthToken>>,
}

impl NpmClient {
    pub fn new(config: NpmConfig, notifier: Notifier) -> Self {
        let http = reqwest::Client::builder()
            .timeout(NPM_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            config,
            notifier,
            token: Mutex::new(None),
        }
    }

    fn base_url(&self) -> anyhow::Result<&str> {
        self.config
            .server_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("NPM_SERVER_URL not set in environment"))
    }

    /// Get a bearer token, reusing the cached one while it is fresh
    ///
    /// A failed refresh leaves any previously cached token in place; the
    /// next caller triggers a new attempt.
    pub async fn token(&self) -> anyhow::Result<String> {
        let mut cache = self.token.lock().await;

        if let Some(token) = cache.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        match self.fetch_token().await {
            Ok(token) => {
                info!("NPM bearer token acquired and cached");
                self.notifier
                    .post_default(
                        "New Bearer Token acquired!",
                        "Token POST succeeded",
                        "white_check_mark",
                    )
                    .await;
                let value = token.value.clone();
                *cache = Some(token);
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "Error getting NPM bearer token");
                self.notifier
                    .post(
                        &format!("Error getting NPM Bearer Token: {e}"),
                        "Token POST failed...",
                        "warning",
                        "high",
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn fetch_token(&self) -> anyhow::Result<AuthToken> {
        let base_url = self.base_url()?;
        let identity = self
            .config
            .user
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("NPM_USER not set in environment"))?;
        let secret = self
            .config
            .secret
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("NPM_SECRET not set in environment"))?;

        let response = self
            .http
            .post(format!("{base_url}/api/tokens"))
            .json(&json!({ "identity": identity, "secret": secret }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("token request failed with status {}", response.status());
        }

        let body: TokenResponse = response.json().await?;
        if body.token.is_empty() {
            anyhow::bail!("no token found in NPM token response");
        }

        let expires_at = DateTime::parse_from_rfc3339(&body.expires)
            .map_err(|e| anyhow::anyhow!("invalid token expiry '{}': {}", body.expires, e))?
            .with_timezone(&Utc);

        Ok(AuthToken {
            value: body.token,
            expires_at,
        })
    }

    /// Look up the certificate id for a domain
    ///
    /// `Ok(None)` means no certificate covers the domain, which is a
    /// normal outcome; the caller decides how to proceed.
    pub async fn certificate_id(&self, domain: &str) -> anyhow::Result<Option<i64>> {
        let base_url = self.base_url()?.to_string();
        let token = self.token().await?;

        let result: anyhow::Result<Vec<Certificate>> = async {
            let response = self
                .http
                .get(format!("{base_url}/api/nginx/certificates"))
                .bearer_auth(&token)
                .send()
                .await?;

            if !response.status().is_success() {
                anyhow::bail!("certificate request failed with status {}", response.status());
            }

            Ok(response.json().await?)
        }
        .await;

        match result {
            Ok(certificates) => Ok(certificates
                .iter()
                .find(|cert| cert.domain_names.iter().any(|d| d == domain))
                .map(|cert| cert.id)),
            Err(e) => {
                error!(domain, error = %e, "Error getting certificate id");
                self.notifier
                    .post(
                        &format!("Error getting certificate ID for domain {domain}: {e}"),
                        "Certificate ID GET failed...",
                        "warning",
                        "high",
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Create a proxy host for `host`, forwarding to the configured host
    /// IP on `port`, bound to `certificate_id`
    ///
    /// A non-201 response whose error message contains "already in use"
    /// means the desired end state already exists and counts as success.
    pub async fn create_proxy_host(
        &self,
        host: &str,
        port: u16,
        certificate_id: i64,
    ) -> anyhow::Result<CreateOutcome> {
        let base_url = self.base_url()?.to_string();
        let forward_host = self
            .config
            .host_ip
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("HOST_IP_ADDRESS not set in environment"))?;
        let token = self.token().await?;

        let payload = proxy_host_payload(host, forward_host, port, certificate_id);

        let response = match self
            .http
            .post(format!("{base_url}/api/nginx/proxy-hosts"))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(host, error = %e, "Exception creating proxy host");
                self.notifier
                    .post(
                        &format!("Exception creating proxy host {host}: {e}"),
                        "New proxy POST failed...",
                        "warning",
                        "high",
                    )
                    .await;
                return Err(e.into());
            }
        };

        if response.status() == StatusCode::CREATED {
            info!(host, "New proxy host created");
            self.notifier
                .post_default(
                    &format!("{host} proxy host created!"),
                    "New proxy POST succeeded",
                    "white_check_mark",
                )
                .await;
            return Ok(CreateOutcome::Created);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error_msg = extract_error_message(&body);

        if is_already_in_use(&error_msg) {
            let msg = format!("Proxy host for '{host}' already exists. Skipping creation.");
            info!(host, "Proxy host already exists, skipping creation");
            self.notifier.post_default(&msg, "Proxy exists", "information").await;
            return Ok(CreateOutcome::AlreadyExists);
        }

        error!(host, status = %status, body = %body, "Failed to create proxy host");
        self.notifier
            .post(
                &format!("Failed to create proxy host {host}. Status: {status}, Response: {body}"),
                "New proxy POST failed...",
                "warning",
                "high",
            )
            .await;
        anyhow::bail!("proxy host creation failed with status {status}")
    }
}

/// Fixed-shape NPM proxy host payload: TLS forced, exploit blocking on,
/// websocket upgrade and HTTP/2 enabled, no custom locations
fn proxy_host_payload(
    host: &str,
    forward_host: &str,
    port: u16,
    certificate_id: i64,
) -> serde_json::Value {
    json!({
        "domain_names": [host],
        "forward_host": forward_host,
        "forward_port": port,
        "access_list_id": 0,
        "certificate_id": certificate_id,
        "ssl_forced": 1,
        "caching_enabled": 0,
        "block_exploits": 1,
        "advanced_config": "",
        "meta": {
            "letsencrypt_agree": 1,
            "dns_challenge": 1
        },
        "allow_websocket_upgrade": 1,
        "http2_support": 1,
        "forward_scheme": "http",
        "enabled": 1,
        "locations": [],
        "hsts_enabled": 0,
        "hsts_subdomains": 0
    })
}

/// Pull the `message` field out of an NPM error body, falling back to the
/// raw body when it is not JSON or the field is empty
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string())
}

fn is_already_in_use(message: &str) -> bool {
    message.to_lowercase().contains("already in use")
}
