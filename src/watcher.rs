//! Docker event orchestration
//!
//! Turns the raw Docker event stream into proxy-provisioning side
//! effects: filter for container starts, poll the container until its
//! proxy labels appear, then drive the NPM client. Every per-event
//! failure is isolated; one bad container never takes down the loop.

use crate::npm::{CreateOutcome, NpmClient};
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Label carrying the public domain of the proxy host
pub const LABEL_HOST: &str = "npmdocker.host";
/// Label carrying the forward port on the host IP
pub const LABEL_PORT: &str = "npmdocker.port";
/// Label carrying the domain whose TLS certificate should be bound
pub const LABEL_TLS_DOMAIN: &str = "npmdocker.tls.domain";

/// How long to wait for labels to appear after a container start.
/// Label propagation is not synchronous with the start event.
pub const LABEL_POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between label snapshots
pub const LABEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Certificate id used when no certificate matches the labelled domain.
/// Best-effort policy carried over from the original deployment; id 1 may
/// not cover the intended domain.
pub const FALLBACK_CERTIFICATE_ID: i64 = 1;

const STREAM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The three required labels, validated non-empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLabels {
    pub host: String,
    pub port: String,
    pub tls_domain: String,
}

impl ProxyLabels {
    /// Extract the required labels from a container label snapshot
    ///
    /// Returns `None` unless all three keys are simultaneously present
    /// and non-empty.
    pub fn from_map(labels: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            host: get(LABEL_HOST)?,
            port: get(LABEL_PORT)?,
            tls_domain: get(LABEL_TLS_DOMAIN)?,
        })
    }

    /// Parse the port label as a positive integer
    pub fn forward_port(&self) -> Option<u16> {
        self.port.parse::<u16>().ok().filter(|port| *port > 0)
    }
}

/// Return the actor id if this is a container start event
pub fn start_event_container_id(event: &EventMessage) -> Option<&str> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    if event.action.as_deref() != Some("start") {
        return None;
    }
    event.actor.as_ref()?.id.as_deref()
}

/// Poll a label snapshot source until the required labels appear
///
/// Snapshot errors are logged and polling continues; only the timeout
/// ends the wait. Returns `None` once `timeout` has elapsed without a
/// complete label set.
pub async fn wait_for_labels<F, Fut>(
    mut fetch: F,
    timeout: Duration,
    interval: Duration,
) -> Option<ProxyLabels>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<HashMap<String, String>>>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        match fetch().await {
            Ok(labels) => {
                if let Some(proxy_labels) = ProxyLabels::from_map(&labels) {
                    return Some(proxy_labels);
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reloading container labels");
            }
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Drive certificate lookup and proxy host creation for one label set
///
/// Returns `true` when the proxy host ends up existing (created now or
/// already there). An unparsable port skips the event before any NPM
/// call is made.
pub async fn provision(npm: &NpmClient, labels: &ProxyLabels) -> bool {
    let port = match labels.forward_port() {
        Some(port) => port,
        None => {
            error!(
                host = %labels.host,
                port = %labels.port,
                "Invalid port label value, skipping"
            );
            return false;
        }
    };

    info!(host = %labels.host, port, "Creating NPM proxy host");

    let certificate_id = match npm.certificate_id(&labels.tls_domain).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!(
                domain = %labels.tls_domain,
                fallback = FALLBACK_CERTIFICATE_ID,
                "No certificate found for domain, defaulting to fallback certificate id"
            );
            FALLBACK_CERTIFICATE_ID
        }
        Err(e) => {
            warn!(
                domain = %labels.tls_domain,
                error = %e,
                fallback = FALLBACK_CERTIFICATE_ID,
                "Certificate lookup failed, defaulting to fallback certificate id"
            );
            FALLBACK_CERTIFICATE_ID
        }
    };

    match npm.create_proxy_host(&labels.host, port, certificate_id).await {
        Ok(CreateOutcome::Created) => true,
        Ok(CreateOutcome::AlreadyExists) => true,
        Err(e) => {
            error!(host = %labels.host, error = %e, "Failed to create NPM proxy host");
            false
        }
    }
}

/// Consumes the Docker event stream and provisions proxy hosts
pub struct Watcher {
    docker: Docker,
    npm: NpmClient,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(docker: Docker, npm: NpmClient, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            docker,
            npm,
            shutdown,
        }
    }

    /// Run the event loop until shutdown or the stream's definitive end
    ///
    /// The shutdown channel is observed between events only; an in-flight
    /// event finishes processing before the loop exits.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        let mut events = self.docker.events(None::<EventsOptions<String>>);
        info!("Started Docker event listener");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping event listener");
                        break;
                    }
                }
                event = events.next() => {
                    match event {
                        Some(Ok(event)) => {
                            if let Some(container_id) = start_event_container_id(&event) {
                                let container_id = container_id.to_string();
                                self.handle_container_start(&container_id).await;
                                info!("Listening for new containers...");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error handling event stream");
                            tokio::time::sleep(STREAM_ERROR_BACKOFF).await;
                        }
                        None => {
                            info!("Docker event stream ended");
                            break;
                        }
                    }
                }
            }
        }

        info!("Docker event listener stopped");
    }

    /// Process a single container start event
    async fn handle_container_start(&self, container_id: &str) {
        let container_name = match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => inspect
                .name
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_else(|| container_id.to_string()),
            Err(e) => {
                error!(container_id, error = %e, "Failed to inspect started container, skipping");
                return;
            }
        };

        info!(
            container_name,
            container_id, "New container found! Searching for proxy labels..."
        );

        let docker = self.docker.clone();
        let id = container_id.to_string();
        let labels = wait_for_labels(
            move || {
                let docker = docker.clone();
                let id = id.clone();
                async move {
                    let inspect = docker.inspect_container(&id, None).await?;
                    Ok(inspect
                        .config
                        .and_then(|config| config.labels)
                        .unwrap_or_default())
                }
            },
            LABEL_POLL_TIMEOUT,
            LABEL_POLL_INTERVAL,
        )
        .await;

        let labels = match labels {
            Some(labels) => labels,
            None => {
                warn!(
                    container_name,
                    container_id, "Container missing labels for NPM proxy, skipping"
                );
                return;
            }
        };

        let success = provision(&self.npm, &labels).await;
        if !success {
            error!(
                container_name,
                container_id, "Failed to create NPM proxy host for container"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn labels(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn complete_labels() -> HashMap<String, String> {
        labels(&[
            (LABEL_HOST, "app.example.com"),
            (LABEL_PORT, "8080"),
            (LABEL_TLS_DOMAIN, "example.com"),
        ])
    }

    fn start_event(typ: Option<EventMessageTypeEnum>, action: &str, actor_id: Option<&str>) -> EventMessage {
        EventMessage {
            typ,
            action: Some(action.to_string()),
            actor: actor_id.map(|id| EventActor {
                id: Some(id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_accepts_container_start() {
        let event = start_event(Some(EventMessageTypeEnum::CONTAINER), "start", Some("c1"));
        assert_eq!(start_event_container_id(&event), Some("c1"));
    }

    #[test]
    fn test_filter_rejects_other_types_and_actions() {
        let network = start_event(Some(EventMessageTypeEnum::NETWORK), "start", Some("n1"));
        assert_eq!(start_event_container_id(&network), None);

        let stop = start_event(Some(EventMessageTypeEnum::CONTAINER), "stop", Some("c1"));
        assert_eq!(start_event_container_id(&stop), None);

        let untyped = start_event(None, "start", Some("c1"));
        assert_eq!(start_event_container_id(&untyped), None);
    }

    #[test]
    fn test_filter_requires_actor_id() {
        let no_actor = start_event(Some(EventMessageTypeEnum::CONTAINER), "start", None);
        assert_eq!(start_event_container_id(&no_actor), None);
    }

    #[test]
    fn test_labels_from_complete_map() {
        let parsed = ProxyLabels::from_map(&complete_labels()).unwrap();
        assert_eq!(parsed.host, "app.example.com");
        assert_eq!(parsed.port, "8080");
        assert_eq!(parsed.tls_domain, "example.com");
    }

    #[test]
    fn test_labels_missing_or_empty_key() {
        let mut missing = complete_labels();
        missing.remove(LABEL_TLS_DOMAIN);
        assert_eq!(ProxyLabels::from_map(&missing), None);

        let mut empty = complete_labels();
        empty.insert(LABEL_PORT.to_string(), String::new());
        assert_eq!(ProxyLabels::from_map(&empty), None);

        // Unrelated labels alone are not enough
        let unrelated = labels(&[("com.docker.compose.project", "demo")]);
        assert_eq!(ProxyLabels::from_map(&unrelated), None);
    }

    #[test]
    fn test_forward_port_parsing() {
        let mut parsed = ProxyLabels::from_map(&complete_labels()).unwrap();
        assert_eq!(parsed.forward_port(), Some(8080));

        parsed.port = "abc".to_string();
        assert_eq!(parsed.forward_port(), None);

        parsed.port = "0".to_string();
        assert_eq!(parsed.forward_port(), None);

        parsed.port = "-1".to_string();
        assert_eq!(parsed.forward_port(), None);

        parsed.port = "70000".to_string();
        assert_eq!(parsed.forward_port(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_labels_returns_once_complete() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for_labels(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    // Labels become visible on the third snapshot
                    if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Ok(complete_labels())
                    } else {
                        Ok(HashMap::new())
                    }
                }
            },
            LABEL_POLL_TIMEOUT,
            LABEL_POLL_INTERVAL,
        )
        .await;

        assert_eq!(result.unwrap().host, "app.example.com");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_labels_times_out() {
        let start = tokio::time::Instant::now();

        let result = wait_for_labels(
            || async { Ok(HashMap::new()) },
            LABEL_POLL_TIMEOUT,
            LABEL_POLL_INTERVAL,
        )
        .await;

        assert_eq!(result, None);
        let elapsed = start.elapsed();
        assert!(elapsed >= LABEL_POLL_TIMEOUT);
        assert!(elapsed <= LABEL_POLL_TIMEOUT + LABEL_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_labels_survives_snapshot_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for_labels(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("container not found yet")
                    }
                    Ok(complete_labels())
                }
            },
            LABEL_POLL_TIMEOUT,
            LABEL_POLL_INTERVAL,
        )
        .await;

        assert!(result.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
