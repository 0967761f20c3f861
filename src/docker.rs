//! Docker daemon connection bootstrap

use bollard::Docker;
use tracing::debug;

/// Connect to the Docker daemon
///
/// Connection priority:
/// 1. DOCKER_HOST environment variable
/// 2. Common socket paths (platform-specific)
/// 3. Bollard's built-in defaults
pub async fn connect() -> anyhow::Result<Docker> {
    let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
        connect_to_host(&host).map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                 Ensure Docker is running and accessible.",
                host, e
            )
        })?
    } else {
        connect_with_defaults().await?
    };

    // Verify connection
    client.ping().await.map_err(|e| {
        anyhow::anyhow!(
            "Docker daemon is not responding: {}. \
             Ensure Docker Desktop, Colima, or dockerd is running.",
            e
        )
    })?;

    debug!("Connected to Docker daemon");
    Ok(client)
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if host.starts_with("unix://") {
        let socket_path = host.trim_start_matches("unix://");
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    for (name, path) in &socket_paths {
        if path.is_empty() || path.contains("//") {
            continue; // Skip invalid paths from empty env vars
        }

        if std::path::Path::new(path).exists() {
            debug!(path, name, "Found Docker socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        anyhow::anyhow!(
            "Cannot connect to Docker daemon: {}. \
             Start dockerd or set the DOCKER_HOST environment variable.",
            e
        )
    })
}
