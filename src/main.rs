use npmbridge::config::{self, Config};
use npmbridge::docker;
use npmbridge::npm::NpmClient;
use npmbridge::ntfy::Notifier;
use npmbridge::watcher::Watcher;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("npmbridge=info".parse().expect("valid log directive")),
        )
        .init();

    // Load environment variables; a missing or empty .env is startup-fatal
    let dotenv_path = std::env::current_dir()
        .map(|dir| dir.join(".env"))
        .unwrap_or_else(|_| PathBuf::from(".env"));
    config::ensure_dotenv(&dotenv_path)?;
    dotenvy::from_path(&dotenv_path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", dotenv_path.display(), e))?;

    let config = Config::from_env();

    let docker = docker::connect().await?;

    let notifier = Notifier::new(config.ntfy.clone());
    let npm = NpmClient::new(config.npm.clone(), notifier);

    // Cooperative shutdown: signals flip the flag, the watcher observes it
    // between events
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = Watcher::new(docker, npm, shutdown_rx);
    let mut watcher_task = tokio::spawn(watcher.run());

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = &mut watcher_task => {
                // Definitive end of the event stream
                info!("Shutdown complete");
                return Ok(());
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = &mut watcher_task => {
                info!("Shutdown complete");
                return Ok(());
            }
        }
    }

    // Signal shutdown and let any in-flight event finish
    let _ = shutdown_tx.send(true);
    let _ = watcher_task.await;

    info!("Shutdown complete");
    Ok(())
}
