//! Environment-based configuration
//!
//! All settings come from environment variables, normally loaded from a
//! `.env` file next to the working directory. The file must exist and be
//! non-empty at startup; individual variables are allowed to be missing
//! and only fail the operation that needs them.

use std::path::Path;

/// Typed view of the process environment, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub npm: NpmConfig,
    pub ntfy: NtfyConfig,
}

/// Nginx Proxy Manager connection settings
#[derive(Debug, Clone)]
pub struct NpmConfig {
    /// Base URL of the NPM instance (NPM_SERVER_URL)
    pub server_url: Option<String>,

    /// API identity (NPM_USER)
    pub user: Option<String>,

    /// API secret (NPM_SECRET)
    pub secret: Option<String>,

    /// Forward target for created proxy hosts (HOST_IP_ADDRESS)
    pub host_ip: Option<String>,
}

/// Ntfy push notification settings
#[derive(Debug, Clone)]
pub struct NtfyConfig {
    /// Whether notifications are sent at all (USE_NTFY_FOR_UPDATES)
    pub enabled: bool,

    /// Base URL of the ntfy server (NTFY_SERVER_URL)
    pub server_url: Option<String>,

    /// Topic to publish to (NTFY_TOPIC)
    pub topic: Option<String>,
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self {
            npm: NpmConfig {
                server_url: env_var("NPM_SERVER_URL"),
                user: env_var("NPM_USER"),
                secret: env_var("NPM_SECRET"),
                host_ip: env_var("HOST_IP_ADDRESS"),
            },
            ntfy: NtfyConfig {
                enabled: flag_enabled(env_var("USE_NTFY_FOR_UPDATES")),
                server_url: env_var("NTFY_SERVER_URL"),
                topic: env_var("NTFY_TOPIC"),
            },
        }
    }
}

/// Verify the `.env` file exists and is non-empty
///
/// This is the only startup-fatal configuration check; everything else
/// fails per-operation.
pub fn ensure_dotenv(path: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path).map_err(|_| {
        anyhow::anyhow!(".env file not found at expected path: {}", path.display())
    })?;
    if meta.len() == 0 {
        anyhow::bail!(".env file at {} is empty", path.display());
    }
    Ok(())
}

/// Read an environment variable, treating empty values as unset
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a boolean-as-string flag ("true" in any case enables)
fn flag_enabled(value: Option<String>) -> bool {
    value.map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flag_enabled() {
        assert!(flag_enabled(Some("true".to_string())));
        assert!(flag_enabled(Some("TRUE".to_string())));
        assert!(flag_enabled(Some("True".to_string())));
        assert!(!flag_enabled(Some("false".to_string())));
        assert!(!flag_enabled(Some("yes".to_string())));
        assert!(!flag_enabled(Some("".to_string())));
        assert!(!flag_enabled(None));
    }

    #[test]
    fn test_ensure_dotenv_missing() {
        let path = std::env::temp_dir().join(format!("npmbridge-missing-{}.env", std::process::id()));
        let err = ensure_dotenv(&path).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_ensure_dotenv_empty() {
        let path = std::env::temp_dir().join(format!("npmbridge-empty-{}.env", std::process::id()));
        std::fs::File::create(&path).unwrap();
        let err = ensure_dotenv(&path).unwrap_err();
        assert!(err.to_string().contains("is empty"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_ensure_dotenv_ok() {
        let path = std::env::temp_dir().join(format!("npmbridge-ok-{}.env", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "NPM_SERVER_URL=http://localhost:81").unwrap();
        assert!(ensure_dotenv(&path).is_ok());
        std::fs::remove_file(&path).unwrap();
    }
}
