use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Configuration of the dashboard process
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Process supervision settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Where persisted settings live
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 7500)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the API.
    /// If not set, a random token is generated at startup and logged
    pub auth_token: Option<String>,

    /// PID file path. Held with an exclusive lock so two dashboards never
    /// supervise the same settings.
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            auth_token: None,
            pid_file: None,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Reconciliation interval in milliseconds (default: 1500)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Stop supervised processes when the dashboard exits (default: false,
    /// children outlive the dashboard)
    #[serde(default)]
    pub stop_on_exit: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stop_on_exit: false,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Path to the settings JSON file. Relative paths are resolved against
    /// the config file's directory.
    pub settings_file: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7500
}

fn default_poll_interval() -> u64 {
    1500
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.bind.trim().is_empty() {
            errors.push("server.bind must not be empty".to_string());
        }
        if self.supervisor.poll_interval_ms == 0 {
            errors.push("supervisor.poll_interval_ms must be non-zero".to_string());
        }
        if let Some(ref token) = self.server.auth_token {
            if token.trim().is_empty() {
                errors.push("server.auth_token must not be blank when set".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Resolve the settings file location. An explicit path is taken
    /// relative to the config file; otherwise the settings live in the
    /// user's config directory, or the working directory as a last resort.
    pub fn settings_path(&self, config_path: &Path) -> PathBuf {
        match self.storage.settings_file {
            Some(ref file) => {
                let file = PathBuf::from(file);
                if file.is_absolute() {
                    file
                } else {
                    config_path
                        .parent()
                        .map(|dir| dir.join(&file))
                        .unwrap_or(file)
                }
            }
            None => dirs_next::config_dir()
                .map(|dir| dir.join(env!("CARGO_PKG_NAME")).join("settings.json"))
                .unwrap_or_else(|| PathBuf::from("settings.json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 8080
auth_token = "secret"
pid_file = "/run/frpdeck.pid"

[supervisor]
poll_interval_ms = 500
stop_on_exit = true

[storage]
settings_file = "state/settings.json"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.server.pid_file.as_deref(), Some("/run/frpdeck.pid"));
        assert_eq!(config.supervisor.poll_interval(), Duration::from_millis(500));
        assert!(config.supervisor.stop_on_exit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 7500);
        assert!(config.server.auth_token.is_none());
        assert_eq!(config.supervisor.poll_interval_ms, 1500);
        assert!(!config.supervisor.stop_on_exit);
        assert!(config.storage.settings_file.is_none());
    }

    #[test]
    fn test_socket_addr() {
        let config = Config::default();
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "127.0.0.1:7500".parse::<SocketAddr>().unwrap()
        );

        let mut bad = ServerConfig::default();
        bad.bind = "not an address".to_string();
        assert!(bad.socket_addr().is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.supervisor.poll_interval_ms = 0;
        config.server.auth_token = Some("  ".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("poll_interval_ms"));
        assert!(err.contains("auth_token"));
    }

    #[test]
    fn test_settings_path_relative_to_config() {
        let config: Config = toml::from_str(
            r#"
[storage]
settings_file = "settings.json"
"#,
        )
        .unwrap();
        assert_eq!(
            config.settings_path(Path::new("/etc/frpdeck/frpdeck.toml")),
            PathBuf::from("/etc/frpdeck/settings.json")
        );

        let config: Config = toml::from_str(
            r#"
[storage]
settings_file = "/var/lib/frpdeck/settings.json"
"#,
        )
        .unwrap();
        assert_eq!(
            config.settings_path(Path::new("frpdeck.toml")),
            PathBuf::from("/var/lib/frpdeck/settings.json")
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 7500);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("frpdeck.toml");
        std::fs::write(&path, "[supervisor]\npoll_interval_ms = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
