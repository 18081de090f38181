use frpdeck::api::{DashboardApi, PKG_NAME, VERSION};
use frpdeck::config::Config;
use frpdeck::settings::{SettingsSource, SettingsStore};
use frpdeck::supervisor::Supervisor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frpdeck=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("frpdeck.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    let settings_path = config.settings_path(&config_path);
    print_startup_banner(&config, &settings_path);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let settings = Arc::new(SettingsStore::new(&settings_path));
    // Fail early on a malformed settings file
    let loaded = settings.load()?;
    info!(
        instances = loaded.frpc_instances.len(),
        current_dir = %loaded.current_dir,
        "Settings loaded"
    );

    let supervisor = Supervisor::new(
        Arc::clone(&settings) as Arc<dyn SettingsSource>,
        config.supervisor.poll_interval(),
    );

    // Generate or use configured API token
    let auth_token = config.server.auth_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure auth_token to set a fixed value)");
        token
    });

    let api_addr = config.server.socket_addr()?;
    let api = Arc::new(DashboardApi::new(
        Arc::clone(&supervisor),
        Arc::clone(&settings),
        auth_token,
        shutdown_rx,
    ));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run(api_addr).await {
            error!(error = %e, "Dashboard API error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    supervisor.shutdown(config.supervisor.stop_on_exit);

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another dashboard is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // The lock lives as long as the handle
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config, settings_path: &Path) {
    info!(name = PKG_NAME, version = VERSION, "Starting frp dashboard");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        auth_token_configured = config.server.auth_token.is_some(),
        "API configuration"
    );
    info!(
        poll_interval_ms = config.supervisor.poll_interval_ms,
        stop_on_exit = config.supervisor.stop_on_exit,
        "Supervision settings"
    );
    info!(path = %settings_path.display(), "Settings file");
}
