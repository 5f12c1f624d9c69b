//! lxsm-session - per-user desktop session supervisor
//!
//! Started by the display manager in place of the user's session. Starts the
//! window manager and the autostart modules, keeps them alive and tears the
//! session down on logout. Readiness of the window manager and the system
//! tray is detected on the X display named by `DISPLAY`. Exits with status
//! 0 after a normal logout and non-zero when the session could not start.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lxsm_core::config::{self, SessionConfig};
use lxsm_core::process::available_window_managers;
use lxsm_core::{Session, SessionHandle};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod alerts;
mod selector;
mod x11;

/// Upper bound on delivering the last alerts after the session ended.
const ALERT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// lxsm-session - desktop session supervisor
#[derive(Parser, Debug)]
#[command(name = "lxsm-session")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the session configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Window manager command line, overriding the configuration
    #[arg(short, long)]
    window_manager: Option<String>,

    /// List the known window managers that are installed and exit
    #[arg(long)]
    list_window_managers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("failed to open log file {}", log_file.display()))?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<(SessionConfig, PathBuf)> {
    if let Some(path) = &args.config {
        let config = SessionConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        return Ok((config, path.clone()));
    }

    let path = config::default_config_path();
    let config = SessionConfig::from_file_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok((config, path))
}

async fn async_main(args: Args) -> Result<()> {
    let (mut config, config_path) = load_config(&args)?;

    if args.list_window_managers {
        for wm in available_window_managers(&config.session.known_window_managers, true) {
            println!("{}", wm.command);
        }
        return Ok(());
    }

    if let Some(window_manager) = args.window_manager {
        config.session.window_manager = Some(window_manager);
    }
    info!(config = %config_path.display(), modules = config.autostart.len(), "starting session");

    let alert_command = config.alerts.command.clone();
    let screen = config.readiness.screen;
    let session = Session::new(config)
        .with_selector(selector::PromptSelector::stdio())
        .with_config_path(config_path);
    let handle = session.handle();
    let env = std::sync::Arc::clone(session.environment());

    let alert_task = tokio::spawn(alerts::forward_alerts(
        handle.subscribe(),
        alert_command,
        env,
    ));
    let signal_task = tokio::spawn(forward_signals(handle.clone()));
    match x11::X11Watch::connect(screen) {
        Ok(watch) => {
            watch.spawn(handle.platform_events());
        },
        Err(e) => error!(
            "window manager and tray detection unavailable, relying on readiness probes: {e:#}"
        ),
    }
    drop(handle);

    let result = session.run().await;

    signal_task.abort();
    let _ = signal_task.await;
    if tokio::time::timeout(ALERT_FLUSH_TIMEOUT, alert_task)
        .await
        .is_err()
    {
        error!("timed out delivering alerts");
    }

    let outcome = result.context("session failed to start")?;
    info!(reason = %outcome.reason, "logged out");
    Ok(())
}

/// Turns SIGTERM, SIGINT and SIGHUP into logout requests.
async fn forward_signals(handle: SessionHandle) {
    let (mut sigterm, mut sigint, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            error!("failed to install signal handlers: {e}");
            return;
        },
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }
        handle.logout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "lxsm-session",
            "--config",
            "/tmp/session.toml",
            "--window-manager",
            "openbox --replace",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/session.toml")));
        assert_eq!(args.window_manager.as_deref(), Some("openbox --replace"));
        assert_eq!(args.log_level, "debug");
        assert!(!args.list_window_managers);
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let args = Args::try_parse_from(["lxsm-session", "--config", path.to_str().unwrap()])
            .unwrap();
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "[session]\nwindow_manager = \"openbox\"\n").unwrap();
        let args = Args::try_parse_from(["lxsm-session", "--config", path.to_str().unwrap()])
            .unwrap();

        let (config, loaded_from) = load_config(&args).unwrap();
        assert_eq!(config.session.window_manager.as_deref(), Some("openbox"));
        assert_eq!(loaded_from, path);
    }
}
