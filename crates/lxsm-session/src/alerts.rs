//! Delivery of user alerts.
//!
//! Alerts published on the session event bus are logged and, when an alert
//! command is configured, handed to it (typically `notify-send`) with the
//! summary and the body as the two final arguments.

use std::sync::Arc;
use std::time::Duration;

use lxsm_core::environment::EnvTemplate;
use lxsm_core::process::run_to_completion;
use lxsm_core::{SessionEvent, UserAlert};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, warn};

const ALERT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the argv for delivering `alert` through `command`.
pub fn alert_argv(command: &[String], alert: &UserAlert) -> Vec<String> {
    let mut argv = command.to_vec();
    argv.push(alert.summary().to_string());
    argv.push(alert.to_string());
    argv
}

/// Logs and delivers every alert until the event bus closes.
pub async fn forward_alerts(
    mut events: broadcast::Receiver<SessionEvent>,
    command: Option<Vec<String>>,
    env: Arc<EnvTemplate>,
) {
    loop {
        let alert = match events.recv().await {
            Ok(SessionEvent::Alert(alert)) => alert,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "alert forwarder fell behind");
                continue;
            },
            Err(RecvError::Closed) => return,
        };

        if alert.is_error() {
            error!(summary = alert.summary(), "{alert}");
        } else {
            warn!(summary = alert.summary(), "{alert}");
        }

        let Some(command) = command.as_deref().filter(|argv| !argv.is_empty()) else {
            continue;
        };
        let argv = alert_argv(command, &alert);
        if let Err(e) = run_to_completion(&argv, &env, ALERT_COMMAND_TIMEOUT).await {
            warn!("failed to deliver alert: {e}");
        }
    }
}
