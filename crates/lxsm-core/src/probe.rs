//! Command-based platform event source.
//!
//! Without a direct connection to the display server the supervisor can
//! still learn about readiness by polling a helper command (for instance
//! `xprop -root _NET_SUPPORTING_WM_CHECK`). The first successful run is
//! reported as the platform event the condition corresponds to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::environment::EnvTemplate;
use crate::events::{EventBus, SessionEvent, UserAlert};
use crate::process::{self, ProcessError};
use crate::readiness::PlatformEvent;

/// Upper bound on a single probe run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls a probe command until it succeeds.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    argv: Vec<String>,
    interval: Duration,
    event: PlatformEvent,
}

impl CommandProbe {
    /// Creates a probe that emits `event` once `argv` exits successfully.
    #[must_use]
    pub fn new(argv: Vec<String>, interval: Duration, event: PlatformEvent) -> Self {
        Self {
            argv,
            interval,
            event,
        }
    }

    /// Runs the probe on the current runtime, delivering the event to `tx`.
    /// A probe that cannot run at all raises a
    /// [`UserAlert::ReadinessCheckFailed`] on `events`.
    pub fn spawn(
        self,
        env: Arc<EnvTemplate>,
        tx: mpsc::UnboundedSender<PlatformEvent>,
        events: EventBus,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(&env, &tx, &events).await })
    }

    async fn run(
        self,
        env: &EnvTemplate,
        tx: &mpsc::UnboundedSender<PlatformEvent>,
        events: &EventBus,
    ) {
        let program = self.argv.first().cloned().unwrap_or_default();
        let mut attempts: u32 = 0;
        loop {
            if tx.is_closed() {
                return;
            }
            attempts += 1;
            match process::run_to_completion(&self.argv, env, PROBE_TIMEOUT).await {
                Ok(status) if status.kind().exit_code() == Some(0) => {
                    info!(probe = %program, attempts, "probe succeeded");
                    let _ = tx.send(self.event);
                    return;
                },
                Ok(status) => {
                    debug!(probe = %program, attempts, %status, "probe not satisfied yet");
                },
                Err(ProcessError::SpawnFailed { reason, .. }) => {
                    error!(probe = %program, "probe cannot run, giving up: {reason}");
                    events.emit(SessionEvent::Alert(UserAlert::ReadinessCheckFailed {
                        command: program,
                        reason,
                    }));
                    return;
                },
                Err(e) => {
                    debug!(probe = %program, attempts, "probe failed: {e}");
                },
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
